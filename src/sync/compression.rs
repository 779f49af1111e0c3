//! Entropy-gated DEFLATE framing for transfer payloads.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression as Flate2Compression;
use std::io::{Read, Write};

const MAGIC: u32 = 0x5A4C4942;
const MIN_COMPRESS_SIZE: usize = 256;
const MAX_DECOMPRESSED_SIZE: u64 = 1024 * 1024 * 1024;
const HEADER_LEN: usize = 8;
const ENTROPY_SAMPLE: usize = 256;
const ENTROPY_THRESHOLD: f64 = 0.9;

/// Distinct-byte ratio over the first 256 bytes; high ratio means the data
/// is already dense (e.g. pre-compressed or encrypted) and not worth
/// compressing.
pub fn is_compressible(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let sample = &data[..data.len().min(ENTROPY_SAMPLE)];
    let mut seen = [false; 256];
    let mut unique = 0usize;
    for &b in sample {
        if !seen[b as usize] {
            seen[b as usize] = true;
            unique += 1;
        }
    }
    let entropy_ratio = unique as f64 / 256.0;
    entropy_ratio < ENTROPY_THRESHOLD
}

/// Returns `None` when compression is skipped: input too small, not
/// entropy-favorable, or the compressed result isn't smaller.
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < MIN_COMPRESS_SIZE || !is_compressible(data) {
        return None;
    }

    let mut encoder = DeflateEncoder::new(Vec::new(), Flate2Compression::default());
    encoder.write_all(data).ok()?;
    let compressed = encoder.finish().ok()?;

    if compressed.len() >= data.len() {
        return None;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&compressed);
    Some(out)
}

/// Returns `None` on bad magic, a too-large claimed size, or a corrupt
/// stream.
pub fn decompress(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let magic = u32::from_be_bytes(data[0..4].try_into().ok()?);
    if magic != MAGIC {
        return None;
    }
    let original_size = u32::from_be_bytes(data[4..8].try_into().ok()?) as u64;
    if original_size > MAX_DECOMPRESSED_SIZE {
        return None;
    }

    let mut decoder = DeflateDecoder::new(&data[HEADER_LEN..]);
    let mut out = Vec::with_capacity(original_size as usize);
    decoder.read_to_end(&mut out).ok()?;

    if out.len() as u64 != original_size {
        return None;
    }
    Some(out)
}

pub fn compression_ratio(original: &[u8], compressed: &[u8]) -> f64 {
    if original.is_empty() {
        return 1.0;
    }
    compressed.len() as f64 / original.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_input_not_compressed() {
        assert!(compress(b"short").is_none());
    }

    #[test]
    fn roundtrip_compressible_text() {
        let data = "a".repeat(2000).into_bytes();
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let back = decompress(&compressed).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn high_entropy_input_skips_compression() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        // every byte value repeats evenly -> unique count close to 256, not compressible per probe
        assert!(!is_compressible(&data[..256]));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bogus = vec![0u8; 16];
        bogus[0] = 0xFF;
        assert!(decompress(&bogus).is_none());
    }

    #[test]
    fn oversized_claimed_length_rejected() {
        let mut bogus = MAGIC.to_be_bytes().to_vec();
        bogus.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(decompress(&bogus).is_none());
    }
}

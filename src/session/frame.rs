//! Authenticated frame encoding for the post-handshake wire.
//!
//! Layout: `version:u8 | sequence:u64 (LE) | nonce:16B | body`, where body is
//! `ciphertext+tag` under AEAD or `ciphertext | hmac:32B` under the legacy
//! encrypt-then-MAC scheme. Authenticated data for both schemes is
//! `version || sequence`. The wire nonce field is always 16 bytes: CBC uses
//! all 16 as its IV, AEAD uses the first 12 as the GCM nonce.

use crate::crypto;
use crate::error::{crypto_auth_fail, CoreError};

pub const FRAME_VERSION: u8 = 1;
const NONCE_FIELD_LEN: usize = 16;
const HEADER_LEN: usize = 1 + 8 + NONCE_FIELD_LEN;

pub struct KeySet {
    pub enc_key: [u8; 32],
    pub mac_key: [u8; 32],
    pub aead_enabled: bool,
}

fn auth_data(version: u8, sequence: u64) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[0] = version;
    aad[1..].copy_from_slice(&sequence.to_le_bytes());
    aad
}

pub fn encode(keys: &KeySet, sequence: u64, plaintext: &[u8]) -> Result<Vec<u8>, CoreError> {
    let nonce_field = crypto::random_nonce(NONCE_FIELD_LEN);
    let aad = auth_data(FRAME_VERSION, sequence);

    let body = if keys.aead_enabled {
        crypto::aead_encrypt(&keys.enc_key, &nonce_field[..12], plaintext, &aad)?
    } else {
        let ciphertext = crypto::cbc_encrypt(&keys.enc_key, &nonce_field, plaintext)?;
        let mut mac_input = aad.to_vec();
        mac_input.extend_from_slice(&ciphertext);
        let tag = crypto::hmac_sha256(&keys.mac_key, &mac_input)?;
        let mut body = ciphertext;
        body.extend_from_slice(&tag);
        body
    };

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(FRAME_VERSION);
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&nonce_field);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a frame, verifying its MAC/tag before any plaintext is returned.
/// Returns `(sequence, plaintext)`.
pub fn decode(keys: &KeySet, frame: &[u8]) -> Result<(u64, Vec<u8>), CoreError> {
    if frame.len() < HEADER_LEN {
        return Err(crate::error::internal("frame shorter than header"));
    }
    let version = frame[0];
    if version != FRAME_VERSION {
        return Err(crate::error::internal(format!("unsupported frame version {version}")));
    }
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&frame[1..9]);
    let sequence = u64::from_le_bytes(seq_bytes);
    let nonce_field = &frame[9..9 + NONCE_FIELD_LEN];
    let body = &frame[HEADER_LEN..];
    let aad = auth_data(version, sequence);

    let plaintext = if keys.aead_enabled {
        crypto::aead_decrypt(&keys.enc_key, &nonce_field[..12], body, &aad)?
    } else {
        if body.len() < crypto::HMAC_LEN {
            return Err(crypto_auth_fail("legacy frame shorter than hmac tag"));
        }
        let split = body.len() - crypto::HMAC_LEN;
        let (ciphertext, tag) = body.split_at(split);
        let mut mac_input = aad.to_vec();
        mac_input.extend_from_slice(ciphertext);
        if !crypto::hmac_verify(&keys.mac_key, &mac_input, tag) {
            return Err(crypto_auth_fail("legacy frame hmac mismatch"));
        }
        crypto::cbc_decrypt(&keys.enc_key, nonce_field, ciphertext)?
    };

    Ok((sequence, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(aead: bool) -> KeySet {
        KeySet {
            enc_key: crypto::random_key(),
            mac_key: crypto::random_key(),
            aead_enabled: aead,
        }
    }

    #[test]
    fn aead_roundtrip() {
        let keys = keys(true);
        let frame = encode(&keys, 7, b"payload").unwrap();
        let (seq, plain) = decode(&keys, &frame).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn legacy_roundtrip() {
        let keys = keys(false);
        let frame = encode(&keys, 3, b"legacy payload").unwrap();
        let (seq, plain) = decode(&keys, &frame).unwrap();
        assert_eq!(seq, 3);
        assert_eq!(plain, b"legacy payload");
    }

    #[test]
    fn tamper_rejected() {
        let keys = keys(true);
        let mut frame = encode(&keys, 1, b"x").unwrap();
        *frame.last_mut().unwrap() ^= 0xFF;
        assert!(decode(&keys, &frame).is_err());
    }

    #[test]
    fn legacy_tamper_rejected() {
        let keys = keys(false);
        let mut frame = encode(&keys, 1, b"x").unwrap();
        *frame.last_mut().unwrap() ^= 0xFF;
        assert!(decode(&keys, &frame).is_err());
    }
}

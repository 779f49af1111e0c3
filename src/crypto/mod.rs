//! Symmetric crypto primitives: AEAD, legacy CBC+HMAC, key derivation.
//!
//! Everything here is stateless; [`crate::session`] owns key material and
//! calls into this module per-frame.

use crate::error::{crypto_auth_fail, crypto_bad_key_size, crypto_bad_nonce, CoreError};
use aes::Aes256;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const GCM_NONCE_LEN: usize = 12;
pub const CBC_IV_LEN: usize = 16;
pub const GCM_TAG_LEN: usize = 16;
pub const HMAC_LEN: usize = 32;
pub const PBKDF2_MIN_ITERATIONS: u32 = 100_000;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// 32-byte random key.
pub fn random_key() -> [u8; KEY_LEN] {
    let mut buf = [0u8; KEY_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
    buf
}

/// Random nonce, sized for GCM (12 B) by default; legacy CBC uses a 16 B IV.
pub fn random_nonce(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
    buf
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn hex_decode(s: &str) -> Result<Vec<u8>, CoreError> {
    hex::decode(s).map_err(|e| crypto_bad_nonce(format!("invalid hex: {e}")))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CoreError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| crypto_bad_key_size("hmac key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

pub fn hmac_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    match hmac_sha256(key, data) {
        Ok(expected) => constant_time_eq(&expected, tag),
        Err(_) => false,
    }
}

/// AES-256-GCM encrypt. `aad` is authenticated but not encrypted.
pub fn aead_encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CoreError> {
    if key.len() != KEY_LEN {
        return Err(crypto_bad_key_size(format!("expected {KEY_LEN} bytes, got {}", key.len())));
    }
    if nonce.len() != GCM_NONCE_LEN {
        return Err(crypto_bad_nonce(format!("expected {GCM_NONCE_LEN} bytes, got {}", nonce.len())));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| crypto_bad_key_size("aes-gcm key"))?;
    let nonce = Nonce::from_slice(nonce);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| crypto_auth_fail("aead encrypt failed"))
}

/// AES-256-GCM decrypt. Authentication failure returns `Err`, never partial
/// plaintext.
pub fn aead_decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CoreError> {
    if key.len() != KEY_LEN {
        return Err(crypto_bad_key_size(format!("expected {KEY_LEN} bytes, got {}", key.len())));
    }
    if nonce.len() != GCM_NONCE_LEN {
        return Err(crypto_bad_nonce(format!("expected {GCM_NONCE_LEN} bytes, got {}", nonce.len())));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| crypto_bad_key_size("aes-gcm key"))?;
    let nonce = Nonce::from_slice(nonce);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| crypto_auth_fail("aead tag verification failed"))
}

/// Legacy AES-256-CBC + PKCS7, paired with an external encrypt-then-MAC HMAC
/// verified by the caller before this is invoked.
pub fn cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CoreError> {
    if key.len() != KEY_LEN {
        return Err(crypto_bad_key_size(format!("expected {KEY_LEN} bytes, got {}", key.len())));
    }
    if iv.len() != CBC_IV_LEN {
        return Err(crypto_bad_nonce(format!("expected {CBC_IV_LEN} bytes, got {}", iv.len())));
    }
    let enc = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| crypto_bad_key_size("cbc key/iv"))?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

pub fn cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CoreError> {
    if key.len() != KEY_LEN {
        return Err(crypto_bad_key_size(format!("expected {KEY_LEN} bytes, got {}", key.len())));
    }
    if iv.len() != CBC_IV_LEN {
        return Err(crypto_bad_nonce(format!("expected {CBC_IV_LEN} bytes, got {}", iv.len())));
    }
    let dec = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| crypto_bad_key_size("cbc key/iv"))?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| crate::error::crypto_bad_padding("pkcs7 unpad failed"))
}

/// PBKDF2-HMAC-SHA-256 derivation of a 64-byte master key, split into
/// `enc_key`/`mac_key`. Wrapped in `Zeroizing` so the master key is wiped
/// the moment it goes out of scope rather than lingering in freed memory.
pub fn derive_master_pbkdf2(session_code: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; 64]> {
    let iterations = iterations.max(PBKDF2_MIN_ITERATIONS);
    let mut out = Zeroizing::new([0u8; 64]);
    pbkdf2_hmac::<Sha256>(session_code, salt, iterations, out.as_mut());
    out
}

/// Argon2id derivation of a 64-byte master key (preferred over PBKDF2 when
/// available).
pub fn derive_master_argon2id(session_code: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 64]>, CoreError> {
    use argon2::{Algorithm, Argon2, Params, Version};
    let params = Params::new(19 * 1024, 2, 1, Some(64))
        .map_err(|e| crate::error::internal(format!("invalid argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new([0u8; 64]);
    argon2
        .hash_password_into(session_code, salt, out.as_mut())
        .map_err(|e| crate::error::internal(format!("argon2 derivation failed: {e}")))?;
    Ok(out)
}

/// Split a 64-byte master key into `(enc_key, mac_key)`, each 32 bytes.
pub fn split_master(master: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut enc_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    enc_key.copy_from_slice(&master[..32]);
    mac_key.copy_from_slice(&master[32..]);
    (enc_key, mac_key)
}

/// Extend a base salt with a big-endian rotation counter, for key rotation.
pub fn rotated_salt(base_salt: &[u8], rotation_counter: u32) -> Vec<u8> {
    let mut salt = base_salt.to_vec();
    salt.extend_from_slice(&rotation_counter.to_be_bytes());
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_roundtrip() {
        let key = random_key();
        let nonce = random_nonce(GCM_NONCE_LEN);
        let pt = b"hello sentinel";
        let ct = aead_encrypt(&key, &nonce, pt, b"aad").unwrap();
        let back = aead_decrypt(&key, &nonce, &ct, b"aad").unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn aead_tamper_detected() {
        let key = random_key();
        let nonce = random_nonce(GCM_NONCE_LEN);
        let mut ct = aead_encrypt(&key, &nonce, b"hello", b"aad").unwrap();
        *ct.last_mut().unwrap() ^= 0xFF;
        assert!(aead_decrypt(&key, &nonce, &ct, b"aad").is_err());
        assert!(aead_decrypt(&key, &nonce, &ct, b"wrong-aad").is_err());
    }

    #[test]
    fn cbc_roundtrip() {
        let key = random_key();
        let iv = random_nonce(CBC_IV_LEN);
        let pt = b"some plaintext that spans multiple blocks of data";
        let ct = cbc_encrypt(&key, &iv, pt).unwrap();
        let back = cbc_decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn hmac_roundtrip_and_tamper() {
        let key = random_key();
        let tag = hmac_sha256(&key, b"payload").unwrap();
        assert!(hmac_verify(&key, b"payload", &tag));
        assert!(!hmac_verify(&key, b"tampered", &tag));
    }

    #[test]
    fn pbkdf2_and_split() {
        let master = derive_master_pbkdf2(b"session-code", b"salt", 100_000);
        let (enc, mac) = split_master(&master);
        assert_ne!(enc, mac);
    }

    #[test]
    fn bad_key_size_rejected() {
        let err = aead_encrypt(&[0u8; 10], &random_nonce(GCM_NONCE_LEN), b"x", b"").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::CryptoBadKeySize);
    }
}

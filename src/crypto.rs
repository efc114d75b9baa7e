//! Key derivation and AES-GCM sealing/opening for the session protocol.
//!
//! The wire format fixes a 16-byte nonce (matching the source's use of
//! `pycryptodome`'s default `AES.MODE_GCM` nonce length), which is not the
//! `aes-gcm` crate's built-in `Aes256Gcm` alias (12 bytes) — so we
//! instantiate the generic `AesGcm` cipher with a 16-byte nonce size here.

use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::ChannelError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

type Cipher = AesGcm<aes_gcm::aes::Aes256, U16>;

pub type Key = [u8; KEY_LEN];

/// `derive_key(password) = SHA256(password)`.
pub fn derive_key(password: &str) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    key
}

/// Seal `plaintext` under `key`, producing `nonce(16) || ciphertext || tag(16)`.
pub fn seal(plaintext: &[u8], key: &Key) -> Vec<u8> {
    let cipher = Cipher::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::<U16>::from_slice(&nonce_bytes);
    let ciphertext_and_tag = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-GCM encryption failed");
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext_and_tag.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext_and_tag);
    out
}

/// Open a sealed buffer: first 16 bytes are the nonce, last 16 the tag, the
/// rest is ciphertext. Any failure collapses to `ChannelError::AuthFail`.
pub fn open(buf: &[u8], key: &Key) -> Result<Vec<u8>, ChannelError> {
    if buf.len() < NONCE_LEN + TAG_LEN {
        return Err(ChannelError::AuthFail);
    }
    let (nonce_bytes, rest) = buf.split_at(NONCE_LEN);
    let cipher = Cipher::new(key.into());
    let nonce = Nonce::<U16>::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, rest)
        .map_err(|_| ChannelError::AuthFail)
}

/// Hex-encoded SHA-256 digest, used for debugging/logging identifiers only;
/// never consulted for file-transfer correctness.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = derive_key("hunter2");
        let sealed = seal(b"hello world", &key);
        let opened = open(&sealed, &key).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn wrong_key_fails() {
        let key_a = derive_key("a");
        let key_b = derive_key("b");
        let sealed = seal(b"secret", &key_a);
        assert!(matches!(open(&sealed, &key_b), Err(ChannelError::AuthFail)));
    }

    #[test]
    fn frame_is_exactly_32_plus_plaintext() {
        let key = derive_key("x");
        let sealed = seal(b"1234567890", &key);
        assert_eq!(sealed.len(), 32 + 10);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = derive_key("x");
        let sealed = seal(b"", &key);
        assert_eq!(sealed.len(), 32);
        let opened = open(&sealed, &key).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn derive_key_is_deterministic() {
        assert_eq!(derive_key("abc"), derive_key("abc"));
        assert_ne!(derive_key("abc"), derive_key("abd"));
    }
}

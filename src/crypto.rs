//! Thin contracts over the cryptographic primitives the vault builds on:
//! password hashing, AEAD seal/open, a keyed hash for the record and file
//! MACs, random bytes, and constant-time comparison.
//!
//! `seal`/`open` use `XChaCha20Poly1305` (24-byte nonce) rather than the
//! 12-byte-nonce `ChaCha20Poly1305` so the AEAD matches the `secretbox`
//! contract the format assumes (32-byte key, 24-byte nonce, 16-byte tag).
//! The keyed hash uses BLAKE3's keyed mode, the corpus's available
//! equivalent of a keyed BLAKE2b (32-byte key in, 32-byte digest out, with
//! the same one-shot-or-streaming shape).

use crate::constants::{MASTER_KEY_SIZE, NONCE_SIZE};
use crate::error::{Result, VaultError};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use subtle::ConstantTimeEq;

pub type MasterKey = [u8; MASTER_KEY_SIZE];
pub type Nonce24 = [u8; NONCE_SIZE];

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Argon2id, moderate ops/memory, parallelism fixed at 1, 32-byte output.
/// Unlike the PHC-string detour some MVP vaults take, the low-level
/// `Argon2::hash_password_into` API gives raw derived bytes directly, so
/// no HKDF post-processing step is needed.
pub fn pw_hash(password: &[u8], salt: &[u8; 16], m_cost_kib: u32, t_cost: u32) -> Result<MasterKey> {
    let params =
        Params::new(m_cost_kib, t_cost, 1, Some(MASTER_KEY_SIZE)).map_err(|_| VaultError::CryptoErr)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; MASTER_KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|_| VaultError::CryptoErr)?;
    Ok(out)
}

pub fn seal(key: &MasterKey, nonce: &Nonce24, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::CryptoErr)
}

/// `on_fail` lets callers distinguish a wrong-password tag mismatch
/// (master envelope) from a tampered-ciphertext one (records), per the
/// error taxonomy in the file format spec.
pub fn open(key: &MasterKey, nonce: &Nonce24, aad: &[u8], ciphertext: &[u8], on_fail: VaultError) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| on_fail)
}

pub fn keyed_hash(key: &MasterKey, msg: &[u8]) -> [u8; 32] {
    *blake3::keyed_hash(key, msg).as_bytes()
}

/// Streaming keyed hash, used to MAC a whole file without buffering it
/// twice.
pub struct StreamingHash(blake3::Hasher);

impl StreamingHash {
    pub fn new(key: &MasterKey) -> Self {
        Self(blake3::Hasher::new_keyed(key))
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn finalize(&self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOW_M_COST: u32 = 8;
    const LOW_T_COST: u32 = 1;

    #[test]
    fn pw_hash_is_deterministic() {
        let salt = [7u8; 16];
        let a = pw_hash(b"hunter2", &salt, LOW_M_COST, LOW_T_COST).unwrap();
        let b = pw_hash(b"hunter2", &salt, LOW_M_COST, LOW_T_COST).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pw_hash_differs_by_salt_and_password() {
        let salt_a = [1u8; 16];
        let salt_b = [2u8; 16];
        let h1 = pw_hash(b"pw", &salt_a, LOW_M_COST, LOW_T_COST).unwrap();
        let h2 = pw_hash(b"pw", &salt_b, LOW_M_COST, LOW_T_COST).unwrap();
        let h3 = pw_hash(b"other", &salt_a, LOW_M_COST, LOW_T_COST).unwrap();
        assert_ne!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn seal_open_roundtrip() {
        let key: MasterKey = random_bytes();
        let nonce: Nonce24 = random_bytes();
        let pt = b"super secret value";
        let sealed = seal(&key, &nonce, b"aad", pt).unwrap();
        let opened = open(&key, &nonce, b"aad", &sealed, VaultError::CryptoErr).unwrap();
        assert_eq!(opened, pt);
    }

    #[test]
    fn open_fails_on_wrong_key() {
        let key: MasterKey = random_bytes();
        let other: MasterKey = random_bytes();
        let nonce: Nonce24 = random_bytes();
        let sealed = seal(&key, &nonce, b"", b"value").unwrap();
        let err = open(&other, &nonce, b"", &sealed, VaultError::WrongPass).unwrap_err();
        assert!(matches!(err, VaultError::WrongPass));
    }

    #[test]
    fn open_fails_on_tampered_aad() {
        let key: MasterKey = random_bytes();
        let nonce: Nonce24 = random_bytes();
        let sealed = seal(&key, &nonce, b"original", b"value").unwrap();
        let err = open(&key, &nonce, b"tampered", &sealed, VaultError::CryptoErr).unwrap_err();
        assert!(matches!(err, VaultError::CryptoErr));
    }

    #[test]
    fn keyed_hash_is_keyed_and_deterministic() {
        let key_a: MasterKey = random_bytes();
        let key_b: MasterKey = random_bytes();
        let msg = b"message bytes";
        assert_eq!(keyed_hash(&key_a, msg), keyed_hash(&key_a, msg));
        assert_ne!(keyed_hash(&key_a, msg), keyed_hash(&key_b, msg));
    }

    #[test]
    fn streaming_hash_matches_one_shot() {
        let key: MasterKey = random_bytes();
        let msg = b"streamed in two pieces";
        let one_shot = keyed_hash(&key, msg);
        let mut streaming = StreamingHash::new(&key);
        streaming.update(&msg[..10]).update(&msg[10..]);
        assert_eq!(streaming.finalize(), one_shot);
    }

    #[test]
    fn ct_eq_rejects_length_mismatch_and_content_mismatch() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"abcd"));
    }
}

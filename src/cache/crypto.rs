//! Per-caller sealing of cached payloads
//!
//! Every entry is sealed with AES-256-GCM under a key derived from a secret
//! the caller holds. The store only ever sees the derived key, never the
//! secret, and a key's public fingerprint is kept next to the ciphertext.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Domain separation prefix for cache keys
const KEY_CONTEXT: &[u8] = b"conso-cache-key-v1\0";

/// Domain separation prefix for key fingerprints
const FINGERPRINT_CONTEXT: &[u8] = b"conso-cache-fingerprint-v1\0";

/// Symmetric key used to seal one caller's cache entries
#[derive(Clone)]
pub struct CallerKey {
    key: [u8; 32],
    fingerprint: String,
}

impl std::fmt::Debug for CallerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Nonce and ciphertext (with tag) produced by [`CallerKey::seal`]
#[derive(Debug, Clone)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl CallerKey {
    /// Derive the cache key from a caller-held secret
    #[must_use]
    pub fn derive(secret: &SecretString) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(secret.expose_secret().as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self::from_bytes(key)
    }

    /// Wrap raw key material
    #[must_use]
    pub fn from_bytes(key: [u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_CONTEXT);
        hasher.update(key);
        let digest = hasher.finalize();
        let fingerprint = hex::encode(&digest[..8]);
        Self { key, fingerprint }
    }

    /// Public identifier of this key, safe to store and log
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypt a payload under a fresh random nonce
    ///
    /// # Errors
    ///
    /// Returns error if the cipher rejects the input
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed> {
        let cipher = Aes256Gcm::new(&self.key.into());

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

        Ok(Sealed { nonce, ciphertext })
    }

    /// Decrypt and authenticate a sealed payload
    ///
    /// # Errors
    ///
    /// Returns error if the nonce is malformed or authentication fails
    /// (wrong key or tampered ciphertext)
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(Error::Crypto(format!("invalid nonce length {}", nonce.len())));
        }
        let cipher = Aes256Gcm::new(&self.key.into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(format!("decryption failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(secret: &str) -> CallerKey {
        CallerKey::derive(&SecretString::new(secret.into()))
    }

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(key("alpha").fingerprint(), key("alpha").fingerprint());
        assert_ne!(key("alpha").fingerprint(), key("beta").fingerprint());
    }

    #[test]
    fn seal_then_open() {
        let k = key("alpha");
        let sealed = k.seal(b"{\"value\":\"42\"}").unwrap();
        assert_eq!(k.open(&sealed.nonce, &sealed.ciphertext).unwrap(), b"{\"value\":\"42\"}");
    }

    #[test]
    fn nonces_are_unique() {
        let k = key("alpha");
        let a = k.seal(b"same").unwrap();
        let b = k.seal(b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = key("alpha").seal(b"payload").unwrap();
        assert!(matches!(
            key("beta").open(&sealed.nonce, &sealed.ciphertext),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let k = key("alpha");
        let mut sealed = k.seal(b"payload").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(k.open(&sealed.nonce, &sealed.ciphertext).is_err());
        assert!(k.open(&[0u8; 4], &sealed.ciphertext).is_err());
    }

    #[test]
    fn debug_hides_key_material() {
        let rendered = format!("{:?}", key("alpha"));
        assert!(rendered.contains("fingerprint"));
        assert!(!rendered.contains("key:"));
    }
}

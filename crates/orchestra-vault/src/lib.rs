//! Secret vault: AES-256-GCM encryption for credentials at rest.
//!
//! Ciphertexts are `nonce || ciphertext || tag` with a fresh random nonce
//! per call, so encryption is non-deterministic. The vault itself is
//! stateless; callers own the ciphertext rows.

pub mod pem;

pub use pem::normalize_pem_key;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use thiserror::Error;

/// AES-GCM nonce length in bytes.
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid encryption key: expected 64 hex chars (32 bytes)")]
    InvalidKey,

    #[error("ciphertext too short")]
    CiphertextTooShort,

    #[error("authentication failed: wrong key or corrupted ciphertext")]
    AuthFail,

    #[error("encryption failed")]
    EncryptFail,
}

/// Stateless AES-256-GCM cipher over a 32-byte key.
#[derive(Clone)]
pub struct Vault {
    key: [u8; 32],
}

impl Vault {
    /// Build a vault from a hex-encoded 32-byte key.
    pub fn new(key_hex: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(key_hex).map_err(|_| VaultError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| VaultError::InvalidKey)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::EncryptFail)?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, VaultError> {
        if data.len() < NONCE_SIZE {
            return Err(VaultError::CiphertextTooShort);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| VaultError::InvalidKey)?;
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher.decrypt(nonce, ciphertext).map_err(|_| VaultError::AuthFail)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const KEY_B: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let vault = Vault::new(KEY_A).unwrap();
        let plaintext = b"Hello, World! This is a test message.";

        let encrypted = vault.encrypt(plaintext).unwrap();
        assert_ne!(&encrypted[..], &plaintext[..]);

        let decrypted = vault.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_different_each_time() {
        let vault = Vault::new(KEY_A).unwrap();

        let encrypted1 = vault.encrypt(b"same message").unwrap();
        let encrypted2 = vault.encrypt(b"same message").unwrap();

        // Random nonce per call
        assert_ne!(encrypted1, encrypted2);
        assert_eq!(vault.decrypt(&encrypted1).unwrap(), b"same message");
        assert_eq!(vault.decrypt(&encrypted2).unwrap(), b"same message");
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let vault_a = Vault::new(KEY_A).unwrap();
        let vault_b = Vault::new(KEY_B).unwrap();

        let encrypted = vault_a.encrypt(b"hello").unwrap();
        let result = vault_b.decrypt(&encrypted);
        assert!(matches!(result, Err(VaultError::AuthFail)));
    }

    #[test]
    fn test_decrypt_too_short() {
        let vault = Vault::new(KEY_A).unwrap();
        let result = vault.decrypt(b"short");
        assert!(matches!(result, Err(VaultError::CiphertextTooShort)));
    }

    #[test]
    fn test_decrypt_corrupted_ciphertext_fails() {
        let vault = Vault::new(KEY_A).unwrap();
        let mut encrypted = vault.encrypt(b"payload").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xff;

        assert!(matches!(vault.decrypt(&encrypted), Err(VaultError::AuthFail)));
    }

    #[test]
    fn test_encrypt_empty_plaintext() {
        let vault = Vault::new(KEY_A).unwrap();
        let encrypted = vault.encrypt(b"").unwrap();
        assert_eq!(vault.decrypt(&encrypted).unwrap(), b"");
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(matches!(Vault::new("deadbeef"), Err(VaultError::InvalidKey)));
        assert!(matches!(Vault::new("not hex at all"), Err(VaultError::InvalidKey)));
    }
}

//! AES-256-GCM sealing for vault values at rest.
//!
//! Each value is bound to its `(scope, key)` slot through the AEAD
//! associated data, so a ciphertext copied into another slot fails to open.

use super::VaultError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use ring::rand::{SecureRandom, SystemRandom};
use std::path::Path;

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const NONCE_SIZE: usize = 12;

/// Key size for AES-256.
pub const KEY_SIZE: usize = 32;

/// AES-256-GCM sealing engine for vault slots.
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    /// Create a sealer from a 256-bit key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Result<Self, VaultError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| VaultError::Crypto(format!("Cipher init failed: {e}")))?;
        Ok(Self { cipher })
    }

    /// Load the key file at `path`, creating it with a fresh random key if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, VaultError> {
        let key = if path.exists() {
            let bytes = std::fs::read(path)?;
            if bytes.len() != KEY_SIZE {
                return Err(VaultError::Corrupt(format!(
                    "Vault key must be exactly {KEY_SIZE} bytes, got {}",
                    bytes.len()
                )));
            }
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&bytes);
            key
        } else {
            let mut key = [0u8; KEY_SIZE];
            SystemRandom::new()
                .fill(&mut key)
                .map_err(|_| VaultError::Crypto("System RNG unavailable".into()))?;
            write_private_file(path, &key)?;
            tracing::info!(path = %path.display(), "Generated new vault key");
            key
        };
        Self::new(&key)
    }

    /// Encrypt `plaintext` for the given slot. Output: `[nonce][ciphertext+tag]`.
    pub fn seal(&self, slot: &str, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: slot.as_bytes(),
                },
            )
            .map_err(|e| VaultError::Crypto(format!("Encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a value sealed for the given slot.
    pub fn open(&self, slot: &str, sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
        if sealed.len() < NONCE_SIZE {
            return Err(VaultError::Corrupt(format!("Sealed value for '{slot}' too short")));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: slot.as_bytes(),
                },
            )
            .map_err(|_| VaultError::Corrupt(format!("Value for '{slot}' failed authentication")))
    }
}

#[cfg(unix)]
fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    std::fs::write(path, bytes)?;
    Ok(())
}

//! Device identifier derivation and device key material.
//!
//! The device identifier is an HMAC-SHA256 of a fixed label keyed with the
//! installation seed. Cooperating applications read the same seed from the
//! shared vault scope, so they all derive the same identifier.

use crate::vault::VaultError;
use base64::Engine;
use hmac::{Hmac, Mac};
use ring::signature::{Ed25519KeyPair, KeyPair};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Domain label mixed into the identifier derivation.
const DEVICE_ID_LABEL: &[u8] = b"gatewarden.device-identifier.v1";

/// Derive the stable device identifier (64 hex chars) from the installation seed.
pub fn derive_device_id(seed: &[u8]) -> Result<String, VaultError> {
    let mut mac = HmacSha256::new_from_slice(seed)
        .map_err(|e| VaultError::Crypto(format!("Invalid installation seed: {e}")))?;
    mac.update(DEVICE_ID_LABEL);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Human-readable name sent with registration.
pub fn default_device_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty());
    match host {
        Some(host) => format!("{host} ({}/{})", std::env::consts::OS, std::env::consts::ARCH),
        None => format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
    }
}

/// Ed25519 device key pair held as a PKCS#8 document.
pub struct DeviceKey {
    pkcs8: Zeroizing<Vec<u8>>,
    pair: Ed25519KeyPair,
}

impl DeviceKey {
    /// Generate a fresh key pair from the system RNG.
    pub fn generate() -> Result<Self, VaultError> {
        let rng = ring::rand::SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| VaultError::Crypto("Device key generation failed".into()))?;
        Self::from_pkcs8(doc.as_ref())
    }

    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self, VaultError> {
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| VaultError::Corrupt(format!("Invalid device key: {e}")))?;
        Ok(Self {
            pkcs8: Zeroizing::new(pkcs8.to_vec()),
            pair,
        })
    }

    /// Load a key stored as base64 PKCS#8.
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let bytes = Zeroizing::new(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| VaultError::Corrupt(format!("Device key is not base64: {e}")))?,
        );
        Self::from_pkcs8(&bytes)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.pkcs8.as_slice())
    }

    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    /// Raw public key, base64.
    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.pair.public_key().as_ref())
    }

    /// Signature over `message`, base64.
    pub fn sign_base64(&self, message: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.pair.sign(message).as_ref())
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::signature::{UnparsedPublicKey, ED25519};

    #[test]
    fn device_id_is_deterministic_per_seed() {
        let a = derive_device_id(&[1u8; 32]).unwrap();
        let b = derive_device_id(&[1u8; 32]).unwrap();
        let c = derive_device_id(&[2u8; 32]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn device_name_is_non_empty() {
        assert!(!default_device_name().is_empty());
    }

    #[test]
    fn key_roundtrips_through_base64() {
        let key = DeviceKey::generate().unwrap();
        let restored = DeviceKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.public_key_base64(), restored.public_key_base64());
    }

    #[test]
    fn signature_verifies_with_public_key() {
        let key = DeviceKey::generate().unwrap();
        let sig = base64::engine::general_purpose::STANDARD
            .decode(key.sign_base64(b"device-1"))
            .unwrap();
        let public = base64::engine::general_purpose::STANDARD
            .decode(key.public_key_base64())
            .unwrap();
        UnparsedPublicKey::new(&ED25519, &public)
            .verify(b"device-1", &sig)
            .unwrap();
    }

    #[test]
    fn garbage_key_is_corrupt() {
        assert!(matches!(DeviceKey::from_base64("AAAA"), Err(VaultError::Corrupt(_))));
        assert!(matches!(DeviceKey::from_base64("!!"), Err(VaultError::Corrupt(_))));
    }

    #[test]
    fn debug_hides_private_key() {
        let key = DeviceKey::generate().unwrap();
        let shown = format!("{key:?}");
        assert!(!shown.contains(&key.to_base64()));
    }
}

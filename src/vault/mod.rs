//! Credential vault: typed, scoped access to persisted secrets.
//!
//! Provides:
//! - Installation-scoped slots (per application: access/refresh tokens)
//! - Shared slots (per cooperating-app group: installation seed, device
//!   registration, and with SSO the ID token and user identity)
//! - Atomic replace: every record is one serialized value in one slot
//!
//! Storage failures are always surfaced. There is no fallback to an
//! unencrypted or in-memory store once a backend has been chosen.

pub mod encryption;
pub mod store;

pub use store::{MemorySecretStore, SecretStore, SqliteSecretStore};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Errors from the vault and its backends.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault backend error: {0}")]
    Backend(String),
    #[error("vault data corrupt: {0}")]
    Corrupt(String),
    #[error("vault crypto error: {0}")]
    Crypto(String),
    #[error("vault I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Visibility of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultScope {
    /// Private to this application.
    Installation,
    /// Shared by every cooperating application using the same shared scope name.
    Shared,
}

/// Named records the runtime persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultSlot {
    /// Stable random seed the device identifier is derived from.
    InstallationSeed,
    /// Device key pair, client certificate and registration status.
    DeviceRegistration,
    /// Whether the user has confirmed a device lock code.
    DeviceLock,
    /// Current access/refresh token set.
    TokenSet,
    /// SSO ID token.
    IdToken,
    /// Authenticated user identity.
    UserIdentity,
}

impl VaultSlot {
    pub fn key(self) -> &'static str {
        match self {
            Self::InstallationSeed => "installation_seed",
            Self::DeviceRegistration => "device_registration",
            Self::DeviceLock => "device_lock",
            Self::TokenSet => "token_set",
            Self::IdToken => "id_token",
            Self::UserIdentity => "user_identity",
        }
    }

    /// Scope of the slot. Identity slots follow the SSO setting.
    pub fn scope(self, sso_enabled: bool) -> VaultScope {
        match self {
            Self::InstallationSeed | Self::DeviceRegistration | Self::DeviceLock => VaultScope::Shared,
            Self::TokenSet => VaultScope::Installation,
            Self::IdToken | Self::UserIdentity if sso_enabled => VaultScope::Shared,
            Self::IdToken | Self::UserIdentity => VaultScope::Installation,
        }
    }

    const ALL: [VaultSlot; 6] = [
        Self::InstallationSeed,
        Self::DeviceRegistration,
        Self::DeviceLock,
        Self::TokenSet,
        Self::IdToken,
        Self::UserIdentity,
    ];
}

/// Typed facade over a [`SecretStore`].
#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn SecretStore>,
    installation_scope: String,
    shared_scope: String,
    sso_enabled: bool,
}

impl CredentialVault {
    /// `app_id` names the installation scope (normally the client id);
    /// `shared_group` names the scope cooperating apps share.
    pub fn new(store: Arc<dyn SecretStore>, app_id: &str, shared_group: &str, sso_enabled: bool) -> Self {
        Self {
            store,
            installation_scope: format!("app:{app_id}"),
            shared_scope: format!("shared:{shared_group}"),
            sso_enabled,
        }
    }

    /// In-memory vault, for tests and throwaway sessions.
    pub fn in_memory(app_id: &str) -> Self {
        Self::new(Arc::new(MemorySecretStore::new()), app_id, "default", true)
    }

    fn scope_name(&self, slot: VaultSlot) -> &str {
        match slot.scope(self.sso_enabled) {
            VaultScope::Installation => &self.installation_scope,
            VaultScope::Shared => &self.shared_scope,
        }
    }

    /// Read and deserialize a record.
    pub fn get<T: DeserializeOwned>(&self, slot: VaultSlot) -> Result<Option<T>, VaultError> {
        match self.store.get(self.scope_name(slot), slot.key())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| VaultError::Corrupt(format!("{}: {e}", slot.key()))),
            None => Ok(None),
        }
    }

    /// Serialize and atomically replace a record.
    pub fn put<T: Serialize>(&self, slot: VaultSlot, value: &T) -> Result<(), VaultError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| VaultError::Backend(format!("Cannot encode {}: {e}", slot.key())))?;
        self.store.put(self.scope_name(slot), slot.key(), &bytes)
    }

    /// Remove a record. Returns whether it existed.
    pub fn remove(&self, slot: VaultSlot) -> Result<bool, VaultError> {
        self.store.delete(self.scope_name(slot), slot.key())
    }

    /// Stable per-installation seed, created on first use.
    pub fn installation_seed(&self) -> Result<Vec<u8>, VaultError> {
        if let Some(seed) = self.get::<String>(VaultSlot::InstallationSeed)? {
            return hex::decode(&seed)
                .map_err(|e| VaultError::Corrupt(format!("installation_seed: {e}")));
        }

        let mut seed = [0u8; 32];
        ring::rand::SecureRandom::fill(&ring::rand::SystemRandom::new(), &mut seed)
            .map_err(|_| VaultError::Crypto("System RNG unavailable".into()))?;
        self.put(VaultSlot::InstallationSeed, &hex::encode(seed))?;
        Ok(seed.to_vec())
    }

    /// Erase every record this runtime knows, in both scopes, except the
    /// installation seed (the device identity must survive a reset).
    pub fn reset_device(&self) -> Result<(), VaultError> {
        for slot in VaultSlot::ALL {
            if slot != VaultSlot::InstallationSeed {
                self.remove(slot)?;
            }
        }
        tracing::info!("Vault device state cleared");
        Ok(())
    }
}

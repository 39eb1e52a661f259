//! Device trust: registration status, device key and client certificate.
//!
//! ## Design
//! - The device identifier is derived from the shared installation seed
//! - Registration generates an Ed25519 key, proves possession by signing the
//!   device id and stores the returned client certificate in the vault
//! - Registration attempts are serialized; concurrent callers wait for the
//!   attempt in flight and observe its result
//! - A stored record that no longer loads is reported as `Invalid` and is
//!   replaced by the next registration

pub mod identity;

pub use identity::{default_device_name, derive_device_id, DeviceKey};

use crate::config::RegistrationMode;
use crate::error::PipelineError;
use crate::gateway::{GatewayApi, GatewayError, RegistrationRequest};
use crate::queue::InteractionKind;
use crate::token::{Credentials, UserIdentity};
use crate::vault::{CredentialVault, VaultSlot};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Minimum length of a device lock code.
const MIN_LOCK_CODE_LEN: usize = 4;

/// Registration status of this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Unregistered,
    Registering,
    Registered,
    /// A record exists but cannot be used.
    Invalid,
}

/// Persisted registration record.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    /// PKCS#8 device key, base64.
    pub private_key: String,
    /// Client certificate, PEM.
    pub client_certificate: String,
    pub registered_at: DateTime<Utc>,
}

/// Persisted device lock confirmation. The code itself is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceLock {
    confirmed_at: DateTime<Utc>,
}

/// Result of [`DeviceTrustManager::ensure_registered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustCheck {
    Registered,
    InteractionRequired(InteractionKind),
}

/// Owns the device registration lifecycle.
pub struct DeviceTrustManager {
    vault: CredentialVault,
    gateway: Arc<dyn GatewayApi>,
    mode: RegistrationMode,
    require_device_lock: bool,
    device_id: String,
    device_name: String,
    status: RwLock<RegistrationStatus>,
    record: tokio::sync::Mutex<Option<DeviceRecord>>,
    /// Completed registration attempts.
    attempts: AtomicU64,
    last_failure: parking_lot::Mutex<Option<(u64, PipelineError)>>,
}

impl DeviceTrustManager {
    /// Derive the device id and restore any persisted registration.
    pub fn new(
        vault: CredentialVault,
        gateway: Arc<dyn GatewayApi>,
        mode: RegistrationMode,
        require_device_lock: bool,
    ) -> Result<Self, PipelineError> {
        let device_id = derive_device_id(&vault.installation_seed()?)?;
        let (record, status) = match vault.get::<DeviceRecord>(VaultSlot::DeviceRegistration) {
            Ok(Some(record)) => match Self::activate(gateway.as_ref(), &record) {
                Ok(()) => (Some(record), RegistrationStatus::Registered),
                Err(e) => {
                    tracing::warn!(%device_id, "Stored device registration unusable: {e}");
                    (None, RegistrationStatus::Invalid)
                }
            },
            Ok(None) => (None, RegistrationStatus::Unregistered),
            Err(e) => {
                tracing::warn!(%device_id, "Stored device registration unreadable: {e}");
                (None, RegistrationStatus::Invalid)
            }
        };
        tracing::debug!(%device_id, ?status, "Device trust restored");

        Ok(Self {
            vault,
            gateway,
            mode,
            require_device_lock,
            device_id,
            device_name: default_device_name(),
            status: RwLock::new(status),
            record: tokio::sync::Mutex::new(record),
            attempts: AtomicU64::new(0),
            last_failure: parking_lot::Mutex::new(None),
        })
    }

    /// Load the key and present the certificate on later gateway calls.
    fn activate(gateway: &dyn GatewayApi, record: &DeviceRecord) -> Result<(), PipelineError> {
        let key = DeviceKey::from_base64(&record.private_key)?;
        if record.client_certificate.trim().is_empty() {
            return Err(PipelineError::Storage(crate::vault::VaultError::Corrupt(
                "device record has no certificate".into(),
            )));
        }
        gateway.install_client_identity(&record.device_id, &record.client_certificate, key.pkcs8())?;
        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn status(&self) -> RegistrationStatus {
        *self.status.read()
    }

    pub fn is_registered(&self) -> bool {
        self.status() == RegistrationStatus::Registered
    }

    fn set_status(&self, status: RegistrationStatus) {
        *self.status.write() = status;
    }

    /// Whether a device lock code has been confirmed on this device.
    pub fn lock_confirmed(&self) -> Result<bool, PipelineError> {
        Ok(self.vault.get::<DeviceLock>(VaultSlot::DeviceLock)?.is_some())
    }

    /// Record that the user set a device lock code.
    pub fn confirm_device_lock(&self, code: &str) -> Result<(), PipelineError> {
        let code = code.trim();
        if code.len() < MIN_LOCK_CODE_LEN {
            return Err(PipelineError::InteractionCancelled(format!(
                "device lock code must be at least {MIN_LOCK_CODE_LEN} characters"
            )));
        }
        self.vault.put(
            VaultSlot::DeviceLock,
            &DeviceLock {
                confirmed_at: Utc::now(),
            },
        )?;
        tracing::info!(device_id = %self.device_id, "Device lock confirmed");
        Ok(())
    }

    /// Make sure the device is registered, registering it if needed.
    ///
    /// Returns `InteractionRequired` when a lock code or user credentials
    /// must be supplied first. No network call is made in that case.
    pub async fn ensure_registered(&self, credentials: Option<&Credentials>) -> Result<TrustCheck, PipelineError> {
        if self.is_registered() {
            return Ok(TrustCheck::Registered);
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let mut record = self.record.lock().await;
        if record.is_some() {
            return Ok(TrustCheck::Registered);
        }
        // an attempt finished while we waited: share its failure
        if let Some((attempt, err)) = self.last_failure.lock().as_ref() {
            if *attempt > seen {
                return Err(err.shared_copy());
            }
        }

        if self.require_device_lock && !self.lock_confirmed()? {
            return Ok(TrustCheck::InteractionRequired(InteractionKind::DeviceLockCode));
        }
        let credentials = match (self.mode, credentials) {
            (RegistrationMode::UserCredentials, None) => {
                return Ok(TrustCheck::InteractionRequired(InteractionKind::Credentials));
            }
            (RegistrationMode::UserCredentials, Some(c)) => Some(c),
            (RegistrationMode::ClientCredentials, _) => None,
        };

        let previous = self.status();
        self.set_status(RegistrationStatus::Registering);
        let result = self.register(credentials).await;
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        match result {
            Ok(new_record) => {
                *record = Some(new_record);
                *self.last_failure.lock() = None;
                self.set_status(RegistrationStatus::Registered);
                Ok(TrustCheck::Registered)
            }
            Err(e) => {
                *self.last_failure.lock() = Some((attempt, e.shared_copy()));
                let status = if previous == RegistrationStatus::Invalid {
                    RegistrationStatus::Invalid
                } else {
                    RegistrationStatus::Unregistered
                };
                self.set_status(status);
                Err(e)
            }
        }
    }

    async fn register(&self, credentials: Option<&Credentials>) -> Result<DeviceRecord, PipelineError> {
        let key = DeviceKey::generate()?;
        let request = RegistrationRequest {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            public_key: key.public_key_base64(),
            proof: key.sign_base64(self.device_id.as_bytes()),
            credentials: credentials.map(|c| (c.username().to_string(), c.password().to_string())),
        };
        tracing::info!(device_id = %self.device_id, mode = ?self.mode, "Registering device");

        let grant = self.gateway.register_device(&request).await.map_err(|e| match e {
            GatewayError::Rejected { status, message } => {
                tracing::warn!(device_id = %self.device_id, status, "Device registration rejected");
                PipelineError::RegistrationRejected(format!("gateway answered {status}: {message}"))
            }
            other => {
                tracing::warn!(device_id = %self.device_id, "Device registration failed: {other}");
                PipelineError::from(other)
            }
        })?;

        let record = DeviceRecord {
            device_id: self.device_id.clone(),
            private_key: key.to_base64(),
            client_certificate: grant.client_certificate,
            registered_at: Utc::now(),
        };
        self.vault.put(VaultSlot::DeviceRegistration, &record)?;
        if let Some(id_token) = &grant.id_token {
            self.vault.put(VaultSlot::IdToken, id_token)?;
        }
        if let Some(c) = credentials {
            self.vault.put(VaultSlot::UserIdentity, &UserIdentity::new(c.username()))?;
        }
        self.gateway
            .install_client_identity(&record.device_id, &record.client_certificate, key.pkcs8())?;
        Ok(record)
    }

    /// Remove the registration. With `contact_server`, first ask the gateway
    /// to forget the device; a failure there is logged and local state is
    /// cleared regardless.
    pub async fn deregister(&self, contact_server: bool) -> Result<(), PipelineError> {
        let mut record = self.record.lock().await;
        if contact_server && record.is_some() {
            if let Err(e) = self.gateway.unregister_device(&self.device_id).await {
                tracing::warn!(device_id = %self.device_id, "Server-side deregistration failed: {e}");
            }
        }
        self.vault.reset_device()?;
        self.gateway.clear_client_identity();
        *record = None;
        self.set_status(RegistrationStatus::Unregistered);
        tracing::info!(device_id = %self.device_id, "Device registration removed");
        Ok(())
    }
}

//! Error taxonomy for the request pipeline.
//!
//! [`PipelineError`] is what the public API returns synchronously (e.g. a
//! malformed request rejected by `submit`). [`ErrorKind`] is the flattened
//! classification carried inside a terminal [`crate::dispatch::Failure`]
//! outcome, which also needs `Timeout` and non-401 HTTP status codes.

use serde::{Deserialize, Serialize};

use crate::gateway::GatewayError;
use crate::vault::VaultError;

/// Errors surfaced by the pipeline and its components.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Transient transport failure; safe for the caller to retry.
    #[error("network error: {0}")]
    Network(String),

    /// The gateway kept rejecting the access token after one refresh attempt.
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// The gateway rejected the device or the registration credentials.
    #[error("device registration rejected: {0}")]
    RegistrationRejected(String),

    /// The user declined to supply a required prerequisite.
    #[error("interaction cancelled: {0}")]
    InteractionCancelled(String),

    /// Malformed target, grant or gateway configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Secure storage unavailable or corrupt.
    #[error("storage error: {0}")]
    Storage(#[from] VaultError),

    /// The orchestrator has been stopped and accepts no new work.
    #[error("session orchestrator is stopped")]
    Stopped,
}

impl PipelineError {
    /// Classification used when this error terminates a request.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::Network,
            Self::AuthorizationFailed(_) => ErrorKind::AuthorizationFailed,
            Self::RegistrationRejected(_) => ErrorKind::RegistrationRejected,
            Self::InteractionCancelled(_) => ErrorKind::InteractionCancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Stopped => ErrorKind::Stopped,
        }
    }

    /// Copy handed to callers that waited on the same failed attempt.
    pub(crate) fn shared_copy(&self) -> Self {
        match self {
            Self::Network(m) => Self::Network(m.clone()),
            Self::AuthorizationFailed(m) => Self::AuthorizationFailed(m.clone()),
            Self::RegistrationRejected(m) => Self::RegistrationRejected(m.clone()),
            Self::InteractionCancelled(m) => Self::InteractionCancelled(m.clone()),
            Self::Configuration(m) => Self::Configuration(m.clone()),
            Self::Storage(e) => Self::Storage(VaultError::Backend(e.to_string())),
            Self::Stopped => Self::Stopped,
        }
    }
}

impl From<GatewayError> for PipelineError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Network(msg) => Self::Network(msg),
            GatewayError::Timeout => Self::Network("gateway request timed out".into()),
            GatewayError::Rejected { status, message } => {
                Self::AuthorizationFailed(format!("gateway rejected request ({status}): {message}"))
            }
            GatewayError::Protocol(msg) => Self::Network(format!("malformed gateway response: {msg}")),
            GatewayError::Configuration(msg) => Self::Configuration(msg),
        }
    }
}

/// Failure classification delivered to result sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    /// Non-2xx response other than 401.
    HttpStatus(u16),
    AuthorizationFailed,
    RegistrationRejected,
    InteractionCancelled,
    Configuration,
    Storage,
    Stopped,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::HttpStatus(_) => "http_status",
            Self::AuthorizationFailed => "authorization_failed",
            Self::RegistrationRejected => "registration_rejected",
            Self::InteractionCancelled => "interaction_cancelled",
            Self::Configuration => "configuration",
            Self::Storage => "storage",
            Self::Stopped => "stopped",
        }
    }

    /// Whether a caller-driven retry may succeed without user action.
    pub fn is_transient(self) -> bool {
        match self {
            Self::Network | Self::Timeout => true,
            Self::HttpStatus(status) => status >= 500,
            _ => false,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HttpStatus(status) => write!(f, "http_status({status})"),
            other => f.write_str(other.label()),
        }
    }
}

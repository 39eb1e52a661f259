//! Session: the orchestrator, its status model and the prompt surface.

mod orchestrator;
pub mod prompt;

pub use orchestrator::SessionOrchestrator;
pub use prompt::{NoPromptSurface, Prompt, PromptResolution, PromptSurface};

use crate::device::RegistrationStatus;
use crate::queue::InteractionKind;
use crate::token::UserIdentity;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Login status derived from the app-logon and user-login flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

impl LoginStatus {
    /// `app_logon`: a usable access token exists. `user_login`: an ID token
    /// or a user identity exists. Either one means logged in.
    pub fn from_flags(app_logon: bool, user_login: bool, flow_in_progress: bool) -> Self {
        if flow_in_progress {
            Self::LoggingIn
        } else if app_logon || user_login {
            Self::LoggedIn
        } else {
            Self::LoggedOut
        }
    }
}

impl std::fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::LoggedOut => "logged out",
            Self::LoggingIn => "logging in",
            Self::LoggedIn => "logged in",
        })
    }
}

/// Notifications about session changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Requests are waiting; call `resume_pending` to prompt.
    InteractionRequired(InteractionKind),
    Registered { device_id: String },
    LoggedIn { username: Option<String> },
    LoggedOut,
    DeviceReset,
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub device_id: String,
    pub registration: RegistrationStatus,
    pub login_status: LoginStatus,
    pub app_logon: bool,
    pub user: Option<UserIdentity>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub queued_requests: usize,
    pub pending_interactions: Vec<InteractionKind>,
}

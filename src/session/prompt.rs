//! Prompt surface: how the pipeline asks a human for prerequisites.

use crate::queue::InteractionKind;
use crate::token::Credentials;
use async_trait::async_trait;

/// What the pipeline needs from the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Credentials,
    DeviceLockCode,
    /// Open `url` in a browser and paste back the authorization code.
    RemoteAuthorization { url: String },
}

impl Prompt {
    pub fn kind(&self) -> InteractionKind {
        match self {
            Self::Credentials => InteractionKind::Credentials,
            Self::DeviceLockCode => InteractionKind::DeviceLockCode,
            Self::RemoteAuthorization { .. } => InteractionKind::RemoteAuthorization,
        }
    }
}

/// The user's answer to a [`Prompt`].
#[derive(Debug, Clone)]
pub enum PromptResolution {
    Credentials(Credentials),
    LockCode(String),
    AuthorizationCode(String),
    Cancelled,
}

/// UI surface able to answer prompts.
#[async_trait]
pub trait PromptSurface: Send + Sync {
    async fn resolve(&self, prompt: Prompt) -> PromptResolution;
}

/// Surface for headless use: every prompt is declined.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPromptSurface;

#[async_trait]
impl PromptSurface for NoPromptSurface {
    async fn resolve(&self, prompt: Prompt) -> PromptResolution {
        tracing::debug!(kind = %prompt.kind(), "No prompt surface, declining");
        PromptResolution::Cancelled
    }
}

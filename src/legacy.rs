//! Older logout and registration-removal entry points.
//!
//! Kept for callers written against the earlier API. Each one forwards to
//! the corresponding [`SessionOrchestrator`] operation.

use crate::error::PipelineError;
use crate::session::SessionOrchestrator;

impl SessionOrchestrator {
    /// Drop the access token only; the user stays logged in.
    #[deprecated(note = "use `clear_app_session`")]
    pub async fn logoff_app(&self) -> Result<(), PipelineError> {
        self.clear_app_session().await
    }

    #[deprecated(note = "use `logout(true)`")]
    pub async fn logout_device(&self) -> Result<(), PipelineError> {
        self.logout(true).await
    }

    #[deprecated(note = "use `deregister(true)`")]
    pub async fn remove_device_registration(&self) -> Result<(), PipelineError> {
        self.deregister(true).await
    }

    /// Wipe every persisted token and the registration without telling the
    /// gateway.
    #[deprecated(note = "use `deregister(false)`")]
    pub async fn destroy_all_persistent_tokens(&self) -> Result<(), PipelineError> {
        self.deregister(false).await
    }
}

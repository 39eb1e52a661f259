//! Client-side security runtime for gateway APIs.
//!
//! Requests submitted to a [`SessionOrchestrator`] are driven through
//! device registration and token acquisition before they hit the network.
//! Prerequisites that need a human (credentials, a device lock code, a
//! remote authorization) park the request until
//! [`SessionOrchestrator::resume_pending`] collects them through a
//! [`PromptSurface`]. Every accepted request gets exactly one [`Outcome`].

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod legacy;
pub mod queue;
pub mod session;
pub mod token;
pub mod vault;

pub use config::Config;
pub use dispatch::{sink_fn, Failure, Outcome, ResultSink};
pub use error::{ErrorKind, PipelineError};
pub use gateway::{ApiRequest, ApiResponse, GatewayApi, HttpGateway, Method};
pub use queue::{InteractionKind, RequestId};
pub use session::{
    LoginStatus, NoPromptSurface, Prompt, PromptResolution, PromptSurface, SessionEvent, SessionOrchestrator,
    SessionState,
};
pub use token::{Credentials, UserIdentity};
pub use vault::CredentialVault;

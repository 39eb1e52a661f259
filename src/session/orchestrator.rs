//! Session orchestrator: drives each request from submission to outcome.
//!
//! ## Design
//! - One spawned task per request; suspension is a queue state, never a
//!   parked task
//! - Device trust and tokens are owned by their managers; the orchestrator
//!   only sequences them
//! - Network attempts are bounded by a semaphore and a per-attempt timeout
//! - Logout, login and device reset take the write side of a gate that
//!   every request driver holds for reading

use super::prompt::{Prompt, PromptResolution, PromptSurface};
use super::{LoginStatus, SessionEvent, SessionState};
use crate::config::{Config, GrantFlow};
use crate::device::{DeviceTrustManager, RegistrationStatus, TrustCheck};
use crate::dispatch::{Failure, Outcome, ResultDispatcher, ResultSink};
use crate::error::{ErrorKind, PipelineError};
use crate::gateway::{ApiRequest, ApiResponse, AuthorizedCall, GatewayApi, GatewayError, HttpGateway};
use crate::queue::{
    Cancelled, InteractionKind, Parked, PendingInteraction, Request, RequestId, RequestIdGenerator,
    RequestQueue, RequestSnapshot, RequestState,
};
use crate::token::{Acquisition, ActiveToken, Credentials, FlowInputs, TokenAuthority, UserIdentity};
use crate::vault::{CredentialVault, SqliteSecretStore};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Capacity of the session event channel.
const EVENT_CAPACITY: usize = 64;

/// User material handed over by prompts or `login`, consumed by the next
/// flow that needs it.
#[derive(Default)]
struct Inbox {
    credentials: Option<Credentials>,
    authorization_code: Option<Zeroizing<String>>,
}

impl Inbox {
    /// Clear everything; returns whether anything was held.
    fn take_all(&mut self) -> bool {
        let held = self.credentials.is_some() || self.authorization_code.is_some();
        self.credentials = None;
        self.authorization_code = None;
        held
    }
}

struct Inner {
    config: Arc<Config>,
    gateway: Arc<dyn GatewayApi>,
    prompts: Arc<dyn PromptSurface>,
    trust: DeviceTrustManager,
    authority: TokenAuthority,
    queue: RequestQueue,
    dispatcher: ResultDispatcher,
    ids: RequestIdGenerator,
    inbox: parking_lot::Mutex<Inbox>,
    workers: Semaphore,
    gate: RwLock<()>,
    events: broadcast::Sender<SessionEvent>,
    registration_announced: AtomicBool,
    runtime: Handle,
    shutdown: CancellationToken,
}

/// Handle to the running pipeline. Cheap to clone; all clones share one
/// session.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    /// Start the pipeline with explicit collaborators. Must be called from
    /// within a Tokio runtime; later calls may come from any thread.
    pub fn start(
        config: Config,
        vault: CredentialVault,
        gateway: Arc<dyn GatewayApi>,
        prompts: Arc<dyn PromptSurface>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            PipelineError::Configuration("the session orchestrator must be started inside a Tokio runtime".into())
        })?;
        let config = Arc::new(config);

        let trust = DeviceTrustManager::new(
            vault.clone(),
            gateway.clone(),
            config.auth.registration,
            config.auth.require_device_lock,
        )?;
        let authority = TokenAuthority::new(config.clone(), vault, gateway.clone())?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(
            device_id = %trust.device_id(),
            registration = ?trust.status(),
            gateway = %config.gateway.host,
            "Session orchestrator started"
        );

        let registered = trust.is_registered();
        Ok(Self {
            inner: Arc::new(Inner {
                workers: Semaphore::new(config.pipeline.max_concurrent_requests),
                config,
                gateway,
                prompts,
                trust,
                authority,
                queue: RequestQueue::new(),
                dispatcher: ResultDispatcher::new(),
                ids: RequestIdGenerator::new(),
                inbox: parking_lot::Mutex::new(Inbox::default()),
                gate: RwLock::new(()),
                events,
                registration_announced: AtomicBool::new(registered),
                runtime,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Start with the encrypted SQLite vault in the configured data
    /// directory and the HTTP gateway backend.
    pub fn start_default(config: Config, prompts: Arc<dyn PromptSurface>) -> Result<Self, PipelineError> {
        config.validate()?;
        let store = SqliteSecretStore::open(&config.data_dir())?;
        let vault = CredentialVault::new(
            Arc::new(store),
            &config.gateway.client_id,
            &config.auth.shared_scope,
            config.auth.sso_enabled,
        );
        let gateway = HttpGateway::new(Arc::new(config.clone()))?;
        Self::start(config, vault, Arc::new(gateway), prompts)
    }

    fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.inner.shutdown.is_cancelled() {
            Err(PipelineError::Stopped)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }

    // ── Submission ───────────────────────────────────────────────

    /// Accept a request. Malformed targets fail here, before anything is
    /// queued; every accepted request gets exactly one outcome on `sink`.
    pub fn submit(&self, request: ApiRequest, sink: impl ResultSink) -> Result<RequestId, PipelineError> {
        self.ensure_running()?;
        let url = self.inner.config.resolve_uri(&request.target)?;
        let id = self.inner.ids.next_id();
        tracing::debug!(request_id = %id, method = %request.method, %url, "Request accepted");

        self.inner.dispatcher.register(id, Box::new(sink));
        self.inner.queue.insert(Request {
            id,
            api: request,
            url,
            retry_count: 0,
            created_at: Utc::now(),
        });
        self.spawn_drive(id);
        Ok(id)
    }

    /// [`submit`](Self::submit) with a oneshot channel as the sink.
    pub fn submit_channel(&self, request: ApiRequest) -> Result<(RequestId, oneshot::Receiver<Outcome>), PipelineError> {
        let (tx, rx) = oneshot::channel();
        let id = self.submit(request, tx)?;
        Ok((id, rx))
    }

    /// Cancel a request that has no outcome yet. Returns `false` if it
    /// already finished or is unknown.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.inner.queue.cancel(id) {
            Cancelled::Removed | Cancelled::Flagged => {
                tracing::debug!(request_id = %id, "Request cancelled");
                self.inner.dispatcher.deliver(id, Outcome::Cancelled)
            }
            Cancelled::NotFound => false,
        }
    }

    fn spawn_drive(&self, id: RequestId) {
        let this = self.clone();
        self.inner.runtime.spawn(async move { this.drive(id).await });
    }

    async fn drive(&self, id: RequestId) {
        let inner = &self.inner;
        let _gate = inner.gate.read().await;

        loop {
            if inner.shutdown.is_cancelled() {
                self.finish(id, Outcome::Cancelled);
                return;
            }
            let Some(request) = inner.queue.ready(id) else {
                return;
            };

            let credentials = inner.inbox.lock().credentials.clone();
            match inner.trust.ensure_registered(credentials.as_ref()).await {
                Ok(TrustCheck::Registered) => self.announce_registration(),
                Ok(TrustCheck::InteractionRequired(kind)) => {
                    self.park(id, kind);
                    return;
                }
                Err(e) => {
                    if matches!(e, PipelineError::RegistrationRejected(_)) {
                        inner.inbox.lock().take_all();
                    }
                    self.fail(id, e);
                    return;
                }
            }

            let token = match self.ensure_token_for(id).await {
                Ok(Some(token)) => token,
                Ok(None) => return,
                Err(e) => {
                    self.fail(id, e);
                    return;
                }
            };

            if !inner.queue.mark_executing(id) {
                return;
            }
            match self.execute(&request, &token).await {
                Ok(resp) if resp.is_unauthorized() => {
                    if request.retry_count == 0 {
                        tracing::debug!(request_id = %id, generation = token.generation, "401, retrying with a fresh token");
                        if let Err(e) = self.replace_refused_token(token.generation).await {
                            self.fail(id, e);
                            return;
                        }
                        if inner.queue.requeue_for_retry(id).is_none() {
                            return;
                        }
                        continue;
                    }
                    tracing::warn!(request_id = %id, "Access token rejected after refresh");
                    self.finish(
                        id,
                        Outcome::Failure(
                            Failure::new(ErrorKind::AuthorizationFailed, "gateway rejected the refreshed access token")
                                .with_response(resp),
                        ),
                    );
                }
                Ok(resp) if resp.is_success() => self.finish(id, Outcome::Success(resp)),
                Ok(resp) => {
                    let status = resp.status;
                    self.finish(
                        id,
                        Outcome::Failure(
                            Failure::new(ErrorKind::HttpStatus(status), format!("gateway answered {status}"))
                                .with_response(resp),
                        ),
                    );
                }
                Err(GatewayError::Timeout) => {
                    tracing::warn!(request_id = %id, "Request timed out");
                    self.finish(id, Outcome::Failure(Failure::new(ErrorKind::Timeout, "request timed out")));
                }
                Err(e) => self.fail(id, e.into()),
            }
            return;
        }
    }

    /// Token for the next attempt. `Ok(None)` means the request was parked.
    async fn ensure_token_for(&self, id: RequestId) -> Result<Option<ActiveToken>, PipelineError> {
        let inner = &self.inner;
        let (credentials, code) = {
            let inbox = inner.inbox.lock();
            (inbox.credentials.clone(), inbox.authorization_code.clone())
        };
        let inputs = FlowInputs {
            credentials: credentials.as_ref(),
            authorization_code: code.as_ref().map(|c| c.as_str()),
        };

        match inner.authority.ensure_token(inner.config.auth.grant_flow, inputs).await {
            Ok(Acquisition::Acquired(token)) => {
                if (credentials.is_some() || code.is_some()) && inner.inbox.lock().take_all() {
                    self.emit(SessionEvent::LoggedIn {
                        username: credentials.as_ref().map(|c| c.username().to_string()),
                    });
                }
                Ok(Some(token))
            }
            Ok(Acquisition::InteractionRequired(kind)) => {
                self.park(id, kind);
                Ok(None)
            }
            Err(e) => {
                if matches!(e, PipelineError::AuthorizationFailed(_)) {
                    inner.inbox.lock().take_all();
                }
                Err(e)
            }
        }
    }

    /// Invalidate the generation the gateway refused and refresh it once for
    /// every request that saw the 401. A grant that needs user input is left
    /// to the retry, which parks on it.
    async fn replace_refused_token(&self, generation: u64) -> Result<(), PipelineError> {
        let authority = &self.inner.authority;
        authority.invalidate_generation(generation).await?;
        authority
            .refresh(generation, self.inner.config.auth.grant_flow, FlowInputs::default())
            .await?;
        Ok(())
    }

    async fn execute(&self, request: &Request, token: &ActiveToken) -> Result<ApiResponse, GatewayError> {
        let _permit = self
            .inner
            .workers
            .acquire()
            .await
            .map_err(|_| GatewayError::Network("worker pool closed".into()))?;
        let call = AuthorizedCall {
            url: &request.url,
            method: request.api.method,
            headers: &request.api.headers,
            body: request.api.body.as_deref(),
            access_token: &token.access_token,
        };
        tracing::debug!(request_id = %request.id, retry = request.retry_count, "Executing request");
        match tokio::time::timeout(self.inner.config.request_timeout(), self.inner.gateway.execute(&call)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    /// Terminal transition; drops the outcome if the request was cancelled.
    fn finish(&self, id: RequestId, outcome: Outcome) {
        match self.inner.queue.complete(id) {
            Some(RequestState::Cancelled) | None => {
                tracing::debug!(request_id = %id, outcome = outcome.label(), "Discarding result of cancelled request");
            }
            Some(_) => {
                self.inner.dispatcher.deliver(id, outcome);
            }
        }
    }

    fn fail(&self, id: RequestId, err: PipelineError) {
        tracing::warn!(request_id = %id, kind = %err.kind(), "Request failed: {err}");
        self.finish(id, Outcome::Failure(Failure::new(err.kind(), err.to_string())));
    }

    fn park(&self, id: RequestId, kind: InteractionKind) {
        match self.inner.queue.park(id, kind) {
            Parked::Opened => {
                tracing::info!(request_id = %id, %kind, "Request waiting on user interaction");
                self.emit(SessionEvent::InteractionRequired(kind));
            }
            Parked::Joined => tracing::debug!(request_id = %id, %kind, "Request joined pending interaction"),
            Parked::NotQueued => return,
        }
        // the prerequisite may have arrived while this request was deciding to wait
        if self.prerequisite_available(kind) {
            self.resume_kind(kind);
        }
    }

    fn prerequisite_available(&self, kind: InteractionKind) -> bool {
        match kind {
            InteractionKind::Credentials => self.inner.inbox.lock().credentials.is_some(),
            InteractionKind::RemoteAuthorization => self.inner.inbox.lock().authorization_code.is_some(),
            InteractionKind::DeviceLockCode => match self.inner.trust.lock_confirmed() {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    tracing::warn!("Failed to read device lock state: {e}");
                    false
                }
            },
        }
    }

    fn resume_kind(&self, kind: InteractionKind) {
        for id in self.inner.queue.resolve_interaction(kind) {
            self.spawn_drive(id);
        }
    }

    fn announce_registration(&self) {
        if !self.inner.registration_announced.swap(true, Ordering::AcqRel) {
            self.emit(SessionEvent::Registered {
                device_id: self.inner.trust.device_id().to_string(),
            });
        }
    }

    // ── Interactions ─────────────────────────────────────────────

    /// Prompt for every open interaction, oldest first, and re-drive the
    /// requests each answer unblocks. Returns how many interactions were
    /// settled. With nothing pending this does nothing.
    pub async fn resume_pending(&self) -> Result<usize, PipelineError> {
        self.ensure_running()?;
        let mut settled = 0;
        for kind in self.inner.queue.open_interaction_kinds() {
            if !self.inner.queue.claim_interaction(kind) {
                continue;
            }
            let prompt = match self.prompt_for(kind) {
                Ok(prompt) => prompt,
                Err(e) => {
                    self.inner.queue.release_interaction(kind);
                    return Err(e);
                }
            };
            tracing::info!(%kind, "Prompting for user interaction");
            let answer = self.inner.prompts.resolve(prompt).await;
            if self.apply_resolution(kind, answer).await {
                settled += 1;
            }
        }
        Ok(settled)
    }

    fn prompt_for(&self, kind: InteractionKind) -> Result<Prompt, PipelineError> {
        Ok(match kind {
            InteractionKind::Credentials => Prompt::Credentials,
            InteractionKind::DeviceLockCode => Prompt::DeviceLockCode,
            InteractionKind::RemoteAuthorization => {
                let state = uuid::Uuid::new_v4().to_string();
                Prompt::RemoteAuthorization {
                    url: self.inner.authority.authorization_url(&state)?.to_string(),
                }
            }
        })
    }

    async fn apply_resolution(&self, kind: InteractionKind, answer: PromptResolution) -> bool {
        match (kind, answer) {
            (_, PromptResolution::Cancelled) => {
                let ids = self.inner.queue.resolve_interaction(kind);
                tracing::info!(%kind, requests = ids.len(), "Interaction declined");
                for id in ids {
                    self.finish(
                        id,
                        Outcome::Failure(Failure::new(
                            ErrorKind::InteractionCancelled,
                            format!("user declined to provide {kind}"),
                        )),
                    );
                }
                true
            }
            (InteractionKind::Credentials, PromptResolution::Credentials(credentials)) => {
                self.inner.authority.clear_rejection().await;
                self.inner.inbox.lock().credentials = Some(credentials);
                self.resume_kind(kind);
                true
            }
            (InteractionKind::DeviceLockCode, PromptResolution::LockCode(code)) => {
                match self.inner.trust.confirm_device_lock(&code) {
                    Ok(()) => {
                        self.resume_kind(kind);
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Device lock code not accepted: {e}");
                        self.inner.queue.release_interaction(kind);
                        false
                    }
                }
            }
            (InteractionKind::RemoteAuthorization, PromptResolution::AuthorizationCode(code)) => {
                self.inner.authority.clear_rejection().await;
                self.inner.inbox.lock().authorization_code = Some(Zeroizing::new(code));
                self.resume_kind(kind);
                true
            }
            (kind, answer) => {
                tracing::warn!(%kind, ?answer, "Prompt answered with the wrong kind of input");
                self.inner.queue.release_interaction(kind);
                false
            }
        }
    }

    // ── Session operations ───────────────────────────────────────

    /// Authenticate `credentials` as the session user, replacing any
    /// current user. Requests waiting on credentials are re-driven.
    pub async fn login(&self, credentials: Credentials) -> Result<(), PipelineError> {
        self.ensure_running()?;
        let _gate = self.inner.gate.write().await;
        let inner = &self.inner;

        inner.authority.clear_session().await?;
        inner.authority.clear_rejection().await;
        self.register_interactively(&credentials).await?;

        let inputs = FlowInputs {
            credentials: Some(&credentials),
            authorization_code: None,
        };
        match inner.authority.acquire(GrantFlow::Password, inputs).await? {
            Acquisition::Acquired(_) => {}
            Acquisition::InteractionRequired(kind) => {
                return Err(PipelineError::InteractionCancelled(format!("{kind} still required after login")));
            }
        }

        tracing::info!(username = credentials.username(), "User logged in");
        self.emit(SessionEvent::LoggedIn {
            username: Some(credentials.username().to_string()),
        });
        self.resume_kind(InteractionKind::Credentials);
        Ok(())
    }

    async fn register_interactively(&self, credentials: &Credentials) -> Result<(), PipelineError> {
        let trust = &self.inner.trust;
        match trust.ensure_registered(Some(credentials)).await? {
            TrustCheck::Registered => {}
            TrustCheck::InteractionRequired(InteractionKind::DeviceLockCode) => {
                match self.inner.prompts.resolve(Prompt::DeviceLockCode).await {
                    PromptResolution::LockCode(code) => trust.confirm_device_lock(&code)?,
                    _ => {
                        return Err(PipelineError::InteractionCancelled(
                            "a device lock code is required to register this device".into(),
                        ))
                    }
                }
                if let TrustCheck::InteractionRequired(kind) = trust.ensure_registered(Some(credentials)).await? {
                    return Err(PipelineError::InteractionCancelled(format!("{kind} required to register")));
                }
            }
            TrustCheck::InteractionRequired(kind) => {
                return Err(PipelineError::InteractionCancelled(format!("{kind} required to register")));
            }
        }
        self.announce_registration();
        Ok(())
    }

    /// End the user session. With `contact_server`, the gateway is asked to
    /// end the SSO session first; failure there is logged and local state is
    /// cleared regardless. Does nothing when already logged out.
    pub async fn logout(&self, contact_server: bool) -> Result<(), PipelineError> {
        let _gate = self.inner.gate.write().await;
        let inner = &self.inner;

        let id_token = inner.authority.id_token()?;
        let has_session =
            id_token.is_some() || inner.authority.user()?.is_some() || inner.authority.token_set().await.is_some();
        if !has_session {
            tracing::debug!("Logout requested while logged out");
            return Ok(());
        }

        if contact_server {
            if let Some(id_token) = &id_token {
                if let Err(e) = inner.gateway.logout_session(id_token).await {
                    tracing::warn!("Server-side logout failed, clearing local session anyway: {e}");
                }
            }
        }
        inner.authority.clear_session().await?;
        inner.inbox.lock().take_all();
        tracing::info!("Logged out");
        self.emit(SessionEvent::LoggedOut);
        Ok(())
    }

    /// Drop the access token but keep the user session.
    pub async fn clear_app_session(&self) -> Result<(), PipelineError> {
        let _gate = self.inner.gate.write().await;
        self.inner.authority.clear_access().await?;
        tracing::info!("App session cleared");
        Ok(())
    }

    /// Remove the device registration and every credential tied to it.
    /// The device identifier survives.
    pub async fn deregister(&self, contact_server: bool) -> Result<(), PipelineError> {
        let _gate = self.inner.gate.write().await;
        let inner = &self.inner;
        inner.trust.deregister(contact_server).await?;
        inner.authority.forget().await;
        inner.inbox.lock().take_all();
        inner.registration_announced.store(false, Ordering::Release);
        self.emit(SessionEvent::DeviceReset);
        Ok(())
    }

    /// Cancel every outstanding request and refuse new work.
    pub fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let ids = self.inner.queue.drain();
        for id in &ids {
            self.inner.dispatcher.deliver(*id, Outcome::Cancelled);
        }
        tracing::info!(cancelled = ids.len(), "Session orchestrator stopped");
    }

    // ── Status ───────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn device_id(&self) -> &str {
        self.inner.trust.device_id()
    }

    pub fn is_device_registered(&self) -> bool {
        self.inner.trust.is_registered()
    }

    /// A usable access token exists.
    pub async fn is_app_logon(&self) -> bool {
        self.inner.authority.current().await.is_some()
    }

    /// An ID token or an authenticated user exists.
    pub fn is_login(&self) -> Result<bool, PipelineError> {
        Ok(self.inner.authority.id_token()?.is_some() || self.inner.authority.user()?.is_some())
    }

    pub fn user_profile(&self) -> Result<Option<UserIdentity>, PipelineError> {
        self.inner.authority.user()
    }

    pub async fn login_status(&self) -> Result<LoginStatus, PipelineError> {
        let in_progress = self.inner.authority.is_flow_in_progress()
            || self.inner.trust.status() == RegistrationStatus::Registering;
        Ok(LoginStatus::from_flags(self.is_app_logon().await, self.is_login()?, in_progress))
    }

    pub async fn session_state(&self) -> Result<SessionState, PipelineError> {
        let inner = &self.inner;
        Ok(SessionState {
            device_id: inner.trust.device_id().to_string(),
            registration: inner.trust.status(),
            login_status: self.login_status().await?,
            app_logon: self.is_app_logon().await,
            user: self.user_profile()?,
            token_expires_at: inner.authority.token_set().await.map(|t| t.expires_at),
            queued_requests: inner.queue.len(),
            pending_interactions: inner.queue.pending_interactions().iter().map(|i| i.kind).collect(),
        })
    }

    pub fn pending_interactions(&self) -> Vec<PendingInteraction> {
        self.inner.queue.pending_interactions()
    }

    pub fn request_state(&self, id: RequestId) -> Option<RequestSnapshot> {
        self.inner.queue.snapshot(id)
    }
}

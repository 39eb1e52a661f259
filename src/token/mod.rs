//! Token authority: owns the active token set and every grant flow.
//!
//! All acquisition, refresh and invalidation runs under one async mutex, so
//! concurrent requests that find the token stale trigger a single refresh
//! and then share its result. Each installed token set gets a generation
//! number; a 401 invalidates only the generation the failing request used,
//! so a late 401 cannot discard a token that was already replaced.

mod types;

pub use types::{Credentials, GrantType, TokenSet, UserIdentity, DEFAULT_EXPIRES_IN_SECS};

use crate::config::{Config, GrantFlow};
use crate::error::PipelineError;
use crate::gateway::{GatewayApi, GatewayError, TokenGrant, TokenRequest};
use crate::queue::InteractionKind;
use crate::vault::{CredentialVault, VaultSlot};
use chrono::Utc;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An access token handed to a request, tagged with its generation.
#[derive(Clone)]
pub struct ActiveToken {
    pub access_token: String,
    pub generation: u64,
}

impl std::fmt::Debug for ActiveToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveToken").field("generation", &self.generation).finish()
    }
}

/// Outcome of a token request that did not fail.
#[derive(Debug, Clone)]
pub enum Acquisition {
    Acquired(ActiveToken),
    /// A user-supplied prerequisite is missing; nothing was sent.
    InteractionRequired(InteractionKind),
}

/// User-supplied material available to grant flows.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowInputs<'a> {
    pub credentials: Option<&'a Credentials>,
    pub authorization_code: Option<&'a str>,
}

#[derive(Default)]
struct AuthorityState {
    current: Option<TokenSet>,
    generation: u64,
    /// Digest of the last user-supplied grant the gateway rejected.
    rejected: Option<[u8; 32]>,
}

struct FlowGuard<'a>(&'a AtomicUsize);

impl<'a> FlowGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct TokenAuthority {
    config: Arc<Config>,
    vault: CredentialVault,
    gateway: Arc<dyn GatewayApi>,
    state: tokio::sync::Mutex<AuthorityState>,
    flows_in_flight: AtomicUsize,
}

impl TokenAuthority {
    /// Restore any persisted token set.
    pub fn new(config: Arc<Config>, vault: CredentialVault, gateway: Arc<dyn GatewayApi>) -> Result<Self, PipelineError> {
        let current: Option<TokenSet> = vault.get(VaultSlot::TokenSet)?;
        let generation = u64::from(current.is_some());
        if let Some(set) = &current {
            tracing::debug!(?set, "Restored token set");
        }
        Ok(Self {
            config,
            vault,
            gateway,
            state: tokio::sync::Mutex::new(AuthorityState {
                current,
                generation,
                rejected: None,
            }),
            flows_in_flight: AtomicUsize::new(0),
        })
    }

    fn usable(&self, state: &AuthorityState) -> Option<ActiveToken> {
        state
            .current
            .as_ref()
            .filter(|t| t.is_usable_at(Utc::now(), self.config.token_skew()))
            .map(|t| ActiveToken {
                access_token: t.access_token.clone(),
                generation: state.generation,
            })
    }

    /// The current token, if it is still usable.
    pub async fn current(&self) -> Option<ActiveToken> {
        let state = self.state.lock().await;
        self.usable(&state)
    }

    /// Snapshot of the stored token set, usable or not.
    pub async fn token_set(&self) -> Option<TokenSet> {
        self.state.lock().await.current.clone()
    }

    pub fn is_flow_in_progress(&self) -> bool {
        self.flows_in_flight.load(Ordering::Acquire) > 0
    }

    /// Usable token, refreshing or running `flow` as needed.
    pub async fn ensure_token(&self, flow: GrantFlow, inputs: FlowInputs<'_>) -> Result<Acquisition, PipelineError> {
        let mut state = self.state.lock().await;
        if let Some(active) = self.usable(&state) {
            return Ok(Acquisition::Acquired(active));
        }
        let _flow = FlowGuard::enter(&self.flows_in_flight);
        if state.current.as_ref().is_some_and(TokenSet::can_refresh) {
            self.refresh_locked(&mut state, flow, inputs).await
        } else {
            self.acquire_locked(&mut state, flow, inputs).await
        }
    }

    /// Refresh the token a caller saw as stale. If another caller already
    /// replaced generation `stale` with a usable token, that token is returned
    /// and no request is sent.
    pub async fn refresh(&self, stale: u64, flow: GrantFlow, inputs: FlowInputs<'_>) -> Result<Acquisition, PipelineError> {
        let mut state = self.state.lock().await;
        if state.generation != stale {
            if let Some(active) = self.usable(&state) {
                return Ok(Acquisition::Acquired(active));
            }
        }
        let _flow = FlowGuard::enter(&self.flows_in_flight);
        self.refresh_locked(&mut state, flow, inputs).await
    }

    /// Run `flow` unconditionally, replacing any current token.
    pub async fn acquire(&self, flow: GrantFlow, inputs: FlowInputs<'_>) -> Result<Acquisition, PipelineError> {
        let mut state = self.state.lock().await;
        let _flow = FlowGuard::enter(&self.flows_in_flight);
        self.acquire_locked(&mut state, flow, inputs).await
    }

    async fn refresh_locked(
        &self,
        state: &mut AuthorityState,
        flow: GrantFlow,
        inputs: FlowInputs<'_>,
    ) -> Result<Acquisition, PipelineError> {
        let Some(previous) = state.current.clone().filter(TokenSet::can_refresh) else {
            return self.acquire_locked(state, flow, inputs).await;
        };
        let refresh_token = previous.refresh_token.clone().unwrap_or_default();

        tracing::debug!(generation = state.generation, "Refreshing access token");
        let grant = TokenGrant::RefreshToken {
            refresh_token: refresh_token.clone(),
        };
        match self.request_grant(grant, GrantType::RefreshToken).await {
            Ok(mut set) => {
                if set.refresh_token.is_none() {
                    set.refresh_token = Some(refresh_token);
                }
                if set.id_token.is_none() {
                    set.id_token = previous.id_token;
                }
                self.install(state, set, None)
            }
            Err(GatewayError::Rejected { status, .. }) => {
                tracing::info!(status, "Refresh token rejected, starting a new grant");
                state.current = None;
                self.vault.remove(VaultSlot::TokenSet)?;
                self.acquire_locked(state, flow, inputs).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn acquire_locked(
        &self,
        state: &mut AuthorityState,
        flow: GrantFlow,
        inputs: FlowInputs<'_>,
    ) -> Result<Acquisition, PipelineError> {
        let (grant, kind, user) = match flow {
            GrantFlow::Password => {
                if self.config.auth.sso_enabled {
                    if let Some(set) = self.try_sso_exchange().await? {
                        return self.install(state, set, None);
                    }
                }
                let Some(credentials) = inputs.credentials else {
                    return Ok(Acquisition::InteractionRequired(InteractionKind::Credentials));
                };
                (
                    TokenGrant::Password {
                        username: credentials.username().to_string(),
                        password: credentials.password().to_string(),
                    },
                    GrantType::Password,
                    Some(credentials.username()),
                )
            }
            GrantFlow::ClientCredentials => (TokenGrant::ClientCredentials, GrantType::ClientCredentials, None),
            GrantFlow::AuthorizationCode => {
                let Some(code) = inputs.authorization_code else {
                    return Ok(Acquisition::InteractionRequired(InteractionKind::RemoteAuthorization));
                };
                (
                    TokenGrant::AuthorizationCode {
                        code: code.to_string(),
                        redirect_uri: self.config.gateway.redirect_uri.clone(),
                    },
                    GrantType::AuthorizationCode,
                    None,
                )
            }
        };

        let digest = grant_digest(&grant);
        if digest.is_some() && digest == state.rejected {
            tracing::debug!(?kind, "Skipping grant already rejected");
            return Err(PipelineError::AuthorizationFailed(
                "the supplied credentials were already rejected".into(),
            ));
        }

        tracing::info!(grant = grant.grant_type(), "Requesting access token");
        match self.request_grant(grant, kind).await {
            Ok(set) => self.install(state, set, user),
            Err(GatewayError::Rejected { status, message }) => {
                tracing::warn!(status, ?kind, "Token grant rejected");
                state.rejected = digest;
                Err(PipelineError::AuthorizationFailed(format!(
                    "token endpoint rejected the grant ({status}): {message}"
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Exchange a shared ID token for an access token. A rejected ID token
    /// is discarded so the caller falls through to the next grant.
    async fn try_sso_exchange(&self) -> Result<Option<TokenSet>, PipelineError> {
        let Some(id_token) = self.vault.get::<String>(VaultSlot::IdToken)? else {
            return Ok(None);
        };
        let grant = TokenGrant::JwtBearer { assertion: id_token };
        match self.request_grant(grant, GrantType::JwtBearer).await {
            Ok(set) => {
                tracing::info!("Signed in with shared ID token");
                Ok(Some(set))
            }
            Err(GatewayError::Rejected { status, .. }) => {
                tracing::info!(status, "Shared ID token rejected, discarding it");
                self.vault.remove(VaultSlot::IdToken)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn request_grant(&self, grant: TokenGrant, kind: GrantType) -> Result<TokenSet, GatewayError> {
        let request = TokenRequest {
            grant,
            scope: self.config.gateway.scope.clone(),
        };
        let resp = self.gateway.request_token(&request).await?;
        Ok(TokenSet::from_response(resp, kind, Utc::now()))
    }

    /// Persist `set`, then make it the active generation.
    fn install(&self, state: &mut AuthorityState, set: TokenSet, user: Option<&str>) -> Result<Acquisition, PipelineError> {
        self.vault.put(VaultSlot::TokenSet, &set)?;
        if let Some(id_token) = &set.id_token {
            self.vault.put(VaultSlot::IdToken, id_token)?;
        }
        if let Some(username) = user {
            self.vault.put(VaultSlot::UserIdentity, &UserIdentity::new(username))?;
        }
        state.generation += 1;
        state.rejected = None;
        let active = ActiveToken {
            access_token: set.access_token.clone(),
            generation: state.generation,
        };
        tracing::debug!(generation = state.generation, grant = ?set.grant, expires_at = %set.expires_at, "Token set installed");
        state.current = Some(set);
        Ok(Acquisition::Acquired(active))
    }

    /// Mark generation `generation` as refused by the gateway. Returns
    /// `false` (and changes nothing) if a newer generation is active.
    pub async fn invalidate_generation(&self, generation: u64) -> Result<bool, PipelineError> {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return Ok(false);
        }
        match state.current.as_mut() {
            Some(set) if !set.invalidated => {
                set.invalidated = true;
                self.vault.put(VaultSlot::TokenSet, &*set)?;
                tracing::debug!(generation, "Access token invalidated");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Allow a previously rejected grant input to be sent again. Called when
    /// the user supplies new input.
    pub async fn clear_rejection(&self) {
        self.state.lock().await.rejected = None;
    }

    /// Invalidate whatever token is current.
    pub async fn invalidate(&self) -> Result<bool, PipelineError> {
        let generation = self.state.lock().await.generation;
        self.invalidate_generation(generation).await
    }

    /// Drop the access token but keep the user session (ID token, identity).
    pub async fn clear_access(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        state.current = None;
        self.vault.remove(VaultSlot::TokenSet)?;
        Ok(())
    }

    /// Drop the access token and the user session.
    pub async fn clear_session(&self) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        state.current = None;
        self.vault.remove(VaultSlot::TokenSet)?;
        self.vault.remove(VaultSlot::IdToken)?;
        self.vault.remove(VaultSlot::UserIdentity)?;
        Ok(())
    }

    /// Forget the in-memory token after the vault was wiped elsewhere.
    pub async fn forget(&self) {
        self.state.lock().await.current = None;
    }

    pub fn id_token(&self) -> Result<Option<String>, PipelineError> {
        Ok(self.vault.get(VaultSlot::IdToken)?)
    }

    pub fn user(&self) -> Result<Option<UserIdentity>, PipelineError> {
        Ok(self.vault.get(VaultSlot::UserIdentity)?)
    }

    /// Authorization endpoint URL for the authorization-code flow.
    pub fn authorization_url(&self, state: &str) -> Result<Url, PipelineError> {
        let gw = &self.config.gateway;
        let mut url = self.config.endpoint_url(&gw.endpoints.authorize)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &gw.client_id)
            .append_pair("redirect_uri", &gw.redirect_uri)
            .append_pair("scope", &gw.scope)
            .append_pair("state", state);
        Ok(url)
    }
}

/// Identity of the user-supplied part of a grant. Grants without user input
/// have none.
fn grant_digest(grant: &TokenGrant) -> Option<[u8; 32]> {
    let mut hasher = Sha256::new();
    match grant {
        TokenGrant::Password { username, password } => {
            hasher.update(b"password\0");
            hasher.update(username.as_bytes());
            hasher.update(b"\0");
            hasher.update(password.as_bytes());
        }
        TokenGrant::AuthorizationCode { code, .. } => {
            hasher.update(b"authorization_code\0");
            hasher.update(code.as_bytes());
        }
        _ => return None,
    }
    Some(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::gateway::{
        ApiResponse, AuthorizedCall, RegistrationGrant, RegistrationRequest, TokenResponse,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct TokenEndpoint {
        grants: Mutex<Vec<&'static str>>,
        reject: Mutex<Vec<&'static str>>,
        expires_in: Option<u64>,
    }

    #[async_trait]
    impl GatewayApi for TokenEndpoint {
        async fn register_device(&self, _: &RegistrationRequest) -> Result<RegistrationGrant, GatewayError> {
            unreachable!()
        }
        async fn unregister_device(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn request_token(&self, req: &TokenRequest) -> Result<TokenResponse, GatewayError> {
            let grant = req.grant.grant_type();
            let n = {
                let mut grants = self.grants.lock();
                grants.push(grant);
                grants.len()
            };
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if self.reject.lock().contains(&grant) {
                return Err(GatewayError::Rejected {
                    status: 400,
                    message: "invalid_grant".into(),
                });
            }
            Ok(TokenResponse {
                access_token: format!("at-{n}"),
                token_type: Some("Bearer".into()),
                expires_in: self.expires_in.or(Some(3600)),
                refresh_token: Some(format!("rt-{n}")),
                id_token: (grant == "password").then(|| "id-token".to_string()),
                scope: None,
            })
        }
        async fn logout_session(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn execute(&self, _: &AuthorizedCall<'_>) -> Result<ApiResponse, GatewayError> {
            unreachable!()
        }
    }

    fn authority(gw: Arc<TokenEndpoint>) -> (CredentialVault, TokenAuthority) {
        let vault = CredentialVault::in_memory("client-a");
        let auth = TokenAuthority::new(Arc::new(test_config()), vault.clone(), gw).unwrap();
        (vault, auth)
    }

    fn acquired(a: Acquisition) -> ActiveToken {
        match a {
            Acquisition::Acquired(t) => t,
            other => panic!("expected token, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn password_flow_without_credentials_asks_for_them() {
        let gw = Arc::new(TokenEndpoint::default());
        let (_vault, auth) = authority(gw.clone());
        let result = auth.ensure_token(GrantFlow::Password, FlowInputs::default()).await.unwrap();
        assert!(matches!(result, Acquisition::InteractionRequired(InteractionKind::Credentials)));
        assert!(gw.grants.lock().is_empty());
    }

    #[tokio::test]
    async fn password_flow_persists_tokens_and_user() {
        let gw = Arc::new(TokenEndpoint::default());
        let (vault, auth) = authority(gw.clone());
        let creds = Credentials::new("alice", "pw");
        let inputs = FlowInputs {
            credentials: Some(&creds),
            authorization_code: None,
        };
        let token = acquired(auth.ensure_token(GrantFlow::Password, inputs).await.unwrap());
        assert_eq!(token.access_token, "at-1");
        assert_eq!(token.generation, 1);

        let stored: TokenSet = vault.get(VaultSlot::TokenSet).unwrap().unwrap();
        assert_eq!(stored.access_token, "at-1");
        assert_eq!(auth.id_token().unwrap().as_deref(), Some("id-token"));
        assert_eq!(auth.user().unwrap().unwrap().username, "alice");

        // second call reuses the token
        acquired(auth.ensure_token(GrantFlow::Password, FlowInputs::default()).await.unwrap());
        assert_eq!(gw.grants.lock().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_stale_callers_share_one_refresh() {
        let gw = Arc::new(TokenEndpoint::default());
        let (_vault, auth) = authority(gw.clone());
        let auth = Arc::new(auth);
        let first = acquired(auth.ensure_token(GrantFlow::ClientCredentials, FlowInputs::default()).await.unwrap());
        let stale = first.generation;
        auth.invalidate_generation(stale).await.unwrap();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move {
                    auth.refresh(stale, GrantFlow::ClientCredentials, FlowInputs::default())
                        .await
                })
            })
            .collect();
        for h in handles {
            let t = acquired(h.await.unwrap().unwrap());
            assert_eq!(t.access_token, "at-2");
        }
        assert_eq!(*gw.grants.lock(), vec!["client_credentials", "refresh_token"]);
    }

    #[tokio::test]
    async fn stale_generation_invalidation_is_ignored() {
        let gw = Arc::new(TokenEndpoint::default());
        let (_vault, auth) = authority(gw.clone());
        let first = acquired(auth.ensure_token(GrantFlow::ClientCredentials, FlowInputs::default()).await.unwrap());
        assert!(auth.invalidate_generation(first.generation).await.unwrap());
        let second = acquired(auth.ensure_token(GrantFlow::ClientCredentials, FlowInputs::default()).await.unwrap());
        assert!(second.generation > first.generation);

        assert!(!auth.invalidate_generation(first.generation).await.unwrap());
        assert_eq!(auth.current().await.unwrap().access_token, second.access_token);
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_full_grant() {
        let gw = Arc::new(TokenEndpoint::default());
        gw.reject.lock().push("refresh_token");
        let (_vault, auth) = authority(gw.clone());
        let first = acquired(auth.ensure_token(GrantFlow::ClientCredentials, FlowInputs::default()).await.unwrap());
        auth.invalidate().await.unwrap();

        let next = acquired(auth.ensure_token(GrantFlow::ClientCredentials, FlowInputs::default()).await.unwrap());
        assert_ne!(next.access_token, first.access_token);
        assert_eq!(
            *gw.grants.lock(),
            vec!["client_credentials", "refresh_token", "client_credentials"]
        );
    }

    #[tokio::test]
    async fn rejected_refresh_with_password_flow_needs_credentials() {
        let gw = Arc::new(TokenEndpoint::default());
        gw.reject.lock().push("refresh_token");
        gw.reject.lock().push("urn:ietf:params:oauth:grant-type:jwt-bearer");
        let (_vault, auth) = authority(gw.clone());
        let creds = Credentials::new("alice", "pw");
        acquired(
            auth.ensure_token(
                GrantFlow::Password,
                FlowInputs {
                    credentials: Some(&creds),
                    authorization_code: None,
                },
            )
            .await
            .unwrap(),
        );
        auth.invalidate().await.unwrap();

        let result = auth.ensure_token(GrantFlow::Password, FlowInputs::default()).await.unwrap();
        assert!(matches!(result, Acquisition::InteractionRequired(InteractionKind::Credentials)));
        // rejected ID token was discarded
        assert!(auth.id_token().unwrap().is_none());
    }

    #[tokio::test]
    async fn shared_id_token_signs_in_without_credentials() {
        let gw = Arc::new(TokenEndpoint::default());
        let (vault, auth) = authority(gw.clone());
        vault.put(VaultSlot::IdToken, &"shared-id".to_string()).unwrap();

        acquired(auth.ensure_token(GrantFlow::Password, FlowInputs::default()).await.unwrap());
        assert_eq!(*gw.grants.lock(), vec!["urn:ietf:params:oauth:grant-type:jwt-bearer"]);
    }

    #[tokio::test]
    async fn rejected_password_grant_is_authorization_failure() {
        let gw = Arc::new(TokenEndpoint::default());
        gw.reject.lock().push("password");
        let (_vault, auth) = authority(gw.clone());
        let creds = Credentials::new("alice", "wrong");
        let err = auth
            .acquire(
                GrantFlow::Password,
                FlowInputs {
                    credentials: Some(&creds),
                    authorization_code: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AuthorizationFailed(_)));
    }

    #[tokio::test]
    async fn rejected_credentials_are_not_resent() {
        let gw = Arc::new(TokenEndpoint::default());
        gw.reject.lock().push("password");
        let (_vault, auth) = authority(gw.clone());
        let wrong = Credentials::new("alice", "wrong");
        let inputs = FlowInputs {
            credentials: Some(&wrong),
            authorization_code: None,
        };
        for _ in 0..3 {
            let err = auth.ensure_token(GrantFlow::Password, inputs).await.unwrap_err();
            assert!(matches!(err, PipelineError::AuthorizationFailed(_)));
        }
        assert_eq!(*gw.grants.lock(), vec!["password"]);

        // different input goes out
        let other = Credentials::new("alice", "other");
        let inputs = FlowInputs {
            credentials: Some(&other),
            authorization_code: None,
        };
        assert!(auth.ensure_token(GrantFlow::Password, inputs).await.is_err());
        assert_eq!(*gw.grants.lock(), vec!["password", "password"]);

        // an explicit retry with the same input goes out again
        auth.clear_rejection().await;
        assert!(auth.ensure_token(GrantFlow::Password, inputs).await.is_err());
        assert_eq!(gw.grants.lock().len(), 3);
    }

    #[tokio::test]
    async fn authorization_code_flow() {
        let gw = Arc::new(TokenEndpoint::default());
        let (_vault, auth) = authority(gw.clone());
        let pending = auth
            .ensure_token(GrantFlow::AuthorizationCode, FlowInputs::default())
            .await
            .unwrap();
        assert!(matches!(
            pending,
            Acquisition::InteractionRequired(InteractionKind::RemoteAuthorization)
        ));

        let inputs = FlowInputs {
            credentials: None,
            authorization_code: Some("code-123"),
        };
        acquired(auth.ensure_token(GrantFlow::AuthorizationCode, inputs).await.unwrap());
        assert_eq!(*gw.grants.lock(), vec!["authorization_code"]);
    }

    #[tokio::test]
    async fn token_survives_restart() {
        let gw = Arc::new(TokenEndpoint::default());
        let (vault, auth) = authority(gw.clone());
        acquired(auth.ensure_token(GrantFlow::ClientCredentials, FlowInputs::default()).await.unwrap());

        let restored = TokenAuthority::new(Arc::new(test_config()), vault, gw.clone()).unwrap();
        assert_eq!(restored.current().await.unwrap().access_token, "at-1");
    }

    #[tokio::test]
    async fn token_inside_skew_window_is_refreshed() {
        let gw = Arc::new(TokenEndpoint {
            expires_in: Some(10),
            ..Default::default()
        });
        let (_vault, auth) = authority(gw.clone());
        acquired(auth.acquire(GrantFlow::ClientCredentials, FlowInputs::default()).await.unwrap());
        // 10s lifetime is inside the default 30s skew
        assert!(auth.current().await.is_none());
        acquired(auth.ensure_token(GrantFlow::ClientCredentials, FlowInputs::default()).await.unwrap());
        assert_eq!(*gw.grants.lock(), vec!["client_credentials", "refresh_token"]);
    }

    #[tokio::test]
    async fn clear_access_keeps_user_session() {
        let gw = Arc::new(TokenEndpoint::default());
        let (_vault, auth) = authority(gw.clone());
        let creds = Credentials::new("alice", "pw");
        let inputs = FlowInputs {
            credentials: Some(&creds),
            authorization_code: None,
        };
        acquired(auth.acquire(GrantFlow::Password, inputs).await.unwrap());

        auth.clear_access().await.unwrap();
        assert!(auth.token_set().await.is_none());
        assert!(auth.id_token().unwrap().is_some());

        auth.clear_session().await.unwrap();
        assert!(auth.id_token().unwrap().is_none());
        assert!(auth.user().unwrap().is_none());
    }

    #[test]
    fn authorization_url_carries_client_and_state() {
        let gw = Arc::new(TokenEndpoint::default());
        let (_vault, auth) = authority(gw);
        let url = auth.authorization_url("st-1").unwrap();
        assert_eq!(url.path(), "/auth/oauth/v2/authorize");
        let query = url.query().unwrap();
        assert!(query.contains("client_id=client-abc"));
        assert!(query.contains("state=st-1"));
        assert!(query.contains("response_type=code"));
    }
}

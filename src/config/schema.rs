use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ── Gateway ─────────────────────────────────────────────────────

/// Where the gateway lives and how this client identifies itself to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional path prefix inserted before every relative API path.
    #[serde(default)]
    pub prefix: Option<String>,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

/// Gateway endpoint paths, relative to the gateway root (not the prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub token: String,
    pub authorize: String,
    pub revoke: String,
    /// Device registration with user credentials.
    pub register: String,
    /// Device registration with client credentials only.
    pub register_client: String,
    pub unregister: String,
    pub logout: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            token: "/auth/oauth/v2/token".into(),
            authorize: "/auth/oauth/v2/authorize".into(),
            revoke: "/auth/oauth/v2/token/revoke".into(),
            register: "/connect/device/register".into(),
            register_client: "/connect/device/register/client".into(),
            unregister: "/connect/device/remove".into(),
            logout: "/connect/session/logout".into(),
        }
    }
}

fn default_scheme() -> String {
    "https".into()
}

fn default_port() -> u16 {
    443
}

fn default_scope() -> String {
    "openid msso profile".into()
}

fn default_redirect_uri() -> String {
    "gatewarden://callback".into()
}

// ── Auth ────────────────────────────────────────────────────────

/// Grant flow used to obtain access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantFlow {
    #[default]
    Password,
    ClientCredentials,
    AuthorizationCode,
}

/// How the device registers itself with the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    /// Registration bootstrap with the user's credentials; yields an ID token.
    #[default]
    UserCredentials,
    /// Registration with the client credentials only.
    ClientCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub grant_flow: GrantFlow,
    pub registration: RegistrationMode,
    /// Require the user to set a device lock code before registering.
    pub require_device_lock: bool,
    /// A token with this many seconds or fewer left is treated as expired.
    pub token_skew_secs: u64,
    /// Keep the ID token in the shared scope so cooperating apps reuse it.
    pub sso_enabled: bool,
    /// Vault scope name shared by cooperating apps.
    pub shared_scope: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            grant_flow: GrantFlow::default(),
            registration: RegistrationMode::default(),
            require_device_lock: false,
            token_skew_secs: 30,
            sso_enabled: true,
            shared_scope: "shared".into(),
        }
    }
}

// ── Pipeline ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on concurrently executing network calls.
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 8,
            request_timeout_secs: 30,
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the vault database and key file. `~` is expanded.
    pub data_dir: Option<String>,
}

//! Gateway contract: the network operations the pipeline needs.
//!
//! [`GatewayApi`] is the seam between the pipeline and the wire. The
//! [`http::HttpGateway`] backend speaks JSON/form over `reqwest`; tests use
//! in-process fakes.

pub mod http;

pub use http::HttpGateway;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

// ── Errors ───────────────────────────────────────────────────────

/// Failures talking to the gateway.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Connection-level failure (DNS, TLS, reset).
    #[error("network failure: {0}")]
    Network(String),
    #[error("gateway request timed out")]
    Timeout,
    /// The gateway answered with a non-success status for a system endpoint.
    #[error("gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The gateway answered with something we cannot parse.
    #[error("unexpected gateway response: {0}")]
    Protocol(String),
    #[error("gateway configuration error: {0}")]
    Configuration(String),
}

// ── API requests ─────────────────────────────────────────────────

/// HTTP method of an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            other => Err(format!("Unsupported HTTP method '{other}'")),
        }
    }
}

/// An outbound request as the caller describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// Path relative to the gateway prefix, or an absolute gateway URL.
    pub target: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::Get, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::Post, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::Delete, target)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// JSON body with the matching content type.
    pub fn json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.header("Content-Type", "application/json").body(bytes))
    }
}

/// A request ready to go on the wire with the current access token.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizedCall<'a> {
    pub url: &'a Url,
    pub method: Method,
    pub headers: &'a [(String, String)],
    pub body: Option<&'a [u8]>,
    pub access_token: &'a str,
}

/// Response of an API request. Every status (including 401) is a response,
/// not an error; only transport failures are [`GatewayError`]s.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

// ── Token endpoint ───────────────────────────────────────────────

/// Grant presented to the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenGrant {
    Password { username: String, password: String },
    ClientCredentials,
    AuthorizationCode { code: String, redirect_uri: String },
    RefreshToken { refresh_token: String },
    /// Exchange an SSO ID token for an access token.
    JwtBearer { assertion: String },
}

impl TokenGrant {
    /// OAuth `grant_type` value.
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::ClientCredentials => "client_credentials",
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::RefreshToken { .. } => "refresh_token",
            Self::JwtBearer { .. } => "urn:ietf:params:oauth:grant-type:jwt-bearer",
        }
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenGrant({})", self.grant_type())
    }
}

#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub grant: TokenGrant,
    pub scope: String,
}

/// Token endpoint response body.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .finish()
    }
}

// ── Device registration ──────────────────────────────────────────

/// Device registration request.
#[derive(Clone)]
pub struct RegistrationRequest {
    pub device_id: String,
    pub device_name: String,
    /// Raw public key, base64.
    pub public_key: String,
    /// Signature over the device id with the device key, base64.
    pub proof: String,
    /// User credentials for registration bootstrap; `None` registers with
    /// client credentials only.
    pub credentials: Option<(String, String)>,
}

impl std::fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationRequest")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("with_user_credentials", &self.credentials.is_some())
            .finish()
    }
}

/// What the gateway returns for a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RegistrationGrant {
    /// Client certificate, PEM.
    pub client_certificate: String,
    /// ID token issued when registering with user credentials.
    #[serde(default)]
    pub id_token: Option<String>,
}

// ── Contract ─────────────────────────────────────────────────────

/// Network operations used by the pipeline.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// Register this device and obtain its client certificate.
    async fn register_device(&self, request: &RegistrationRequest) -> Result<RegistrationGrant, GatewayError>;

    /// Remove the device registration server-side.
    async fn unregister_device(&self, device_id: &str) -> Result<(), GatewayError>;

    /// Call the token endpoint.
    async fn request_token(&self, request: &TokenRequest) -> Result<TokenResponse, GatewayError>;

    /// End the SSO session identified by `id_token`.
    async fn logout_session(&self, id_token: &str) -> Result<(), GatewayError>;

    /// Execute an API request with a bearer token.
    async fn execute(&self, call: &AuthorizedCall<'_>) -> Result<ApiResponse, GatewayError>;

    /// Present this identity (client certificate + device key) on later calls.
    fn install_client_identity(
        &self,
        _device_id: &str,
        _certificate_pem: &str,
        _private_key_pkcs8: &[u8],
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Stop presenting a client identity.
    fn clear_client_identity(&self) {}
}

//! Runtime configuration: loading, validation and URI resolution.
//!
//! Configuration is read from TOML (`config.toml`) or from a JSON gateway
//! descriptor (any path ending in `.json`). Both use the same schema.

pub mod schema;

pub use schema::{
    AuthConfig, Config, EndpointConfig, GatewayConfig, GrantFlow, PipelineConfig,
    RegistrationMode, StorageConfig,
};

use crate::error::PipelineError;
use anyhow::Context;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on `pipeline.max_concurrent_requests`.
pub const MAX_CONCURRENT_REQUESTS: usize = 1024;

/// Upper bound on `auth.token_skew_secs` (one day).
pub const MAX_TOKEN_SKEW_SECS: u64 = 86_400;

/// Default location of the config file (`~/.config/gatewarden/config.toml` on Linux).
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "gatewarden", "gatewarden")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "gatewarden", "gatewarden")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".gatewarden"))
}

impl Config {
    /// Load and validate the config at `path`, or at [`default_config_path`].
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()
                .ok_or_else(|| anyhow::anyhow!("Cannot determine a config directory for this platform"))?,
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json_str(&raw)?
        } else {
            Self::from_toml_str(&raw)?
        };
        tracing::debug!(path = %path.display(), host = %config.gateway.host, "Loaded config");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw).context("Invalid TOML config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw).context("Invalid JSON gateway descriptor")?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let gw = &self.gateway;
        if gw.host.trim().is_empty() {
            return Err(PipelineError::Configuration("gateway.host cannot be empty".into()));
        }
        if gw.scheme != "https" && gw.scheme != "http" {
            return Err(PipelineError::Configuration(format!(
                "Unsupported gateway.scheme '{}'. Supported values: https, http",
                gw.scheme
            )));
        }
        if gw.client_id.trim().is_empty() {
            return Err(PipelineError::Configuration("gateway.client_id cannot be empty".into()));
        }
        if let Some(prefix) = &gw.prefix {
            if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.starts_with("//")) {
                return Err(PipelineError::Configuration(format!(
                    "gateway.prefix must start with a single '/', got '{prefix}'"
                )));
            }
        }

        let endpoints = [
            ("token", &gw.endpoints.token),
            ("authorize", &gw.endpoints.authorize),
            ("revoke", &gw.endpoints.revoke),
            ("register", &gw.endpoints.register),
            ("register_client", &gw.endpoints.register_client),
            ("unregister", &gw.endpoints.unregister),
            ("logout", &gw.endpoints.logout),
        ];
        for (name, path) in endpoints {
            if !path.starts_with('/') {
                return Err(PipelineError::Configuration(format!(
                    "gateway.endpoints.{name} must start with '/', got '{path}'"
                )));
            }
        }

        let needs_secret = self.auth.grant_flow == GrantFlow::ClientCredentials
            || self.auth.registration == RegistrationMode::ClientCredentials;
        if needs_secret && gw.client_secret.as_deref().unwrap_or("").is_empty() {
            return Err(PipelineError::Configuration(
                "gateway.client_secret is required for client-credentials flows".into(),
            ));
        }
        if self.auth.grant_flow == GrantFlow::AuthorizationCode && gw.redirect_uri.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "gateway.redirect_uri is required for the authorization-code flow".into(),
            ));
        }
        if self.pipeline.max_concurrent_requests == 0 {
            return Err(PipelineError::Configuration(
                "pipeline.max_concurrent_requests must be at least 1".into(),
            ));
        }
        if self.pipeline.max_concurrent_requests > MAX_CONCURRENT_REQUESTS {
            return Err(PipelineError::Configuration(format!(
                "pipeline.max_concurrent_requests must be at most {MAX_CONCURRENT_REQUESTS}"
            )));
        }
        if self.auth.token_skew_secs > MAX_TOKEN_SKEW_SECS {
            return Err(PipelineError::Configuration(format!(
                "auth.token_skew_secs must be at most {MAX_TOKEN_SKEW_SECS}"
            )));
        }
        if self.pipeline.request_timeout_secs == 0 {
            return Err(PipelineError::Configuration(
                "pipeline.request_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Gateway root, e.g. `https://gw.example.com:8443`.
    pub fn base_url(&self) -> Result<Url, PipelineError> {
        let gw = &self.gateway;
        Url::parse(&format!("{}://{}:{}", gw.scheme, gw.host, gw.port))
            .map_err(|e| PipelineError::Configuration(format!("Invalid gateway address: {e}")))
    }

    /// Absolute URL of a gateway system endpoint (no prefix applied).
    pub fn endpoint_url(&self, endpoint_path: &str) -> Result<Url, PipelineError> {
        self.base_url()?
            .join(endpoint_path)
            .map_err(|e| PipelineError::Configuration(format!("Invalid endpoint '{endpoint_path}': {e}")))
    }

    /// Resolve an API target into an absolute URL.
    ///
    /// Relative paths get the configured prefix. Absolute URLs are accepted
    /// only when they point at the configured gateway, so access tokens are
    /// never sent to a foreign host.
    pub fn resolve_uri(&self, target: &str) -> Result<Url, PipelineError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(PipelineError::Configuration("request target cannot be empty".into()));
        }

        if target.starts_with("https://") || target.starts_with("http://") {
            let url = Url::parse(target)
                .map_err(|e| PipelineError::Configuration(format!("Invalid request URL '{target}': {e}")))?;
            return self.same_origin(url, target);
        }

        if !target.starts_with('/') || target.starts_with("//") {
            return Err(PipelineError::Configuration(format!(
                "Relative request path must start with a single '/', got '{target}'"
            )));
        }
        let full = format!("{}{}", self.prefix(), target);
        let url = self
            .base_url()?
            .join(&full)
            .map_err(|e| PipelineError::Configuration(format!("Invalid request path '{target}': {e}")))?;
        self.same_origin(url, target)
    }

    /// Accept `url` only if scheme, host and port match the gateway.
    fn same_origin(&self, url: Url, target: &str) -> Result<Url, PipelineError> {
        let base = self.base_url()?;
        if url.scheme() != base.scheme()
            || url.host_str() != base.host_str()
            || url.port_or_known_default() != base.port_or_known_default()
        {
            return Err(PipelineError::Configuration(format!(
                "Request URL '{target}' does not point at the configured gateway"
            )));
        }
        Ok(url)
    }

    /// Configured path prefix, or the empty string.
    pub fn prefix(&self) -> &str {
        self.gateway.prefix.as_deref().unwrap_or("")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.request_timeout_secs)
    }

    pub fn token_skew(&self) -> chrono::Duration {
        i64::try_from(self.auth.token_skew_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::seconds(MAX_TOKEN_SKEW_SECS as i64))
    }

    /// Directory holding the vault database and key file.
    pub fn data_dir(&self) -> PathBuf {
        match &self.storage.data_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
            None => default_data_dir(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        gateway: GatewayConfig {
            scheme: "https".into(),
            host: "gw.example.com".into(),
            port: 8443,
            prefix: None,
            client_id: "client-abc".into(),
            client_secret: Some("secret-xyz".into()),
            scope: "openid msso".into(),
            redirect_uri: "gatewarden://callback".into(),
            endpoints: EndpointConfig::default(),
        },
        auth: AuthConfig::default(),
        pipeline: PipelineConfig::default(),
        storage: StorageConfig::default(),
    }
}

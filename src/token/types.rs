use crate::gateway::TokenResponse;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Upper bound on a token lifetime (ten years).
const MAX_EXPIRES_IN_SECS: u64 = 10 * 365 * 24 * 3600;

/// How a token set was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    Password,
    ClientCredentials,
    AuthorizationCode,
    RefreshToken,
    JwtBearer,
}

/// Access token with its refresh material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub grant: GrantType,
    #[serde(default)]
    pub scope: Option<String>,
    /// Set when the gateway refused this access token.
    #[serde(default)]
    pub invalidated: bool,
}

impl TokenSet {
    pub fn from_response(resp: TokenResponse, grant: GrantType, now: DateTime<Utc>) -> Self {
        let expires_in = resp
            .expires_in
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
            .min(MAX_EXPIRES_IN_SECS);
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            id_token: resp.id_token,
            expires_at: now + Duration::seconds(expires_in as i64),
            grant,
            scope: resp.scope,
            invalidated: false,
        }
    }

    /// Expired once the remaining lifetime is at or below `skew`.
    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at - now <= skew
    }

    /// Not invalidated and not expired.
    pub fn is_usable_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        !self.invalidated && !self.is_expired_at(now, skew)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("expires_at", &self.expires_at)
            .field("grant", &self.grant)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

/// Username and password supplied by the user.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// The authenticated user, as far as this runtime knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub authenticated_at: DateTime<Utc>,
}

impl UserIdentity {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            authenticated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(expires_in: Option<u64>) -> TokenResponse {
        TokenResponse {
            access_token: "at".into(),
            token_type: Some("Bearer".into()),
            expires_in,
            refresh_token: Some("rt".into()),
            id_token: None,
            scope: None,
        }
    }

    #[test]
    fn expiry_respects_skew() {
        let now = Utc::now();
        let set = TokenSet::from_response(response(Some(60)), GrantType::Password, now);
        let skew = Duration::seconds(30);
        assert!(set.is_usable_at(now, skew));
        assert!(set.is_usable_at(now + Duration::seconds(29), skew));
        assert!(set.is_expired_at(now + Duration::seconds(30), skew));
        assert!(!set.is_usable_at(now + Duration::seconds(45), skew));
    }

    #[test]
    fn missing_expires_in_uses_default() {
        let now = Utc::now();
        let set = TokenSet::from_response(response(None), GrantType::ClientCredentials, now);
        assert_eq!((set.expires_at - now).num_seconds(), DEFAULT_EXPIRES_IN_SECS as i64);
    }

    #[test]
    fn invalidated_token_is_unusable() {
        let now = Utc::now();
        let mut set = TokenSet::from_response(response(Some(3600)), GrantType::Password, now);
        set.invalidated = true;
        assert!(!set.is_usable_at(now, Duration::zero()));
        assert!(set.can_refresh());
    }

    #[test]
    fn debug_output_has_no_secrets() {
        let set = TokenSet::from_response(response(Some(10)), GrantType::Password, Utc::now());
        let creds = Credentials::new("alice", "s3cret");
        assert!(!format!("{set:?}").contains("\"at\""));
        assert!(!format!("{creds:?}").contains("s3cret"));
    }

    #[test]
    fn token_set_serde_roundtrip_keeps_fields() {
        let set = TokenSet::from_response(response(Some(10)), GrantType::RefreshToken, Utc::now());
        let json = serde_json::to_string(&set).unwrap();
        let back: TokenSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}

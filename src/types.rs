use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::time::Instant;

use crate::provider::Integration;

// Providers issue lifetimes of hours; anything past a year is bogus.
const MAX_EXPIRES_IN_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_expires_at")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// A manually obtained token: no refresh token, never expires locally.
    pub fn manual(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Build the stored token from a token endpoint response. Providers that
    /// don't rotate refresh tokens omit it, so the previous one is carried over.
    pub fn from_response(
        response: TokenResponse,
        previous_refresh_token: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(previous_refresh_token),
            expires_at: response.expires_in.and_then(|secs| {
                Duration::try_seconds(secs.clamp(0, MAX_EXPIRES_IN_SECS))
                    .and_then(|lifetime| now.checked_add_signed(lifetime))
            }),
        }
    }

    pub fn needs_refresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at - margin,
            None => false,
        }
    }

    pub fn method(&self) -> &'static str {
        if self.refresh_token.is_some() {
            "oauth"
        } else {
            "manual"
        }
    }
}

// Accepts RFC 3339 as well as naive ISO timestamps (read as UTC).
fn deserialize_expires_at<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }

    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(|e| serde::de::Error::custom(format!("invalid expires_at {raw:?}: {e}")))
}

/// Form body sent to a provider token endpoint. `None` fields are left out
/// of the encoded form.
#[derive(Debug, Default, Serialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl TokenRequest {
    pub fn is_refresh(&self) -> bool {
        self.grant_type == "refresh_token"
    }
}

/// Only the fields the token lifecycle needs; `token_type` and `scope` are
/// ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub integration: Integration,
    pub code_verifier: Option<String>,
    pub created_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct ConnectionStatus {
    pub integration: Integration,
    pub configured: bool,
    pub connected: bool,
    pub method: Option<&'static str>,
    pub has_refresh_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

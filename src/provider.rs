//! The OAuth-backed integrations and the provider-specific quirks of their
//! token endpoints.
//!
//! Every integration shares the same token store, refresher and cache; the
//! differences (authorization URL shape, how the client authenticates, how
//! early to refresh, whether PKCE is used) are captured here.

use chrono::Duration;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};
use url::Url;

use crate::{
    config::ProviderSettings,
    error::{AppError, Result},
    types::{TokenRequest, TokenResponse},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integration {
    Monzo,
    Spotify,
    Google,
    Garmin,
}

/// How the first token is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    /// Browser redirect to the provider, code exchanged on callback.
    AuthorizationCode,
    /// Session-style login with stored account credentials.
    Credentials,
}

/// Where the client credentials go on token endpoint calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    FormBody,
    BasicHeader,
}

impl Integration {
    pub const ALL: [Integration; 4] = [
        Integration::Monzo,
        Integration::Spotify,
        Integration::Google,
        Integration::Garmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Integration::Monzo => "monzo",
            Integration::Spotify => "spotify",
            Integration::Google => "google",
            Integration::Garmin => "garmin",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Integration::Monzo => "Monzo",
            Integration::Spotify => "Spotify",
            Integration::Google => "Google",
            Integration::Garmin => "Garmin",
        }
    }

    pub fn grant_kind(&self) -> GrantKind {
        match self {
            Integration::Garmin => GrantKind::Credentials,
            _ => GrantKind::AuthorizationCode,
        }
    }

    pub fn client_auth(&self) -> ClientAuth {
        match self {
            Integration::Spotify => ClientAuth::BasicHeader,
            _ => ClientAuth::FormBody,
        }
    }

    /// How long before `expires_at` a token is treated as expired.
    pub fn refresh_margin(&self) -> Duration {
        match self {
            Integration::Monzo => Duration::zero(),
            Integration::Spotify => Duration::minutes(5),
            Integration::Google | Integration::Garmin => Duration::seconds(60),
        }
    }

    pub fn uses_pkce(&self) -> bool {
        matches!(self, Integration::Spotify | Integration::Google)
    }

    pub fn scopes(&self) -> &'static [&'static str] {
        match self {
            Integration::Spotify => &[
                "user-read-currently-playing",
                "user-read-playback-state",
                "user-modify-playback-state",
                "user-read-recently-played",
                "user-read-playback-position",
            ],
            Integration::Google => &[
                "https://www.googleapis.com/auth/gmail.readonly",
                "https://www.googleapis.com/auth/calendar.events.readonly",
            ],
            Integration::Monzo | Integration::Garmin => &[],
        }
    }

    fn extra_authorize_params(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Integration::Google => &[("access_type", "offline"), ("prompt", "consent")],
            _ => &[],
        }
    }
}

impl fmt::Display for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Integration {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Integration::ALL
            .into_iter()
            .find(|integration| integration.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AppError::NotFound(format!("unknown integration '{s}'")))
    }
}

/// An integration bound to its configured credentials and endpoints.
#[derive(Debug, Clone)]
pub struct Provider {
    pub integration: Integration,
    pub settings: ProviderSettings,
}

impl Provider {
    pub fn new(integration: Integration, settings: ProviderSettings) -> Self {
        Self {
            integration,
            settings,
        }
    }

    pub fn is_configured(&self) -> bool {
        match self.integration.grant_kind() {
            GrantKind::AuthorizationCode => {
                self.settings.client_id.is_some() && self.settings.client_secret.is_some()
            }
            GrantKind::Credentials => {
                self.settings.username.is_some() && self.settings.password.is_some()
            }
        }
    }

    fn client_id(&self) -> Result<&str> {
        self.settings
            .client_id
            .as_deref()
            .ok_or_else(|| self.not_configured("client id"))
    }

    fn not_configured(&self, what: &str) -> AppError {
        AppError::NotConfigured(format!("{} {}", self.integration.display_name(), what))
    }

    pub fn authorization_url(&self, state: &str, code_challenge: Option<&str>) -> Result<String> {
        let mut url = Url::parse(&self.settings.authorize_url).map_err(|e| {
            AppError::NotConfigured(format!(
                "{} authorization URL ({e})",
                self.integration.display_name()
            ))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", self.client_id()?)
                .append_pair("redirect_uri", &self.settings.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("state", state);

            let scopes = self.integration.scopes();
            if !scopes.is_empty() {
                query.append_pair("scope", &scopes.join(" "));
            }
            if let Some(challenge) = code_challenge {
                query
                    .append_pair("code_challenge", challenge)
                    .append_pair("code_challenge_method", "S256");
            }
            for (key, value) in self.integration.extra_authorize_params() {
                query.append_pair(key, value);
            }
        }

        Ok(url.into())
    }

    pub fn code_exchange_request(
        &self,
        code: String,
        code_verifier: Option<String>,
    ) -> TokenRequest {
        self.with_client_credentials(TokenRequest {
            grant_type: "authorization_code".to_string(),
            code: Some(code),
            redirect_uri: Some(self.settings.redirect_uri.clone()),
            code_verifier,
            ..Default::default()
        })
    }

    pub fn refresh_request(&self, refresh_token: String) -> TokenRequest {
        self.with_client_credentials(TokenRequest {
            grant_type: "refresh_token".to_string(),
            refresh_token: Some(refresh_token),
            ..Default::default()
        })
    }

    pub fn login_request(&self) -> Result<TokenRequest> {
        let username = self
            .settings
            .username
            .clone()
            .ok_or_else(|| self.not_configured("account email"))?;
        let password = self
            .settings
            .password
            .clone()
            .ok_or_else(|| self.not_configured("account password"))?;

        Ok(self.with_client_credentials(TokenRequest {
            grant_type: "password".to_string(),
            username: Some(username),
            password: Some(password),
            ..Default::default()
        }))
    }

    fn with_client_credentials(&self, mut request: TokenRequest) -> TokenRequest {
        if self.integration.client_auth() == ClientAuth::FormBody {
            request.client_id = self.settings.client_id.clone();
            request.client_secret = self.settings.client_secret.clone();
        }
        request
    }

    /// Call the token endpoint. Failures of a refresh grant surface as
    /// `Refresh`, everything else as `TokenExchange`.
    pub async fn request_token(
        &self,
        client: &reqwest::Client,
        request: &TokenRequest,
    ) -> Result<TokenResponse> {
        let name = self.integration.display_name();
        let fail = |message: String| {
            if request.is_refresh() {
                AppError::Refresh(message)
            } else {
                AppError::TokenExchange(message)
            }
        };

        debug!(
            "{} token request ({}) to: {}",
            name, request.grant_type, self.settings.token_url
        );

        let mut builder = client
            .post(&self.settings.token_url)
            .header(header::ACCEPT, "application/json")
            .form(request);

        if self.integration.client_auth() == ClientAuth::BasicHeader {
            builder = builder.basic_auth(self.client_id()?, self.settings.client_secret.as_deref());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| fail(format!("{name} token endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("{} token request failed ({}): {}", name, status, error_text);
            return Err(fail(format!("{name} returned {status}: {error_text}")));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| fail(format!("Failed to parse {name} token response: {e}")))
    }
}

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::provider::Integration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub token_dir: PathBuf,
    pub frontend_url: String,
    pub cors_origins: Vec<String>,
    pub http_timeout: Duration,
    pub cache_max_entries: usize,
    pub monzo: ProviderSettings,
    pub spotify: ProviderSettings,
    pub google: ProviderSettings,
    pub garmin: ProviderSettings,
}

/// Credentials and endpoints for one upstream provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base_url: String,
    /// Pre-issued access token that takes precedence over the token file.
    pub manual_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token_dir = match optional_var("TOKEN_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .map(|dir| dir.join("lifeos"))
                .unwrap_or_else(|| PathBuf::from(".lifeos")),
        };

        Ok(Self {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .context("Invalid PORT")?,

            token_dir,

            frontend_url: std::env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),

            http_timeout: Duration::from_secs(
                std::env::var("HTTP_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("Invalid HTTP_TIMEOUT_SECS")?,
            ),

            cache_max_entries: std::env::var("CACHE_MAX_ENTRIES")
                .unwrap_or_else(|_| "512".to_string())
                .parse()
                .context("Invalid CACHE_MAX_ENTRIES")?,

            monzo: ProviderSettings::from_env(
                "MONZO",
                "http://localhost:8000/api/monzo/callback",
                "https://auth.monzo.com/",
                "https://api.monzo.com/oauth2/token",
                "https://api.monzo.com",
            ),

            spotify: ProviderSettings::from_env(
                "SPOTIFY",
                "http://localhost:8000/api/spotify/callback",
                "https://accounts.spotify.com/authorize",
                "https://accounts.spotify.com/api/token",
                "https://api.spotify.com/v1",
            ),

            google: ProviderSettings::from_env(
                "GOOGLE",
                "http://127.0.0.1:8000/api/google/callback",
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
                "https://www.googleapis.com",
            ),

            garmin: ProviderSettings {
                username: optional_var("GARMIN_EMAIL"),
                password: optional_var("GARMIN_PASSWORD"),
                ..ProviderSettings::from_env(
                    "GARMIN",
                    "",
                    "",
                    "https://connectapi.garmin.com/oauth-service/oauth/token",
                    "https://connectapi.garmin.com",
                )
            },
        })
    }

    pub fn server_address(&self) -> SocketAddr {
        ([0, 0, 0, 0], self.port).into()
    }

    pub fn provider_settings(&self, integration: Integration) -> &ProviderSettings {
        match integration {
            Integration::Monzo => &self.monzo,
            Integration::Spotify => &self.spotify,
            Integration::Google => &self.google,
            Integration::Garmin => &self.garmin,
        }
    }
}

impl ProviderSettings {
    fn from_env(
        prefix: &str,
        redirect_uri: &str,
        authorize_url: &str,
        token_url: &str,
        api_base_url: &str,
    ) -> Self {
        let var_or = |name: &str, default: &str| {
            optional_var(&format!("{prefix}_{name}")).unwrap_or_else(|| default.to_string())
        };

        Self {
            client_id: optional_var(&format!("{prefix}_CLIENT_ID")),
            client_secret: optional_var(&format!("{prefix}_CLIENT_SECRET")),
            redirect_uri: var_or("REDIRECT_URI", redirect_uri),
            authorize_url: var_or("AUTH_URL", authorize_url),
            token_url: var_or("TOKEN_URL", token_url),
            api_base_url: var_or("API_BASE_URL", api_base_url),
            manual_token: optional_var(&format!("{prefix}_ACCESS_TOKEN")),
            username: None,
            password: None,
        }
    }
}

// Blank values count as unset.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

//! Fixtures shared by the unit tests: every provider points at one mock
//! server, tokens live in a temporary directory.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::{
    cache::ResponseCache,
    config::{Config, ProviderSettings},
    oauth::TokenManager,
    provider::{Integration, Provider},
    token_store::TokenStore,
    upstream::UpstreamClient,
    AppState,
};

pub fn settings_for(base: &str) -> ProviderSettings {
    ProviderSettings {
        client_id: Some("client-id".into()),
        client_secret: Some("client-secret".into()),
        redirect_uri: "http://localhost:8000/callback".into(),
        authorize_url: format!("{base}/authorize"),
        token_url: format!("{base}/token"),
        api_base_url: base.to_string(),
        manual_token: None,
        username: Some("me@example.com".into()),
        password: Some("hunter2".into()),
    }
}

pub fn manager_for(base: &str, dir: &Path) -> TokenManager {
    let providers = Integration::ALL
        .into_iter()
        .map(|integration| Provider::new(integration, settings_for(base)))
        .collect();
    let store = TokenStore::open(dir, &[]).unwrap();
    TokenManager::new(providers, store, reqwest::Client::new())
}

pub fn write_token_file(
    dir: &Path,
    name: &str,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: &str,
) {
    let token = json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_at": expires_at,
    });
    std::fs::write(
        dir.join(format!("{name}_tokens.json")),
        serde_json::to_vec_pretty(&token).unwrap(),
    )
    .unwrap();
}

pub fn state_for(base: &str, dir: &Path) -> AppState {
    let config = Config {
        port: 0,
        token_dir: PathBuf::from(dir),
        frontend_url: "http://localhost:3000".into(),
        cors_origins: vec!["http://localhost:3000".into()],
        http_timeout: Duration::from_secs(5),
        cache_max_entries: 64,
        monzo: settings_for(base),
        spotify: settings_for(base),
        google: settings_for(base),
        garmin: settings_for(base),
    };
    let tokens = Arc::new(manager_for(base, dir));

    AppState {
        config: Arc::new(config),
        upstream: UpstreamClient::new(reqwest::Client::new(), tokens.clone()),
        tokens,
        cache: Arc::new(ResponseCache::new(64)),
    }
}

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod cache;
mod config;
mod error;
mod integrations;
mod oauth;
mod provider;
mod proxy;
mod routes;
#[cfg(test)]
mod test_support;
mod token_store;
mod types;
mod upstream;

use crate::{
    cache::ResponseCache,
    config::Config,
    oauth::TokenManager,
    provider::{Integration, Provider},
    token_store::TokenStore,
    upstream::UpstreamClient,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tokens: Arc<TokenManager>,
    pub upstream: UpstreamClient,
    pub cache: Arc<ResponseCache>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lifeos_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("Starting LifeOS backend");

    // Tokens from the environment win over the token files
    let overrides: Vec<(Integration, String)> = Integration::ALL
        .into_iter()
        .filter_map(|integration| {
            config
                .provider_settings(integration)
                .manual_token
                .clone()
                .map(|token| (integration, token))
        })
        .collect();
    let store = TokenStore::open(&config.token_dir, &overrides)?;
    info!("Tokens are persisted to: {}", store.dir().display());

    let providers: Vec<Provider> = Integration::ALL
        .into_iter()
        .map(|integration| {
            let provider = Provider::new(integration, config.provider_settings(integration).clone());
            if !provider.is_configured() {
                info!("{} is not configured", integration.display_name());
            }
            provider
        })
        .collect();

    // One client for token endpoints and API calls
    let http_client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .user_agent(concat!("lifeos-backend/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let tokens = Arc::new(TokenManager::new(providers, store, http_client.clone()));

    // Create app state
    let app_state = AppState {
        upstream: UpstreamClient::new(http_client, tokens.clone()),
        tokens,
        cache: Arc::new(ResponseCache::new(config.cache_max_entries)),
        config: config.clone(),
    };

    let app = routes::router(app_state);

    // Start server
    let addr = config.server_address();
    info!("Listening on {}", addr);

    println!("\n🚀 LifeOS Backend");
    println!("=================");
    println!("Server running at: http://localhost:{}", config.port);
    println!("\nConnect an integration:");
    for integration in Integration::ALL {
        println!(
            "  {:<8} http://localhost:{}/api/{}/auth",
            integration.display_name(),
            config.port,
            integration
        );
    }
    println!("\nAPI Endpoints:");
    println!(
        "  Status: http://localhost:{}/api/<integration>/status",
        config.port
    );
    println!("  Health: http://localhost:{}/health", config.port);
    println!(
        "  Proxy:  http://localhost:{}/api/<integration>/proxy/*\n",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{any, get, post},
    Extension, Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

use crate::{
    auth,
    integrations::{garmin, google, monzo, spotify},
    provider::Integration,
    proxy, AppState,
};

// Proxied request bodies are small JSON payloads
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Build the full application: one `/api/<integration>` tree per
/// integration plus the service routes.
pub fn router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.cors_origins))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(state.config.http_timeout));

    Router::new()
        .nest("/api/monzo", integration_routes(Integration::Monzo, monzo::routes()))
        .nest(
            "/api/spotify",
            integration_routes(Integration::Spotify, spotify::routes()),
        )
        .nest("/api/google", integration_routes(Integration::Google, google::routes()))
        .nest("/api/garmin", integration_routes(Integration::Garmin, garmin::routes()))
        .route("/health", get(health_check))
        .route("/", get(root_handler))
        .with_state(state)
        .layer(middleware)
}

// Every integration gets the same token lifecycle routes and passthrough;
// handlers learn which integration they serve from the extension.
fn integration_routes(
    integration: Integration,
    data_routes: Router<AppState>,
) -> Router<AppState> {
    Router::new()
        .route("/auth", get(auth::authorize))
        .route("/auth/url", get(auth::authorize_url))
        .route("/callback", get(auth::callback))
        .route("/status", get(auth::status))
        .route("/refresh", post(auth::refresh))
        .route("/set-token", post(auth::set_token))
        .route("/disconnect", post(auth::disconnect))
        .route("/proxy/*path", any(proxy::proxy_handler))
        .merge(data_routes)
        .layer(Extension(integration))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn root_handler() -> impl IntoResponse {
    let integrations: Vec<&str> = Integration::ALL.iter().map(Integration::as_str).collect();

    Json(json!({
        "service": "LifeOS Backend",
        "status": "running",
        "integrations": integrations,
        "endpoints": {
            "health": "/health",
            "status": "/api/<integration>/status",
            "auth": "/api/<integration>/auth",
            "proxy": "/api/<integration>/proxy/*"
        }
    }))
}

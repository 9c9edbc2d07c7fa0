use crate::{
    error::{AppError, Result},
    provider::{GrantKind, Integration},
    types::OAuthCallback,
    AppState,
};
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};

#[derive(Debug, Deserialize)]
pub struct ManualToken {
    pub access_token: String,
}

// Send the browser to the provider, or sign in directly for
// credential-style integrations.
pub async fn authorize(
    State(state): State<AppState>,
    Extension(integration): Extension<Integration>,
) -> Result<Response> {
    if integration.grant_kind() == GrantKind::Credentials {
        state.tokens.login(integration).await?;
        return Ok(Json(state.tokens.status(integration)).into_response());
    }

    let auth_url = state.tokens.begin_authorization(integration)?;
    info!("Redirecting to {} authorization", integration.display_name());
    Ok(Redirect::to(&auth_url).into_response())
}

// Same as `authorize` but hands the URL to the front end instead.
pub async fn authorize_url(
    State(state): State<AppState>,
    Extension(integration): Extension<Integration>,
) -> Result<impl IntoResponse> {
    let auth_url = state.tokens.begin_authorization(integration)?;
    Ok(Json(json!({ "auth_url": auth_url })))
}

pub async fn callback(
    State(state): State<AppState>,
    Extension(integration): Extension<Integration>,
    Query(params): Query<OAuthCallback>,
) -> Result<impl IntoResponse> {
    debug!(
        "{} callback received (code present: {}, state present: {})",
        integration,
        params.code.is_some(),
        params.state.is_some()
    );

    if let Some(error) = params.error {
        error!(
            "{} OAuth error: {} - {:?}",
            integration.display_name(),
            error,
            params.error_description
        );
        return Err(AppError::TokenExchange(format!(
            "{}: {}",
            error,
            params.error_description.unwrap_or_default()
        )));
    }

    let code = params
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing authorization code".into()))?;
    let oauth_state = params.state.ok_or(AppError::InvalidState)?;

    state
        .tokens
        .complete_authorization(integration, code, &oauth_state)
        .await?;
    state.cache.invalidate_prefix(&cache_prefix(integration));

    let target = format!(
        "{}?{}=connected",
        state.config.frontend_url.trim_end_matches('/'),
        integration.as_str()
    );
    Ok(Redirect::to(&target))
}

pub async fn status(
    State(state): State<AppState>,
    Extension(integration): Extension<Integration>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.tokens.status(integration)))
}

pub async fn refresh(
    State(state): State<AppState>,
    Extension(integration): Extension<Integration>,
) -> Result<impl IntoResponse> {
    let token = state.tokens.force_refresh(integration).await?;

    Ok(Json(json!({
        "message": format!("{} token refreshed successfully", integration.display_name()),
        "expires_at": token.expires_at,
    })))
}

pub async fn set_token(
    State(state): State<AppState>,
    Extension(integration): Extension<Integration>,
    Json(payload): Json<ManualToken>,
) -> Result<impl IntoResponse> {
    state
        .tokens
        .set_manual_token(integration, payload.access_token)?;
    state.cache.invalidate_prefix(&cache_prefix(integration));

    Ok(Json(json!({ "message": "Access token set successfully" })))
}

pub async fn disconnect(
    State(state): State<AppState>,
    Extension(integration): Extension<Integration>,
) -> Result<impl IntoResponse> {
    state.tokens.disconnect(integration).await?;
    state.cache.invalidate_prefix(&cache_prefix(integration));

    Ok(Json(json!({
        "message": format!("Disconnected from {}", integration.display_name())
    })))
}

/// Every cache key of an integration starts with this.
pub fn cache_prefix(integration: Integration) -> String {
    format!("{}:", integration.as_str())
}

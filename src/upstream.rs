use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use reqwest::header;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    error::{AppError, Result},
    oauth::TokenManager,
    provider::Integration,
};

/// How an upstream response is surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    AuthFailure,
    RateLimited,
    UpstreamError,
}

impl Outcome {
    pub fn classify(status: StatusCode) -> Self {
        if status.is_success() {
            Outcome::Success
        } else if status == StatusCode::UNAUTHORIZED {
            Outcome::AuthFailure
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Outcome::RateLimited
        } else {
            Outcome::UpstreamError
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Decode the body as JSON; empty bodies (204 and friends) become `null`.
    pub fn json(&self) -> Result<Value> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body).map_err(|e| AppError::Upstream {
            status: StatusCode::BAD_GATEWAY.as_u16(),
            message: format!("invalid JSON from upstream: {e}"),
        })
    }
}

/// Everything needed to (re)build one upstream request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn query(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }
}

/// Authenticated calls against an integration's REST API.
#[derive(Clone)]
pub struct UpstreamClient {
    http_client: reqwest::Client,
    tokens: Arc<TokenManager>,
}

impl UpstreamClient {
    pub fn new(http_client: reqwest::Client, tokens: Arc<TokenManager>) -> Self {
        Self {
            http_client,
            tokens,
        }
    }

    pub async fn get_json(&self, integration: Integration, request: UpstreamRequest) -> Result<Value> {
        self.send(integration, request).await?.json()
    }

    /// Send with a valid bearer token. A 401 gets exactly one refresh and
    /// one replay when the token can be refreshed.
    pub async fn send(
        &self,
        integration: Integration,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse> {
        let access_token = self.tokens.get_valid_token(integration).await?;

        match self.dispatch(integration, &request, &access_token).await {
            Err(AppError::Authentication(reason)) if self.tokens.can_refresh(integration) => {
                warn!(
                    "{} rejected the access token ({}), refreshing once",
                    integration.display_name(),
                    reason
                );
                let refreshed = self
                    .tokens
                    .refresh_after_rejection(integration, &access_token)
                    .await?;
                self.dispatch(integration, &request, &refreshed.access_token)
                    .await
            }
            other => other,
        }
    }

    async fn dispatch(
        &self,
        integration: Integration,
        request: &UpstreamRequest,
        access_token: &str,
    ) -> Result<UpstreamResponse> {
        let provider = self.tokens.provider(integration)?;
        let target_url = format!(
            "{}/{}",
            provider.settings.api_base_url.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        debug!("{} {} request to: {}", integration, request.method, target_url);

        let mut builder = self
            .http_client
            .request(request.method.clone(), &target_url)
            .headers(request.headers.clone())
            .bearer_auth(access_token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            error!("{} request failed: {}", integration.display_name(), e);
            if e.is_timeout() {
                AppError::Network(format!("{} timed out", integration.display_name()))
            } else {
                AppError::Network(format!("{}: {}", integration.display_name(), e))
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| {
            error!("Failed to read {} response body: {}", integration, e);
            AppError::Network(format!("failed to read {} response: {e}", integration))
        })?;

        match Outcome::classify(status) {
            Outcome::Success => Ok(UpstreamResponse {
                status,
                headers,
                body,
            }),
            Outcome::AuthFailure => Err(AppError::Authentication(format!(
                "{} rejected the access token",
                integration.display_name()
            ))),
            Outcome::RateLimited => {
                let retry_after = headers
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok());
                info!(
                    "{} rate limited, retry after {:?}s",
                    integration.display_name(),
                    retry_after
                );
                Err(AppError::RateLimited { retry_after })
            }
            Outcome::UpstreamError => {
                let message = String::from_utf8_lossy(&body);
                error!(
                    "{} returned {}: {}",
                    integration.display_name(),
                    status,
                    message
                );
                Err(AppError::Upstream {
                    status: status.as_u16(),
                    message: truncate(&message, 512),
                })
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

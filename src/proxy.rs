use crate::{
    error::{AppError, Result},
    provider::Integration,
    upstream::UpstreamRequest,
    AppState,
};
use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
    Extension,
};
use bytes::Bytes;
use tracing::{debug, error};

/// Forward any request under `/api/<integration>/proxy/` to the
/// integration's API with its bearer token attached.
pub async fn proxy_handler(
    State(state): State<AppState>,
    Extension(integration): Extension<Integration>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    debug!("Proxying {} {} request to /{}", integration, method, path);

    let mut request = UpstreamRequest::new(method, path);
    if let Some(query) = query {
        request.query = serde_urlencoded::from_str(&query)
            .map_err(|e| AppError::BadRequest(format!("invalid query string: {e}")))?;
    }

    for (key, value) in headers.iter() {
        if should_forward_header(key.as_str()) {
            request.headers.insert(key.clone(), value.clone());
        }
    }

    if !body.is_empty() {
        request.body = Some(body);
    }

    let response = state.upstream.send(integration, request).await?;

    let mut response_builder = Response::builder().status(response.status);
    for (key, value) in response.headers.iter() {
        if should_forward_response_header(key.as_str()) {
            response_builder = response_builder.header(key.clone(), value.clone());
        }
    }

    response_builder
        .body(Body::from(response.body))
        .map_err(|e| {
            error!("Failed to build response: {}", e);
            AppError::InternalError(e.into())
        })
}

// Determine if a request header should be forwarded
fn should_forward_header(header: &str) -> bool {
    let header_lower = header.to_lowercase();

    let blocked_headers = [
        "host",
        "connection",
        "content-length",
        "transfer-encoding",
        "upgrade",
        "cookie",
        "origin",
        "referer",
        "authorization", // We set this ourselves
        // reqwest is built without decompression, so bodies must come back
        // uncompressed
        "accept-encoding",
    ];

    !blocked_headers.contains(&header_lower.as_str())
}

// Determine if a response header should be forwarded
fn should_forward_response_header(header: &str) -> bool {
    let header_lower = header.to_lowercase();

    let blocked_headers = [
        "connection",
        "content-encoding",
        "content-length",
        "transfer-encoding",
        "upgrade",
        "set-cookie",
    ];

    !blocked_headers.contains(&header_lower.as_str())
}

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required: {0}")]
    Authentication(String),

    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Invalid OAuth state")]
    InvalidState,

    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Upstream rate limit reached")]
    RateLimited { retry_after: Option<u64> },

    #[error("Upstream unreachable: {0}")]
    Network(String),

    #[error("{0} is not configured")]
    NotConfigured(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Authentication(_) | AppError::Refresh(_) => StatusCode::UNAUTHORIZED,
            AppError::InvalidState | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::TokenExchange(_) | AppError::Network(_) => StatusCode::BAD_GATEWAY,
            AppError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotConfigured(_) | AppError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            AppError::Upstream {
                status: upstream_status,
                ..
            } => Json(json!({
                "error": self.to_string(),
                "upstream_status": upstream_status,
            })),
            AppError::InternalError(e) => {
                tracing::error!("Internal error: {:#}", e);
                Json(json!({ "error": self.to_string() }))
            }
            _ => Json(json!({ "error": self.to_string() })),
        };

        let mut response = (status, body).into_response();
        if let AppError::RateLimited {
            retry_after: Some(secs),
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

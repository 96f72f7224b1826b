use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::upstream::UpstreamError;

/// Everything a `/gpt` request can fail with. Each variant maps to one status code.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid request body: {0}")]
    InvalidBody(String),
    #[error("Request body too large")]
    BodyTooLarge,
    #[error("Unauthorized (missing/invalid X-Proxy-Token)")]
    Unauthorized,
    #[error("Rate limit exceeded. Try again shortly.")]
    RateLimited,
    /// Trimmed text is blank or longer than the configured limit.
    #[error("Payload too large (text must be 1..={max_chars} chars after trimming)")]
    PayloadTooLarge { max_chars: usize },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BodyTooLarge | Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(UpstreamError::MissingApiKey) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidBody(_) => "invalid_body",
            Self::BodyTooLarge => "request_too_large",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Upstream(err) => match err {
                UpstreamError::MissingApiKey => "server_misconfigured",
                UpstreamError::Timeout => "upstream_timeout",
                UpstreamError::Request(_) => "upstream_request_failed",
                UpstreamError::Status { .. } => "upstream_status",
                UpstreamError::InvalidJson(_) => "upstream_invalid_json",
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
    pub code: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.to_string(),
            code: self.code().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

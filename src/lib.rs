use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub mod client_ip;
pub mod error;
pub mod rate_limit;
pub mod upstream;

use crate::client_ip::resolve_client_identity;
use crate::error::ProxyError;
use crate::rate_limit::{Clock, RateLimiter, SystemClock};
use crate::upstream::UpstreamBridge;

pub const DEFAULT_APP_NAME: &str = "BUBULIZER Kidney Triage GPT Proxy";
pub const PROXY_TOKEN_HEADER: &str = "x-proxy-token";

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    limiter: RateLimiter,
    upstream: UpstreamBridge,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub app_name: String,
    pub openai_base_url: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub use_responses_api: bool,
    /// Shared secret expected in `X-Proxy-Token`. Empty disables the check.
    pub proxy_auth_token: String,
    pub cors_origins: Vec<String>,
    pub rate_limit_rpm: u32,
    pub rate_limit_sweep_interval: Duration,
    pub max_body_chars: usize,
    pub trust_forwarded_for: bool,
    pub trusted_proxy_cidrs: Vec<IpNet>,
    pub upstream_connect_timeout: Duration,
    pub upstream_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: String::new(),
            openai_model: "gpt-4o-mini".to_string(),
            use_responses_api: true,
            proxy_auth_token: String::new(),
            cors_origins: vec!["*".to_string()],
            rate_limit_rpm: 30,
            rate_limit_sweep_interval: Duration::from_secs(60),
            max_body_chars: 25_000,
            trust_forwarded_for: true,
            trusted_proxy_cidrs: Vec::new(),
            upstream_connect_timeout: upstream::DEFAULT_UPSTREAM_CONNECT_TIMEOUT,
            upstream_timeout: upstream::DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

impl AppConfig {
    /// Byte ceiling for the raw request body. Leaves room for UTF-8 and JSON escaping
    /// so the character limit is what actually bounds `text`.
    pub fn max_request_bytes(&self) -> usize {
        self.max_body_chars.saturating_mul(6).saturating_add(1_024)
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> reqwest::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> reqwest::Result<Self> {
        let upstream = UpstreamBridge::new(&config)?;
        let limiter = RateLimiter::with_clock(config.rate_limit_rpm, clock);
        Ok(Self {
            config: Arc::new(config),
            limiter,
            upstream,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// Starts the background task that drops rate-limit buckets idle for a full window.
///
/// A zero interval leaves the table unswept, so it grows with every identity seen.
pub fn spawn_bucket_sweeper(state: AppState) {
    let interval = state.config.rate_limit_sweep_interval;
    if interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            let removed = state.limiter.sweep_idle().await;
            if removed > 0 {
                let remaining = state.limiter.len().await;
                tracing::debug!(removed, remaining, "swept idle rate-limit buckets");
            }
        }
    });
}

pub fn build_cors(origins: &[String]) -> anyhow::Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut allowed = Vec::with_capacity(origins.len());
    for origin in origins {
        allowed.push(
            HeaderValue::from_str(origin)
                .map_err(|e| anyhow::anyhow!("invalid CORS origin {origin:?}: {e}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any))
}

pub fn app(state: AppState) -> anyhow::Result<Router> {
    let cors = build_cors(&state.config.cors_origins)?;
    let max_request_bytes = state.config.max_request_bytes();
    Ok(Router::new()
        .route("/health", get(health))
        .route("/gpt", post(gpt))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(cors)
        .with_state(state))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub app: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        app: state.config.app_name.clone(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GptRequest {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GptResponse {
    pub reply: String,
}

async fn gpt(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    match handle_gpt(&state, &connect_info, &headers, body).await {
        Ok(reply) => Json(GptResponse { reply }).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_gpt(
    state: &AppState,
    connect_info: &Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<String, ProxyError> {
    let request = decode_gpt_request(body)?;

    require_auth(&state.config, headers)?;

    let client = resolve_client_identity(&state.config, headers, connect_info);
    if !state.limiter.admit(&client).await {
        tracing::warn!(%client, "rate limit exceeded");
        return Err(ProxyError::RateLimited);
    }

    let text = validate_text(&request.text, state.config.max_body_chars)?;

    tracing::info!(%client, chars = text.chars().count(), "forwarding text upstream");
    let reply = state.upstream.send(text).await.map_err(|err| {
        tracing::warn!(%client, error = %err, "upstream call failed");
        ProxyError::from(err)
    })?;

    Ok(reply)
}

fn decode_gpt_request(body: Result<Bytes, BytesRejection>) -> Result<GptRequest, ProxyError> {
    let body = match body {
        Ok(body) => body,
        Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(_))) => {
            return Err(ProxyError::BodyTooLarge);
        }
        Err(_) => {
            return Err(ProxyError::InvalidBody(
                "failed to read request body".to_string(),
            ));
        }
    };

    serde_json::from_slice(&body).map_err(|e| ProxyError::InvalidBody(e.to_string()))
}

fn require_auth(config: &AppConfig, headers: &HeaderMap) -> Result<(), ProxyError> {
    if config.proxy_auth_token.is_empty() {
        return Ok(());
    }

    let presented = headers
        .get(PROXY_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented == Some(config.proxy_auth_token.as_str()) {
        Ok(())
    } else {
        Err(ProxyError::Unauthorized)
    }
}

fn validate_text(text: &str, max_chars: usize) -> Result<&str, ProxyError> {
    let text = text.trim();
    if text.is_empty() || text.chars().count() > max_chars {
        return Err(ProxyError::PayloadTooLarge { max_chars });
    }
    Ok(text)
}

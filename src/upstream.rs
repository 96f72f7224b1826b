use std::fmt::Debug;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::AppConfig;

pub const SYSTEM_PROMPT: &str = "You are a clinical decision-support assistant for educational use in Africa. \
Do NOT prescribe antibiotics or provide dosing. \
Provide differential considerations, red flags, and next-step questions. \
Offer safe, non-prescriptive symptom relief suggestions only. \
If danger signs exist, advise urgent in-person care.";

pub const TEMPERATURE: f64 = 0.2;

pub const DEFAULT_UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest raw upstream text passed back to the caller, in characters.
pub const RAW_REPLY_MAX_CHARS: usize = 4_000;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Server misconfigured: OPENAI_API_KEY not set")]
    MissingApiKey,
    #[error("Upstream error: request timed out")]
    Timeout,
    #[error("Upstream error: request failed")]
    Request(#[source] reqwest::Error),
    #[error("Upstream error: {status} {body}")]
    Status { status: u16, body: String },
    #[error("Upstream error: response was not valid JSON")]
    InvalidJson(#[source] serde_json::Error),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Request(err)
        }
    }
}

/// Request/response layout of one upstream API flavour.
pub trait WireShape: Send + Sync + Debug {
    /// Path appended to the configured base URL.
    fn path(&self) -> &'static str;

    fn payload(&self, model: &str, system_prompt: &str, text: &str) -> Value;

    /// Pulls the reply text out of a successful response, if it has the expected layout.
    fn extract_reply(&self, body: &Value) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponsesApi;

impl WireShape for ResponsesApi {
    fn path(&self) -> &'static str {
        "/responses"
    }

    fn payload(&self, model: &str, system_prompt: &str, text: &str) -> Value {
        json!({
            "model": model,
            "input": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": text},
            ],
            "temperature": TEMPERATURE,
        })
    }

    fn extract_reply(&self, body: &Value) -> Option<String> {
        body.get("output")?
            .as_array()?
            .iter()
            .filter_map(|item| item.get("content").and_then(Value::as_array))
            .flatten()
            .find_map(|part| {
                if part.get("type").and_then(Value::as_str) != Some("output_text") {
                    return None;
                }
                part.get("text").and_then(Value::as_str)
            })
            .map(ToString::to_string)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCompletionsApi;

impl WireShape for ChatCompletionsApi {
    fn path(&self) -> &'static str {
        "/chat/completions"
    }

    fn payload(&self, model: &str, system_prompt: &str, text: &str) -> Value {
        json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": text},
            ],
            "temperature": TEMPERATURE,
        })
    }

    fn extract_reply(&self, body: &Value) -> Option<String> {
        body.pointer("/choices/0/message/content")?
            .as_str()
            .map(ToString::to_string)
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Single outbound call to the LLM API. The wire shape is fixed at construction.
#[derive(Debug, Clone)]
pub struct UpstreamBridge {
    http_client: Client,
    base_url: String,
    api_key: String,
    model: String,
    shape: &'static dyn WireShape,
}

impl UpstreamBridge {
    pub fn new(config: &AppConfig) -> reqwest::Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(config.upstream_connect_timeout)
            .timeout(config.upstream_timeout)
            .build()?;

        let shape: &'static dyn WireShape = if config.use_responses_api {
            &ResponsesApi
        } else {
            &ChatCompletionsApi
        };

        Ok(Self {
            http_client,
            base_url: config.openai_base_url.clone(),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
            shape,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.shape.path()
        )
    }

    pub async fn send(&self, text: &str) -> Result<String, UpstreamError> {
        if self.api_key.is_empty() {
            return Err(UpstreamError::MissingApiKey);
        }

        let payload = self.shape.payload(&self.model, SYSTEM_PROMPT, text);
        let response = self
            .http_client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                upstream_status = status.as_u16(),
                "upstream returned an error status"
            );
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: truncate_chars(&body, RAW_REPLY_MAX_CHARS),
            });
        }

        let raw = response.text().await?;
        let body: Value = serde_json::from_str(&raw).map_err(UpstreamError::InvalidJson)?;

        match self.shape.extract_reply(&body) {
            Some(reply) => Ok(reply),
            None => {
                tracing::warn!(
                    path = self.shape.path(),
                    "upstream response had no reply text; returning raw body"
                );
                Ok(truncate_chars(&body.to_string(), RAW_REPLY_MAX_CHARS))
            }
        }
    }
}

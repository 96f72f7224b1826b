use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use triage_gpt_proxy::AppConfig;

/// Reads proxy settings from a key lookup. Blank values count as unset; values that
/// are set but unparsable fail startup instead of silently keeping the default.
struct ConfigSource<F> {
    lookup: F,
}

impl<F> ConfigSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).map(|v| v.trim().to_string())
    }

    fn non_empty(&self, name: &str) -> Option<String> {
        self.string(name).filter(|v| !v.is_empty())
    }

    fn number<T>(&self, name: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.non_empty(name) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid numeric value for {name}: {raw:?}: {e}"))
    }

    fn flag(&self, name: &str) -> anyhow::Result<Option<bool>> {
        let Some(raw) = self.non_empty(name) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "n" | "off" => Ok(Some(false)),
            _ => Err(anyhow::anyhow!(
                "invalid boolean value for {name}: {raw:?} (expected true/false)"
            )),
        }
    }

    fn load(&self) -> anyhow::Result<AppConfig> {
        let mut cfg = AppConfig::default();

        if let Some(name) = self.non_empty("APP_NAME") {
            cfg.app_name = name;
        }
        if let Some(url) = self.non_empty("OPENAI_BASE_URL") {
            cfg.openai_base_url = url;
        }
        if let Some(key) = self.string("OPENAI_API_KEY") {
            cfg.openai_api_key = key;
        }
        if let Some(model) = self.non_empty("OPENAI_MODEL") {
            cfg.openai_model = model;
        }
        if let Some(use_responses) = self.flag("OPENAI_USE_RESPONSES")? {
            cfg.use_responses_api = use_responses;
        }
        if let Some(token) = self.string("PROXY_AUTH_TOKEN") {
            cfg.proxy_auth_token = token;
        }
        if let Some(raw) = self.string("CORS_ORIGINS") {
            cfg.cors_origins = parse_cors_origins(&raw);
        }
        if let Some(rpm) = self.number::<u32>("RATE_LIMIT_RPM")? {
            cfg.rate_limit_rpm = rpm;
        }
        if let Some(secs) = self.number::<u64>("RATE_LIMIT_SWEEP_SECS")? {
            cfg.rate_limit_sweep_interval = Duration::from_secs(secs);
        }
        if let Some(max_chars) = self.number::<usize>("MAX_BODY_CHARS")? {
            cfg.max_body_chars = max_chars;
        }
        if let Some(ms) = self.number::<u64>("UPSTREAM_CONNECT_TIMEOUT_MS")? {
            cfg.upstream_connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.number::<u64>("UPSTREAM_TIMEOUT_MS")? {
            cfg.upstream_timeout = Duration::from_millis(ms);
        }

        if let Some(trust) = self.flag("TRUST_PROXY_HEADERS")? {
            cfg.trust_forwarded_for = trust;
        }
        if cfg.trust_forwarded_for {
            if let Some(raw) = self.string("TRUSTED_PROXY_CIDRS") {
                cfg.trusted_proxy_cidrs = parse_trusted_proxy_cidrs(&raw)?;
            }
        }

        Ok(cfg)
    }
}

fn parse_trusted_proxy_cidrs(raw: &str) -> anyhow::Result<Vec<IpNet>> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        for token in part.split_whitespace() {
            let net = token.parse::<IpNet>().map_err(|e| {
                anyhow::anyhow!("invalid CIDR in TRUSTED_PROXY_CIDRS: {token:?}: {e}")
            })?;
            out.push(net);
        }
    }
    Ok(out)
}

fn parse_cors_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn config_from_env() -> anyhow::Result<AppConfig> {
    ConfigSource {
        lookup: |name: &str| std::env::var(name).ok(),
    }
    .load()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "triage_gpt_proxy=info".into()),
        )
        .init();

    let listen: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;

    let state = triage_gpt_proxy::AppState::new(config_from_env()?)?;
    let cfg = state.config();
    if cfg.openai_api_key.is_empty() {
        tracing::warn!("OPENAI_API_KEY is not set; /gpt will fail with a server error");
    }
    if cfg.proxy_auth_token.is_empty() {
        tracing::warn!("PROXY_AUTH_TOKEN is not set; /gpt accepts unauthenticated callers");
    }
    if cfg.trust_forwarded_for && cfg.trusted_proxy_cidrs.is_empty() {
        tracing::warn!(
            "X-Forwarded-For is trusted from any peer; only run this way behind a reverse proxy"
        );
    }
    tracing::info!(
        model = %cfg.openai_model,
        responses_api = cfg.use_responses_api,
        rate_limit_rpm = cfg.rate_limit_rpm,
        max_body_chars = cfg.max_body_chars,
        "configured upstream"
    );

    triage_gpt_proxy::spawn_bucket_sweeper(state.clone());
    let app = triage_gpt_proxy::app(state)?;

    let listener = TcpListener::bind(listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

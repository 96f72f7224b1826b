use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::HeaderMap;
use ipnet::IpNet;

use crate::AppConfig;

pub const UNKNOWN_CLIENT: &str = "unknown";

fn leftmost_x_forwarded_for(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first)
}

fn is_trusted_proxy(peer_ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&peer_ip))
}

/// Key under which a request is rate limited.
///
/// The leftmost `X-Forwarded-For` entry wins when forwarding headers are trusted.
/// That header is client-supplied, so without a reverse proxy in front either turn
/// `trust_forwarded_for` off or pin `trusted_proxy_cidrs` to the proxy's network.
pub fn resolve_client_identity(
    config: &AppConfig,
    headers: &HeaderMap,
    connect_info: &Option<ConnectInfo<SocketAddr>>,
) -> String {
    let peer_ip = connect_info.as_ref().map(|ConnectInfo(addr)| addr.ip());

    let honour_forwarded = config.trust_forwarded_for
        && (config.trusted_proxy_cidrs.is_empty()
            || peer_ip.is_some_and(|ip| is_trusted_proxy(ip, &config.trusted_proxy_cidrs)));

    if honour_forwarded {
        if let Some(forwarded) = leftmost_x_forwarded_for(headers) {
            return forwarded.to_string();
        }
    }

    peer_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;

    fn peer(addr: &str) -> Option<ConnectInfo<SocketAddr>> {
        Some(ConnectInfo(addr.parse::<SocketAddr>().unwrap()))
    }

    fn xff(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn uses_leftmost_forwarded_entry() {
        let cfg = AppConfig::default();
        let got = resolve_client_identity(&cfg, &xff("1.2.3.4, 5.6.7.8"), &peer("9.9.9.9:80"));
        assert_eq!(got, "1.2.3.4");
    }

    #[test]
    fn forwarded_entry_is_not_required_to_be_an_ip() {
        let cfg = AppConfig::default();
        let got = resolve_client_identity(&cfg, &xff("  client-a ,proxy"), &None);
        assert_eq!(got, "client-a");
    }

    #[test]
    fn empty_forwarded_entry_falls_back_to_peer_ip() {
        let cfg = AppConfig::default();
        let got = resolve_client_identity(&cfg, &xff(" , 5.6.7.8"), &peer("203.0.113.10:1234"));
        assert_eq!(got, "203.0.113.10");
    }

    #[test]
    fn missing_everything_is_unknown() {
        let cfg = AppConfig::default();
        let got = resolve_client_identity(&cfg, &HeaderMap::new(), &None);
        assert_eq!(got, UNKNOWN_CLIENT);
    }

    #[test]
    fn ignores_forwarded_header_when_untrusted() {
        let mut cfg = AppConfig::default();
        cfg.trust_forwarded_for = false;

        let got = resolve_client_identity(&cfg, &xff("198.51.100.7"), &peer("203.0.113.10:1234"));
        assert_eq!(got, "203.0.113.10");
    }

    #[test]
    fn ignores_forwarded_header_from_peer_outside_trusted_cidrs() {
        let mut cfg = AppConfig::default();
        cfg.trusted_proxy_cidrs = vec!["192.0.2.0/24".parse::<IpNet>().unwrap()];

        let got = resolve_client_identity(&cfg, &xff("198.51.100.7"), &peer("203.0.113.10:1234"));
        assert_eq!(got, "203.0.113.10");
    }

    #[test]
    fn honours_forwarded_header_from_peer_inside_trusted_cidrs() {
        let mut cfg = AppConfig::default();
        cfg.trusted_proxy_cidrs = vec!["203.0.113.0/24".parse::<IpNet>().unwrap()];

        let got = resolve_client_identity(
            &cfg,
            &xff("198.51.100.7, 203.0.113.10"),
            &peer("203.0.113.10:1234"),
        );
        assert_eq!(got, "198.51.100.7");
    }

    #[test]
    fn trusted_cidrs_without_peer_address_ignore_forwarded_header() {
        let mut cfg = AppConfig::default();
        cfg.trusted_proxy_cidrs = vec!["203.0.113.0/24".parse::<IpNet>().unwrap()];

        let got = resolve_client_identity(&cfg, &xff("198.51.100.7"), &None);
        assert_eq!(got, UNKNOWN_CLIENT);
    }
}

//! Upstream-proxy dialer factory (C2): resolves, validates, and turns a
//! `ProxyOptions` into an outbound transport, matching the connect/pool/
//! timeout tuning the reference proxy client already uses for its fixed set
//! of upstreams, generalized to an arbitrary caller-supplied proxy.

use std::net::IpAddr;
use std::time::Duration;

use base64::Engine;

use crate::error::GatewayError;
use crate::model::{ProxyAuth, ProxyOptions, ProxyScheme};

/// What to do to reach the target once a `ProxyOptions` has been resolved
/// and validated, for transports (WebSocket) that cannot simply hand a URL
/// to `reqwest`.
#[derive(Debug, Clone)]
pub enum Dialer {
    Direct,
    HttpConnect(ProxyOptions),
}

/// Priority: (1) `X-Proxy-Config` header (base64 JSON `ProxyOptions`), (2)
/// `proxy` query parameter (a bare URL), (3) the process-level default, (4)
/// none.
pub fn resolve_proxy_options(
    header_value: Option<&str>,
    query_proxy: Option<&str>,
    default_proxy: Option<&str>,
) -> Result<Option<ProxyOptions>, GatewayError> {
    if let Some(encoded) = header_value {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| GatewayError::Validation(format!("invalid X-Proxy-Config: {e}")))?;
        let opts: ProxyOptions = serde_json::from_slice(&decoded)
            .map_err(|e| GatewayError::Validation(format!("invalid X-Proxy-Config: {e}")))?;
        return Ok(Some(opts));
    }
    if let Some(url) = query_proxy {
        return ProxyOptions::parse_url(url)
            .map(Some)
            .map_err(GatewayError::Validation);
    }
    if let Some(url) = default_proxy {
        return ProxyOptions::parse_url(url)
            .map(Some)
            .map_err(GatewayError::Validation);
    }
    Ok(None)
}

fn host_matches_whitelist(host: &str, whitelist: &[String]) -> bool {
    whitelist
        .iter()
        .any(|entry| entry == host || host.ends_with(&format!(".{entry}")))
}

fn is_private_or_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Validates a resolved `ProxyOptions` against the configured whitelist and
/// private-address policy. Performs a DNS lookup when the host is not a
/// literal IP address.
pub async fn validate_proxy_options(
    opts: &ProxyOptions,
    whitelist: &[String],
    allow_private: bool,
) -> Result<(), GatewayError> {
    let host = opts
        .host()
        .ok_or_else(|| GatewayError::Validation("proxy url has no host".to_string()))?;

    if !whitelist.is_empty() && !host_matches_whitelist(&host, whitelist) {
        return Err(GatewayError::Forbidden(format!(
            "proxy host {host} is not in the whitelist"
        )));
    }

    if !allow_private {
        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private_or_loopback(ip) {
                return Err(GatewayError::Forbidden(format!(
                    "proxy host {host} resolves to a private address"
                )));
            }
        } else {
            let port = url::Url::parse(&opts.url)
                .ok()
                .and_then(|u| u.port_or_known_default())
                .unwrap_or(80);
            match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if is_private_or_loopback(addr.ip()) {
                            return Err(GatewayError::Forbidden(format!(
                                "proxy host {host} resolves to a private address"
                            )));
                        }
                    }
                }
                Err(e) => {
                    return Err(GatewayError::Validation(format!(
                        "failed to resolve proxy host {host}: {e}"
                    )))
                }
            }
        }
    }

    Ok(())
}

/// Builds a `reqwest::Client` wired to the given proxy options (if any). For
/// `http`/`https` schemes this is a regular forward proxy; for `socks5` the
/// `socks` feature of `reqwest` does the work.
pub fn build_http_client(
    opts: Option<&ProxyOptions>,
    timeout_seconds: u64,
) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(Duration::from_secs(timeout_seconds));

    if let Some(opts) = opts {
        let proxy_url = with_userinfo(opts);
        let proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| GatewayError::Validation(format!("invalid proxy: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to build http client: {e}")))
}

fn with_userinfo(opts: &ProxyOptions) -> String {
    match &opts.auth {
        Some(ProxyAuth { username, password }) => {
            if let Ok(mut url) = url::Url::parse(&opts.url) {
                let _ = url.set_username(username);
                let _ = url.set_password(Some(password));
                return url.to_string();
            }
            opts.url.clone()
        }
        None => opts.url.clone(),
    }
}

/// Decides the dial strategy for the WebSocket forwarding engine.
/// SOCKS5 is explicitly unsupported for WebSocket in this revision.
pub fn build_websocket_dialer(opts: Option<&ProxyOptions>) -> Result<Dialer, GatewayError> {
    match opts {
        None => Ok(Dialer::Direct),
        Some(opts) if opts.scheme == ProxyScheme::Socks5 => Err(GatewayError::NotImplemented(
            "SOCKS5 upstream proxy is not supported for WebSocket forwarding".to_string(),
        )),
        Some(opts) => Ok(Dialer::HttpConnect(opts.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_header_over_query() {
        let opts = ProxyOptions::parse_url("http://p.test:8080").unwrap();
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&opts).unwrap());
        let resolved = resolve_proxy_options(Some(&encoded), Some("http://other:1"), None)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.url, "http://p.test:8080");
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let resolved = resolve_proxy_options(None, None, Some("http://d.test:80"))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.url, "http://d.test:80");
    }

    #[test]
    fn resolve_returns_none_when_nothing_configured() {
        assert!(resolve_proxy_options(None, None, None).unwrap().is_none());
    }

    #[tokio::test]
    async fn whitelist_rejects_unlisted_host() {
        let opts = ProxyOptions::parse_url("http://evil.test:8080").unwrap();
        let result = validate_proxy_options(&opts, &["good.test".to_string()], true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn literal_private_ip_rejected_by_default() {
        let opts = ProxyOptions::parse_url("http://127.0.0.1:8080").unwrap();
        let result = validate_proxy_options(&opts, &[], false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn literal_private_ip_allowed_when_configured() {
        let opts = ProxyOptions::parse_url("http://127.0.0.1:8080").unwrap();
        let result = validate_proxy_options(&opts, &[], true).await;
        assert!(result.is_ok());
    }

    #[test]
    fn websocket_dialer_rejects_socks5() {
        let opts = ProxyOptions::parse_url("socks5://p.test:1080").unwrap();
        let result = build_websocket_dialer(Some(&opts));
        assert!(matches!(result, Err(GatewayError::NotImplemented(_))));
    }

    #[test]
    fn websocket_dialer_allows_http_proxy() {
        let opts = ProxyOptions::parse_url("http://p.test:8080").unwrap();
        let result = build_websocket_dialer(Some(&opts));
        assert!(matches!(result, Ok(Dialer::HttpConnect(_))));
    }
}

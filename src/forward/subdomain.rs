//! Subdomain router (C7): resolves the Host header against the
//! configuration registry's subdomain index and rewrites the request onto
//! the HTTP forwarding engine's `target=` contract.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;
use crate::forward::common::SubdomainMarker;
use crate::forward::http::handle_http_proxy;
use crate::state::AppState;

/// Extracts the first label of the Host header, stripping a `:port` suffix.
/// `localhost` and bare IP hosts never carry a subdomain.
fn host_label(host: &str) -> Option<&str> {
    let host = host.split(':').next().unwrap_or(host);
    if host == "localhost" || host.parse::<std::net::IpAddr>().is_ok() {
        return None;
    }
    host.split('.').next().filter(|label| !label.is_empty())
}

pub async fn handle_subdomain_proxy(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(label) = host_label(host) else {
        return GatewayError::NotFound.into_response();
    };

    let Some(config) = state.registry.get_by_subdomain(label).await else {
        return GatewayError::NotFound.into_response();
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let (path, extra_query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let target = format!("{}{}", config.target_url.trim_end_matches('/'), path);
    let mut new_query = format!("target={}", urlencode(&target));
    if let Some(extra) = extra_query {
        new_query.push('&');
        new_query.push_str(extra);
    }

    let (mut parts, body) = req.into_parts();
    let new_uri = format!("/proxy?{new_query}");
    parts.uri = match new_uri.parse() {
        Ok(uri) => uri,
        Err(_) => {
            return GatewayError::Internal("failed to rewrite subdomain request".to_string())
                .into_response()
        }
    };
    parts.extensions.insert(SubdomainMarker);
    let rewritten = Request::from_parts(parts, body);
    handle_http_proxy(State(state), ConnectInfo(remote), rewritten).await
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port_from_host() {
        assert_eq!(host_label("api.example.com:8080"), Some("api"));
    }

    #[test]
    fn localhost_has_no_subdomain() {
        assert_eq!(host_label("localhost:3000"), None);
    }

    #[test]
    fn bare_ip_has_no_subdomain() {
        assert_eq!(host_label("127.0.0.1"), None);
    }
}

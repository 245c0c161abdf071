//! HTTP forwarding engine (C6): the `/proxy?target=...` entry point.
//!
//! Pipeline grounded on the reference proxy's `UpstreamClient::forward`, with
//! the outbound dial generalized from a fixed upstream list to an arbitrary
//! caller-supplied `target` plus an optional chained outbound proxy.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, StreamExt};
use reqwest::Method as ReqwestMethod;
use tracing::warn;
use url::Url;

use crate::error::GatewayError;
use crate::forward::common::{
    build_access_log, client_ip, inbound_response_headers, outbound_request_headers, CaptureInput,
    SubdomainMarker,
};
use crate::model::RequestType;
use crate::state::AppState;
use crate::upstream::{build_http_client, resolve_proxy_options, validate_proxy_options};

fn query_param<'a>(query: &'a str, name: &str) -> Option<std::borrow::Cow<'a, str>> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
}

fn request_type_for(url: &Url, is_subdomain: bool) -> RequestType {
    match (url.scheme(), is_subdomain) {
        ("https", true) => RequestType::SubdomainHttps,
        ("https", false) => RequestType::Https,
        (_, true) => RequestType::SubdomainHttp,
        (_, false) => RequestType::Http,
    }
}

/// Builds the outbound URL: the caller's `target`, with any extra query
/// parameters (everything except `target`, `proxy`, and the credential
/// parameters already consumed by authentication) re-attached.
fn outbound_url(target: &str, original_query: &str) -> Result<Url, GatewayError> {
    let mut url = Url::parse(target).map_err(|e| GatewayError::Validation(format!("invalid target url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::Validation("target url must be http or https".to_string()));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(GatewayError::Validation("target url has no host".to_string()));
    }

    let skip = ["target", "proxy", "token", "secret", "config_id"];
    let extra: Vec<(String, String)> = url::form_urlencoded::parse(original_query.as_bytes())
        .filter(|(k, _)| !skip.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !extra.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in extra {
            pairs.append_pair(&k, &v);
        }
    }
    Ok(url)
}

pub async fn handle_http_proxy(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    match handle_inner(state, remote, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_inner(state: AppState, remote: SocketAddr, req: Request) -> Result<Response, GatewayError> {
    let started_at = Instant::now();
    let query = req.uri().query().unwrap_or("").to_string();
    let method = req.method().clone();
    let headers = req.headers().clone();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let client_addr = client_ip(&headers, remote);
    let is_subdomain = req.extensions().get::<SubdomainMarker>().is_some();

    let _auth = state
        .authenticator
        .authenticate_for_proxy(&req, &state.registry, None)
        .await?;

    let target = query_param(&query, "target")
        .ok_or_else(|| GatewayError::Validation("missing target query parameter".to_string()))?
        .into_owned();
    let outbound = outbound_url(&target, &query)?;

    let proxy_header = headers.get("x-proxy-config").and_then(|v| v.to_str().ok());
    let proxy_query = query_param(&query, "proxy");
    let proxy_opts = resolve_proxy_options(
        proxy_header,
        proxy_query.as_deref(),
        state.settings.default_proxy.as_deref(),
    )?;
    if let Some(opts) = &proxy_opts {
        validate_proxy_options(opts, &state.settings.proxy_whitelist, state.settings.allow_private_proxy).await?;
    }
    let client = build_http_client(proxy_opts.as_ref(), state.settings.http_client_timeout_seconds)?;

    let body_bytes = axum::body::to_bytes(req.into_body(), state.settings.max_request_body_size)
        .await
        .map_err(|_| GatewayError::Validation("request body exceeds configured limit".to_string()))?;

    let outbound_headers = outbound_request_headers(&headers, &state.settings.sensitive_headers);
    let reqwest_method = ReqwestMethod::from_bytes(method.as_str().as_bytes())
        .map_err(|_| GatewayError::Validation("unsupported http method".to_string()))?;

    let mut builder = client.request(reqwest_method, outbound.clone());
    for (name, value) in outbound_headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let upstream_response = builder
        .body(body_bytes.to_vec())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                GatewayError::UpstreamTimeout
            } else {
                GatewayError::Upstream(e.to_string())
            }
        })?;

    let status = upstream_response.status();
    let response_headers_reqwest = upstream_response.headers().clone();

    let mut response_header_map = axum::http::HeaderMap::new();
    for (name, value) in response_headers_reqwest.iter() {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_header_map.append(name, value);
        }
    }
    let downstream_headers = inbound_response_headers(&response_header_map, &state.settings.sensitive_headers);

    // The body is proxied to the client as a stream rather than buffered in
    // full; a bounded prefix (up to `log_max_body_size`) is captured on the
    // side for the access-log entry, which is enqueued once the stream ends.
    let max_body_size = state.settings.log_max_body_size;
    let captured = Arc::new(Mutex::new(Vec::new()));
    let captured_for_stream = captured.clone();
    let body_stream = upstream_response.bytes_stream().map(move |chunk| {
        if let Ok(chunk) = &chunk {
            let mut buf = captured_for_stream.lock().unwrap();
            if buf.len() < max_body_size {
                let remaining = max_body_size - buf.len();
                let take = remaining.min(chunk.len());
                buf.extend_from_slice(&chunk[..take]);
            }
        }
        chunk
    });

    let log_state = state.clone();
    let log_method = method.to_string();
    let log_target_host = outbound.host_str().unwrap_or("").to_string();
    let log_target_path = outbound.path().to_string();
    let log_request_type = request_type_for(&outbound, is_subdomain);
    let log_proxy_info = proxy_opts.as_ref().map(|o| o.url.clone());
    let log_request_headers = headers.clone();
    let log_response_headers = response_header_map.clone();
    let log_request_body = body_bytes.clone();
    let record_200 = state.settings.log_record_200;
    let tail = stream::once(async move {
        let response_body = captured.lock().unwrap().clone();
        let log = build_access_log(CaptureInput {
            method: log_method,
            target_host: log_target_host,
            target_path: log_target_path,
            status_code: status.as_u16(),
            started_at,
            request_type: log_request_type,
            client_ip: client_addr,
            user_agent,
            proxy_info: log_proxy_info,
            request_headers: &log_request_headers,
            response_headers: &log_response_headers,
            request_body: &log_request_body,
            response_body: &response_body,
            record_200,
            max_body_size,
        });
        log_state.access_log.enqueue(log);
        Ok::<Bytes, reqwest::Error>(Bytes::new())
    });

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in downstream_headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(body_stream.chain(tail)))
        .map_err(|e| {
            warn!(error = %e, "failed to build downstream response");
            GatewayError::Internal("failed to build response".to_string())
        })
}

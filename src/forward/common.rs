//! Shared plumbing for the HTTP and WebSocket forwarding engines: header
//! filtering, client-IP resolution, and access-log record assembly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::http::HeaderMap;
use chrono::Utc;
use rand::RngCore;

use crate::accesslog::classify_body;
use crate::auth::client_ip_from;
use crate::headers::{is_cors_response_header, is_sensitive};
use crate::model::{AccessLog, RequestType};

/// Headers that must never be forwarded verbatim between hops regardless of
/// the sensitive-header list, since they describe the connection itself.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Marks a request as having been rewritten by the subdomain router, so the
/// HTTP forwarding engine can tag its access-log entry as a subdomain
/// request type instead of a plain one.
#[derive(Debug, Clone, Copy)]
pub struct SubdomainMarker;

pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    let from_headers = client_ip_from(headers);
    if !from_headers.is_empty() {
        from_headers
    } else {
        remote.ip().to_string()
    }
}

/// Headers safe to copy to the outbound request: not hop-by-hop and not on
/// the configured sensitive list.
pub fn outbound_request_headers(headers: &HeaderMap, sensitive_list: &[String]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || is_sensitive(&lower, sensitive_list) {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

/// Headers safe to copy back to the downstream client: not hop-by-hop, not a
/// CORS header the gateway owns, and not on the sensitive list.
pub fn inbound_response_headers(headers: &HeaderMap, sensitive_list: &[String]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str())
            || is_cors_response_header(&lower)
            || is_sensitive(&lower, sensitive_list)
        {
            continue;
        }
        out.append(name, value.clone());
    }
    out
}

/// 16-hex-digit access-log id: 8 random bytes, hex-encoded.
pub fn generate_log_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

pub struct CaptureInput<'a> {
    pub method: String,
    pub target_host: String,
    pub target_path: String,
    pub status_code: u16,
    pub started_at: Instant,
    pub request_type: RequestType,
    pub client_ip: String,
    pub user_agent: String,
    pub proxy_info: Option<String>,
    pub request_headers: &'a HeaderMap,
    pub response_headers: &'a HeaderMap,
    pub request_body: &'a [u8],
    pub response_body: &'a [u8],
    pub record_200: bool,
    pub max_body_size: usize,
}

pub fn build_access_log(input: CaptureInput) -> AccessLog {
    let request_content_type = input
        .request_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok());
    let response_content_type = input
        .response_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok());

    AccessLog {
        id: generate_log_id(),
        timestamp: Utc::now(),
        method: input.method,
        target_host: input.target_host,
        target_path: input.target_path,
        status_code: input.status_code,
        duration_ms: input.started_at.elapsed().as_millis() as u64,
        request_type: input.request_type,
        client_ip: input.client_ip,
        user_agent: input.user_agent,
        proxy_info: input.proxy_info,
        request_headers: headers_to_map(input.request_headers),
        request_body: classify_body(
            input.request_body,
            request_content_type,
            0,
            true,
            input.max_body_size,
        ),
        response_headers: headers_to_map(input.response_headers),
        response_body: classify_body(
            input.response_body,
            response_content_type,
            input.status_code,
            input.record_200,
            input.max_body_size,
        ),
        request_size: input.request_body.len() as u64,
        response_size: input.response_body.len() as u64,
    }
}

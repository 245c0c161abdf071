//! WebSocket forwarding engine (C8): `/ws?target=...`, admin-only in this
//! revision (spec §4.8 — token-scoped WebSocket auth is an open question
//! resolved as out of scope, see DESIGN.md).
//!
//! Bidirectional splicing is grounded on the reference proxy's SSE relay
//! (`forward_sse_stream`), which already pairs an inbound and an outbound
//! async stream and copies frames until either side ends; tokio-tungstenite
//! replaces the reference's `eventsource-stream` decoder since full-duplex
//! WebSocket framing, not one-way SSE, is what this engine forwards.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as TungsteniteMessage;
use tracing::{info, warn};
use url::Url;

use crate::error::GatewayError;
use crate::forward::common::generate_log_id;
use crate::model::{AccessLog, RequestType};
use crate::state::AppState;
use crate::upstream::{build_websocket_dialer, resolve_proxy_options, validate_proxy_options, Dialer};

const FORWARDED_REQUEST_HEADERS: &[&str] =
    &["origin", "sec-websocket-protocol", "sec-websocket-extensions"];

pub async fn handle_websocket_proxy(
    State(state): State<AppState>,
    Query(params): Query<std::collections::HashMap<String, String>>,
    ws: WebSocketUpgrade,
    req: Request,
) -> Response {
    if let Err(err) = state.authenticator.authenticate_for_config(&req) {
        return err.into_response();
    }

    let Some(target) = params.get("target").cloned() else {
        return GatewayError::Validation("missing target query parameter".to_string()).into_response();
    };
    let target_url = match Url::parse(&target) {
        Ok(url) if url.scheme() == "ws" || url.scheme() == "wss" => url,
        Ok(url) if url.scheme() == "http" => {
            let mut url = url;
            let _ = url.set_scheme("ws");
            url
        }
        Ok(url) if url.scheme() == "https" => {
            let mut url = url;
            let _ = url.set_scheme("wss");
            url
        }
        Ok(_) | Err(_) => {
            return GatewayError::Validation("target must be a ws/wss url".to_string()).into_response()
        }
    };

    let proxy_header = req.headers().get("x-proxy-config").and_then(|v| v.to_str().ok());
    let proxy_opts = match resolve_proxy_options(
        proxy_header,
        params.get("proxy").map(String::as_str),
        state.settings.default_proxy.as_deref(),
    ) {
        Ok(opts) => opts,
        Err(err) => return err.into_response(),
    };
    if let Some(opts) = &proxy_opts {
        if let Err(err) =
            validate_proxy_options(opts, &state.settings.proxy_whitelist, state.settings.allow_private_proxy).await
        {
            return err.into_response();
        }
    }
    let dialer = match build_websocket_dialer(proxy_opts.as_ref()) {
        Ok(dialer) => dialer,
        Err(err) => return err.into_response(),
    };

    let forwarded_headers: Vec<(String, String)> = FORWARDED_REQUEST_HEADERS
        .iter()
        .filter_map(|name| {
            req.headers()
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    let remote = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0)
        .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
    let client_ip = crate::forward::common::client_ip(req.headers(), remote);

    // Dial the upstream before committing to the 101 upgrade: a dial failure
    // must surface as a normal HTTP error response, not a silently dropped
    // client socket that already believes it's connected.
    let upstream = match dial_upstream(&target_url, &dialer, &forwarded_headers).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, target = %target_url, "websocket upstream dial failed");
            return err.into_response();
        }
    };

    ws.on_upgrade(move |socket| async move {
        splice(state, socket, upstream, target_url, client_ip).await
    })
}

async fn splice(
    state: AppState,
    downstream: WebSocket,
    upstream: UpstreamWs,
    target_url: Url,
    client_ip: String,
) {
    let started_at = Instant::now();
    let (mut upstream_sink, mut upstream_stream) = upstream.split();
    let (mut downstream_sink, mut downstream_stream) = downstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = downstream_stream.next().await {
            let forwarded = match msg {
                AxumMessage::Text(text) => TungsteniteMessage::Text(text),
                AxumMessage::Binary(bin) => TungsteniteMessage::Binary(bin),
                AxumMessage::Ping(bin) => TungsteniteMessage::Ping(bin),
                AxumMessage::Pong(bin) => TungsteniteMessage::Pong(bin),
                AxumMessage::Close(_) => break,
            };
            if upstream_sink.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = upstream_sink.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_stream.next().await {
            let forwarded = match msg {
                TungsteniteMessage::Text(text) => AxumMessage::Text(text),
                TungsteniteMessage::Binary(bin) => AxumMessage::Binary(bin),
                TungsteniteMessage::Ping(bin) => AxumMessage::Ping(bin),
                TungsteniteMessage::Pong(bin) => AxumMessage::Pong(bin),
                TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => break,
            };
            if downstream_sink.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = downstream_sink.close().await;
    };

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    let duration_ms = started_at.elapsed().as_millis() as u64;
    info!(client_ip, target = %target_url, duration_ms, "websocket session closed");

    state.access_log.enqueue(AccessLog {
        id: generate_log_id(),
        timestamp: Utc::now(),
        method: "GET".to_string(),
        target_host: target_url.host_str().unwrap_or("").to_string(),
        target_path: target_url.path().to_string(),
        status_code: 101,
        duration_ms,
        request_type: RequestType::WebSocket,
        client_ip,
        user_agent: String::new(),
        proxy_info: None,
        request_headers: HashMap::new(),
        request_body: None,
        response_headers: HashMap::new(),
        response_body: None,
        request_size: 0,
        response_size: 0,
    });
}

type UpstreamWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn dial_upstream(
    target_url: &Url,
    dialer: &Dialer,
    forwarded_headers: &[(String, String)],
) -> Result<UpstreamWs, GatewayError> {
    let request = build_handshake_request(target_url, forwarded_headers)?;
    match dialer {
        Dialer::Direct => {
            let (stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| GatewayError::Upstream(format!("websocket connect failed: {e}")))?;
            Ok(stream)
        }
        Dialer::HttpConnect(opts) => {
            let proxy_host = opts
                .host()
                .ok_or_else(|| GatewayError::Validation("proxy url has no host".to_string()))?;
            let proxy_port = Url::parse(&opts.url)
                .ok()
                .and_then(|u| u.port_or_known_default())
                .unwrap_or(8080);
            let target_host = target_url
                .host_str()
                .ok_or_else(|| GatewayError::Validation("target url has no host".to_string()))?;
            let target_port = target_url.port_or_known_default().unwrap_or(80);

            let mut tcp = TcpStream::connect((proxy_host.as_str(), proxy_port))
                .await
                .map_err(|e| GatewayError::Upstream(format!("failed to connect to proxy: {e}")))?;
            connect_handshake(&mut tcp, target_host, target_port, opts).await?;

            let (stream, _response) = tokio_tungstenite::client_async_tls(request, tcp)
                .await
                .map_err(|e| GatewayError::Upstream(format!("websocket connect via proxy failed: {e}")))?;
            Ok(stream)
        }
    }
}

async fn connect_handshake(
    tcp: &mut TcpStream,
    target_host: &str,
    target_port: u16,
    opts: &crate::model::ProxyOptions,
) -> Result<(), GatewayError> {
    let mut request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n"
    );
    if let Some(auth) = &opts.auth {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    tcp.write_all(request.as_bytes())
        .await
        .map_err(|e| GatewayError::Upstream(format!("CONNECT write failed: {e}")))?;

    let mut buf = vec![0u8; 4096];
    let mut total = 0usize;
    loop {
        let n = tcp
            .read(&mut buf[total..])
            .await
            .map_err(|e| GatewayError::Upstream(format!("CONNECT read failed: {e}")))?;
        if n == 0 {
            return Err(GatewayError::Upstream("proxy closed connection during CONNECT".to_string()));
        }
        total += n;
        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if total == buf.len() {
            return Err(GatewayError::Upstream("CONNECT response too large".to_string()));
        }
    }
    let response = String::from_utf8_lossy(&buf[..total]);
    let status_line = response.lines().next().unwrap_or("");
    if !status_line.contains(" 200 ") {
        return Err(GatewayError::Upstream(format!("CONNECT rejected: {status_line}")));
    }
    Ok(())
}

fn build_handshake_request(
    target_url: &Url,
    forwarded_headers: &[(String, String)],
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, GatewayError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = target_url
        .as_str()
        .into_client_request()
        .map_err(|e| GatewayError::Validation(format!("invalid websocket target: {e}")))?;
    for (name, value) in forwarded_headers {
        if let (Ok(name), Ok(value)) = (
            tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_bytes()),
            tokio_tungstenite::tungstenite::http::HeaderValue::from_str(value),
        ) {
            request.headers_mut().append(name, value);
        }
    }
    Ok(request)
}

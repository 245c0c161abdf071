//! Route table, middleware, and the manual accept loop (spec §6.2).
//!
//! Grounded on the reference `AxumServer::start`: a hand-rolled
//! `TcpListener::accept()` loop feeding `hyper::server::conn::http1` with
//! upgrades enabled (needed for the WebSocket forwarding engine's `Upgrade`
//! handshake) rather than `axum::serve`, with `ConnectInfo` injected via
//! `map_request` so every handler can resolve the transport-level remote
//! address.

use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::api::admin;
use crate::forward::{handle_http_proxy, handle_root, handle_websocket_proxy};
use crate::state::AppState;

const ALLOWED_REQUEST_HEADERS: &[&str] = &[
    "content-type",
    "authorization",
    "x-proxy-token",
    "x-log-secret",
    "x-config-id",
    "x-proxy-config",
];

/// Matches spec §6.2's CORS contract: wildcard origin, the gateway's own
/// method/header surface, and a day-long preflight cache.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(
            ALLOWED_REQUEST_HEADERS
                .iter()
                .map(|h| HeaderValue::from_static(h))
                .collect::<Vec<_>>(),
        )
        .max_age(Duration::from_secs(86_400))
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/config/proxy",
            get(admin::list_configs)
                .post(admin::create_config)
                .put(admin::update_config)
                .delete(admin::delete_config),
        )
        .route("/config/proxy/export", get(admin::export_configs))
        .route("/config/proxy/import", post(admin::import_configs))
        .route("/config/proxy/batch", post(admin::batch_operation))
        .route(
            "/config/proxy/:id/tokens",
            get(admin::list_tokens).post(admin::create_token),
        )
        .route(
            "/config/proxy/:id/tokens/:token_id",
            get(admin::get_token).put(admin::update_token).delete(admin::delete_token),
        )
        .route("/logs", get(admin::query_logs))
        .route("/logs/stats", get(admin::log_stats))
}

fn proxy_routes() -> Router<AppState> {
    Router::new()
        .route("/proxy", get(handle_http_proxy).post(handle_http_proxy).put(handle_http_proxy).delete(handle_http_proxy))
        .route("/ws", get(handle_websocket_proxy))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(admin_routes())
        .merge(proxy_routes())
        .fallback(handle_root)
        .layer(cors_layer())
        .with_state(state)
}

/// Binds and serves the router until `shutdown_rx` resolves, using the
/// manual accept-loop idiom (not `axum::serve`) so WebSocket upgrades and a
/// bounded graceful-shutdown window are both easy to express explicitly.
pub async fn serve(
    host: &str,
    port: u16,
    state: AppState,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> std::io::Result<()> {
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper_util::rt::TokioIo;
    use hyper_util::service::TowerToHyperService;
    use tower::ServiceExt;

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, "gateway listening");

    let shutdown_grace = Duration::from_secs(state.settings.shutdown_grace_seconds);
    let app = build_router(state);
    let app_service = app.into_service();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok((stream, remote_addr)) => {
                        let io = TokioIo::new(stream);
                        let svc = app_service.clone().map_request(
                            move |mut req: axum::http::Request<Incoming>| {
                                req.extensions_mut().insert(ConnectInfo(remote_addr));
                                req
                            },
                        );
                        let hyper_svc = TowerToHyperService::new(svc);
                        connections.spawn(async move {
                            if let Err(err) = http1::Builder::new()
                                .serve_connection(io, hyper_svc)
                                .with_upgrades()
                                .await
                            {
                                debug!(error = %err, "connection ended");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                }
            }
            _ = &mut shutdown_rx => {
                info!("gateway shutting down");
                break;
            }
        }
    }

    // Let in-flight connections finish under a bounded grace period instead
    // of dropping them the instant the accept loop stops.
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
        warn!(
            remaining = connections.len(),
            grace_seconds = shutdown_grace.as_secs(),
            "shutdown grace period elapsed with connections still in flight"
        );
        connections.abort_all();
    }

    Ok(())
}

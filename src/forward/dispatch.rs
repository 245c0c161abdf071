//! Root dispatcher (C10): decides whether an inbound request at `/` (or any
//! path not matched by a more specific route) is a subdomain-routed proxy
//! request or simply not found.
//!
//! Grounded on the reference `AxumServer`'s top-level `Router::new()`
//! composition, which always falls through to a catch-all after the
//! purpose-built routes have had a chance to match.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;

use crate::forward::subdomain::handle_subdomain_proxy;
use crate::state::AppState;

pub async fn handle_root(
    state: State<AppState>,
    connect_info: ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    handle_subdomain_proxy(state, connect_info, req).await
}

//! Forwarding engines: HTTP (C6), subdomain routing (C7), WebSocket (C8),
//! and the root dispatcher (C10) that ties them together.

pub mod common;
pub mod dispatch;
pub mod http;
pub mod subdomain;
pub mod websocket;

pub use dispatch::handle_root;
pub use http::handle_http_proxy;
pub use subdomain::handle_subdomain_proxy;
pub use websocket::handle_websocket_proxy;

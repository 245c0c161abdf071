mod dialer;

pub use dialer::{
    build_http_client, build_websocket_dialer, resolve_proxy_options, validate_proxy_options, Dialer,
};

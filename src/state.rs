use std::sync::Arc;

use crate::accesslog::AccessLogPipeline;
use crate::auth::Authenticator;
use crate::registry::Registry;
use crate::settings::GatewaySettings;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub authenticator: Arc<Authenticator>,
    pub settings: Arc<GatewaySettings>,
    pub access_log: Arc<AccessLogPipeline>,
}

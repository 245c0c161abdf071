//! Process entry point: reads configuration from the environment, wires up
//! the registry/authenticator/access-log pipeline, and serves until a
//! termination signal arrives.
//!
//! Grounded on the reference `run()`'s headless branch, which is the only
//! branch relevant once the desktop/Tauri shell is gone.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, info};

use privacy_gateway::accesslog::{AccessLogPipeline, PipelineSettings};
use privacy_gateway::auth::Authenticator;
use privacy_gateway::registry::Registry;
use privacy_gateway::settings::GatewaySettings;
use privacy_gateway::state::AppState;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let settings = Arc::new(GatewaySettings::from_env());

    let persist_path = settings.config_persist.then(|| settings.config_file.clone().into());
    let registry = Registry::load(
        persist_path,
        Duration::from_secs(settings.config_auto_save_seconds),
    )
    .await;
    registry.start_persistence().await;

    let access_log = AccessLogPipeline::new(PipelineSettings {
        max_entries: settings.log_max_entries,
        max_memory_mb: settings.log_max_memory_mb,
        retention_hours: settings.log_retention_hours,
    });

    let authenticator = Arc::new(Authenticator::new(settings.admin_secret.clone()));

    let state = AppState {
        registry: registry.clone(),
        authenticator,
        settings: settings.clone(),
        access_log: access_log.clone(),
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    let host = settings.host.clone();
    let port = settings.port;
    let result = privacy_gateway::server::serve(&host, port, state, shutdown_rx).await;

    signal_task.abort();
    access_log.shutdown().await;
    registry.close().await;

    match result {
        Ok(()) => {
            info!("gateway stopped gracefully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "gateway failed to bind or serve");
            ExitCode::FAILURE
        }
    }
}

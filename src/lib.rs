//! craftynap: hibernates idle Minecraft servers managed by an external
//! controller and wakes them on demand by interposing on their ports.
//!
//! The three subsystems named in the design notes live in their own
//! modules: [`state_machine`] is the pure per-server FSM, [`interposer`]
//! (plus [`protocol`]) is the dual-stack connection responder, and
//! [`monitor`] is the coordinator that arbitrates port handoff between
//! them and the [`controller`] client.

pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod interposer;
pub mod metrics;
pub mod monitor;
pub mod protocol;
pub mod signals;
pub mod state_machine;
pub mod webhook;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::Config;
use crate::controller::ControllerClient;
use crate::http::AppState;
use crate::monitor::Monitor;
use crate::webhook::WebhookNotifier;

/// Environment variable holding the controller bearer token (§6). Never
/// read from the YAML config file itself.
pub const API_TOKEN_ENV_VAR: &str = "CRAFTY_API_TOKEN";

/// Load config, wire up the controller client, interposers, webhook
/// notifier and HTTP surface, and run until a shutdown signal arrives.
pub async fn run(config_path: impl AsRef<Path>) -> anyhow::Result<()> {
    let config_path = config_path.as_ref().to_path_buf();
    let config = Config::load(&config_path).context("loading configuration")?;

    let token = std::env::var(API_TOKEN_ENV_VAR)
        .with_context(|| format!("{API_TOKEN_ENV_VAR} must be set in the environment"))?;

    let controller = ControllerClient::new(
        &config.controller.base_url,
        token,
        config.controller.request_timeout(),
    )
    .context("building controller client")?;

    let webhook = WebhookNotifier::new(&config.webhook);
    let status: http::StatusSnapshot = Arc::new(RwLock::new(Vec::new()));
    let metrics_handle = metrics::install();

    let health_addr: std::net::SocketAddr =
        format!("0.0.0.0:{}", config.health.listen_port).parse()?;
    let app_state = AppState {
        status: status.clone(),
        metrics: metrics_handle,
    };
    let http_router = http::router(app_state);
    let http_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("binding health/status/metrics surface on {health_addr}"))?;
    info!(addr = %health_addr, "serving /health, /status, /metrics");
    let http_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, http_router).await {
            tracing::error!(error = %e, "observability HTTP surface exited");
        }
    });

    let monitor = Monitor::new(config_path, config, controller, webhook, status)
        .context("initializing monitor and interposers")?;

    info!("craftynap starting");
    monitor.run().await;
    http_task.abort();
    info!("craftynap stopped");

    Ok(())
}

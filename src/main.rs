//! # switchboard
//!
//! Bridge binary: serves the conversational webhook and the web client's
//! streaming endpoint, and runs operator tasks through an external engine.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use switchboard_core::task::TaskEngine;
use switchboard_server::{CommandEngine, HttpConversationAdapter, ServerConfig};
use switchboard_telemetry::TelemetryConfig;

/// Identity-correlated bridge between a chat channel and web clients.
#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Identity-correlated event bridge")]
struct Cli {
    /// Host to bind.
    #[arg(long, env = "SWITCHBOARD_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "SWITCHBOARD_PORT", default_value = "3978")]
    port: u16,

    /// Bot application id used when continuing conversations.
    #[arg(long, env = "BOT_APP_ID", default_value = "")]
    app_id: String,

    /// Task engine command line; the goal is appended as the last argument.
    #[arg(long, env = "SWITCHBOARD_ENGINE")]
    engine: String,

    /// Outbound queue length per streaming connection.
    #[arg(long, env = "SWITCHBOARD_MAX_SEND_QUEUE", default_value = "256")]
    max_send_queue: usize,

    /// Seconds between dead-connection sweeps.
    #[arg(long, env = "SWITCHBOARD_CLEANUP_SECS", default_value = "60")]
    cleanup_secs: u64,

    /// Default log level. RUST_LOG takes precedence.
    #[arg(long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// Emit JSON log lines.
    #[arg(long, env = "SWITCHBOARD_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_send_queue: self.max_send_queue,
            app_id: self.app_id.clone(),
            cleanup_interval: Duration::from_secs(self.cleanup_secs.max(1)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _telemetry = switchboard_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.log_json,
        ..Default::default()
    })
    .context("Failed to initialize logging")?;

    let engine = CommandEngine::from_command_line(&cli.engine)
        .context("SWITCHBOARD_ENGINE must name a program")?;
    tracing::info!(engine = engine.program(), "Task engine configured");
    let engine: Arc<dyn TaskEngine> = Arc::new(engine);

    let handle = switchboard_server::start(
        cli.server_config(),
        Arc::new(HttpConversationAdapter::new()),
        engine,
    )
    .await
    .with_context(|| format!("Failed to bind {}:{}", cli.host, cli.port))?;

    tracing::info!(port = handle.port, "Switchboard ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

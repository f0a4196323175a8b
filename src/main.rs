//! MQTT Device Bridge CLI
//!
//! Runs the device broker and the WebSocket session endpoint in one process.

use anyhow::{Context, Result};
use clap::Parser;
use mqtt_device_bridge::auth::JwtVerifier;
use mqtt_device_bridge::directory::{MemoryDeviceDirectory, StaticPolicy};
use mqtt_device_bridge::session::SessionOptions;
use mqtt_device_bridge::{router, AppState, BridgeConfig, DeviceBroker, SessionHub};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// MQTT device broker bridged to WebSocket sessions
#[derive(Parser, Debug)]
#[command(name = "device-bridge")]
#[command(version)]
#[command(about = "MQTT device broker bridged to authenticated WebSocket sessions")]
#[command(long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT listen address
    #[arg(long, env = "MQTT_LISTEN_ADDR")]
    mqtt_addr: Option<String>,

    /// Username every device presents on CONNECT
    #[arg(long, env = "MQTT_DEVICE_USERNAME")]
    device_username: Option<String>,

    /// Create unknown devices on register publishes
    #[arg(long, env = "FACTORY_ALLOW_REGISTRATION")]
    allow_registration: Option<bool>,

    /// Project assigned to self-registered devices
    #[arg(long, env = "FACTORY_PROJECT_ID")]
    project_id: Option<String>,

    /// HTTP listen address for WebSocket sessions
    #[arg(long, env = "SERVER_ADDR")]
    http_addr: Option<String>,

    /// Concurrent sessions allowed per user
    #[arg(long, env = "WS_MAX_CONN_PER_USER")]
    max_conn_per_user: Option<usize>,

    /// HS256 secret for session tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(ref addr) = self.mqtt_addr {
            config.broker.listen_addr = addr.clone();
        }
        if let Some(ref username) = self.device_username {
            config.broker.device_username = username.clone();
        }
        if let Some(allow) = self.allow_registration {
            config.broker.allow_registration = allow;
        }
        if let Some(ref project) = self.project_id {
            config.broker.default_project_id = Some(project.clone());
        }
        if let Some(ref addr) = self.http_addr {
            config.websocket.listen_addr = addr.clone();
        }
        if let Some(max) = self.max_conn_per_user {
            config.websocket.max_conn_per_user = max;
        }
        if let Some(ref secret) = self.jwt_secret {
            config.identity.jwt_secret = Some(secret.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting MQTT device bridge");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        info!(path = %config_path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        serde_json::from_str(&content).context("invalid configuration")?
    } else {
        BridgeConfig::default()
    };
    args.apply(&mut config);

    let directory = Arc::new(MemoryDeviceDirectory::new());
    let broker = Arc::new(
        DeviceBroker::new(config.broker.clone(), directory.clone())
            .with_packet_logging(config.general.log_packets),
    );

    let shutdown = CancellationToken::new();
    let listener = broker.bind().await?;
    let mut broker_task = tokio::spawn(broker.clone().serve(listener, shutdown.clone()));

    let hub = Arc::new(SessionHub::new(config.websocket.max_conn_per_user));
    let mut http_task = None;

    if config.websocket.enabled {
        let verifier = JwtVerifier::from_config(&config.identity)
            .context("session endpoint needs identity.jwt-secret or identity.jwt-public-key-pem")?;

        tokio::spawn(hub.clone().run_reaper(
            config.websocket.reap_interval(),
            config.websocket.max_idle(),
            shutdown.clone(),
        ));

        let state = AppState {
            hub: hub.clone(),
            bus: broker.clone(),
            directory,
            policy: Arc::new(StaticPolicy::new(config.policy.grants.clone())),
            verifier: Arc::new(verifier),
            options: SessionOptions::from(&config),
        };
        let app = router(state, &config.websocket.path);

        let listener = tokio::net::TcpListener::bind(&config.websocket.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.websocket.listen_addr))?;
        info!(
            addr = %config.websocket.listen_addr,
            path = %config.websocket.path,
            "WebSocket endpoint listening"
        );

        let cancel = shutdown.clone();
        http_task = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
        }));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
        result = &mut broker_task => {
            error!("MQTT broker stopped unexpectedly");
            shutdown.cancel();
            hub.shutdown();
            result.context("broker task panicked")??;
            return Ok(());
        }
    }

    shutdown.cancel();
    hub.shutdown();
    broker.stop();

    if let Some(task) = http_task {
        task.await.context("HTTP task panicked")?.context("HTTP server failed")?;
    }
    broker_task.await.context("broker task panicked")??;

    info!("MQTT device bridge stopped");
    Ok(())
}

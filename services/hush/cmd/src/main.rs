//! Console client for a hush noise-monitoring device.
//!
//! Connects to the device over WebSocket, mirrors its telemetry, forwards
//! threshold and filter changes, and surfaces device alerts.

use anyhow::Context;
use clap::Parser;
use hush_session::{Endpoint, SessionController};
use hush_storage::open_store;
use std::path::PathBuf;
use tracing::info;

mod config;
mod console;
mod logging;

use config::{parse_timeout, ClientConfig, PreferencesMode};
use console::{Console, OutputFormat};

/// Console client for a hush noise-monitoring device
#[derive(Parser, Debug)]
#[command(name = "hush", version, about = "Console client for a hush noise-monitoring device")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "hush.yaml")]
    config: PathBuf,

    /// Device address, e.g. 192.168.1.50:8765 or ws://192.168.1.50:8765
    #[arg(long)]
    endpoint: Option<String>,

    /// Operator name used by `connect` and `--connect`
    #[arg(long)]
    name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Preference storage: memory, file, redis
    #[arg(long)]
    preferences: Option<String>,

    /// Preferences file for the file backend
    #[arg(long)]
    preferences_path: Option<PathBuf>,

    /// Redis URL for the redis backend
    #[arg(long)]
    redis_url: Option<String>,

    /// Give up on a connect attempt after this long, e.g. 5s ("off" to disable)
    #[arg(long)]
    connect_timeout: Option<String>,

    /// Output format for state and alerts
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Connect right after startup
    #[arg(long)]
    connect: bool,
}

impl Args {
    fn apply_to(&self, config: &mut ClientConfig) -> anyhow::Result<()> {
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(name) = &self.name {
            config.user_name = Some(name.clone());
        }
        if let Some(mode) = &self.preferences {
            config.preferences.mode = mode.parse::<PreferencesMode>()?;
        }
        if let Some(path) = &self.preferences_path {
            config.preferences.path = path.clone();
        }
        if let Some(url) = &self.redis_url {
            config.preferences.redis_url = url.clone();
        }
        if let Some(timeout) = &self.connect_timeout {
            config.connect_timeout = parse_timeout(timeout)?;
        }
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    info!("Starting hush v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load_from_file(&args.config);
    args.apply_to(&mut config)?;

    let endpoint = Endpoint::parse(&config.endpoint)
        .with_context(|| format!("invalid endpoint '{}'", config.endpoint))?;
    info!("Device endpoint: {}", endpoint);

    let store = open_store(config.storage_mode())
        .await
        .context("failed to open preference store")?;

    let (handle, interrupts, controller) =
        SessionController::spawn(store, &config.session_config());

    if args.connect {
        let name = match config.user_name.clone() {
            Some(name) => name,
            None => {
                handle
                    .current_snapshot()
                    .await
                    .context("session controller stopped")?
                    .user_name
            }
        };
        if let Err(e) = handle.request_connect(endpoint.to_string(), name).await {
            component_warn!("startup", "Initial connect rejected: {}", e);
        }
    }

    let console = Console::new(
        handle.clone(),
        endpoint.to_string(),
        config.user_name.clone(),
        args.output,
    );
    let result = console::run(console, interrupts).await;

    handle.shutdown();
    if let Err(e) = controller.await {
        component_error!("startup", "Session controller task failed: {}", e);
    }
    info!("hush stopped");
    result
}

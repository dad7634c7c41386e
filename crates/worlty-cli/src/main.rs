//! Worlty gateway CLI
//!
//! Talks to one gateway over its local TCP protocol:
//! - `probe`: authenticate once and print the gateway identity
//! - `run`: keep a self-healing session open and log device discovery
//! - `set`: send one device write and exit
//! - `init`: write the merged settings to the config file

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use worlty_core::config::{Config, Directories};
use worlty_core::{GatewayIdentity, JsonFileStore, Platform, Session, SessionHandle};
use worlty_rpc::probe;

/// Worlty gateway client
#[derive(Parser)]
#[command(name = "worlty")]
#[command(about = "Worlty gateway client - local device sync over TCP")]
#[command(version)]
#[command(after_help = "\
Examples:
  worlty --host 192.168.0.20 --port 8501 --token abc probe
  worlty init --host 192.168.0.20 --port 8501 --token abc
  worlty run                               Sync devices until Ctrl-C
  worlty set --pk 5 --payload '{\"stt\": true}'

Settings come from the config file (default ~/.config/worlty/config.json),
overridden by any flags given on the command line.
")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Gateway host or IP address
    #[arg(long, global = true)]
    host: Option<String>,

    /// Gateway TCP port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Gateway access token
    #[arg(long, global = true)]
    token: Option<String>,

    /// Session state file path
    #[arg(long, global = true, value_name = "PATH")]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate once and print the gateway identity
    Probe,

    /// Keep a session open and log devices as they are discovered
    Run,

    /// Queue one write for a device and exit once it is sent
    Set {
        /// Device pk to write to
        #[arg(long)]
        pk: i64,

        /// Payload JSON object (e.g. '{"stt": true}')
        #[arg(long)]
        payload: String,
    },

    /// Save the effective gateway settings to the config file
    Init,
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to a timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("worlty={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("worlty-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        #[cfg(unix)]
        {
            let symlink_path = temp_dir.join("worlty.log");
            let _ = std::fs::remove_file(&symlink_path);
            let _ = std::os::unix::fs::symlink(&log_path, &symlink_path);
        }

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

impl Cli {
    /// Config file contents with command line overrides applied
    fn load_config(&self, dirs: &Directories) -> Result<(Config, PathBuf)> {
        let path = self.config.clone().unwrap_or_else(|| dirs.config_file.clone());
        let mut config = Config::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        if let Some(host) = &self.host {
            config.gateway.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(token) = &self.token {
            config.gateway.access_token.clone_from(token);
        }
        Ok((config, path))
    }
}

fn parse_payload(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("Payload is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("Payload must be a JSON object, got: {other}"),
    }
}

async fn start_session(config: &Config, state_path: &Path) -> Result<Session> {
    config.gateway.validate()?;
    let store = JsonFileStore::open(state_path)
        .with_context(|| format!("Failed to open state file {}", state_path.display()))?;

    info!(
        "Connecting to {}:{}",
        config.gateway.host, config.gateway.port
    );
    let session = Session::setup(&config.gateway, config.session.clone(), Box::new(store))
        .await
        .context("Gateway setup failed")?;
    Ok(session)
}

fn log_discoveries(handle: &SessionHandle) -> Result<()> {
    for platform in Platform::ALL {
        handle.register_platform_listener(platform, move |record| {
            info!(
                "Discovered {platform} {} (pk={}, fk={}) stt={}",
                record.name(),
                record.pk,
                record.fk,
                record.stt
            );
        })?;
    }
    Ok(())
}

/// Log availability changes until the session stops
async fn watch_availability(mut status: watch::Receiver<GatewayIdentity>) {
    while status.changed().await.is_ok() {
        let identity = status.borrow_and_update().clone();
        if identity.available {
            info!("{identity} is available");
        } else {
            warn!("{identity} is unavailable");
        }
    }
}

async fn run(config: &Config, state_path: &Path) -> Result<()> {
    let session = start_session(config, state_path).await?;
    let handle = session.handle();
    log_discoveries(&handle)?;
    tokio::spawn(watch_availability(handle.status()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Disconnecting");
    session.disconnect().await;
    Ok(())
}

async fn set(config: &Config, state_path: &Path, pk: i64, payload: &str) -> Result<()> {
    let payload = parse_payload(payload)?;
    let session = start_session(config, state_path).await?;
    let handle = session.handle();

    handle.enqueue_command(pk, payload)?;
    // Give the debounce window time to close before tearing down
    tokio::time::sleep(config.session.debounce() + Duration::from_millis(200)).await;
    session.disconnect().await;
    println!("Sent write to pk {pk}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging();

    let dirs = Directories::new();
    let (config, config_path) = cli.load_config(&dirs)?;
    let state_path = cli.state.clone().unwrap_or_else(|| dirs.state_file.clone());

    match cli.command {
        Commands::Probe => {
            config.gateway.validate()?;
            let gateway = &config.gateway;
            match probe(
                &gateway.host,
                gateway.port,
                &gateway.access_token,
                config.session.auth_options(),
            )
            .await
            {
                Ok(identity) => {
                    println!("{identity}");
                    println!("Manufacturer: {}", identity.manufacturer());
                }
                Err(e) => bail!("Probe failed ({}): {e}", e.reason()),
            }
        }
        Commands::Run => run(&config, &state_path).await?,
        Commands::Set { pk, ref payload } => set(&config, &state_path, pk, payload).await?,
        Commands::Init => {
            dirs.ensure_exists()?;
            config.save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
    }

    Ok(())
}

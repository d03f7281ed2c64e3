//! mqtt-notify - forward MQTT messages as JSON notifications
//!
//! Usage:
//!   mqtt-notify [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   --disabled             Start without connecting to any broker
//!   -h, --help             Print help
//!
//! Notifications are written to stdout, one JSON object per line. Logs go
//! to stderr. On Unix, SIGHUP reloads the configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mqtt_notify::config::Config;
use mqtt_notify::{Bridge, ChannelSink};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// mqtt-notify - MQTT to notification bridge
#[derive(Parser, Debug)]
#[command(name = "mqtt-notify")]
#[command(version)]
#[command(about = "Forward messages from MQTT brokers as notifications")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Start with the bridge disabled
    #[arg(long)]
    disabled: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let file_config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // CLI overrides config
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    // stdout carries notifications, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let (sink, mut notifications) = ChannelSink::channel();
    let bridge = Arc::new(Bridge::new(Arc::new(sink), file_config.bridge).await?);

    if args.disabled {
        info!("Starting with bridge disabled");
    } else if let Err(e) = bridge.enable().await {
        // Brokers before the failing one stay connected; a reload can repair it
        error!("{}", e);
    }

    #[cfg(unix)]
    spawn_reload_handler(bridge.clone(), args.config.clone());

    loop {
        tokio::select! {
            Some(message) = notifications.recv() => {
                match serde_json::to_string(&message) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize notification: {}", e),
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Taken from the config in force now, which a reload may have replaced
    let shutdown_grace = bridge.disconnect_grace().await;
    bridge.disable().await;
    // Let the session tasks send DISCONNECT
    tokio::time::sleep(shutdown_grace).await;

    Ok(())
}

/// Reload the configuration file on SIGHUP
#[cfg(unix)]
fn spawn_reload_handler(bridge: Arc<Bridge>, config_path: Option<PathBuf>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Failed to install SIGHUP handler: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            let Some(path) = config_path.as_ref() else {
                info!("SIGHUP received without a configuration file, ignoring");
                continue;
            };

            info!("Reloading configuration from {:?}", path);
            let config = match Config::load(path) {
                Ok(config) => config,
                Err(e) => {
                    error!("Configuration rejected, keeping current brokers: {}", e);
                    continue;
                }
            };

            if let Err(e) = bridge.apply_config(config.bridge).await {
                error!("{}", e);
            }
        }
    });
}

//! RelayMQ - clustered MQTT v3.1/v3.1.1 broker
//!
//! Usage:
//!   relaymq [OPTIONS]
//!   relaymq relay --bind <ADDR>
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -b, --bind <ADDR>        Bind address (default: 0.0.0.0:1883)
//!   -m, --mode <MODE>        Deploy mode: local or cluster
//!   -t, --transport <ADDR>   Relay hub address (cluster mode)
//!   --broker-id <ID>         Broker identifier (default: hostname:port)
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use relaymq::broker::Broker;
use relaymq::config::{Config, DeployMode};
use relaymq::events::relay::RelayHub;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
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
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// Deploy mode for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Local,
    Cluster,
}

impl From<Mode> for DeployMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Local => DeployMode::Local,
            Mode::Cluster => DeployMode::Cluster,
        }
    }
}

/// RelayMQ - clustered MQTT broker
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(author = "RelayMQ Contributors")]
#[command(version)]
#[command(about = "Clustered MQTT v3.1/v3.1.1 broker")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Deploy mode
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Relay hub address used in cluster mode
    #[arg(short, long)]
    transport: Option<String>,

    /// Broker identifier
    #[arg(long)]
    broker_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cluster relay hub
    Relay {
        /// Hub bind address
        #[arg(short, long, default_value = "0.0.0.0:7883")]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus environment
    let mut config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    }
    .map_err(|e| {
        eprintln!("Error loading configuration: {}", e);
        e
    })?;

    // CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
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

    if let Some(Command::Relay { bind }) = args.command {
        let hub = RelayHub::bind(bind).await?;
        hub.run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
        return Ok(());
    }

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(mode) = args.mode {
        config.cluster.mode = mode.into();
    }
    if let Some(transport) = args.transport {
        config.cluster.transport_addr = transport;
    }
    if let Some(broker_id) = args.broker_id {
        config.cluster.broker_id = Some(broker_id);
    }
    config.validate()?;

    info!("Starting RelayMQ MQTT Broker");
    info!("  Bind address: {}", config.server.bind);
    info!("  Deploy mode: {:?}", config.cluster.mode);
    if config.cluster.mode == DeployMode::Cluster {
        info!("  Relay hub: {}", config.cluster.transport_addr);
    }
    info!("  Storage: {:?}", config.storage.backend);
    if !config.mqtt.mount_point.is_empty() {
        info!("  Mount point: {}", config.mqtt.mount_point);
    }
    if config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if config.acl.enabled {
        info!("  ACL: enabled ({} roles configured)", config.acl.roles.len());
    } else {
        info!("  ACL: disabled");
    }

    let broker = std::sync::Arc::new(Broker::from_config(config).await.map_err(|e| {
        error!("Failed to start broker: {}", e);
        e
    })?);

    let signal = {
        let broker = broker.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
                broker.shutdown();
            }
        })
    };

    let result = broker.run().await;
    signal.abort();
    result?;
    Ok(())
}

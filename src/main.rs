//! LumenMQ broker binary.
//!
//! Flags override the TOML configuration; both are optional.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lumenmq::auth::PasswordAuthProvider;
use lumenmq::broker::Broker;
use lumenmq::config::Config;
use lumenmq::hooks::CompositeHooks;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
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
}

/// MQTT v3.1.1 / v5.0 broker
#[derive(Parser, Debug)]
#[command(name = "lumenmq", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind host
    #[arg(short = 'H', long = "host")]
    host: Option<IpAddr>,

    /// Bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// PEM key store (certificate chain + private key) enabling the TLS
    /// listener on port 8883
    #[arg(long)]
    key_store: Option<PathBuf>,

    /// Key store password
    #[arg(long)]
    key_store_psw: Option<String>,

    /// Log level
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let log_level = args.log_level.map(LogLevel::to_tracing_level).unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("loaded configuration from {}", path.display());
    }

    let mut broker_config = file_config.to_broker_config();
    if let Some(host) = args.host {
        broker_config.bind_addr.set_ip(host);
    }
    if let Some(port) = args.port {
        broker_config.bind_addr.set_port(port);
    }
    if let Some(max) = args.max_connections {
        broker_config.max_connections = max;
    }
    if let Some(key_store) = args.key_store {
        broker_config.key_store = Some(key_store);
        if broker_config.tls_bind_addr.is_none() {
            broker_config.tls_bind_addr =
                Some(SocketAddr::new(broker_config.bind_addr.ip(), 8883));
        }
    }
    if let Some(psw) = args.key_store_psw {
        broker_config.key_store_password = Some(psw);
    }

    info!("starting lumenmq");
    info!("  bind: {}", broker_config.bind_addr);
    if let Some(tls) = broker_config.tls_bind_addr {
        info!("  tls bind: {}", tls);
    }
    info!("  max connections: {}", broker_config.max_connections);
    info!("  max packet size: {} bytes", broker_config.max_packet_size);
    info!("  max QoS: {:?}", broker_config.max_qos);
    if file_config.auth.enabled {
        info!("  auth: enabled ({} users)", file_config.auth.users.len());
    } else {
        info!("  auth: disabled");
    }

    let hooks = Arc::new(
        CompositeHooks::new().with(PasswordAuthProvider::new(&file_config.auth)),
    );
    let broker = Broker::with_hooks(broker_config, hooks);

    broker.run().await?;
    Ok(())
}

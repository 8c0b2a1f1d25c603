//! TOML configuration.
//!
//! Sections: `[log]`, `[server]`, `[limits]`, `[session]`, `[mqtt]`,
//! `[auth]`, `[redirect]`. Values can be overridden through `LUMENMQ_*`
//! environment variables (`LUMENMQ_SERVER__BIND=...`), and the file itself
//! supports `${VAR}` / `${VAR:-default}` substitution.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, Redirect};
use crate::protocol::{QoS, ReasonCode};

#[cfg(test)]
mod tests;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(config::ConfigError),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Parse(e)
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` in the raw file contents.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern");
    re.replace_all(content, |caps: &regex::Captures| {
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub auth: AuthConfig,
    pub redirect: Option<RedirectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// TLS listener address; requires `key_store`
    pub tls_bind: Option<SocketAddr>,
    /// PEM bundle with certificate chain and private key
    pub key_store: Option<PathBuf>,
    pub key_store_password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1883)),
            tls_bind: None,
            key_store: None,
            key_store_password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_packet_size: usize,
    /// Per-connection outbound packet queue depth
    pub outbound_queue_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            outbound_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cap on the client-requested session expiry, seconds
    pub max_session_expiry: u32,
    /// Keep-alive the server imposes when below the client's request
    pub server_keep_alive: Option<u16>,
    /// Seconds a connection may sit without completing CONNECT
    pub connect_timeout: u64,
    /// Housekeeper tick, seconds
    pub housekeeper_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_expiry: u32::MAX,
            server_keep_alive: None,
            connect_timeout: 30,
            housekeeper_interval: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub receive_maximum: u16,
    /// 0, 1 or 2
    pub max_qos: u8,
    pub retain_available: bool,
    pub wildcard_subscriptions: bool,
    pub subscription_identifiers: bool,
    pub shared_subscriptions: bool,
    pub max_topic_alias: u16,
    /// Returned to clients that request response information
    pub response_information: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            receive_maximum: 65_535,
            max_qos: 2,
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            shared_subscriptions: true,
            max_topic_alias: 65_535,
            response_information: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub allow_anonymous: bool,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

/// Where clients are pointed at shutdown instead of "server shutting down".
#[derive(Debug, Clone, Deserialize)]
pub struct RedirectConfig {
    pub server_reference: String,
    /// true -> "server moved" (0x9D), false -> "use another server" (0x9C)
    #[serde(default)]
    pub permanent: bool,
}

impl Config {
    /// Load from a TOML file with env substitution, then apply `LUMENMQ_*`
    /// overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let settings = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .add_source(Environment::with_prefix("LUMENMQ").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(format!(
                "mqtt.max_qos must be 0, 1 or 2, got {}",
                self.mqtt.max_qos
            )));
        }
        if self.mqtt.receive_maximum == 0 {
            return Err(ConfigError::Validation(
                "mqtt.receive_maximum cannot be 0".to_string(),
            ));
        }
        if self.server.tls_bind.is_some() && self.server.key_store.is_none() {
            return Err(ConfigError::Validation(
                "server.tls_bind requires server.key_store".to_string(),
            ));
        }
        Ok(())
    }

    /// Lower to the broker's runtime configuration.
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            tls_bind_addr: self.server.tls_bind,
            key_store: self.server.key_store.clone(),
            key_store_password: self.server.key_store_password.clone(),
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            server_keep_alive: self.session.server_keep_alive,
            max_session_expiry: self.session.max_session_expiry,
            receive_maximum: self.mqtt.receive_maximum,
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
            wildcard_subscription_available: self.mqtt.wildcard_subscriptions,
            subscription_identifiers_available: self.mqtt.subscription_identifiers,
            shared_subscriptions_available: self.mqtt.shared_subscriptions,
            max_topic_alias: self.mqtt.max_topic_alias,
            response_information: self.mqtt.response_information.clone(),
            redirect: self.redirect.as_ref().map(|r| Redirect {
                reason_code: if r.permanent {
                    ReasonCode::ServerMoved
                } else {
                    ReasonCode::UseAnotherServer
                },
                server_reference: r.server_reference.clone(),
            }),
            connect_timeout: Duration::from_secs(self.session.connect_timeout),
            housekeeper_interval: Duration::from_secs(self.session.housekeeper_interval),
            outbound_queue_capacity: self.limits.outbound_queue_capacity,
        }
    }
}

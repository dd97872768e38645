//! Configuration Module
//!
//! Provides TOML-based configuration for RelayMQ with support for:
//! - Server settings (bind address, timeouts)
//! - MQTT protocol options (size limits, client id rules, mount point)
//! - Session queues and delivery retry
//! - Deploy mode and cluster transport
//! - Storage backend selection
//! - Authentication and ACL
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// MQTT protocol configuration
    pub mqtt: MqttConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Deploy mode and cluster transport
    pub cluster: ClusterConfig,
    /// Session store backend
    pub storage: StorageConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// ACL configuration
    pub acl: AclConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// How long shutdown waits for sessions to finish
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// How long a new socket may take to send CONNECT
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 1883))
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            shutdown_timeout: default_shutdown_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// MQTT protocol configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum PUBLISH payload in bytes (0 = unlimited)
    #[serde(default = "default_message_size_limit")]
    pub message_size_limit: usize,
    /// Maximum remaining length of any packet in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Accept an empty client id (v3.1.1 only) and assign one
    #[serde(default = "default_true")]
    pub allow_zero_length_client_id: bool,
    /// Replace the client id with the username when one is given
    pub user_name_as_client_id: bool,
    /// Deliver at the subscription QoS instead of min(publish, subscription)
    pub upgrade_outgoing_qos: bool,
    /// Prefix applied to every client topic and filter
    pub mount_point: String,
}

fn default_message_size_limit() -> usize {
    256 * 1024
}
fn default_max_packet_size() -> usize {
    1024 * 1024
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            message_size_limit: default_message_size_limit(),
            max_packet_size: default_max_packet_size(),
            allow_zero_length_client_id: true,
            user_name_as_client_id: false,
            upgrade_outgoing_qos: false,
            mount_point: String::new(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of the outbound packet channel of each connection
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Capacity of the in-memory message queue of each clean session
    #[serde(default = "default_msg_queue_size")]
    pub msg_queue_size: usize,
    /// Age after which an unacknowledged QoS 1 delivery is re-sent
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Period of the send worker's bookkeeping tick
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Keep alive in seconds applied when a client asks for 0 (0 = none)
    pub default_keep_alive: u16,
}

fn default_queue_size() -> usize {
    64
}
fn default_msg_queue_size() -> usize {
    1000
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(20)
}
fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            msg_queue_size: default_msg_queue_size(),
            retry_interval: default_retry_interval(),
            tick_interval: default_tick_interval(),
            default_keep_alive: 0,
        }
    }
}

/// Where events travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// In-process only
    #[default]
    Local,
    /// Mirrored through the cluster transport
    Cluster,
}

/// Cluster configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Deploy mode, fixed at startup
    pub mode: DeployMode,
    /// Broker identifier (hostname plus bind port if not set)
    pub broker_id: Option<String>,
    /// Address of the relay hub
    #[serde(default = "default_transport_addr")]
    pub transport_addr: String,
    /// Channel carrying events selected by `mqtt_event_mask`
    #[serde(default = "default_mqtt_channel")]
    pub mqtt_channel: String,
    /// Channel carrying every other event
    #[serde(default = "default_broker_channel")]
    pub broker_channel: String,
    /// Event type bits routed to the mqtt channel
    #[serde(default = "default_mqtt_event_mask")]
    pub mqtt_event_mask: u32,
    /// Capacity of the outgoing mirror queue; overflow is dropped
    #[serde(default = "default_mirror_queue_size")]
    pub mirror_queue_size: usize,
}

fn default_transport_addr() -> String {
    "127.0.0.1:7883".to_string()
}
fn default_mqtt_channel() -> String {
    "relaymq.mqtt".to_string()
}
fn default_broker_channel() -> String {
    "relaymq.broker".to_string()
}
fn default_mqtt_event_mask() -> u32 {
    0x00FF
}
fn default_mirror_queue_size() -> usize {
    4096
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: DeployMode::Local,
            broker_id: None,
            transport_addr: default_transport_addr(),
            mqtt_channel: default_mqtt_channel(),
            broker_channel: default_broker_channel(),
            mqtt_event_mask: default_mqtt_event_mask(),
            mirror_queue_size: default_mirror_queue_size(),
        }
    }
}

/// Session store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Memory,
    Fjall,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    /// Data directory for disk-backed stores
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Memory,
            path: default_storage_path(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether credentials are checked
    pub enabled: bool,
    /// Accept clients that send no username
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username
    pub username: String,
    /// Password (plaintext)
    pub password: String,
    /// Role name for ACL permissions
    #[serde(default)]
    pub role: Option<String>,
}

/// ACL configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    /// Whether ACL is enabled
    pub enabled: bool,
    /// ACL roles
    pub roles: Vec<AclRole>,
    /// Default permissions for users without explicit role (including anonymous)
    pub default: AclPermissions,
}

/// ACL role
#[derive(Debug, Clone, Deserialize)]
pub struct AclRole {
    /// Role name
    pub name: String,
    /// Topic patterns this role can publish to
    #[serde(default)]
    pub publish: Vec<String>,
    /// Topic patterns this role can subscribe to
    #[serde(default)]
    pub subscribe: Vec<String>,
}

/// ACL permissions
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclPermissions {
    /// Topic patterns that can be published to
    pub publish: Vec<String>,
    /// Topic patterns that can be subscribed to
    pub subscribe: Vec<String>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `RELAYMQ__CLUSTER__MODE=cluster` overrides `cluster.mode`
    ///    - `RELAYMQ__AUTH__ENABLED=true` overrides `auth.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "warn")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.shutdown_timeout", "5s")?
            .set_default("server.connect_timeout", "10s")?
            .set_default("mqtt.message_size_limit", 256 * 1024)?
            .set_default("mqtt.max_packet_size", 1024 * 1024)?
            .set_default("mqtt.allow_zero_length_client_id", true)?
            .set_default("mqtt.user_name_as_client_id", false)?
            .set_default("mqtt.upgrade_outgoing_qos", false)?
            .set_default("mqtt.mount_point", "")?
            .set_default("session.queue_size", 64)?
            .set_default("session.msg_queue_size", 1000)?
            .set_default("session.retry_interval", "20s")?
            .set_default("session.tick_interval", "1s")?
            .set_default("session.default_keep_alive", 0)?
            .set_default("cluster.mode", "local")?
            .set_default("storage.backend", "memory")?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("acl.enabled", false)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "mqtt.max_packet_size must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.message_size_limit > self.mqtt.max_packet_size {
            return Err(ConfigError::Validation(
                "mqtt.message_size_limit cannot exceed mqtt.max_packet_size".to_string(),
            ));
        }
        if self.mqtt.mount_point.contains(['+', '#']) {
            return Err(ConfigError::Validation(
                "mqtt.mount_point cannot contain wildcards".to_string(),
            ));
        }
        if self.session.queue_size == 0 || self.session.msg_queue_size == 0 {
            return Err(ConfigError::Validation(
                "session queue sizes must be greater than 0".to_string(),
            ));
        }
        if self.session.tick_interval.is_zero() {
            return Err(ConfigError::Validation(
                "session.tick_interval must be greater than 0".to_string(),
            ));
        }
        if self.cluster.mode == DeployMode::Cluster {
            if self.cluster.mqtt_channel == self.cluster.broker_channel {
                return Err(ConfigError::Validation(
                    "cluster.mqtt_channel and cluster.broker_channel must differ".to_string(),
                ));
            }
            if self.cluster.mirror_queue_size == 0 {
                return Err(ConfigError::Validation(
                    "cluster.mirror_queue_size must be greater than 0".to_string(),
                ));
            }
        }

        // Validate user password configuration
        if self.auth.enabled {
            for user in &self.auth.users {
                if user.password.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has empty password",
                        user.username
                    )));
                }
            }
        }

        // Validate ACL role references
        if self.auth.enabled && self.acl.enabled {
            let role_names: HashSet<_> = self.acl.roles.iter().map(|r| &r.name).collect();

            for user in &self.auth.users {
                if let Some(ref role) = user.role {
                    if !role_names.contains(role) {
                        return Err(ConfigError::Validation(format!(
                            "User '{}' references unknown role '{}'",
                            user.username, role
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

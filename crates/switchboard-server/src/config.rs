//! Gateway configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchboard_core::{SbError, SbResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret for bearer tokens.
    #[serde(default)]
    pub secret: Option<String>,
}

/// What to do when the shared store cannot answer the admission quota check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaFailurePolicy {
    /// Refuse the connection with `connectionError{code:"QUOTA_UNAVAILABLE"}`.
    #[default]
    Reject,
    /// Admit the connection without counting it.
    Admit,
}

/// `[presence]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSection {
    #[serde(default = "default_max_connections")]
    pub max_connections_per_identity: u32,
    #[serde(default = "default_quota_ttl")]
    pub quota_ttl_secs: u64,
    #[serde(default)]
    pub quota_store_failure: QuotaFailurePolicy,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            max_connections_per_identity: default_max_connections(),
            quota_ttl_secs: default_quota_ttl(),
            quota_store_failure: QuotaFailurePolicy::default(),
        }
    }
}

/// `[heartbeat]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_connection_timeout")]
    pub timeout_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_connection_timeout(),
        }
    }
}

/// `[reconnect]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_delay_min")]
    pub delay_min_ms: u64,
    #[serde(default = "default_delay_max")]
    pub delay_max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            delay_min_ms: default_delay_min(),
            delay_max_ms: default_delay_max(),
            max_attempts: default_max_attempts(),
            state_ttl_secs: default_state_ttl(),
        }
    }
}

/// `[queue]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_queue_ttl")]
    pub ttl_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_queue_ttl(),
        }
    }
}

/// `[store]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// Redis URL; without one the gateway keeps shared state in-process.
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_max_connections() -> u32 {
    3
}
fn default_quota_ttl() -> u64 {
    86_400
}
fn default_heartbeat_interval() -> u64 {
    25_000
}
fn default_connection_timeout() -> u64 {
    60_000
}
fn default_delay_min() -> u64 {
    1_000
}
fn default_delay_max() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_state_ttl() -> u64 {
    3_600
}
fn default_queue_ttl() -> u64 {
    7 * 86_400
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub secret: Option<String>,
    pub redis_url: Option<String>,
    pub max_connections: Option<u32>,
    pub heartbeat_interval_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
}

/// Resolved gateway configuration (defaults, file and CLI merged and validated).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    /// HMAC secret; `None` means a random one is generated at startup.
    pub secret: Option<Vec<u8>>,
    pub max_connections_per_identity: u32,
    pub quota_ttl: Duration,
    pub quota_store_failure: QuotaFailurePolicy,
    pub heartbeat_interval: Duration,
    pub connection_timeout: Duration,
    pub reconnect_delay_min_ms: u64,
    pub reconnect_delay_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_state_ttl: Duration,
    pub queue_ttl: Duration,
    pub redis_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            secret: None,
            max_connections_per_identity: default_max_connections(),
            quota_ttl: Duration::from_secs(default_quota_ttl()),
            quota_store_failure: QuotaFailurePolicy::default(),
            heartbeat_interval: Duration::from_millis(default_heartbeat_interval()),
            connection_timeout: Duration::from_millis(default_connection_timeout()),
            reconnect_delay_min_ms: default_delay_min(),
            reconnect_delay_max_ms: default_delay_max(),
            max_reconnect_attempts: default_max_attempts(),
            reconnect_state_ttl: Duration::from_secs(default_state_ttl()),
            queue_ttl: Duration::from_secs(default_queue_ttl()),
            redis_url: None,
        }
    }
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> SbResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| SbError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(file_config, cli)
    }

    /// Merge a parsed config file with CLI overrides and validate the result.
    pub fn from_file(file: ConfigFile, cli: CliOverrides) -> SbResult<Self> {
        let secret_hex = cli.secret.or(file.auth.secret);
        let secret = match secret_hex {
            Some(hex_str) => Some(
                hex::decode(hex_str.trim())
                    .map_err(|e| SbError::Config(format!("auth.secret is not hex: {e}")))?,
            ),
            None => None,
        };

        let config = Self {
            bind: cli.bind.unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            secret,
            max_connections_per_identity: cli
                .max_connections
                .unwrap_or(file.presence.max_connections_per_identity),
            quota_ttl: Duration::from_secs(file.presence.quota_ttl_secs),
            quota_store_failure: file.presence.quota_store_failure,
            heartbeat_interval: Duration::from_millis(
                cli.heartbeat_interval_ms
                    .unwrap_or(file.heartbeat.interval_ms),
            ),
            connection_timeout: Duration::from_millis(
                cli.connection_timeout_ms
                    .unwrap_or(file.heartbeat.timeout_ms),
            ),
            reconnect_delay_min_ms: file.reconnect.delay_min_ms,
            reconnect_delay_max_ms: file.reconnect.delay_max_ms,
            max_reconnect_attempts: file.reconnect.max_attempts,
            reconnect_state_ttl: Duration::from_secs(file.reconnect.state_ttl_secs),
            queue_ttl: Duration::from_secs(file.queue.ttl_secs),
            redis_url: cli.redis_url.or(file.store.redis_url),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SbResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(SbError::Config("heartbeat.interval_ms must be > 0".into()));
        }
        if self.connection_timeout <= self.heartbeat_interval {
            return Err(SbError::Config(format!(
                "heartbeat.timeout_ms ({}) must exceed heartbeat.interval_ms ({})",
                self.connection_timeout.as_millis(),
                self.heartbeat_interval.as_millis()
            )));
        }
        if self.max_connections_per_identity == 0 {
            return Err(SbError::Config(
                "presence.max_connections_per_identity must be > 0".into(),
            ));
        }
        if self.reconnect_delay_min_ms > self.reconnect_delay_max_ms {
            return Err(SbError::Config(
                "reconnect.delay_min_ms must not exceed reconnect.delay_max_ms".into(),
            ));
        }
        Ok(())
    }

    /// Interval of the reconciliation sweep (twice the heartbeat interval).
    pub fn reconcile_interval(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

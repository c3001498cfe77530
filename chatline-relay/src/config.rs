//! Configuration system for the Chatline relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatline-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::relay::RelaySettings;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
    heartbeat: HeartbeatFileConfig,
    store: StoreFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_payload_size: Option<usize>,
}

/// `[session]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    token_ttl_secs: Option<u64>,
    history_limit: Option<usize>,
}

/// `[heartbeat]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HeartbeatFileConfig {
    ping_interval_secs: Option<u64>,
    pong_timeout_secs: Option<u64>,
    reap_unresponsive: Option<bool>,
}

/// `[store]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    retry_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Chatline direct-messaging relay server")]
pub struct RelayCliArgs {
    /// Address to bind the relay server to.
    #[arg(short, long, env = "CHATLINE_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/chatline-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum WebSocket message size in bytes.
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Auth token lifetime in seconds.
    #[arg(long)]
    pub token_ttl_secs: Option<u64>,

    /// Close connections that miss a heartbeat pong.
    #[arg(long)]
    pub reap_unresponsive: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATLINE_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9501`).
    pub bind_addr: String,
    /// Maximum allowed WebSocket message size in bytes.
    pub max_payload_size: usize,
    /// Auth token lifetime in seconds.
    pub token_ttl_secs: u64,
    /// Messages retained per conversation.
    pub history_limit: usize,
    /// Seconds between server pings.
    pub ping_interval_secs: u64,
    /// Seconds allowed for a pong.
    pub pong_timeout_secs: u64,
    /// Close connections that miss a pong.
    pub reap_unresponsive: bool,
    /// Retries for transient store failures.
    pub retry_attempts: u32,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9501".to_string(),
            max_payload_size: 64 * 1024,
            token_ttl_secs: 3600,
            history_limit: 100,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            reap_unresponsive: false,
            retry_attempts: 2,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. The reap flag can only be switched on
    /// from the CLI, never off.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_payload_size: cli
                .max_payload_size
                .or(file.server.max_payload_size)
                .unwrap_or(defaults.max_payload_size),
            token_ttl_secs: cli
                .token_ttl_secs
                .or(file.session.token_ttl_secs)
                .unwrap_or(defaults.token_ttl_secs),
            history_limit: file
                .session
                .history_limit
                .unwrap_or(defaults.history_limit),
            ping_interval_secs: file
                .heartbeat
                .ping_interval_secs
                .unwrap_or(defaults.ping_interval_secs),
            pong_timeout_secs: file
                .heartbeat
                .pong_timeout_secs
                .unwrap_or(defaults.pong_timeout_secs),
            reap_unresponsive: cli.reap_unresponsive
                || file
                    .heartbeat
                    .reap_unresponsive
                    .unwrap_or(defaults.reap_unresponsive),
            retry_attempts: file
                .store
                .retry_attempts
                .unwrap_or(defaults.retry_attempts),
            log_level: cli.log_level.clone(),
        }
    }

    /// Runtime settings handed to [`crate::relay::RelayState`].
    #[must_use]
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            max_payload_size: self.max_payload_size,
            token_ttl: Duration::from_secs(self.token_ttl_secs),
            history_limit: self.history_limit.max(1),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs.max(1)),
            reap_unresponsive: self.reap_unresponsive,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("chatline-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

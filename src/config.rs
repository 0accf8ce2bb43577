//! Configuration management for netshaper
//!
//! Handles loading the optional YAML configuration file shared by the
//! server and client roles. Every field has a default, so running without
//! a file is the normal case under Tor.

use crate::constants::{
    ALPN_PROTOCOL, CERT_FILE_NAME, DEFAULT_BUFFER_SIZE, KEY_FILE_NAME, MAX_BUFFER_SIZE,
    TRANSPORT_NAME,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// QUIC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuicConfig {
    /// Maximum idle timeout in milliseconds
    #[serde(default = "default_quic_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Keep-alive interval in milliseconds (0 disables keep-alives)
    #[serde(default = "default_quic_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_quic_idle_timeout_ms(),
            keep_alive_interval_ms: default_quic_keep_alive_interval_ms(),
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Outbound connection and SOCKS handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// How long a full close waits for the peer to acknowledge sent data, in seconds
    #[serde(default = "default_close_linger")]
    pub close_linger: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            close_linger: default_close_linger(),
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Directory holding `cert.pem` and `key.pem` (server role)
    #[serde(default = "default_tls_cert_dir")]
    pub cert_dir: String,
    /// PEM bundle the client verifies the server certificate against.
    /// When unset the client accepts any server certificate.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: default_tls_cert_dir(),
            ca_cert_path: None,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Copy buffer size per relay direction
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path to logging theme configuration file
    #[serde(default = "default_log_theme_path")]
    pub log_theme_path: String,
    /// Whether to log to file
    #[serde(default = "default_log_to_file")]
    pub log_to_file: bool,
    /// Path to log file (used when log_to_file is true)
    #[serde(default = "default_log_file_path")]
    pub log_file_path: Option<String>,
    /// Transport method names this process serves
    #[serde(default = "default_transport_methods")]
    pub transport_methods: Vec<String>,
    /// ALPN protocols offered and accepted on QUIC connections
    #[serde(default = "default_alpn_protocols")]
    pub alpn_protocols: Vec<String>,
    /// QUIC configuration
    #[serde(default)]
    pub quic: QuicConfig,
    /// Timeout configuration
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,
    /// Relay configuration
    #[serde(default)]
    pub relay: RelayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_theme_path: default_log_theme_path(),
            log_to_file: default_log_to_file(),
            log_file_path: default_log_file_path(),
            transport_methods: default_transport_methods(),
            alpn_protocols: default_alpn_protocols(),
            quic: QuicConfig::default(),
            timeouts: TimeoutConfig::default(),
            tls: TlsConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_theme_path() -> String {
    "config/logging_theme.yml".to_string()
}

fn default_log_to_file() -> bool {
    false
}

fn default_log_file_path() -> Option<String> {
    None
}

fn default_transport_methods() -> Vec<String> {
    vec![TRANSPORT_NAME.to_string()]
}

fn default_alpn_protocols() -> Vec<String> {
    vec![ALPN_PROTOCOL.to_string()]
}

fn default_quic_idle_timeout_ms() -> u64 {
    30000
}

fn default_quic_keep_alive_interval_ms() -> u64 {
    10000
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_close_linger() -> u64 {
    5
}

fn default_tls_cert_dir() -> String {
    ".".to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Where a loaded [`Config`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// No file at the given path; built-in defaults are in use
    Defaults,
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults when
    /// the file does not exist.
    /// Callers report [`ConfigSource::Defaults`] once logging is up.
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<(Self, ConfigSource)> {
        let (config, source) = match fs::read_to_string(&path).await {
            Ok(contents) => {
                let config: Config = serde_yaml::from_str(&contents)
                    .map_err(|e| anyhow::anyhow!("Failed to parse YAML configuration: {}", e))?;
                (config, ConfigSource::File)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Config::default(), ConfigSource::Defaults),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read configuration file '{}': {}",
                    path.as_ref().display(),
                    e
                ))
            }
        };
        config.validate()?;
        Ok((config, source))
    }

    /// Validate configuration fields
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.log_level.to_uppercase().as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.log_level));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if path.trim().is_empty() {
                    return Err(anyhow::anyhow!("Log file path cannot be empty when log_to_file is true"));
                }
            }
        }

        if self.transport_methods.is_empty() {
            return Err(anyhow::anyhow!("At least one transport method must be configured"));
        }
        for method in &self.transport_methods {
            if method.is_empty() || method.contains(|c: char| c.is_whitespace() || c == ',') {
                return Err(anyhow::anyhow!("Invalid transport method name: '{}'", method));
            }
        }

        if self.alpn_protocols.is_empty() {
            return Err(anyhow::anyhow!("At least one ALPN protocol must be configured"));
        }

        if self.quic.idle_timeout_ms == 0 {
            return Err(anyhow::anyhow!("QUIC idle timeout must be greater than 0"));
        }
        if self.quic.keep_alive_interval_ms >= self.quic.idle_timeout_ms {
            return Err(anyhow::anyhow!(
                "QUIC keep-alive interval ({}ms) must be shorter than the idle timeout ({}ms)",
                self.quic.keep_alive_interval_ms,
                self.quic.idle_timeout_ms
            ));
        }

        if self.timeouts.connect_timeout == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }
        if self.timeouts.close_linger == 0 {
            return Err(anyhow::anyhow!("Close linger must be greater than 0"));
        }

        if self.tls.cert_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("TLS certificate directory cannot be empty"));
        }

        if self.relay.buffer_size == 0 || self.relay.buffer_size > MAX_BUFFER_SIZE {
            return Err(anyhow::anyhow!(
                "Relay buffer size must be between 1 and {}",
                MAX_BUFFER_SIZE
            ));
        }

        Ok(())
    }

    /// Whether `method` is one of the configured transport methods
    pub fn serves_method(&self, method: &str) -> bool {
        self.transport_methods.iter().any(|m| m == method)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_timeout)
    }

    pub fn close_linger(&self) -> Duration {
        Duration::from_secs(self.timeouts.close_linger)
    }

    /// Certificate and key file locations inside the configured directory
    pub fn cert_files(&self) -> (PathBuf, PathBuf) {
        Self::cert_files_in(Path::new(&self.tls.cert_dir))
    }

    /// Certificate and key file locations inside `dir`
    pub fn cert_files_in(dir: &Path) -> (PathBuf, PathBuf) {
        (dir.join(CERT_FILE_NAME), dir.join(KEY_FILE_NAME))
    }
}

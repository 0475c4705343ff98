//! Server configuration: TOML file, defaults, and validation.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TftpError};
use crate::{DEFAULT_RETRIES, DEFAULT_SERVER_PORT, TftpOptions};

/// Write operation policy.
///
/// Writes are disabled by default; when enabled, only files matching one of
/// the glob patterns may be created, and overwriting is opt-in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Enable write operations
    pub enabled: bool,

    /// Allow overwriting existing files
    /// When false, returns "File already exists" per RFC 1350
    pub allow_overwrite: bool,

    /// Glob patterns of files that may be written, relative to the root
    /// Examples: ["*.txt", "configs/*.cfg", "firmware/device-*.bin"]
    pub allowed_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub transfer: TransferConfig,
    pub write: WriteConfig,
    pub logging: LoggingConfig,
    /// Maximum file size in bytes served or accepted (0 = unlimited)
    pub max_file_size_bytes: u64,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/tftpx"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), DEFAULT_SERVER_PORT),
            transfer: TransferConfig::default(),
            write: WriteConfig::default(),
            logging: LoggingConfig::default(),
            max_file_size_bytes: 104_857_600, // 100 MB default
        }
    }
}

/// Retransmission tuning applied before per-request option negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub timeout_secs: u64,
    pub retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl TransferConfig {
    /// Session defaults derived from this tuning.
    pub fn session_defaults(&self) -> TftpOptions {
        TftpOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            retries: self.retries,
            ..TftpOptions::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured audit events for SIEM integration
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate the configuration; with `validate_bind` the bind address is
/// probed with a trial socket.
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Config(format!("root_dir is not readable: {e}")));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind && let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
        return Err(TftpError::Config(format!("bind_addr is not available: {e}")));
    }

    if config.transfer.timeout_secs == 0 || config.transfer.timeout_secs > 255 {
        return Err(TftpError::Config(
            "transfer.timeout_secs must be in range 1-255".to_string(),
        ));
    }

    for pattern in &config.write.allowed_patterns {
        if let Err(e) = glob::Pattern::new(pattern) {
            return Err(TftpError::Config(format!(
                "invalid write pattern '{pattern}': {e}"
            )));
        }
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::Config(format!("logging.file parent error: {e}")));
            }
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| TftpError::Config(format!("logging.file not writable: {e}")))?;
    }

    Ok(())
}

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TftpError};
use crate::packet::{TftpOption, TransferMode};
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS, TFTP_PORT};

/// Which request types the server accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMode {
    /// Serve read requests only
    GetOnly,
    /// Accept write requests only
    PutOnly,
    /// Serve reads and accept writes
    #[default]
    GetAndPut,
}

impl ServerMode {
    pub fn allows_read(self) -> bool {
        matches!(self, ServerMode::GetOnly | ServerMode::GetAndPut)
    }

    pub fn allows_write(self) -> bool {
        matches!(self, ServerMode::PutOnly | ServerMode::GetAndPut)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Directory read requests are served from
    pub read_root: PathBuf,
    /// Directory write requests land in; `read_root` when unset
    pub write_root: Option<PathBuf>,
    pub mode: ServerMode,
    /// Per-attempt receive timeout in milliseconds
    pub timeout_ms: u64,
    /// Consecutive timeouts tolerated before a session fails
    pub max_retries: u32,
    /// Largest file served or accepted in bytes; 0 means unlimited
    pub max_file_size_bytes: u64,
    /// Buffer pairs kept for reuse across sessions
    pub buffer_pool_size: usize,
    pub socket: SocketConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), TFTP_PORT),
            read_root: PathBuf::from("/srv/tftp"),
            write_root: None,
            mode: ServerMode::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_file_size_bytes: 0,
            buffer_pool_size: crate::buffer_pool::DEFAULT_POOL_SIZE,
            socket: SocketConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn write_root(&self) -> &Path {
        self.write_root.as_deref().unwrap_or(&self.read_root)
    }

    pub fn max_file_size(&self) -> Option<u64> {
        (self.max_file_size_bytes > 0).then_some(self.max_file_size_bytes)
    }
}

/// Socket-level options for the listening and per-session sockets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Receive buffer size in KB (SO_RCVBUF); 0 keeps the OS default
    pub recv_buffer_kb: usize,
    /// Send buffer size in KB (SO_SNDBUF); 0 keeps the OS default
    pub send_buffer_kb: usize,
    /// Enable SO_REUSEADDR for faster restarts
    pub reuse_address: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_kb: 0,
            send_buffer_kb: 0,
            reuse_address: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured audit events for requests, denials and transfers
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
    /// One JSON object per line for log aggregators
    Json,
}

/// Settings for client-initiated transfers
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-attempt receive timeout
    pub timeout: Duration,
    /// Consecutive timeouts tolerated before a transfer fails
    pub max_retries: u32,
    /// Local address to bind; an unspecified address of the server's family
    /// on an ephemeral port when unset
    pub local_addr: Option<SocketAddr>,
    pub mode: TransferMode,
    /// RFC 2347 options appended to requests
    pub options: Vec<TftpOption>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            local_addr: None,
            mode: TransferMode::Octet,
            options: Vec::new(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    write_config(path, &ServerConfig::default())
}

pub fn write_config(path: &Path, config: &ServerConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate server configuration before binding
pub fn validate_config(config: &ServerConfig, validate_bind: bool) -> Result<()> {
    validate_root("read_root", &config.read_root)?;
    if let Some(ref write_root) = config.write_root {
        validate_root("write_root", write_root)?;
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind {
        if let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
            return Err(TftpError::Config(format!(
                "bind_addr is not available: {}",
                e
            )));
        }
    }

    if config.timeout_ms == 0 {
        return Err(TftpError::Config("timeout_ms must be positive".to_string()));
    }

    if config.max_retries == 0 {
        return Err(TftpError::Config(
            "max_retries must be at least 1".to_string(),
        ));
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
                return Err(TftpError::Config(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
    }

    Ok(())
}

fn validate_root(name: &str, root: &Path) -> Result<()> {
    if !root.is_absolute() {
        return Err(TftpError::Config(format!(
            "{name} must be an absolute path"
        )));
    }

    match std::fs::metadata(root) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config(format!("{name} must be a directory")));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(format!(
                "{name} does not exist; create it or adjust config"
            )));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(root) {
        return Err(TftpError::Config(format!("{name} is not readable: {}", e)));
    }

    Ok(())
}

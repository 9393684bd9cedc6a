use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::DEFAULT_MAX_SESSIONS;
use crate::heartbeat;
use crate::pty::ShellConfig;
use crate::session::{SessionConfig, AUTH_TIMEOUT};

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Server config file, loaded from TOML. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    /// Shared secret clients must present.
    pub token: Option<String>,
    pub shell: Option<String>,
    pub max_sessions: Option<usize>,
    pub heartbeat_interval_secs: Option<u64>,
    pub max_missed_pongs: Option<u32>,
    /// Extra host environment variable names forwarded to the shell.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
    /// Per-IP request rate on `/ws`.
    pub rate_limit: Option<u32>,
}

impl FileConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // Warn if the config file is world-readable (may contain the token).
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), Box::new(e)))?;
        Ok(Some(config))
    }
}

/// Errors that can occur when loading or resolving config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {1}", .0.display())]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {1}", .0.display())]
    ParseFailed(PathBuf, #[source] Box<toml::de::Error>),
    #[error("invalid bind address {0:?}")]
    InvalidBind(String),
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("token must not be empty")]
    EmptyToken,
}

/// Default config file location: `<config_dir>/ptyrelay/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ptyrelay").join("config.toml"))
}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain the access token -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

/// Values given on the command line. `None` defers to the file, then the
/// built-in default.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub token: Option<String>,
    pub shell: Option<String>,
    pub max_sessions: Option<usize>,
    pub rate_limit: Option<u32>,
}

/// Fully resolved server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind: SocketAddr,
    pub token: Option<String>,
    pub shell: Option<String>,
    pub max_sessions: usize,
    pub heartbeat_interval: Duration,
    pub max_missed_pongs: u32,
    pub env_passthrough: Vec<String>,
    pub rate_limit: Option<u32>,
}

impl Settings {
    /// Merge CLI overrides over the file config over defaults.
    pub fn resolve(cli: Overrides, file: Option<FileConfig>) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();

        let bind = cli
            .bind
            .or(file.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidBind(bind.clone()))?;

        let token = cli.token.or(file.token);
        if token.as_deref() == Some("") {
            return Err(ConfigError::EmptyToken);
        }

        let max_sessions = cli
            .max_sessions
            .or(file.max_sessions)
            .unwrap_or(DEFAULT_MAX_SESSIONS);
        if max_sessions == 0 {
            return Err(ConfigError::Zero("max_sessions"));
        }

        let heartbeat_interval = match file.heartbeat_interval_secs {
            Some(0) => return Err(ConfigError::Zero("heartbeat_interval_secs")),
            Some(secs) => Duration::from_secs(secs),
            None => heartbeat::DEFAULT_INTERVAL,
        };

        let max_missed_pongs = file
            .max_missed_pongs
            .unwrap_or(heartbeat::DEFAULT_MAX_MISSED);
        if max_missed_pongs == 0 {
            return Err(ConfigError::Zero("max_missed_pongs"));
        }

        let rate_limit = cli.rate_limit.or(file.rate_limit);
        if rate_limit == Some(0) {
            return Err(ConfigError::Zero("rate_limit"));
        }

        Ok(Self {
            bind,
            token,
            shell: cli.shell.or(file.shell),
            max_sessions,
            heartbeat_interval,
            max_missed_pongs,
            env_passthrough: file.env_passthrough,
            rate_limit,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            secret: self.token.as_deref().map(Arc::from),
            auth_timeout: AUTH_TIMEOUT,
            heartbeat_interval: self.heartbeat_interval,
            max_missed_pongs: self.max_missed_pongs,
            shell: ShellConfig {
                shell: self.shell.clone(),
                env_passthrough: self.env_passthrough.clone(),
            },
        }
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default poll interval when `server.staterefresh` is absent.
pub const DEFAULT_STATE_REFRESH_SECS: i64 = 5;

/// Longest accepted poll interval (one day). Larger values disable polling.
pub const MAX_STATE_REFRESH_SECS: u64 = 86_400;

/// Top-level explorer config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplorerConfig {
    /// Server state polling settings.
    #[serde(default)]
    pub server: ServerSection,
    /// Connection settings forwarded to the language server.
    #[serde(default)]
    pub connection: ConnectionSection,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Poll interval in seconds. Zero or negative disables polling.
    #[serde(default = "default_state_refresh")]
    pub staterefresh: i64,
    /// How server state is shown: `icon`, `color` or `none`.
    #[serde(default = "default_state_check")]
    pub statecheck: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            staterefresh: default_state_refresh(),
            statecheck: default_state_check(),
        }
    }
}

fn default_state_refresh() -> i64 {
    DEFAULT_STATE_REFRESH_SECS
}

fn default_state_check() -> String {
    "icon".to_string()
}

/// `[connection]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// Accept self-signed certificates when talking to servers.
    #[serde(default)]
    pub trustssl: bool,
}

/// How server health is rendered on explorer nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCheckMode {
    Icon,
    Color,
    /// State checking is off; also disables polling.
    None,
}

impl StateCheckMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "icon" => Some(Self::Icon),
            "color" => Some(Self::Color),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Normalized polling settings consumed by the state manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCheckSettings {
    pub interval_secs: u64,
    pub mode: StateCheckMode,
}

impl StateCheckSettings {
    pub fn new(interval_secs: u64, mode: StateCheckMode) -> Self {
        Self {
            interval_secs,
            mode,
        }
    }

    /// Settings with polling turned off.
    pub fn disabled() -> Self {
        Self::new(0, StateCheckMode::None)
    }

    /// True when the timer may run at all.
    pub fn polling_enabled(&self) -> bool {
        (1..=MAX_STATE_REFRESH_SECS).contains(&self.interval_secs)
            && self.mode != StateCheckMode::None
    }

    pub fn interval(&self) -> Option<Duration> {
        self.polling_enabled()
            .then(|| Duration::from_secs(self.interval_secs))
    }
}

impl Default for StateCheckSettings {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_REFRESH_SECS as u64, StateCheckMode::Icon)
    }
}

impl ExplorerConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Normalize the `[server]` section. Values that cannot be interpreted
    /// turn polling off instead of failing.
    pub fn state_check(&self) -> StateCheckSettings {
        let Some(mode) = StateCheckMode::parse(&self.server.statecheck) else {
            tracing::warn!(
                statecheck = %self.server.statecheck,
                "unrecognized server.statecheck value, disabling state polling"
            );
            return StateCheckSettings::disabled();
        };
        if self.server.staterefresh < 0 {
            tracing::warn!(
                staterefresh = self.server.staterefresh,
                "negative server.staterefresh value, disabling state polling"
            );
            return StateCheckSettings::new(0, mode);
        }
        let interval_secs = self.server.staterefresh as u64;
        if interval_secs > MAX_STATE_REFRESH_SECS {
            tracing::warn!(
                staterefresh = self.server.staterefresh,
                max = MAX_STATE_REFRESH_SECS,
                "server.staterefresh too large, disabling state polling"
            );
            return StateCheckSettings::new(0, mode);
        }
        StateCheckSettings::new(interval_secs, mode)
    }
}

/// Directory holding the config and registration files.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scdf-explorer")
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

/// Check file permissions on a file holding secrets and warn if
/// world-readable.
#[cfg(unix)]
pub fn check_secret_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "credentials file {} is world-readable (mode {:o}); consider restricting permissions to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_secret_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

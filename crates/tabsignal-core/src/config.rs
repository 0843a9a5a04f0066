use crate::{TabColor, TabPalette};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "TABSIGNAL_CONFIG_PATH";
pub const SOCKET_ENV: &str = "TABSIGNAL_HUB_SOCKET";
pub const LOG_DIR_ENV: &str = "TABSIGNAL_LOG_DIR";
pub const LOG_LEVEL_ENV: &str = "TABSIGNAL_LOG_LEVEL";
pub const HUB_DEBUG_ENV: &str = "TABSIGNAL_HUB_DEBUG";
pub const INSTANCE_ENV: &str = "KITTY_LISTEN_ON";
pub const WINDOW_ENV: &str = "KITTY_WINDOW_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabSignalConfig {
    pub poll_interval_ms: u64,
    pub poll_debounce_ms: u64,
    pub poll_max_cycles: u32,
    pub command_timeout_ms: u64,
    pub hub_idle_exit_secs: u64,
    pub ack_timeout_ms: u64,
    pub kitten_bin: String,
    pub fast_path: bool,
    pub palette: PaletteConfig,
}

impl Default for TabSignalConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            poll_debounce_ms: 500,
            poll_max_cycles: 1_800,
            command_timeout_ms: 2_000,
            hub_idle_exit_secs: 600,
            ack_timeout_ms: 300,
            kitten_bin: "kitten".to_string(),
            fast_path: true,
            palette: PaletteConfig::default(),
        }
    }
}

impl TabSignalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// At least one pass always runs before the cycle cap force-clears.
    pub fn poll_max_cycles(&self) -> u32 {
        self.poll_max_cycles.max(1)
    }

    pub fn poll_debounce(&self) -> Duration {
        Duration::from_millis(self.poll_debounce_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }

    /// `None` keeps the hub alive until it is stopped.
    pub fn hub_idle_exit(&self) -> Option<Duration> {
        if self.hub_idle_exit_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.hub_idle_exit_secs))
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaletteConfig {
    pub blue: TabPalette,
    pub yellow: TabPalette,
    pub red: TabPalette,
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            blue: solid("#ffffff", "#2b6cc4"),
            yellow: solid("#000000", "#e0b000"),
            red: solid("#ffffff", "#c73a3a"),
        }
    }
}

impl PaletteConfig {
    /// Palette that makes the tab show `color`; paused blue and cleared tabs reset.
    pub fn for_color(&self, color: Option<TabColor>) -> TabPalette {
        match color {
            Some(TabColor::Blue) => self.blue.clone(),
            Some(TabColor::Yellow) => self.yellow.clone(),
            Some(TabColor::Red) => self.red.clone(),
            Some(TabColor::BluePaused) | None => TabPalette::reset(),
        }
    }
}

fn solid(fg: &str, bg: &str) -> TabPalette {
    TabPalette {
        active_fg: Some(fg.to_string()),
        active_bg: Some(bg.to_string()),
        inactive_fg: Some(fg.to_string()),
        inactive_bg: Some(bg.to_string()),
    }
}

pub fn load_config(path: &Path) -> Result<TabSignalConfig, ConfigError> {
    if !path.exists() {
        return Ok(TabSignalConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn config_path() -> PathBuf {
    if let Some(path) = env_nonempty(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join("tabsignal/config.toml")
}

pub fn resolve_socket_path(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Some(path) = env_nonempty(SOCKET_ENV) {
        return PathBuf::from(path);
    }
    default_socket_path()
}

pub fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("tabsignal/hub.sock"),
        None => env::temp_dir()
            .join(format!("tabsignal-{}", user_component()))
            .join("hub.sock"),
    }
}

/// Advisory lock held by the running hub, next to its socket.
pub fn lock_path_for(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("lock")
}

pub fn resolve_log_dir(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Some(path) = env_nonempty(LOG_DIR_ENV) {
        return PathBuf::from(path);
    }
    dirs::state_dir()
        .unwrap_or_else(|| home_dir().join(".local/state"))
        .join("tabsignal/logs")
}

pub fn resolve_log_level(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    env_nonempty(LOG_LEVEL_ENV).unwrap_or_else(|| "info".to_string())
}

pub fn env_nonempty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_true(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn user_component() -> String {
    let user = env_nonempty("USER").unwrap_or_else(|| "user".to_string());
    user.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

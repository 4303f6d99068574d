//! # memload-config
//!
//! Configuration management for memload.
//!
//! Loads configuration from:
//! 1. `~/.memload/config.toml` (global)
//! 2. The file named by `MEMLOAD_CONFIG` (replaces the global file)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "MEMLOAD_CONFIG";

/// Global config instance, loaded on first use
static CONFIG: Lazy<Config> = Lazy::new(|| Config::load().unwrap_or_default());

/// Get global config (read-only)
pub fn config() -> &'static Config {
    &CONFIG
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub hook: HookConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.memload/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Explicit config file
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            debug!("Loading config from {}", explicit);
            config = Self::from_file(Path::new(&explicit))?;
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.memload/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".memload/config.toml"))
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Unparsable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("MEMLOAD_LOG") {
            self.log.level = level;
        }
        if let Some(file) = lookup("MEMLOAD_LOG_FILE") {
            self.log.file = Some(PathBuf::from(file));
        }
        if let Some(mode) = lookup("MEMLOAD_HOOK_MODE") {
            if let Ok(mode) = mode.parse() {
                self.hook.mode = mode;
            }
        }
        if let Some(library) = lookup("MEMLOAD_HOOK_LIBRARY") {
            self.hook.library = (!library.is_empty()).then_some(library);
        }
        if let Some(symbol) = lookup("MEMLOAD_HOOK_SYMBOL") {
            self.hook.symbol = symbol;
        }
        if let Some(symbol) = lookup("MEMLOAD_PATCHER_SYMBOL") {
            self.hook.patcher_symbol = symbol;
        }
        if let Some(name) = lookup("MEMLOAD_MEMFD_NAME") {
            self.store.memfd_name = name;
        }
        if let Some(flag) = lookup("MEMLOAD_AUTO_INSTALL") {
            if let Some(flag) = parse_bool(&flag) {
                self.hook.auto_install = flag;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (`error`, `warn`, `info`, `debug`, `trace` or an EnvFilter string)
    pub level: String,
    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// How the open entry point gets redirected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    /// Dynamic-linker interposition of the exported hook symbol
    #[default]
    Interpose,
    /// Inline patch of the target through an external patcher
    Inline,
}

impl FromStr for HookMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interpose" => Ok(HookMode::Interpose),
            "inline" => Ok(HookMode::Inline),
            _ => Err(ConfigError::InvalidValue {
                key: "hook.mode",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for HookMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookMode::Interpose => f.write_str("interpose"),
            HookMode::Inline => f.write_str("inline"),
        }
    }
}

/// Default hook target for this platform: `(mode, library, symbol)`.
///
/// Android's linker opens libraries through its private `__dl___openat`, which only an
/// inline patch reaches. Elsewhere the exported `openat` is interposed; that catches
/// direct `openat` callers only, not the dynamic loader's own opens.
pub fn default_hook_target() -> (HookMode, Option<&'static str>, &'static str) {
    if cfg!(all(target_os = "android", target_pointer_width = "64")) {
        (HookMode::Inline, Some("linker64"), "__dl___openat")
    } else if cfg!(target_os = "android") {
        (HookMode::Inline, Some("linker"), "__dl___openat")
    } else {
        (HookMode::Interpose, None, "openat")
    }
}

/// Hook installation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Install from the load-time constructor
    pub auto_install: bool,
    pub mode: HookMode,
    /// Library that defines the target symbol (None = next definition after us)
    pub library: Option<String>,
    /// Target open-by-path symbol
    pub symbol: String,
    /// Inline patcher entry point, `int (*)(void *, void *, void **)`
    pub patcher_symbol: String,
}

impl Default for HookConfig {
    fn default() -> Self {
        let (mode, library, symbol) = default_hook_target();
        Self {
            auto_install: true,
            mode,
            library: library.map(str::to_string),
            symbol: symbol.to_string(),
            patcher_symbol: "DobbyHook".to_string(),
        }
    }
}

/// Backing store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name attached to anonymous memory files (visible in /proc/<pid>/fd)
    pub memfd_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memfd_name: "jit-cache".to_string(),
        }
    }
}

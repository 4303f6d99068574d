//! Structured logging utilities for memload components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use memload_config::{log_hook_debug, log_registry_info};
//!
//! log_registry_info!("Registered substitution", fragment = "libfoo.so", size = 4096);
//! log_hook_debug!("Forwarding open", path = "/system/lib64/libc.so");
//! ```

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::LogConfig;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const HOOK: &'static str = "HOOK";
    pub const REGISTRY: &'static str = "REGISTRY";
    pub const PRELOAD: &'static str = "PRELOAD";
}

// === HOOK logging macros ===

#[macro_export]
macro_rules! log_hook_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "HOOK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_hook_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "HOOK", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_hook_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "HOOK", $($key = $value,)* $msg)
    };
}

// === REGISTRY logging macros ===

#[macro_export]
macro_rules! log_registry_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "REGISTRY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_registry_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "REGISTRY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_registry_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "REGISTRY", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_registry_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "REGISTRY", $($key = $value,)* $msg)
    };
}

// === PRELOAD logging macros ===

#[macro_export]
macro_rules! log_preload_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "PRELOAD", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_preload_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "PRELOAD", $($key = $value,)* $msg)
    };
}

/// Keeps the non-blocking file writer flushing for the process lifetime
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Build the filter for a configured level, falling back to `info`.
pub fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging from config.
///
/// Returns `false` if a global subscriber was already installed (e.g. by the host
/// process); the existing one is left in place.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = level_filter(&config.level);

    let Some(path) = config.file.as_deref() else {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok();
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let Some(file_name) = path.file_name() else {
        return false;
    };
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .is_ok();
    if installed {
        let _ = FILE_GUARD.set(guard);
    }
    installed
}

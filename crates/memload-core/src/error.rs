//! Error taxonomy for registration, substitution and hook installation.

use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to allocate {size} bytes for {fragment:?}: {source}")]
    Allocation {
        fragment: String,
        size: usize,
        #[source]
        source: TryReserveError,
    },
}

impl RegistryError {
    /// errno equivalent for C callers
    pub fn raw_os_error(&self) -> i32 {
        match self {
            RegistryError::Allocation { .. } => libc::ENOMEM,
        }
    }
}

/// Failure while serving a matched open. Both map onto the errno channel of `openat`.
#[derive(Error, Debug)]
pub enum SubstitutionError {
    /// The anonymous file could not be created; the entry stays registered.
    #[error("backing store creation failed: {0}")]
    BackingStore(#[source] io::Error),

    /// The content could not be fully written; the entry has been consumed.
    #[error("writing substitution content failed: {0}")]
    Write(#[source] io::Error),
}

impl SubstitutionError {
    pub fn io_error(&self) -> &io::Error {
        match self {
            SubstitutionError::BackingStore(e) | SubstitutionError::Write(e) => e,
        }
    }

    /// errno to report to the caller of the hooked open (`EIO` when the OS gave none)
    pub fn raw_os_error(&self) -> i32 {
        self.io_error().raw_os_error().unwrap_or(libc::EIO)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("library {0:?} is not loaded")]
    LibraryNotLoaded(String),

    #[error("symbol {symbol:?} not found{}", .library.as_deref().map(|l| format!(" in {l:?}")).unwrap_or_default())]
    SymbolNotFound {
        library: Option<String>,
        symbol: String,
    },

    #[error("name contains an interior NUL byte: {0:?}")]
    InvalidName(String),

    #[error("patcher failed with code {0}")]
    PatchFailed(i32),

    #[error("target {0} resolves to the hook itself")]
    ResolvesToHook(String),

    #[error("interceptor is already installed")]
    AlreadyInstalled,
}

impl HookError {
    /// errno equivalent for C callers
    pub fn raw_os_error(&self) -> i32 {
        match self {
            HookError::LibraryNotLoaded(_) | HookError::SymbolNotFound { .. } => libc::ENOENT,
            HookError::InvalidName(_) => libc::EINVAL,
            HookError::PatchFailed(_) => libc::EFAULT,
            HookError::ResolvesToHook(_) => libc::ELOOP,
            HookError::AlreadyInstalled => libc::EEXIST,
        }
    }
}

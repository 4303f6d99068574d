//! Anonymous, memory-backed file objects that receive substitution content.

use std::ffi::CString;
use std::io;
use std::os::fd::OwnedFd;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

/// Creates a fresh anonymous file object for one substitution.
pub trait BackingStore: Send + Sync {
    /// New empty, seekable, path-less file. `cloexec` mirrors the caller's `O_CLOEXEC`.
    fn create(&self, cloexec: bool) -> io::Result<OwnedFd>;
}

/// `memfd_create(2)` backed store.
#[derive(Debug, Clone)]
pub struct MemfdStore {
    name: CString,
}

impl MemfdStore {
    pub const DEFAULT_NAME: &'static str = "jit-cache";

    /// Names containing NUL fall back to [`Self::DEFAULT_NAME`].
    pub fn new(name: &str) -> Self {
        let name = CString::new(name).unwrap_or_else(|_| c"jit-cache".to_owned());
        Self { name }
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or(Self::DEFAULT_NAME)
    }
}

impl Default for MemfdStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAME)
    }
}

impl BackingStore for MemfdStore {
    fn create(&self, cloexec: bool) -> io::Result<OwnedFd> {
        let flags = if cloexec {
            MemFdCreateFlag::MFD_CLOEXEC
        } else {
            MemFdCreateFlag::empty()
        };
        Ok(memfd_create(&self.name, flags)?)
    }
}

//! Substitution registry.
//!
//! Process-wide table of pending substitutions, keyed by path fragment. Entries are
//! added by [`Registry::register`] and consumed at most once by the interceptor
//! through [`Registry::claim_with`]; every read and write goes through one mutex.

use std::ffi::CStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::{c_char, c_int};

use indexmap::IndexMap;
use memchr::memmem;
use memload_config::{
    log_registry_debug, log_registry_error, log_registry_info, log_registry_warn,
};
use once_cell::sync::Lazy;

use crate::error::RegistryError;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// The process-wide registry shared by the registration entry point and the hook.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// A registered path fragment and the bytes to serve in place of the matching file.
///
/// The entry owns its content; moving it out of the registry moves the buffer with it.
#[derive(Debug, PartialEq, Eq)]
pub struct Substitution {
    fragment: String,
    content: Box<[u8]>,
}

impl Substitution {
    /// Copy `content` into a freshly allocated buffer.
    pub fn new(fragment: impl Into<String>, content: &[u8]) -> Result<Self, RegistryError> {
        let fragment = fragment.into();
        let mut buf = Vec::new();
        if let Err(source) = buf.try_reserve_exact(content.len()) {
            return Err(RegistryError::Allocation {
                fragment,
                size: content.len(),
                source,
            });
        }
        buf.extend_from_slice(content);
        Ok(Self {
            fragment,
            content: buf.into_boxed_slice(),
        })
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// True if the fragment occurs anywhere in `path`.
    pub fn matches(&self, path: &[u8]) -> bool {
        memmem::find(path, self.fragment.as_bytes()).is_some()
    }
}

/// Result of [`Registry::claim_with`].
#[derive(Debug)]
pub enum Claim<T, E> {
    /// No registered fragment occurs in the path.
    Miss,
    /// A fragment matched but acquiring the resource failed; the entry is still registered.
    Failed(E),
    /// The entry was removed and handed over together with the acquired resource.
    Taken { resource: T, entry: Substitution },
}

/// Insertion-ordered map from path fragment to pending substitution.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<IndexMap<String, Substitution>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Substitution>> {
        // A panic elsewhere must not take the open path down with it.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy `content` and register it under `fragment`.
    ///
    /// A pending entry for the same fragment is replaced and its buffer released.
    /// On allocation failure nothing is stored.
    pub fn register(&self, fragment: &str, content: &[u8]) -> Result<(), RegistryError> {
        if fragment.is_empty() {
            log_registry_warn!("Empty fragment matches every opened path");
        }
        let entry = Substitution::new(fragment, content).inspect_err(|e| {
            log_registry_error!(
                "Registration failed",
                fragment = fragment,
                error = tracing::field::display(e)
            )
        })?;
        let size = entry.size();
        let replaced = self.insert(entry);

        if let Some(old) = &replaced {
            log_registry_debug!(
                "Replaced pending substitution",
                fragment = fragment,
                old_size = old.size()
            );
        }
        log_registry_info!("Registered substitution", fragment = fragment, size = size);
        Ok(())
    }

    /// Store an entry, returning the one it replaced.
    ///
    /// A replaced fragment keeps its position in the iteration order. The returned
    /// [`Substitution`] owns the old buffer, so dropping it releases that memory.
    pub fn insert(&self, entry: Substitution) -> Option<Substitution> {
        let mut entries = self.lock();
        entries.insert(entry.fragment.clone(), entry)
    }

    /// [`Registry::register`] for C callers: `len` bytes at `data` under the
    /// NUL-terminated `fragment`.
    ///
    /// Fails with `EINVAL` for a null or non UTF-8 fragment and for null `data` with a
    /// non-zero `len`, and with `ENOMEM` when the copy cannot be allocated. `data` may
    /// be null when `len` is 0.
    ///
    /// # Safety
    /// A non-null `fragment` must point to a NUL-terminated string and a non-null
    /// `data` to at least `len` readable bytes.
    pub unsafe fn register_raw(
        &self,
        fragment: *const c_char,
        data: *const u8,
        len: usize,
    ) -> Result<(), c_int> {
        if fragment.is_null() || (data.is_null() && len != 0) {
            log_registry_error!("Rejected registration with null argument", len = len);
            return Err(libc::EINVAL);
        }
        let Ok(fragment) = CStr::from_ptr(fragment).to_str() else {
            log_registry_error!("Rejected registration with non UTF-8 fragment", len = len);
            return Err(libc::EINVAL);
        };
        let content: &[u8] = if len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(data, len)
        };
        self.register(fragment, content).map_err(|e| e.raw_os_error())
    }

    /// Atomically find the first entry whose fragment occurs in `path`, run `acquire`
    /// on it and, if that succeeds, remove it.
    ///
    /// The lock is held across `acquire`, so two racing callers can never both take
    /// the same entry: the loser sees it absent and gets [`Claim::Miss`].
    pub fn claim_with<T, E, F>(&self, path: &[u8], acquire: F) -> Claim<T, E>
    where
        F: FnOnce(&Substitution) -> Result<T, E>,
    {
        let mut entries = self.lock();
        let Some(index) = entries.values().position(|entry| entry.matches(path)) else {
            return Claim::Miss;
        };

        let resource = match acquire(&entries[index]) {
            Ok(resource) => resource,
            Err(e) => return Claim::Failed(e),
        };

        match entries.shift_remove_index(index) {
            Some((_, entry)) => Claim::Taken { resource, entry },
            None => Claim::Miss,
        }
    }

    pub fn contains(&self, fragment: &str) -> bool {
        self.lock().contains_key(fragment)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of pending fragments in match order.
    pub fn fragments(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

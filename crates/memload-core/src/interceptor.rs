//! Open interceptor.
//!
//! Stands in for the process's `openat`. A path containing a registered fragment is
//! served from an anonymous memory file filled with the registered bytes; every other
//! call is forwarded to the original entry point untouched.

use std::cell::Cell;
use std::ffi::{c_void, CStr};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock, PoisonError};

use libc::{c_char, c_int, mode_t};
use memload_config::{log_hook_debug, log_hook_error, log_hook_info};

use crate::error::{HookError, SubstitutionError};
use crate::hook::{HookTarget, SymbolResolver, Trampoline};
use crate::registry::{Claim, Registry, Substitution};
use crate::store::BackingStore;
use crate::sys;

/// Signature of the intercepted primitive: `openat(dirfd, pathname, flags, mode)`.
pub type OpenAtFn = unsafe extern "C" fn(c_int, *const c_char, c_int, mode_t) -> c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Uninstalled,
    Installed,
}

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Per-thread marker that a substitution is in flight on this thread.
struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Option<Self> {
        IN_HOOK
            .try_with(|active| (!active.replace(true)).then_some(ReentryGuard))
            .ok()
            .flatten()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|active| active.set(false));
    }
}

pub struct Interceptor<'r, S> {
    registry: &'r Registry,
    store: S,
    original: OnceLock<OpenAtFn>,
    replacement: OnceLock<OpenAtFn>,
    install_lock: Mutex<()>,
}

impl<'r, S: BackingStore> Interceptor<'r, S> {
    pub fn new(registry: &'r Registry, store: S) -> Self {
        Self {
            registry,
            store,
            original: OnceLock::new(),
            replacement: OnceLock::new(),
            install_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> InstallState {
        match self.original.get() {
            Some(_) => InstallState::Installed,
            None => InstallState::Uninstalled,
        }
    }

    /// The write-once handle to the un-hooked entry point.
    pub fn original(&self) -> Option<OpenAtFn> {
        self.original.get().copied()
    }

    /// True once [`Interceptor::install`] has redirected the target to `replacement`.
    ///
    /// An exported entry point that is not the installed replacement must not
    /// substitute; it only shadows a symbol.
    pub fn is_hooked_by(&self, replacement: OpenAtFn) -> bool {
        self.replacement
            .get()
            .is_some_and(|&installed| installed as usize == replacement as usize)
    }

    /// Resolve `target`, have `trampoline` redirect it to `replacement` and keep the
    /// original it returns for forwarding.
    ///
    /// # Safety
    /// `replacement` must end up calling [`Interceptor::open_at`] on this interceptor,
    /// and `target` must name a function with the [`OpenAtFn`] signature.
    pub unsafe fn install(
        &self,
        target: &HookTarget,
        replacement: OpenAtFn,
        resolver: &dyn SymbolResolver,
        trampoline: &dyn Trampoline,
    ) -> Result<(), HookError> {
        let _lock = self.install_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.original.get().is_some() {
            return Err(HookError::AlreadyInstalled);
        }

        let address = resolver.resolve(target)?;
        let replacement_ptr = NonNull::new(replacement as *mut c_void)
            .ok_or_else(|| HookError::ResolvesToHook(target.to_string()))?;
        if address == replacement_ptr {
            return Err(HookError::ResolvesToHook(target.to_string()));
        }

        let original = trampoline.redirect(address, replacement_ptr)?;
        let original = std::mem::transmute::<*mut c_void, OpenAtFn>(original.as_ptr());
        self.original
            .set(original)
            .map_err(|_| HookError::AlreadyInstalled)?;
        let _ = self.replacement.set(replacement);

        log_hook_info!(
            "Installed open interceptor",
            target = target.to_string().as_str(),
            address = address.as_ptr() as usize
        );
        Ok(())
    }

    /// [`Interceptor::install`] that treats an existing installation as success.
    ///
    /// Returns whether this call did the installation.
    ///
    /// # Safety
    /// Same as [`Interceptor::install`].
    pub unsafe fn ensure_installed(
        &self,
        target: &HookTarget,
        replacement: OpenAtFn,
        resolver: &dyn SymbolResolver,
        trampoline: &dyn Trampoline,
    ) -> Result<bool, HookError> {
        match self.install(target, replacement, resolver, trampoline) {
            Ok(()) => Ok(true),
            Err(HookError::AlreadyInstalled) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Install an already known original entry point.
    pub fn install_original(&self, original: OpenAtFn) -> Result<(), HookError> {
        let _lock = self.install_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.original
            .set(original)
            .map_err(|_| HookError::AlreadyInstalled)
    }

    /// Serve `path` from the registry if a fragment matches.
    ///
    /// `None` means no match. On a match the entry is consumed unless the backing
    /// store could not be created; a failed write still consumes it so partial
    /// content is never served twice.
    pub fn substitute(
        &self,
        path: &CStr,
        flags: c_int,
    ) -> Option<Result<OwnedFd, SubstitutionError>> {
        let cloexec = flags & libc::O_CLOEXEC != 0;
        let claim = self.registry.claim_with(path.to_bytes(), |_| {
            self.store
                .create(cloexec)
                .map_err(SubstitutionError::BackingStore)
        });

        let path = path.to_string_lossy();
        match claim {
            Claim::Miss => None,
            Claim::Failed(e) => {
                log_hook_error!(
                    "Backing store creation failed, substitution kept",
                    path = &*path,
                    error = tracing::field::display(&e)
                );
                Some(Err(e))
            }
            Claim::Taken { resource, entry } => {
                let fragment = entry.fragment().to_string();
                let size = entry.size();
                let served = fill(resource, entry);
                match &served {
                    Ok(fd) => log_hook_info!(
                        "Served substitution",
                        path = &*path,
                        fragment = fragment.as_str(),
                        size = size,
                        fd = fd.as_raw_fd()
                    ),
                    Err(e) => log_hook_error!(
                        "Writing substitution failed, entry dropped",
                        path = &*path,
                        fragment = fragment.as_str(),
                        error = tracing::field::display(e)
                    ),
                }
                Some(served)
            }
        }
    }

    /// Full hook body with the exact contract of `openat`.
    ///
    /// Nothing is substituted until an original is installed; until then every call
    /// is forwarded and registrations stay pending.
    ///
    /// # Safety
    /// `path` must be null or a valid NUL-terminated string.
    pub unsafe fn open_at(
        &self,
        dirfd: c_int,
        path: *const c_char,
        flags: c_int,
        mode: mode_t,
    ) -> c_int {
        if !path.is_null() && self.original.get().is_some() {
            if let Some(_guard) = ReentryGuard::enter() {
                match self.substitute(CStr::from_ptr(path), flags) {
                    Some(Ok(fd)) => return fd.into_raw_fd(),
                    Some(Err(e)) => {
                        sys::set_errno(e.raw_os_error());
                        return -1;
                    }
                    None => {}
                }
            }
        }
        self.forward(dirfd, path, flags, mode)
    }

    /// Call the original entry point, or the kernel directly before installation.
    ///
    /// # Safety
    /// Same as the original `openat`.
    pub unsafe fn forward(
        &self,
        dirfd: c_int,
        path: *const c_char,
        flags: c_int,
        mode: mode_t,
    ) -> c_int {
        match self.original.get() {
            Some(original) => original(dirfd, path, flags, mode),
            None => {
                log_hook_debug!("Forwarding before install, using raw syscall");
                sys::raw_openat(dirfd, path, flags, mode)
            }
        }
    }
}

/// Copy the entry into the backing object and rewind it. The entry's buffer is
/// released on return whatever the outcome.
fn fill(fd: OwnedFd, entry: Substitution) -> Result<OwnedFd, SubstitutionError> {
    let mut file = File::from(fd);
    file.write_all(entry.content())
        .and_then(|()| file.seek(SeekFrom::Start(0)))
        .map_err(SubstitutionError::Write)?;
    drop(entry);
    Ok(OwnedFd::from(file))
}

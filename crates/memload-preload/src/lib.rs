//! # memload-preload
//!
//! Shared library that puts the memload interceptor in front of `openat`.
//!
//! ## Usage
//!
//! ```bash
//! LD_PRELOAD=/path/to/libmemload_preload.so ./app
//! ```
//!
//! Content is supplied at runtime through `memload_register(fragment, data, len)`;
//! the next open of a path containing `fragment` returns a memfd holding `data`.
//!
//! ## Hook modes
//!
//! - `inline` (Android default): the linker's `__dl___openat` in `linker64` / `linker`
//!   is patched through an external `DobbyHook`-compatible patcher, so the dynamic
//!   loader's own library opens are substituted.
//! - `interpose` (default elsewhere): the exported `openat` shadows libc's. This only
//!   intercepts code that calls `openat` directly; the dynamic loader opens libraries
//!   through its internal open and is not seen.
//!
//! In `inline` mode the exported `openat` still shadows libc and forwards to it.
//!
//! ## Environment Variables
//!
//! - `MEMLOAD_CONFIG`: config file to load instead of `~/.memload/config.toml`
//! - `MEMLOAD_LOG`: log filter (default: `info`)
//! - `MEMLOAD_HOOK_MODE`: `interpose` or `inline`
//! - `MEMLOAD_HOOK_LIBRARY` / `MEMLOAD_HOOK_SYMBOL`: where the real open lives
//! - `MEMLOAD_AUTO_INSTALL`: set to `0` to defer to `memload_install()`

#![allow(clippy::missing_safety_doc)]

mod install;

use std::sync::OnceLock;

use libc::{c_char, c_int, mode_t};
use memload_config::{log_preload_error, log_preload_info, logging};
use memload_core::{registry, sys, Interceptor, MemfdStore};

/// Set by the constructor; until then every open goes straight to the kernel.
static INTERCEPTOR: OnceLock<Interceptor<'static, MemfdStore>> = OnceLock::new();

fn interceptor() -> &'static Interceptor<'static, MemfdStore> {
    INTERCEPTOR.get_or_init(|| {
        let name = memload_config::config().store.memfd_name.clone();
        Interceptor::new(registry(), MemfdStore::new(&name))
    })
}

// ============================================================================
// Intercepted entry points
// ============================================================================

/// Intercept openat()
///
/// Substitutes only when installed as the interposed replacement; otherwise it is
/// a plain pass-through to the next `openat`.
#[no_mangle]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    match INTERCEPTOR.get() {
        Some(interceptor) if interceptor.is_hooked_by(openat) => {
            interceptor.open_at(dirfd, path, flags, mode)
        }
        _ => sys::next_openat(dirfd, path, flags, mode),
    }
}

/// Intercept openat64() (same as openat on 64-bit)
#[no_mangle]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    openat(dirfd, path, flags, mode)
}

/// Replacement handed to the inline patcher. Not exported, so it shadows nothing.
unsafe extern "C" fn memload_openat_hook(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    match INTERCEPTOR.get() {
        Some(interceptor) => interceptor.open_at(dirfd, path, flags, mode),
        None => sys::raw_openat(dirfd, path, flags, mode),
    }
}

// ============================================================================
// C API
// ============================================================================

/// Register `len` bytes at `data` to be served for the next open of a path containing
/// `fragment`. The bytes are copied. Returns 0, or -1 with errno set.
#[no_mangle]
pub unsafe extern "C" fn memload_register(
    fragment: *const c_char,
    data: *const u8,
    len: usize,
) -> c_int {
    match registry().register_raw(fragment, data, len) {
        Ok(()) => 0,
        Err(errno) => {
            sys::set_errno(errno);
            -1
        }
    }
}

/// Install the hook now. Installing twice is not an error. Returns 0, or -1 with errno set.
#[no_mangle]
pub unsafe extern "C" fn memload_install() -> c_int {
    let config = memload_config::config().hook.clone();
    match install::install(interceptor(), &config) {
        Ok(_) => 0,
        Err(e) => {
            log_preload_error!(
                "Hook installation failed",
                target = install::target(&config).to_string().as_str(),
                error = tracing::field::display(&e)
            );
            sys::set_errno(e.raw_os_error());
            -1
        }
    }
}

/// Number of registrations not yet consumed.
#[no_mangle]
pub extern "C" fn memload_pending() -> usize {
    registry().len()
}

// ============================================================================
// Module initialization (constructor)
// ============================================================================

fn startup() {
    let config = memload_config::config().clone();
    logging::init_logging(&config.log);
    let interceptor = interceptor();

    if !config.hook.auto_install {
        log_preload_info!("Auto install disabled, waiting for memload_install");
        return;
    }
    if let Err(e) = unsafe { install::install(interceptor, &config.hook) } {
        log_preload_error!(
            "Hook installation failed, opens pass through",
            error = tracing::field::display(&e)
        );
    }
}

/// Called when the library is loaded
#[used]
#[cfg_attr(any(target_os = "linux", target_os = "android"), link_section = ".init_array")]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        startup();
    }
    init
};

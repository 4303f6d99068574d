//! Raw OS helpers used on the hook path.

use std::sync::OnceLock;

use libc::{c_char, c_int, mode_t};

use crate::interceptor::OpenAtFn;

#[cfg(target_os = "linux")]
pub fn set_errno(e: c_int) {
    unsafe {
        *libc::__errno_location() = e;
    }
}

#[cfg(target_os = "android")]
pub fn set_errno(e: c_int) {
    unsafe {
        *libc::__errno() = e;
    }
}

/// `openat` straight to the kernel, bypassing every userspace definition.
///
/// Used while no original is installed so an early call never re-enters the hook.
pub unsafe fn raw_openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    libc::syscall(libc::SYS_openat, dirfd, path, flags, mode) as c_int
}

static NEXT_OPENAT: OnceLock<Option<OpenAtFn>> = OnceLock::new();

/// `openat` of the next object in lookup order (normally libc), or the raw syscall
/// when there is none.
///
/// For an exported `openat` that only shadows libc and must not intercept.
pub unsafe fn next_openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let next = NEXT_OPENAT.get_or_init(|| {
        let ptr = libc::dlsym(libc::RTLD_NEXT, c"openat".as_ptr());
        (!ptr.is_null()).then(|| std::mem::transmute::<*mut libc::c_void, OpenAtFn>(ptr))
    });
    match next {
        Some(openat) => openat(dirfd, path, flags, mode),
        None => raw_openat(dirfd, path, flags, mode),
    }
}

//! Symbol resolution and the trampoline seam.
//!
//! Redirecting a function is delegated to a [`Trampoline`]; this crate only asks it
//! once, at install time, and keeps the callable original it hands back.

use std::ffi::{c_void, CString};
use std::fmt;
use std::ptr::NonNull;

use libc::c_int;

use crate::error::HookError;

/// C ABI of an inline patcher: `int patch(void *target, void *replacement, void **original)`.
///
/// Returns 0 on success and stores a trampoline to the unmodified target in `*original`.
pub type PatchFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut *mut c_void) -> c_int;

/// Where the function to intercept lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTarget {
    /// Already-loaded library to search; `None` means the next definition after this object.
    pub library: Option<String>,
    pub symbol: String,
}

impl HookTarget {
    pub fn next(symbol: impl Into<String>) -> Self {
        Self {
            library: None,
            symbol: symbol.into(),
        }
    }

    pub fn in_library(library: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            library: Some(library.into()),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.library {
            Some(library) => write!(f, "{}!{}", library, self.symbol),
            None => write!(f, "<next>!{}", self.symbol),
        }
    }
}

/// Resolves symbol addresses in loaded objects.
pub trait SymbolResolver {
    fn resolve(&self, target: &HookTarget) -> Result<NonNull<c_void>, HookError>;

    /// Search every loaded object in load order.
    fn resolve_global(&self, symbol: &str) -> Result<NonNull<c_void>, HookError>;
}

fn c_name(name: &str) -> Result<CString, HookError> {
    CString::new(name).map_err(|_| HookError::InvalidName(name.to_string()))
}

/// `dlopen`/`dlsym` based resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlsymResolver;

impl SymbolResolver for DlsymResolver {
    fn resolve(&self, target: &HookTarget) -> Result<NonNull<c_void>, HookError> {
        let symbol = c_name(&target.symbol)?;
        let ptr = match &target.library {
            None => unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()) },
            Some(library) => {
                let name = c_name(library)?;
                // RTLD_NOLOAD: only look at what the process already mapped.
                let handle =
                    unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
                if handle.is_null() {
                    return Err(HookError::LibraryNotLoaded(library.clone()));
                }
                let ptr = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
                unsafe { libc::dlclose(handle) };
                ptr
            }
        };
        NonNull::new(ptr).ok_or_else(|| HookError::SymbolNotFound {
            library: target.library.clone(),
            symbol: target.symbol.clone(),
        })
    }

    fn resolve_global(&self, symbol: &str) -> Result<NonNull<c_void>, HookError> {
        let name = c_name(symbol)?;
        let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        NonNull::new(ptr).ok_or_else(|| HookError::SymbolNotFound {
            library: None,
            symbol: symbol.to_string(),
        })
    }
}

/// Redirects calls from a target function to a replacement.
pub trait Trampoline {
    /// Route calls of `target` to `replacement` and return a callable pointer that
    /// still reaches the unmodified `target`.
    ///
    /// # Safety
    /// Both pointers must be functions of the same signature and calling convention.
    unsafe fn redirect(
        &self,
        target: NonNull<c_void>,
        replacement: NonNull<c_void>,
    ) -> Result<NonNull<c_void>, HookError>;
}

/// Redirection already done by the dynamic linker (`LD_PRELOAD` symbol interposition).
///
/// The exported hook shadows the target for every caller, so the target itself is
/// the path back to the original.
#[derive(Debug, Default, Clone, Copy)]
pub struct Interposition;

impl Trampoline for Interposition {
    unsafe fn redirect(
        &self,
        target: NonNull<c_void>,
        _replacement: NonNull<c_void>,
    ) -> Result<NonNull<c_void>, HookError> {
        Ok(target)
    }
}

/// Inline patching through an external patcher (DobbyHook-compatible ABI).
#[derive(Clone, Copy)]
pub struct ExternPatcher {
    patch: PatchFn,
}

impl ExternPatcher {
    pub fn new(patch: PatchFn) -> Self {
        Self { patch }
    }

    /// Look the patcher entry point up among the loaded objects.
    pub fn resolve(resolver: &dyn SymbolResolver, symbol: &str) -> Result<Self, HookError> {
        let ptr = resolver.resolve_global(symbol)?;
        let patch = unsafe { std::mem::transmute::<*mut c_void, PatchFn>(ptr.as_ptr()) };
        Ok(Self::new(patch))
    }
}

impl fmt::Debug for ExternPatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternPatcher")
            .field("patch", &(self.patch as *const c_void))
            .finish()
    }
}

impl Trampoline for ExternPatcher {
    unsafe fn redirect(
        &self,
        target: NonNull<c_void>,
        replacement: NonNull<c_void>,
    ) -> Result<NonNull<c_void>, HookError> {
        let mut original: *mut c_void = std::ptr::null_mut();
        let rc = (self.patch)(target.as_ptr(), replacement.as_ptr(), &mut original);
        if rc != 0 {
            return Err(HookError::PatchFailed(rc));
        }
        NonNull::new(original).ok_or(HookError::PatchFailed(rc))
    }
}

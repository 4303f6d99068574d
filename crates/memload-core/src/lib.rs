//! # memload-core
//!
//! Serves registered in-memory content in place of shared-library files.
//!
//! A process-wide [`Registry`] maps path fragments to owned byte buffers. The
//! [`Interceptor`] sits in front of `openat`: the first registered fragment that
//! occurs in a requested path is consumed and its bytes are handed back as a
//! `memfd` descriptor rewound to offset 0. Everything else reaches the original
//! `openat` unchanged.
//!
//! ```ignore
//! use memload_core::{registry, Interceptor, MemfdStore};
//!
//! registry().register("libfoo.so", &bytes)?;
//! let interceptor = Interceptor::new(registry(), MemfdStore::default());
//! // the loader's openat("/system/lib64/libfoo.so") now yields a memfd with `bytes`
//! ```

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("memload needs memfd_create and raw openat: Linux or Android only");

pub mod error;
pub mod hook;
pub mod interceptor;
pub mod registry;
pub mod store;
pub mod sys;

pub use error::{HookError, RegistryError, SubstitutionError};
pub use hook::{
    DlsymResolver, ExternPatcher, HookTarget, Interposition, PatchFn, SymbolResolver, Trampoline,
};
pub use interceptor::{InstallState, Interceptor, OpenAtFn};
pub use registry::{registry, Claim, Registry, Substitution};
pub use store::{BackingStore, MemfdStore};

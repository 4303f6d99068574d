//! Hook installation from configuration.

use memload_config::{log_preload_info, HookConfig, HookMode};
use memload_core::{
    DlsymResolver, ExternPatcher, HookError, HookTarget, InstallState, Interceptor,
    Interposition, MemfdStore, OpenAtFn,
};

pub(crate) fn target(config: &HookConfig) -> HookTarget {
    HookTarget {
        library: config.library.clone(),
        symbol: config.symbol.clone(),
    }
}

/// Entry point the target gets redirected to in `mode`.
pub(crate) fn replacement(mode: HookMode) -> OpenAtFn {
    match mode {
        HookMode::Interpose => crate::openat,
        HookMode::Inline => crate::memload_openat_hook,
    }
}

/// Redirect the configured target. Returns whether this call installed the hook;
/// an interceptor that is already installed is left as is.
///
/// # Safety
/// Patches code in the running process when `config.mode` is inline.
pub(crate) unsafe fn install(
    interceptor: &Interceptor<'static, MemfdStore>,
    config: &HookConfig,
) -> Result<bool, HookError> {
    if interceptor.state() == InstallState::Installed {
        return Ok(false);
    }
    let target = target(config);
    let replacement = replacement(config.mode);
    let resolver = DlsymResolver;

    let installed = match config.mode {
        HookMode::Interpose => {
            interceptor.ensure_installed(&target, replacement, &resolver, &Interposition)?
        }
        HookMode::Inline => {
            let patcher = ExternPatcher::resolve(&resolver, &config.patcher_symbol)?;
            interceptor.ensure_installed(&target, replacement, &resolver, &patcher)?
        }
    };

    if installed {
        log_preload_info!(
            "Hook installed",
            mode = config.mode.to_string().as_str(),
            target = target.to_string().as_str()
        );
    }
    Ok(installed)
}

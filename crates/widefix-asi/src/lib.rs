//! # widefix
//!
//! DLL loaded into the game (as an ASI plugin or a proxy DLL). Attaching
//! opens `widefix.log` next to the host executable and starts the init worker;
//! everything else happens on that worker.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use widefix_core::hook::HookStats;
use widefix_core::runtime::{self, FixStatus, InstalledHooks, RuntimeOptions, Status};
use widefix_core::{Result, ShutdownSignal};

pub const LOG_FILE_NAME: &str = "widefix.log";

struct Attached {
    status: Arc<FixStatus>,
    shutdown: Arc<ShutdownSignal>,
    hooks: Arc<InstalledHooks>,
}

static ATTACHED: OnceLock<Attached> = OnceLock::new();

/// Log file path for a config file path (both live next to the executable).
pub fn log_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(LOG_FILE_NAME)
}

/// Route `tracing` output to `path`, truncating it.
///
/// Keeps an already installed subscriber, e.g. when the host loads the DLL twice.
pub fn init_logging(path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("widefix=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}

/// Start the worker for the current process. Runs at most once.
pub fn attach() -> Result<()> {
    if ATTACHED.get().is_some() {
        return Ok(());
    }

    let options = RuntimeOptions::for_current_exe()?;
    init_logging(&log_path(&options.config_path))?;
    info!(
        "widefix {} attached to {}",
        env!("CARGO_PKG_VERSION"),
        options.executable
    );

    let runtime = runtime::spawn(options)?;
    let _ = ATTACHED.set(Attached {
        status: runtime.status_handle(),
        shutdown: runtime.shutdown_signal(),
        hooks: runtime.hooks(),
    });
    Ok(())
}

/// Stop waiting for the game module.
///
/// When the DLL is unloaded while the game keeps running, hooked sites get
/// their original bytes back so nothing jumps into unmapped stubs. On process
/// exit applied patches and hooks stay in place.
pub fn detach(unloading: bool) {
    let Some(attached) = ATTACHED.get() else {
        return;
    };
    attached.shutdown.trigger();
    if !unloading {
        return;
    }
    match attached.hooks.uninstall() {
        Ok(0) => {}
        Ok(restored) => info!("Removed {} hooks before unload", restored),
        Err(e) => warn!("Failed to remove hooks before unload: {}", e),
    }
}

pub fn status() -> Status {
    ATTACHED
        .get()
        .map(|a| a.status.get())
        .unwrap_or(Status::Pending)
}

/// Per-hook call counters, empty until the worker has installed hooks.
pub fn hook_stats() -> Vec<HookStats> {
    ATTACHED
        .get()
        .map(|a| a.hooks.stats())
        .unwrap_or_default()
}

/// Total calls routed through this plugin's hooks.
#[unsafe(no_mangle)]
pub extern "C" fn widefix_hook_hits() -> u64 {
    hook_stats().iter().map(|s| s.hits).sum()
}

/// Current [`Status`] as its numeric value, for other plugins and tools.
#[unsafe(no_mangle)]
pub extern "C" fn widefix_status() -> u8 {
    status() as u8
}

#[cfg(target_os = "windows")]
#[unsafe(no_mangle)]
pub extern "system" fn DllMain(
    module: windows::Win32::Foundation::HINSTANCE,
    reason: u32,
    reserved: *mut std::ffi::c_void,
) -> windows::Win32::Foundation::BOOL {
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    match reason {
        DLL_PROCESS_ATTACH => {
            // SAFETY: `module` is the handle the loader passed for this DLL.
            let _ = unsafe { DisableThreadLibraryCalls(HMODULE(module.0)) };
            // Failures are logged; the game keeps running unmodified.
            if let Err(e) = attach() {
                error!("Failed to start: {}", e);
            }
        }
        // A null `reserved` means FreeLibrary rather than process exit.
        DLL_PROCESS_DETACH => detach(reserved.is_null()),
        _ => {}
    }
    true.into()
}

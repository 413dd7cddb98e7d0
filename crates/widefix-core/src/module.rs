//! Resolution of loaded modules into scannable regions.

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::RetryStrategy;
use crate::scanner::MemoryRegion;
use crate::shutdown::ShutdownSignal;

/// A module mapped into the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

impl ModuleInfo {
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base, self.size)
    }
}

/// Access to the operating system's loaded-module table.
pub trait ModuleProvider: Send + Sync {
    fn find_module(&self, name: &str) -> Option<ModuleInfo>;

    /// The executable image of the current process.
    fn main_module(&self) -> Option<ModuleInfo>;
}

/// Polls a [`ModuleProvider`] until a module appears or the retry budget runs out.
pub struct ModuleLocator<'a, P: ModuleProvider + ?Sized> {
    provider: &'a P,
}

impl<'a, P: ModuleProvider + ?Sized> ModuleLocator<'a, P> {
    pub fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    /// Locate `name`, waiting between attempts as `retry` dictates.
    ///
    /// Gives up with [`Error::ModuleNotFound`] after the last attempt or as
    /// soon as `shutdown` is triggered.
    pub fn locate(
        &self,
        name: &str,
        retry: &dyn RetryStrategy,
        shutdown: &ShutdownSignal,
    ) -> Result<ModuleInfo> {
        self.poll(name, retry, shutdown, || self.provider.find_module(name))
    }

    /// Like [`locate`](Self::locate), for the process executable itself.
    pub fn locate_main(
        &self,
        retry: &dyn RetryStrategy,
        shutdown: &ShutdownSignal,
    ) -> Result<ModuleInfo> {
        self.poll("main executable", retry, shutdown, || self.provider.main_module())
    }

    fn poll<F>(
        &self,
        name: &str,
        retry: &dyn RetryStrategy,
        shutdown: &ShutdownSignal,
        lookup: F,
    ) -> Result<ModuleInfo>
    where
        F: Fn() -> Option<ModuleInfo>,
    {
        let max_attempts = retry.max_attempts().max(1);
        let mut attempts = 0u32;

        while attempts < max_attempts {
            attempts += 1;

            if let Some(module) = lookup() {
                info!(
                    "Located module {} at {:#x} ({:#x} bytes, attempt {}/{})",
                    module.name, module.base, module.size, attempts, max_attempts
                );
                return Ok(module);
            }

            if attempts == max_attempts {
                break;
            }

            let delay = retry.delay_after(attempts);
            debug!(
                "Module {} not loaded yet, retrying in {}ms (attempt {}/{})",
                name,
                delay.as_millis(),
                attempts,
                max_attempts
            );
            if shutdown.wait(delay) {
                warn!("Shutdown requested while waiting for module {}", name);
                break;
            }
        }

        Err(Error::ModuleNotFound {
            module: name.to_string(),
            attempts,
        })
    }
}

/// Modules of the current process, via the Win32 loader.
#[cfg(target_os = "windows")]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessModules;

#[cfg(target_os = "windows")]
impl ProcessModules {
    fn query(handle: windows::Win32::Foundation::HMODULE, name: &str) -> Option<ModuleInfo> {
        use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
        use windows::Win32::System::Threading::GetCurrentProcess;

        let mut info = MODULEINFO::default();
        // SAFETY: the handle was returned by the loader for this process and
        // MODULEINFO is a plain out-parameter of the size we pass.
        unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                handle,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
        }
        .ok()?;

        Some(ModuleInfo {
            name: name.to_string(),
            base: info.lpBaseOfDll as usize,
            size: info.SizeOfImage as usize,
        })
    }
}

#[cfg(target_os = "windows")]
impl ModuleProvider for ProcessModules {
    fn find_module(&self, name: &str) -> Option<ModuleInfo> {
        use windows::Win32::System::LibraryLoader::GetModuleHandleW;
        use windows::core::HSTRING;

        let wide = HSTRING::from(name);
        // SAFETY: GetModuleHandleW does not take a reference on the module and
        // only reads the NUL-terminated name.
        let handle = unsafe { GetModuleHandleW(&wide) }.ok()?;
        Self::query(handle, name)
    }

    fn main_module(&self) -> Option<ModuleInfo> {
        use windows::Win32::System::LibraryLoader::GetModuleHandleW;
        use windows::core::PCWSTR;

        // SAFETY: a null name returns the handle of the process executable.
        let handle = unsafe { GetModuleHandleW(PCWSTR::null()) }.ok()?;
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        Self::query(handle, &name)
    }
}

//! In-process initialization on a dedicated worker thread.
//!
//! The loader lock is held while the host calls into the DLL, so nothing here
//! runs on the attaching thread: [`spawn`] starts a worker that waits for the
//! game module, applies the selected profile and publishes a [`Status`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use strum::Display;
use tracing::{error, info, warn};

use crate::config::{FixConfig, Settings, system_display};
use crate::error::{Error, Result};
use crate::fix::{FixReport, FixRunner, HookTarget, Target};
use crate::hook::{HookRegistry, HookStats};
use crate::memory::CodeMemory;
use crate::module::{ModuleInfo, ModuleLocator, ModuleProvider};
use crate::profile::{GameProfile, ProfileSet};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::shutdown::ShutdownSignal;

/// File read from the host executable's directory.
pub const CONFIG_FILE_NAME: &str = "widefix.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum Status {
    Pending = 0,
    Running = 1,
    Applied = 2,
    Failed = 3,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Pending,
            1 => Status::Running,
            2 => Status::Applied,
            _ => Status::Failed,
        }
    }
}

/// Status readable from any thread.
#[derive(Debug)]
pub struct FixStatus(AtomicU8);

impl FixStatus {
    pub fn new() -> Self {
        Self(AtomicU8::new(Status::Pending as u8))
    }

    pub fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }
}

impl Default for FixStatus {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveHooks {
    registry: HookRegistry,
    memory: Box<dyn CodeMemory + Send>,
}

/// Hooks the worker installed, with the module they patch.
///
/// Sites must be restored before the code their stubs call is unloaded.
#[derive(Default)]
pub struct InstalledHooks(Mutex<Option<ActiveHooks>>);

impl InstalledHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `registry` and the memory its sites live in.
    pub fn store(&self, registry: HookRegistry, memory: Box<dyn CodeMemory + Send>) {
        if registry.is_empty() {
            return;
        }
        *self.lock() = Some(ActiveHooks { registry, memory });
    }

    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, |active| active.registry.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<HookStats> {
        self.lock()
            .as_ref()
            .map(|active| active.registry.stats())
            .unwrap_or_default()
    }

    /// Write the original bytes back at every hooked site.
    ///
    /// Returns how many sites were restored; hooks that could not be removed
    /// stay registered.
    pub fn uninstall(&self) -> Result<usize> {
        let mut guard = self.lock();
        let Some(active) = guard.as_mut() else {
            return Ok(0);
        };
        let restored = active.registry.uninstall_all(&mut *active.memory)?;
        *guard = None;
        Ok(restored)
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveHooks>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What the worker needs to know about its host.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Executable file name used to select a profile.
    pub executable: String,
    /// `widefix.toml` holding the `[fix]` table and `[[profile]]` entries.
    pub config_path: PathBuf,
    pub retry: ExponentialBackoff,
}

impl RuntimeOptions {
    /// Options for the current process: its executable name, with the config
    /// file next to it.
    pub fn for_current_exe() -> Result<Self> {
        let exe = std::env::current_exe()?;
        let executable = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidConfig("host executable has no file name".into()))?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self {
            executable,
            config_path: dir.join(CONFIG_FILE_NAME),
            retry: ExponentialBackoff::default(),
        })
    }
}

/// Handle to a running worker.
pub struct Runtime {
    status: Arc<FixStatus>,
    shutdown: Arc<ShutdownSignal>,
    hooks: Arc<InstalledHooks>,
    thread: Option<JoinHandle<()>>,
}

impl Runtime {
    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn status_handle(&self) -> Arc<FixStatus> {
        Arc::clone(&self.status)
    }

    /// Cancel a pending module wait. Fixes already applied stay applied.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.shutdown)
    }

    /// Hooks installed by the worker, once it has applied the profile.
    pub fn hooks(&self) -> Arc<InstalledHooks> {
        Arc::clone(&self.hooks)
    }

    /// Wait for the worker to finish.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Init thread panicked");
                self.status.set(Status::Failed);
            }
        }
    }
}

/// Start the worker thread.
pub fn spawn(options: RuntimeOptions) -> Result<Runtime> {
    let status = Arc::new(FixStatus::new());
    let shutdown = Arc::new(ShutdownSignal::new());

    let hooks = Arc::new(InstalledHooks::new());

    let worker_status = Arc::clone(&status);
    let worker_shutdown = Arc::clone(&shutdown);
    let worker_hooks = Arc::clone(&hooks);
    let thread = thread::Builder::new()
        .name("widefix-init".into())
        .spawn(move || {
            worker_status.set(Status::Running);
            let result = run_in_process(&options, &worker_shutdown, &worker_hooks);
            worker_status.set(publish(result));
        })?;

    Ok(Runtime {
        status,
        shutdown,
        hooks,
        thread: Some(thread),
    })
}

fn publish(result: Result<FixReport>) -> Status {
    match result {
        Ok(report) if report.failed() == 0 => {
            info!(
                "Profile '{}' applied ({} fixes)",
                report.profile,
                report.applied()
            );
            Status::Applied
        }
        Ok(report) => {
            error!(
                "Profile '{}': {} of {} fixes failed",
                report.profile,
                report.failed(),
                report.outcomes.len()
            );
            Status::Failed
        }
        Err(e) if e.is_unsupported_target() => {
            error!("Game version not supported: {}", e);
            Status::Failed
        }
        Err(e) => {
            error!("Initialization failed: {}", e);
            Status::Failed
        }
    }
}

/// Settings and the profile for `executable`, both read from `content`.
pub fn load_host_config(content: &str, executable: &str) -> Result<(Settings, GameProfile)> {
    let config = FixConfig::from_toml_str(content)?;
    let profiles = ProfileSet::from_toml_str(content)?;
    let profile = profiles
        .select(executable)
        .ok_or_else(|| Error::ProfileNotFound(executable.to_string()))?
        .clone();
    let display = system_display();
    Ok((config.resolve(display.as_ref()), profile))
}

/// Locate `profile`'s module (the executable when it names none) and apply
/// its fixes to it. Returns the report and the opened module memory.
pub fn apply_to_module<P, M, F>(
    profile: &GameProfile,
    settings: Settings,
    provider: &P,
    retry: &dyn RetryStrategy,
    shutdown: &ShutdownSignal,
    open: F,
    hooks: Option<HookTarget<'_>>,
) -> Result<(FixReport, M)>
where
    P: ModuleProvider + ?Sized,
    M: CodeMemory,
    F: FnOnce(&ModuleInfo) -> Result<M>,
{
    let locator = ModuleLocator::new(provider);
    let module = match profile.module.as_deref() {
        Some(name) => locator.locate(name, retry, shutdown)?,
        None => locator.locate_main(retry, shutdown)?,
    };
    let mut memory = open(&module)?;
    let report = FixRunner::new(settings, Target::Process).run(profile, &mut memory, hooks);
    Ok((report, memory))
}

fn run_in_process(
    options: &RuntimeOptions,
    shutdown: &ShutdownSignal,
    hooks: &InstalledHooks,
) -> Result<FixReport> {
    let content = match fs::read_to_string(&options.config_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "{} not found, no profiles to apply",
                options.config_path.display()
            );
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    let (settings, profile) = load_host_config(&content, &options.executable)?;
    if !settings.enabled {
        info!("Fix disabled in {}", options.config_path.display());
    }
    info!(
        "Selected profile '{}' for {}",
        profile.name, options.executable
    );
    attach(&profile, settings, &options.retry, shutdown, hooks)
}

#[cfg(target_os = "windows")]
fn attach(
    profile: &GameProfile,
    settings: Settings,
    retry: &dyn RetryStrategy,
    shutdown: &ShutdownSignal,
    hooks: &InstalledHooks,
) -> Result<FixReport> {
    use crate::hook::alloc::NearAllocator;
    use crate::memory::ProcessMemory;
    use crate::module::ProcessModules;

    let mut registry = HookRegistry::native()?;
    let mut exec = NearAllocator::new();
    let (report, memory) = apply_to_module(
        profile,
        settings,
        &ProcessModules,
        retry,
        shutdown,
        // SAFETY: the region comes from the loader and the module is never
        // unloaded while the game runs.
        |module| Ok(unsafe { ProcessMemory::new(module.region()) }),
        Some(HookTarget {
            registry: &mut registry,
            exec: &mut exec,
        }),
    )?;

    for stats in registry.stats() {
        info!("Hook '{}' active", stats.name);
    }
    hooks.store(registry, Box::new(memory));
    Ok(report)
}

#[cfg(not(target_os = "windows"))]
fn attach(
    _profile: &GameProfile,
    _settings: Settings,
    _retry: &dyn RetryStrategy,
    _shutdown: &ShutdownSignal,
    _hooks: &InstalledHooks,
) -> Result<FixReport> {
    Err(Error::UnsupportedPlatform("in-process patching needs Windows"))
}

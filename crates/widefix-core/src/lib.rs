//! # widefix-core
//!
//! Engine for widescreen and field-of-view fixes to legacy games.
//!
//! This crate provides:
//! - Wildcard byte signatures and scanning of module images
//! - Module location with bounded, cancellable retry
//! - Bounds-checked patching (in-process or of an executable on disk)
//! - Mid-function hooks that hand the CPU state to Rust callbacks
//! - Aspect-ratio and FOV math
//! - Game profiles, user configuration and the fix controller

pub mod config;
pub mod error;
pub mod fix;
pub mod hook;
pub mod memory;
pub mod module;
pub mod profile;
pub mod retry;
pub mod runtime;
pub mod scanner;
pub mod shutdown;
pub mod signature;
pub mod transform;

pub use config::{ConfigOverrides, DisplayInfo, FixConfig, NoDisplay, Settings, system_display};
pub use error::{Error, Result};
pub use fix::{
    FileOptions, FixOutcome, FixReport, FixRunner, FixState, HookTarget, Target, patch_file,
};
pub use hook::{CpuContext, HookFlavor, HookHandle, HookRegistry, HookRequest, HookStats, Register};
pub use memory::{BufferMemory, CodeMemory, PatchPlan, PatchSite, Patcher};
pub use module::{ModuleInfo, ModuleLocator, ModuleProvider};
pub use profile::{FixDef, GameProfile, HookEffect, ProfileSet, SiteAction, SiteDef, SiteLocator};
pub use retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryStrategy};
pub use runtime::{FixStatus, InstalledHooks, Runtime, RuntimeOptions, Status};
pub use scanner::{BatchScan, MemoryRegion, Occurrence, find, find_all, scan_batch};
pub use shutdown::ShutdownSignal;
pub use signature::ByteSignature;
pub use transform::{AngleUnit, BASE_ASPECT_RATIO, Resolution, aspect_ratio, rescale_hfov};

#[cfg(target_os = "windows")]
pub use memory::ProcessMemory;
#[cfg(target_os = "windows")]
pub use module::ProcessModules;

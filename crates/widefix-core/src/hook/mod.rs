//! Mid-function hooks.
//!
//! Installing a hook overwrites whole instructions at a site with a `jmp` to
//! a generated stub. The stub hands the interrupted CPU state to a Rust
//! callback through [`CpuContext`], then either replays the displaced
//! instructions ([`HookFlavor::Resume`]) or skips them
//! ([`HookFlavor::Replace`]) before returning behind the site.
//!
//! The site is only written after the stub is fully committed, so a thread
//! reaching the site never sees a half-built hook.

pub mod alloc;
pub mod context;
pub mod stub;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

pub use alloc::{ExecutableMemory, STUB_CAPACITY};
pub use context::{Arch, CpuContext, HookContext, HookFrame, Register};
pub use stub::{CallConv, JMP_REL32_LEN};

use crate::error::{Error, Result};
use crate::memory::{CodeMemory, PatchSite, Patcher, hex};

/// Longest run of instructions the site jump can displace.
const MAX_STOLEN_WINDOW: usize = 32;

/// What happens to the instructions the site jump displaces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HookFlavor {
    /// Run the callback, then the displaced instructions.
    #[default]
    Resume,
    /// Run the callback instead of the displaced instructions.
    Replace,
}

/// Hook logic. Runs on the game's thread and must not block or allocate.
pub type HookCallback = Box<dyn Fn(&mut dyn CpuContext) + Send + Sync>;

pub struct HookRequest {
    pub name: String,
    pub address: usize,
    pub flavor: HookFlavor,
    pub callback: HookCallback,
}

impl HookRequest {
    pub fn new(
        name: impl Into<String>,
        address: usize,
        flavor: HookFlavor,
        callback: impl Fn(&mut dyn CpuContext) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            flavor,
            callback: Box::new(callback),
        }
    }
}

/// State the stub passes to [`dispatch`] alongside the frame.
struct HookSlot {
    name: String,
    arch: Arch,
    stack_skip: u64,
    callback: HookCallback,
    hits: AtomicU64,
    panics: AtomicU32,
}

/// Entry point every stub calls.
extern "C" fn dispatch(frame: *mut HookFrame, slot: *const HookSlot) {
    if frame.is_null() || slot.is_null() {
        return;
    }
    // SAFETY: stubs pass their own stack frame and the slot address baked in
    // at install time; slots are leaked and never freed.
    let (frame, slot) = unsafe { (&mut *frame, &*slot) };
    slot.hits.fetch_add(1, Ordering::Relaxed);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `frame.regs` points at the registers the stub just pushed,
        // in the layout of the stub's architecture.
        let mut ctx = unsafe { HookContext::new(frame, slot.arch, slot.stack_skip) };
        (slot.callback)(&mut ctx);
    }));
    if outcome.is_err() {
        slot.panics.fetch_add(1, Ordering::Relaxed);
    }
}

/// Identity of an installed hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookHandle {
    pub name: String,
    pub address: usize,
    pub stub: usize,
    pub stolen_len: usize,
    pub flavor: HookFlavor,
}

/// Per-hook counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookStats {
    pub name: String,
    pub hits: u64,
    pub panics: u32,
}

/// A hook whose stub is committed but whose site is still untouched.
pub struct PreparedHook {
    handle: HookHandle,
    slot: &'static HookSlot,
    jump: Vec<u8>,
}

impl PreparedHook {
    pub fn handle(&self) -> &HookHandle {
        &self.handle
    }

    /// Bytes to write at the site to activate the hook.
    pub fn site_bytes(&self) -> &[u8] {
        &self.jump
    }
}

/// Bytes at `address` that a site jump could displace.
pub fn read_site<M: CodeMemory + ?Sized>(memory: &M, address: usize) -> Result<Vec<u8>> {
    let region = memory.region();
    if !region.contains_range(address, JMP_REL32_LEN) {
        return Err(Error::PatchOutOfBounds {
            address,
            len: JMP_REL32_LEN,
            region,
        });
    }
    let window = (region.end() - address).min(MAX_STOLEN_WINDOW);
    let mut code = vec![0u8; window];
    memory.read(address, &mut code)?;
    Ok(code)
}

struct InstalledHook {
    handle: HookHandle,
    slot: &'static HookSlot,
    site: PatchSite,
}

/// Owns every hook installed into one module.
///
/// Callbacks live for the rest of the process: a thread may still be inside
/// a stub after its hook is removed, so slots and stubs are never freed.
pub struct HookRegistry {
    conv: CallConv,
    dispatch: u64,
    hooks: Vec<InstalledHook>,
}

impl HookRegistry {
    /// Registry for hooks into code of this build's architecture.
    pub fn native() -> Result<Self> {
        let conv = CallConv::native()
            .ok_or(Error::UnsupportedPlatform("hooks need an x86 or x86-64 target"))?;
        let entry: extern "C" fn(*mut HookFrame, *const HookSlot) = dispatch;
        Ok(Self::with_convention(conv, entry as usize as u64))
    }

    /// Registry whose stubs call `dispatch` using `conv`.
    pub fn with_convention(conv: CallConv, dispatch: u64) -> Self {
        Self {
            conv,
            dispatch,
            hooks: Vec::new(),
        }
    }

    pub fn convention(&self) -> CallConv {
        self.conv
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = &HookHandle> {
        self.hooks.iter().map(|h| &h.handle)
    }

    pub fn stats(&self) -> Vec<HookStats> {
        self.hooks
            .iter()
            .map(|h| HookStats {
                name: h.slot.name.clone(),
                hits: h.slot.hits.load(Ordering::Relaxed),
                panics: h.slot.panics.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Build and commit the stub for `request` without touching the site.
    pub fn prepare<M, E>(&self, memory: &M, exec: &mut E, request: HookRequest) -> Result<PreparedHook>
    where
        M: CodeMemory + ?Sized,
        E: ExecutableMemory + ?Sized,
    {
        let code = read_site(memory, request.address)?;
        self.prepare_from(&code, exec, request)
    }

    /// Like [`prepare`](Self::prepare), decoding `code` as the bytes at the
    /// site instead of reading them.
    ///
    /// Lets a caller hook code it has planned (but not yet written) changes to.
    pub fn prepare_from<E>(&self, code: &[u8], exec: &mut E, request: HookRequest) -> Result<PreparedHook>
    where
        E: ExecutableMemory + ?Sized,
    {
        let address = request.address;
        let arch = self.conv.arch();
        let stolen = stub::steal_instructions(code, address as u64, arch.bitness())?;
        debug!(
            "Hook '{}' displaces {} bytes at {:#x}: {}",
            request.name,
            stolen.len,
            address,
            hex(&code[..stolen.len])
        );

        let stub_address = exec.reserve(address, STUB_CAPACITY)?;
        let slot = Box::new(HookSlot {
            name: request.name,
            arch,
            stack_skip: self.conv.stack_skip(),
            callback: request.callback,
            hits: AtomicU64::new(0),
            panics: AtomicU32::new(0),
        });
        let slot_address = &*slot as *const HookSlot as usize as u64;

        let relocated: &[_] = match request.flavor {
            HookFlavor::Resume => &stolen.instructions,
            HookFlavor::Replace => &[],
        };
        let code = stub::assemble_stub(&stub::StubLayout {
            conv: self.conv,
            address: stub_address as u64,
            site: address as u64,
            dispatch: self.dispatch,
            slot: slot_address,
            relocated,
            resume_at: (address + stolen.len) as u64,
        })?;
        if code.len() > STUB_CAPACITY {
            return Err(Error::HookInstall {
                address,
                reason: format!("stub needs {} bytes, {} reserved", code.len(), STUB_CAPACITY),
            });
        }

        let jump = stub::site_jump(address as u64, stub_address as u64, stolen.len).ok_or_else(
            || Error::HookInstall {
                address,
                reason: format!("stub at {:#x} is out of jump range", stub_address),
            },
        )?;

        exec.commit(stub_address, &code)?;
        let slot: &'static HookSlot = Box::leak(slot);

        Ok(PreparedHook {
            handle: HookHandle {
                name: slot.name.clone(),
                address,
                stub: stub_address,
                stolen_len: stolen.len,
                flavor: request.flavor,
            },
            slot,
            jump,
        })
    }

    /// Record a prepared hook whose site bytes have been written.
    pub fn activate(&mut self, prepared: PreparedHook, site: PatchSite) -> HookHandle {
        info!(
            "Installed {} hook '{}' at {:#x} (stub {:#x})",
            prepared.handle.flavor, prepared.handle.name, prepared.handle.address, prepared.handle.stub
        );
        let handle = prepared.handle.clone();
        self.hooks.push(InstalledHook {
            handle: prepared.handle,
            slot: prepared.slot,
            site,
        });
        handle
    }

    /// Prepare `request` and write its site jump.
    pub fn install<M, E>(&mut self, memory: &mut M, exec: &mut E, request: HookRequest) -> Result<HookHandle>
    where
        M: CodeMemory + ?Sized,
        E: ExecutableMemory + ?Sized,
    {
        let prepared = self.prepare(&*memory, exec, request)?;
        let site = Patcher::new(memory).patch(prepared.handle.address, &prepared.jump)?;
        Ok(self.activate(prepared, site))
    }

    /// Put the original bytes back at every site, newest hook first.
    ///
    /// Returns how many sites were restored. Stubs stay mapped.
    pub fn uninstall_all<M>(&mut self, memory: &mut M) -> Result<usize>
    where
        M: CodeMemory + ?Sized,
    {
        let mut restored = 0;
        while let Some(hook) = self.hooks.pop() {
            let mut patcher = Patcher::new(&mut *memory);
            if let Err(e) = patcher.patch(hook.site.address, &hook.site.original) {
                warn!("Failed to remove hook '{}': {}", hook.handle.name, e);
                self.hooks.push(hook);
                return Err(e);
            }
            restored += 1;
        }
        Ok(restored)
    }
}

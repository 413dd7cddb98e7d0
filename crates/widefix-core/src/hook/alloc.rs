//! Executable memory for hook stubs.

use crate::error::Result;

/// Room reserved for one stub, relocated instructions included.
pub const STUB_CAPACITY: usize = 512;

/// Source of executable memory reachable from hook sites.
pub trait ExecutableMemory {
    /// Reserve `size` bytes within `rel32` reach of `near`.
    fn reserve(&mut self, near: usize, size: usize) -> Result<usize>;

    /// Copy finished code to an address returned by [`reserve`](Self::reserve).
    fn commit(&mut self, address: usize, code: &[u8]) -> Result<()>;
}

/// Bump allocator over pages allocated close to the hook sites.
///
/// Pages are never freed: a thread may still be executing a stub after its
/// hook has been removed.
#[cfg(target_os = "windows")]
#[derive(Debug, Default)]
pub struct NearAllocator {
    blocks: Vec<Block>,
}

#[cfg(target_os = "windows")]
#[derive(Debug)]
struct Block {
    base: usize,
    used: usize,
}

#[cfg(target_os = "windows")]
const BLOCK_SIZE: usize = 0x1000;

/// Search window on either side of the site; half the reach of `rel32`.
#[cfg(all(target_os = "windows", target_pointer_width = "64"))]
const MAX_MEMORY_RANGE: usize = 0x4000_0000;

#[cfg(target_os = "windows")]
impl NearAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_range(near: usize, address: usize) -> bool {
        #[cfg(target_pointer_width = "64")]
        {
            address.abs_diff(near) < MAX_MEMORY_RANGE
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            let _ = (near, address);
            true
        }
    }

    #[cfg(target_pointer_width = "64")]
    fn allocate_block(near: usize) -> Option<usize> {
        use windows::Win32::System::Memory::{
            MEM_COMMIT, MEM_FREE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
            VirtualAlloc, VirtualQuery,
        };
        use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

        let mut si = SYSTEM_INFO::default();
        // SAFETY: plain out-parameter.
        unsafe { GetSystemInfo(&mut si) };
        let granularity = si.dwAllocationGranularity as usize;
        let min_addr = (si.lpMinimumApplicationAddress as usize)
            .max(near.saturating_sub(MAX_MEMORY_RANGE));
        let max_addr = (si.lpMaximumApplicationAddress as usize)
            .min(near.saturating_add(MAX_MEMORY_RANGE))
            .saturating_sub(BLOCK_SIZE);

        let query = |address: usize| {
            let mut mbi = MEMORY_BASIC_INFORMATION::default();
            // SAFETY: VirtualQuery accepts any address and fills the struct.
            let written = unsafe {
                VirtualQuery(
                    Some(address as *const _),
                    &mut mbi,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            (written != 0).then_some(mbi)
        };
        let try_alloc = |address: usize| {
            // SAFETY: requests fresh pages at a free address; failure returns null.
            let block = unsafe {
                VirtualAlloc(
                    Some(address as *const _),
                    BLOCK_SIZE,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_EXECUTE_READWRITE,
                )
            };
            (!block.is_null()).then_some(block as usize)
        };

        let aligned = near - near % granularity;

        // Below the site first, then above.
        let mut address = aligned.saturating_sub(granularity);
        while address >= min_addr && address > 0 {
            let mbi = query(address)?;
            if mbi.State == MEM_FREE {
                if let Some(block) = try_alloc(address) {
                    return Some(block);
                }
            }
            let base = mbi.AllocationBase as usize;
            let next = if base != 0 && base < address {
                base
            } else {
                address
            };
            address = next.saturating_sub(granularity);
            address -= address % granularity;
        }

        let mut address = aligned + granularity;
        while address <= max_addr {
            let mbi = query(address)?;
            if mbi.State == MEM_FREE {
                if let Some(block) = try_alloc(address) {
                    return Some(block);
                }
            }
            let end = (mbi.BaseAddress as usize).saturating_add(mbi.RegionSize);
            address = end.max(address + granularity);
            address = address.div_ceil(granularity) * granularity;
        }

        None
    }

    #[cfg(not(target_pointer_width = "64"))]
    fn allocate_block(_near: usize) -> Option<usize> {
        use windows::Win32::System::Memory::{
            MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAlloc,
        };

        // SAFETY: fresh anonymous allocation; every address is in rel32 reach.
        let block =
            unsafe { VirtualAlloc(None, BLOCK_SIZE, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE) };
        (!block.is_null()).then_some(block as usize)
    }
}

#[cfg(target_os = "windows")]
impl ExecutableMemory for NearAllocator {
    fn reserve(&mut self, near: usize, size: usize) -> Result<usize> {
        use crate::error::Error;
        use tracing::debug;

        let size = size.next_multiple_of(16);
        if size > BLOCK_SIZE {
            return Err(Error::AllocationFailed { near });
        }

        let existing = self
            .blocks
            .iter_mut()
            .find(|b| Self::in_range(near, b.base) && BLOCK_SIZE - b.used >= size);
        let block = match existing {
            Some(block) => block,
            None => {
                let base = Self::allocate_block(near).ok_or(Error::AllocationFailed { near })?;
                debug!("Allocated stub block at {:#x} for site {:#x}", base, near);
                self.blocks.push(Block { base, used: 0 });
                let last = self.blocks.len() - 1;
                &mut self.blocks[last]
            }
        };

        let address = block.base + block.used;
        block.used += size;
        Ok(address)
    }

    fn commit(&mut self, address: usize, code: &[u8]) -> Result<()> {
        use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows::Win32::System::Threading::GetCurrentProcess;

        // SAFETY: `address` came from `reserve`, which handed out at least
        // `code.len()` writable bytes in a block we own.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), address as *mut u8, code.len());
            let _ = FlushInstructionCache(GetCurrentProcess(), Some(address as *const _), code.len());
        }
        Ok(())
    }
}

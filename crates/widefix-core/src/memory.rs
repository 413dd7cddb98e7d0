//! Bounds-checked byte patching of module images.
//!
//! All writes go through a [`CodeMemory`] whose region has been validated
//! (a mapped module, or a file image held in a buffer). A patch either writes
//! exactly the requested bytes or nothing at all.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::scanner::MemoryRegion;

pub const NOP: u8 = 0x90;

/// Readable and writable view of one validated region.
pub trait CodeMemory {
    fn region(&self) -> MemoryRegion;

    /// Entire region as a byte slice, for scanning.
    fn bytes(&self) -> &[u8];

    /// Copy bytes starting at `address` into `buf`.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<()> {
        let region = self.region();
        if !region.contains_range(address, buf.len()) {
            return Err(Error::PatchOutOfBounds {
                address,
                len: buf.len(),
                region,
            });
        }
        let start = address - region.base;
        buf.copy_from_slice(&self.bytes()[start..start + buf.len()]);
        Ok(())
    }

    /// Overwrite `[address, address + bytes.len())`.
    ///
    /// Implementations may assume the range has been bounds-checked.
    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()>;
}

/// A byte buffer addressed from a nominal base (file images, tests).
#[derive(Debug, Clone)]
pub struct BufferMemory {
    base: usize,
    data: Vec<u8>,
}

impl BufferMemory {
    pub fn new(base: usize, data: Vec<u8>) -> Self {
        Self { base, data }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl CodeMemory for BufferMemory {
    fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base, self.data.len())
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        let region = self.region();
        if !region.contains_range(address, bytes.len()) {
            return Err(Error::PatchOutOfBounds {
                address,
                len: bytes.len(),
                region,
            });
        }
        let start = address - region.base;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

/// A module image mapped into the current process.
///
/// Writes temporarily make the pages writable, since code sections are
/// mapped read/execute only and W^X must be respected.
#[cfg(target_os = "windows")]
pub struct ProcessMemory {
    region: MemoryRegion,
}

#[cfg(target_os = "windows")]
impl ProcessMemory {
    /// # Safety
    ///
    /// `region` must describe a module image that stays mapped for the
    /// lifetime of the returned value.
    pub unsafe fn new(region: MemoryRegion) -> Self {
        Self { region }
    }
}

#[cfg(target_os = "windows")]
impl CodeMemory for ProcessMemory {
    fn region(&self) -> MemoryRegion {
        self.region
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the constructor contract guarantees the image is mapped.
        unsafe { std::slice::from_raw_parts(self.region.base as *const u8, self.region.len) }
    }

    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows::Win32::System::Memory::{
            PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualProtect,
        };
        use windows::Win32::System::Threading::GetCurrentProcess;

        let target = address as *mut u8;
        let mut old_protect = PAGE_PROTECTION_FLAGS(0);

        // SAFETY: the caller bounds-checked the range against the mapped image.
        unsafe {
            VirtualProtect(
                target.cast(),
                bytes.len(),
                PAGE_EXECUTE_READWRITE,
                &mut old_protect,
            )
        }
        .map_err(|e| Error::MemoryProtect {
            address,
            message: e.to_string(),
        })?;

        // SAFETY: the pages are writable now and the range is inside the image.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), target, bytes.len());
        }

        let mut ignored = PAGE_PROTECTION_FLAGS(0);
        // SAFETY: restores the protection captured above on the same range.
        unsafe { VirtualProtect(target.cast(), bytes.len(), old_protect, &mut ignored) }.map_err(
            |e| Error::MemoryProtect {
                address,
                message: e.to_string(),
            },
        )?;

        // SAFETY: flushing is always valid for ranges in our own process.
        unsafe {
            let _ = FlushInstructionCache(GetCurrentProcess(), Some(target.cast()), bytes.len());
        }
        Ok(())
    }
}

/// One applied byte overwrite.
///
/// The original bytes are kept for diagnostics; the patcher never writes
/// them back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchSite {
    pub address: usize,
    pub original: Vec<u8>,
    pub replacement: Vec<u8>,
}

impl PatchSite {
    pub fn len(&self) -> usize {
        self.replacement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacement.is_empty()
    }

    pub fn is_noop(&self) -> bool {
        self.original == self.replacement
    }
}

/// Applies bounds-checked writes to a [`CodeMemory`].
pub struct Patcher<'m, M: CodeMemory + ?Sized> {
    memory: &'m mut M,
}

impl<'m, M: CodeMemory + ?Sized> Patcher<'m, M> {
    pub fn new(memory: &'m mut M) -> Self {
        Self { memory }
    }

    pub fn region(&self) -> MemoryRegion {
        self.memory.region()
    }

    pub fn memory(&self) -> &M {
        &*self.memory
    }

    pub fn check_bounds(&self, address: usize, len: usize) -> Result<()> {
        let region = self.memory.region();
        if len == 0 || !region.contains_range(address, len) {
            return Err(Error::PatchOutOfBounds {
                address,
                len,
                region,
            });
        }
        Ok(())
    }

    /// Overwrite exactly `bytes.len()` bytes at `address`.
    pub fn patch(&mut self, address: usize, bytes: &[u8]) -> Result<PatchSite> {
        self.check_bounds(address, bytes.len())?;

        let mut original = vec![0u8; bytes.len()];
        self.memory.read(address, &mut original)?;
        self.memory.write(address, bytes)?;

        info!(
            "Patched {} bytes at {:#x}: {} -> {}",
            bytes.len(),
            address,
            hex(&original),
            hex(bytes)
        );

        Ok(PatchSite {
            address,
            original,
            replacement: bytes.to_vec(),
        })
    }

    /// Replace `count` bytes at `address` with single-byte NOPs.
    pub fn patch_nops(&mut self, address: usize, count: usize) -> Result<PatchSite> {
        self.patch(address, &vec![NOP; count])
    }

    pub fn write_f32(&mut self, address: usize, value: f32) -> Result<PatchSite> {
        self.patch(address, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, address: usize, value: u32) -> Result<PatchSite> {
        self.patch(address, &value.to_le_bytes())
    }

    pub fn read_f32(&self, address: usize) -> Result<f32> {
        let mut buf = [0u8; 4];
        self.memory.read(address, &mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }
}

/// Ordered set of writes applied as a unit.
///
/// Every entry is bounds-checked before the first byte is written, so a plan
/// with one bad entry leaves memory untouched. Entries may only overlap
/// earlier ones when pushed with [`push_layered`](Self::push_layered).
#[derive(Debug, Clone, Default)]
pub struct PatchPlan {
    entries: Vec<PlannedPatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPatch {
    pub label: String,
    pub address: usize,
    pub bytes: Vec<u8>,
    /// Built from the bytes earlier entries leave behind.
    pub layered: bool,
}

impl PlannedPatch {
    fn end(&self) -> usize {
        self.address.saturating_add(self.bytes.len())
    }

    fn overlaps(&self, other: &PlannedPatch) -> bool {
        self.address < other.end() && other.address < self.end()
    }
}

impl PatchPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, address: usize, bytes: Vec<u8>) {
        self.entries.push(PlannedPatch {
            label: label.into(),
            address,
            bytes,
            layered: false,
        });
    }

    pub fn push_nops(&mut self, label: impl Into<String>, address: usize, count: usize) {
        self.push(label, address, vec![NOP; count]);
    }

    /// Add a write computed from [`overlay`](Self::overlay)ed bytes. It may
    /// replace earlier entries in place.
    pub fn push_layered(&mut self, label: impl Into<String>, address: usize, bytes: Vec<u8>) {
        self.entries.push(PlannedPatch {
            label: label.into(),
            address,
            bytes,
            layered: true,
        });
    }

    /// Copy the planned bytes that fall inside `code` (read from `address`)
    /// into it, in plan order.
    pub fn overlay(&self, address: usize, code: &mut [u8]) {
        let end = address.saturating_add(code.len());
        for entry in &self.entries {
            let start = entry.address.max(address);
            let stop = entry.end().min(end);
            if start < stop {
                code[start - address..stop - address]
                    .copy_from_slice(&entry.bytes[start - entry.address..stop - entry.address]);
            }
        }
    }

    pub fn entries(&self) -> &[PlannedPatch] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn validate<M: CodeMemory + ?Sized>(&self, patcher: &Patcher<'_, M>) -> Result<()> {
        for (index, entry) in self.entries.iter().enumerate() {
            patcher.check_bounds(entry.address, entry.bytes.len())?;
            if entry.layered {
                continue;
            }
            if let Some(earlier) = self.entries[..index].iter().find(|e| e.overlaps(entry)) {
                return Err(Error::PatchOverlap {
                    first: earlier.label.clone(),
                    second: entry.label.clone(),
                    address: entry.address.max(earlier.address),
                });
            }
        }
        Ok(())
    }

    pub fn apply<M: CodeMemory + ?Sized>(
        &self,
        patcher: &mut Patcher<'_, M>,
    ) -> Result<Vec<PatchSite>> {
        self.validate(patcher)?;
        debug!("Applying patch plan with {} entries", self.entries.len());

        self.entries
            .iter()
            .map(|entry| {
                debug!("  {} at {:#x}", entry.label, entry.address);
                patcher.patch(entry.address, &entry.bytes)
            })
            .collect()
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}


#[cfg(test)]
mod tests {
    use super::mock::SpyMemory;
    use super::*;

    #[test]
    fn test_patch_touches_exact_range() {
        let mut memory = BufferMemory::new(0x1000, vec![0xAA; 32]);
        let mut patcher = Patcher::new(&mut memory);

        let site = patcher.patch(0x1008, &[1, 2, 3, 4]).unwrap();
        assert_eq!(site.original, vec![0xAA; 4]);
        assert_eq!(site.replacement, vec![1, 2, 3, 4]);

        let data = memory.into_inner();
        assert_eq!(data[7], 0xAA);
        assert_eq!(&data[8..12], &[1, 2, 3, 4]);
        assert_eq!(data[12], 0xAA);
    }

    #[test]
    fn test_patch_nops() {
        let mut memory = BufferMemory::new(0, vec![0xD9, 0x05, 0x00, 0x10, 0x40, 0x00, 0xC3]);
        let site = Patcher::new(&mut memory).patch_nops(0, 6).unwrap();
        assert_eq!(site.original, vec![0xD9, 0x05, 0x00, 0x10, 0x40, 0x00]);
        assert_eq!(memory.bytes(), &[0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0xC3]);
    }

    #[test]
    fn test_out_of_bounds_writes_nothing() {
        let mut memory = SpyMemory::new(0x1000, vec![0; 16]);
        let mut patcher = Patcher::new(&mut memory);

        let err = patcher.patch(0x100E, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::PatchOutOfBounds { address: 0x100E, len: 3, .. }));
        assert!(patcher.patch(0x0FFF, &[1]).is_err());
        assert!(patcher.patch(0x1000, &[]).is_err());
        assert!(memory.writes.is_empty());
    }

    #[test]
    fn test_write_f32_idempotent() {
        let mut memory = BufferMemory::new(0, vec![0; 8]);
        let mut patcher = Patcher::new(&mut memory);
        let first = patcher.write_f32(4, 1920.0 / 1080.0).unwrap();
        let second = patcher.write_f32(4, 1920.0 / 1080.0).unwrap();
        assert!(!first.is_noop());
        assert!(second.is_noop());
        assert_eq!(patcher.read_f32(4).unwrap(), 1920.0 / 1080.0);
    }

    #[test]
    fn test_plan_is_all_or_nothing() {
        let mut memory = SpyMemory::new(0x1000, vec![0; 16]);
        let mut plan = PatchPlan::new();
        plan.push("aspect", 0x1000, vec![1, 2, 3, 4]);
        plan.push("beyond", 0x2000, vec![5]);

        let mut patcher = Patcher::new(&mut memory);
        assert!(plan.apply(&mut patcher).is_err());
        assert!(memory.writes.is_empty());
    }

    #[test]
    fn test_plan_applies_in_order() {
        let mut memory = SpyMemory::new(0, vec![0; 16]);
        let mut plan = PatchPlan::new();
        plan.push_nops("neutralize", 2, 3);
        plan.push("value", 8, vec![7, 7]);

        let sites = plan.apply(&mut Patcher::new(&mut memory)).unwrap();
        assert_eq!(sites.len(), 2);
        assert_eq!(memory.writes[0], (2, vec![NOP; 3]));
        assert_eq!(memory.writes[1], (8, vec![7, 7]));
    }

    #[test]
    fn test_plan_rejects_overlapping_writes() {
        let mut memory = SpyMemory::new(0x1000, vec![0; 16]);
        let mut plan = PatchPlan::new();
        plan.push_layered("jump", 0x1000, vec![0xE9, 0, 0, 0, 0, NOP]);
        plan.push("aspect", 0x1002, vec![1, 2, 3, 4]);

        let err = plan.apply(&mut Patcher::new(&mut memory)).unwrap_err();
        match err {
            Error::PatchOverlap { first, second, address } => {
                assert_eq!(first, "jump");
                assert_eq!(second, "aspect");
                assert_eq!(address, 0x1002);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(memory.writes.is_empty());
    }

    #[test]
    fn test_layered_write_replaces_earlier_entries() {
        let mut memory = SpyMemory::new(0, vec![0xAA; 16]);
        let mut plan = PatchPlan::new();
        plan.push_nops("nop", 4, 6);
        plan.push("adjacent", 10, vec![1, 2]);

        let mut code = vec![0xAA; 8];
        plan.overlay(2, &mut code);
        assert_eq!(code, vec![0xAA, 0xAA, NOP, NOP, NOP, NOP, NOP, NOP]);

        plan.push_layered("jump", 4, vec![0xE9, 9, 9, 9, 9]);
        let sites = plan.apply(&mut Patcher::new(&mut memory)).unwrap();
        assert_eq!(sites.len(), 3);
        assert_eq!(&memory.bytes()[4..12], &[0xE9, 9, 9, 9, 9, NOP, 1, 2]);
    }
}

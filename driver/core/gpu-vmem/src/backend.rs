//! # Page-Table Layouts
//!
//! [`AddressSpaceBackend`] abstracts over how a generation stores its tables.
//! [`AddressSpace`](crate::AddressSpace) only talks to this trait; the two
//! implementations are selected by [`ChipGeneration`].
//!
//! ## Semantics
//!
//! - [`write`](AddressSpaceBackend::write) installs PTEs for a whole request,
//!   creating tables for untouched directory slots on demand. On error some
//!   PTEs may already be written; the caller clears the range.
//! - [`clear`](AddressSpaceBackend::clear) zeroes every PTE of either size
//!   overlapping a range. Slots without tables are skipped; nothing is freed.
//! - [`lookup`](AddressSpaceBackend::lookup) prefers the small table when both
//!   hold a present entry for an address.
//! - [`sync`](AddressSpaceBackend::sync) writes every entry changed since the
//!   previous sync to instance memory.

mod dual;
mod flat;

pub use self::dual::DualBackend;
pub use self::flat::FlatBackend;

use crate::entry::{DirectoryEntry, PageTableEntry};
use crate::error::VmError;
use crate::request::MapRequest;
use crate::{MmuHardware, TableAlloc};
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;
use gpu_addresses::{PhysicalAddress, VirtualAddress, align_up};
use gpu_info::{ChipGeneration, PageTableGeometry};
use gpu_mm::PageClass;

pub trait AddressSpaceBackend: Send {
    fn geometry(&self) -> &'static PageTableGeometry;

    /// Base of the page directory in instance memory.
    fn directory(&self) -> PhysicalAddress;

    fn directory_entry(&self, pde: u64) -> DirectoryEntry;

    /// Install PTEs for `request` starting at `va`.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] if a segment is not page aligned.
    /// - [`VmError::OutOfMemory`] if a page table cannot be allocated.
    fn write(
        &mut self,
        tables: &mut dyn TableAlloc,
        va: VirtualAddress,
        request: &MapRequest,
    ) -> Result<(), VmError>;

    fn clear(&mut self, va: VirtualAddress, len: u64);

    fn lookup(&self, va: VirtualAddress) -> Option<(PageTableEntry, PageClass)>;

    /// Write dirty directory and table entries through `hw`.
    fn sync(&mut self, hw: &dyn MmuHardware);

    /// Number of page tables currently allocated.
    fn table_count(&self) -> usize;

    /// Visit every present PTE in address order.
    fn for_each_present(&self, f: &mut dyn FnMut(VirtualAddress, PageTableEntry, PageClass));

    /// Free every table and the directory.
    fn release(&mut self, tables: &mut dyn TableAlloc);
}

/// Allocate the directory and the layout matching `generation`.
///
/// # Errors
/// [`VmError::OutOfMemory`] if the directory cannot be allocated.
pub fn new_backend(
    generation: ChipGeneration,
    tables: &mut dyn TableAlloc,
) -> Result<Box<dyn AddressSpaceBackend>, VmError> {
    Ok(match generation {
        ChipGeneration::Tesla => Box::new(FlatBackend::new(tables)?),
        ChipGeneration::Fermi => Box::new(DualBackend::new(tables)?),
    })
}

/// The page directory and its shadow copy.
pub(crate) struct Directory {
    base: PhysicalAddress,
    entries: Vec<DirectoryEntry>,
    dirty: BTreeSet<usize>,
}

impl Directory {
    pub fn alloc(tables: &mut dyn TableAlloc, geometry: &PageTableGeometry) -> Result<Self, VmError> {
        let base = tables
            .alloc_table(geometry.directory_bytes())
            .ok_or(VmError::OutOfMemory)?;
        Ok(Self {
            base,
            entries: vec![DirectoryEntry::zero(); to_index(geometry.pde_count)],
            dirty: BTreeSet::new(),
        })
    }

    #[inline]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    pub fn get(&self, pde: u64) -> DirectoryEntry {
        self.entries
            .get(to_index(pde))
            .copied()
            .unwrap_or_else(DirectoryEntry::zero)
    }

    #[inline]
    pub fn set(&mut self, pde: u64, e: DirectoryEntry) {
        let i = to_index(pde);
        if let Some(slot) = self.entries.get_mut(i) {
            *slot = e;
            self.dirty.insert(i);
        }
    }

    pub fn sync(&mut self, hw: &dyn MmuHardware) {
        for i in core::mem::take(&mut self.dirty) {
            hw.write_entry(self.base + i as u64 * ENTRY_SIZE, self.entries[i].raw());
        }
    }

    pub fn release(&mut self, tables: &mut dyn TableAlloc, geometry: &PageTableGeometry) {
        tables.free_table(self.base, geometry.directory_bytes());
        self.entries.fill(DirectoryEntry::zero());
        self.dirty.clear();
    }
}

/// One page table and its shadow copy.
pub(crate) struct PageTable {
    base: PhysicalAddress,
    entries: Vec<PageTableEntry>,
    dirty: BTreeSet<usize>,
}

impl PageTable {
    pub fn alloc(tables: &mut dyn TableAlloc, count: u64) -> Result<Self, VmError> {
        let base = tables
            .alloc_table(count * ENTRY_SIZE)
            .ok_or(VmError::OutOfMemory)?;
        Ok(Self {
            base,
            entries: vec![PageTableEntry::zero(); to_index(count)],
            dirty: BTreeSet::new(),
        })
    }

    #[inline]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    pub fn get(&self, i: usize) -> PageTableEntry {
        self.entries.get(i).copied().unwrap_or_else(PageTableEntry::zero)
    }

    #[inline]
    pub fn set(&mut self, i: usize, e: PageTableEntry) {
        if let Some(slot) = self.entries.get_mut(i) {
            *slot = e;
            self.dirty.insert(i);
        }
    }

    /// Zero entries `[from, to)`, clamped to the table. Only entries that
    /// were present become dirty.
    pub fn clear(&mut self, from: usize, to: usize) {
        let to = to.min(self.entries.len());
        if from >= to {
            return;
        }
        for (i, e) in (from..).zip(&mut self.entries[from..to]) {
            if e.present() {
                *e = PageTableEntry::zero();
                self.dirty.insert(i);
            }
        }
    }

    pub fn sync(&mut self, hw: &dyn MmuHardware) {
        for i in core::mem::take(&mut self.dirty) {
            hw.write_entry(self.base + i as u64 * ENTRY_SIZE, self.entries[i].raw());
        }
    }

    pub fn present(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }

    pub fn release(self, tables: &mut dyn TableAlloc) {
        tables.free_table(self.base, self.entries.len() as u64 * ENTRY_SIZE);
    }
}

/// Bytes per directory and table entry.
const ENTRY_SIZE: u64 = 8;

#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn to_index(v: u64) -> usize {
    v as usize
}

/// Index range of `page`-sized entries of the slot at `slot_base` touched by
/// `[start, end)`.
pub(crate) const fn entry_span(
    slot_base: u64,
    block: u64,
    start: u64,
    end: u64,
    page: u64,
) -> (usize, usize) {
    let lo = if start > slot_base { start - slot_base } else { 0 };
    let hi = if end < slot_base + block { end - slot_base } else { block };
    (to_index(lo / page), to_index(align_up(hi, page) / page))
}

/// Call `f(va, pa)` for every `step`-sized page of `request` laid out from `va`.
///
/// All segments are validated before the first call.
pub(crate) fn for_each_page(
    request: &MapRequest,
    va: VirtualAddress,
    step: u64,
    align: u64,
    mut f: impl FnMut(u64, PhysicalAddress) -> Result<(), VmError>,
) -> Result<(), VmError> {
    if va.as_u64() % align != 0 {
        return Err(VmError::InvalidRange);
    }
    for seg in &request.segments {
        if seg.len == 0 || seg.len % align != 0 || seg.base.as_u64() % align != 0 {
            return Err(VmError::InvalidRange);
        }
    }

    let mut v = va.as_u64();
    for seg in &request.segments {
        let mut off = 0;
        while off < seg.len {
            f(v, seg.base + off)?;
            v += step;
            off += step;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_span_clamps_to_slot() {
        let block = 0x800_0000;
        assert_eq!(entry_span(0, block, 0x1000, 0x3000, 0x1000), (1, 3));
        assert_eq!(entry_span(block, block, 0x1000, block + 0x1000, 0x1000), (0, 1));
        assert_eq!(entry_span(0, block, 0x1000, 0x3000, 0x2_0000), (0, 1));
        assert_eq!(
            entry_span(0, block, 0, 2 * block, 0x2_0000),
            (0, 0x400)
        );
    }
}

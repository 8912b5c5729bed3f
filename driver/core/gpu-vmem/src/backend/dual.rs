//! Fermi layout: a hashed sparse directory of small/large table pairs.
//!
//! Slots are 128 MiB and kept in 32 buckets keyed by `pde % 32`, since a
//! typical space touches only a handful of the 8192 slots. Each slot owns a
//! small table (32768 × 4 KiB) and a large table (1024 × 128 KiB); both are
//! created together and installed in a single directory entry.

use super::{AddressSpaceBackend, Directory, PageTable, entry_span, for_each_page, to_index};
use crate::entry::PageTableEntry;
use crate::error::VmError;
use crate::request::MapRequest;
use crate::{DirectoryEntry, MmuHardware, TableAlloc};
use alloc::vec::Vec;
use gpu_addresses::{PhysicalAddress, VirtualAddress};
use gpu_info::PageTableGeometry;
use gpu_mm::PageClass;

const BUCKETS: usize = 32;

struct Slot {
    pde: u64,
    small: PageTable,
    large: PageTable,
}

impl Slot {
    const fn table(&self, page: PageClass) -> &PageTable {
        match page {
            PageClass::Small => &self.small,
            PageClass::Large => &self.large,
        }
    }

    const fn table_mut(&mut self, page: PageClass) -> &mut PageTable {
        match page {
            PageClass::Small => &mut self.small,
            PageClass::Large => &mut self.large,
        }
    }
}

pub struct DualBackend {
    directory: Directory,
    buckets: [Vec<Slot>; BUCKETS],
}

impl DualBackend {
    const GEOMETRY: &'static PageTableGeometry = &PageTableGeometry::FERMI;

    /// # Errors
    /// [`VmError::OutOfMemory`] if the directory cannot be allocated.
    pub fn new(tables: &mut dyn TableAlloc) -> Result<Self, VmError> {
        Ok(Self {
            directory: Directory::alloc(tables, Self::GEOMETRY)?,
            buckets: core::array::from_fn(|_| Vec::new()),
        })
    }

    #[inline]
    const fn bucket(pde: u64) -> usize {
        to_index(pde % BUCKETS as u64)
    }

    fn slot(&self, pde: u64) -> Option<&Slot> {
        self.buckets[Self::bucket(pde)].iter().find(|s| s.pde == pde)
    }

    fn slot_mut(&mut self, tables: &mut dyn TableAlloc, pde: u64) -> Result<&mut Slot, VmError> {
        let g = Self::GEOMETRY;
        if pde >= g.pde_count {
            return Err(VmError::InvalidRange);
        }
        let bucket = &mut self.buckets[Self::bucket(pde)];
        let pos = match bucket.iter().position(|s| s.pde == pde) {
            Some(pos) => pos,
            None => {
                let small = PageTable::alloc(tables, g.small_ptes())?;
                let large = match PageTable::alloc(tables, g.large_ptes()) {
                    Ok(large) => large,
                    Err(e) => {
                        small.release(tables);
                        return Err(e);
                    }
                };
                log::trace!(
                    "vmem: slot {pde} gets tables small={:?} large={:?}",
                    small.base(),
                    large.base()
                );
                self.directory.set(
                    pde,
                    DirectoryEntry::zero()
                        .with_small(small.base())
                        .with_large(large.base()),
                );
                bucket.push(Slot { pde, small, large });
                bucket.len() - 1
            }
        };
        Ok(&mut bucket[pos])
    }
}

impl AddressSpaceBackend for DualBackend {
    fn geometry(&self) -> &'static PageTableGeometry {
        Self::GEOMETRY
    }

    fn directory(&self) -> PhysicalAddress {
        self.directory.base()
    }

    fn directory_entry(&self, pde: u64) -> DirectoryEntry {
        self.directory.get(pde)
    }

    fn write(
        &mut self,
        tables: &mut dyn TableAlloc,
        va: VirtualAddress,
        request: &MapRequest,
    ) -> Result<(), VmError> {
        let g = Self::GEOMETRY;
        let page = match request.page {
            PageClass::Small => g.small_page,
            PageClass::Large => g.large_page,
        };
        for_each_page(request, va, page, page, |v, pa| {
            let slot = self.slot_mut(tables, g.pde_index(v))?;
            let i = to_index((v % g.block_size) / page);
            slot.table_mut(request.page)
                .set(i, PageTableEntry::map(pa, request));
            Ok(())
        })
    }

    fn clear(&mut self, va: VirtualAddress, len: u64) {
        let g = Self::GEOMETRY;
        let (start, end) = (va.as_u64(), va.as_u64().saturating_add(len));
        if start >= end {
            return;
        }
        for pde in g.pde_index(start)..=g.pde_index(end - 1) {
            let bucket = &mut self.buckets[Self::bucket(pde)];
            let Some(slot) = bucket.iter_mut().find(|s| s.pde == pde) else {
                continue;
            };
            let base = pde * g.block_size;
            let (lo, hi) = entry_span(base, g.block_size, start, end, g.small_page);
            slot.small.clear(lo, hi);
            let (lo, hi) = entry_span(base, g.block_size, start, end, g.large_page);
            slot.large.clear(lo, hi);
        }
    }

    fn lookup(&self, va: VirtualAddress) -> Option<(PageTableEntry, PageClass)> {
        let g = Self::GEOMETRY;
        let v = va.as_u64();
        let slot = self.slot(g.pde_index(v))?;
        [PageClass::Small, PageClass::Large]
            .into_iter()
            .find_map(|page| {
                let size = match page {
                    PageClass::Small => g.small_page,
                    PageClass::Large => g.large_page,
                };
                let e = slot.table(page).get(to_index((v % g.block_size) / size));
                e.present().then_some((e, page))
            })
    }

    fn sync(&mut self, hw: &dyn MmuHardware) {
        self.directory.sync(hw);
        for slot in self.buckets.iter_mut().flatten() {
            slot.small.sync(hw);
            slot.large.sync(hw);
        }
    }

    fn table_count(&self) -> usize {
        2 * self.buckets.iter().map(Vec::len).sum::<usize>()
    }

    fn for_each_present(&self, f: &mut dyn FnMut(VirtualAddress, PageTableEntry, PageClass)) {
        let g = Self::GEOMETRY;
        let mut slots: Vec<&Slot> = self.buckets.iter().flatten().collect();
        slots.sort_by_key(|s| s.pde);
        for slot in slots {
            let base = slot.pde * g.block_size;
            for (i, e) in slot.small.present() {
                f(VirtualAddress::new(base + i as u64 * g.small_page), e, PageClass::Small);
            }
            for (i, e) in slot.large.present() {
                f(VirtualAddress::new(base + i as u64 * g.large_page), e, PageClass::Large);
            }
        }
    }

    fn release(&mut self, tables: &mut dyn TableAlloc) {
        for bucket in &mut self.buckets {
            for slot in bucket.drain(..) {
                slot.small.release(tables);
                slot.large.release(tables);
            }
        }
        self.directory.release(tables, Self::GEOMETRY);
    }
}

//! Tesla layout: a dense directory of single-size tables.
//!
//! Every slot spans 512 MiB and points at one table of 4 KiB PTEs. Large-page
//! mappings are expanded into runs of small PTEs, so a translation never
//! reports [`PageClass::Large`].

use super::{AddressSpaceBackend, Directory, PageTable, entry_span, for_each_page, to_index};
use crate::entry::PageTableEntry;
use crate::error::VmError;
use crate::request::MapRequest;
use crate::{MmuHardware, TableAlloc};
use alloc::vec::Vec;
use gpu_addresses::{PhysicalAddress, VirtualAddress};
use gpu_info::PageTableGeometry;
use gpu_mm::PageClass;

pub struct FlatBackend {
    directory: Directory,
    slots: Vec<Option<PageTable>>,
}

impl FlatBackend {
    const GEOMETRY: &'static PageTableGeometry = &PageTableGeometry::TESLA;

    /// # Errors
    /// [`VmError::OutOfMemory`] if the directory cannot be allocated.
    pub fn new(tables: &mut dyn TableAlloc) -> Result<Self, VmError> {
        let directory = Directory::alloc(tables, Self::GEOMETRY)?;
        let mut slots = Vec::new();
        slots.resize_with(to_index(Self::GEOMETRY.pde_count), || None);
        Ok(Self { directory, slots })
    }

    fn slot_mut(
        &mut self,
        tables: &mut dyn TableAlloc,
        pde: u64,
    ) -> Result<&mut PageTable, VmError> {
        let g = Self::GEOMETRY;
        let Some(slot) = self.slots.get_mut(to_index(pde)) else {
            return Err(VmError::InvalidRange);
        };
        if slot.is_none() {
            let table = PageTable::alloc(tables, g.small_ptes())?;
            log::trace!("vmem: slot {pde} gets table at {:?}", table.base());
            self.directory
                .set(pde, self.directory.get(pde).with_small(table.base()));
            *slot = Some(table);
        }
        slot.as_mut().ok_or(VmError::OutOfMemory)
    }
}

impl AddressSpaceBackend for FlatBackend {
    fn geometry(&self) -> &'static PageTableGeometry {
        Self::GEOMETRY
    }

    fn directory(&self) -> PhysicalAddress {
        self.directory.base()
    }

    fn directory_entry(&self, pde: u64) -> crate::DirectoryEntry {
        self.directory.get(pde)
    }

    fn write(
        &mut self,
        tables: &mut dyn TableAlloc,
        va: VirtualAddress,
        request: &MapRequest,
    ) -> Result<(), VmError> {
        let g = Self::GEOMETRY;
        let align = match request.page {
            PageClass::Small => g.small_page,
            PageClass::Large => g.large_page,
        };
        for_each_page(request, va, g.small_page, align, |v, pa| {
            let table = self.slot_mut(tables, g.pde_index(v))?;
            let i = to_index((v % g.block_size) / g.small_page);
            table.set(i, PageTableEntry::map(pa, request));
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
            if let Some(Some(table)) = self.slots.get_mut(to_index(pde)) {
                let (lo, hi) = entry_span(pde * g.block_size, g.block_size, start, end, g.small_page);
                table.clear(lo, hi);
            }
        }
    }

    fn lookup(&self, va: VirtualAddress) -> Option<(PageTableEntry, PageClass)> {
        let g = Self::GEOMETRY;
        let v = va.as_u64();
        let table = self.slots.get(to_index(g.pde_index(v)))?.as_ref()?;
        let e = table.get(to_index((v % g.block_size) / g.small_page));
        e.present().then_some((e, PageClass::Small))
    }

    fn sync(&mut self, hw: &dyn MmuHardware) {
        self.directory.sync(hw);
        for table in self.slots.iter_mut().flatten() {
            table.sync(hw);
        }
    }

    fn table_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn for_each_present(&self, f: &mut dyn FnMut(VirtualAddress, PageTableEntry, PageClass)) {
        let g = Self::GEOMETRY;
        for (pde, table) in self.slots.iter().enumerate() {
            let Some(table) = table else { continue };
            let base = pde as u64 * g.block_size;
            for (i, e) in table.present() {
                f(VirtualAddress::new(base + i as u64 * g.small_page), e, PageClass::Small);
            }
        }
    }

    fn release(&mut self, tables: &mut dyn TableAlloc) {
        for slot in &mut self.slots {
            if let Some(table) = slot.take() {
                table.release(tables);
            }
        }
        self.directory.release(tables, Self::GEOMETRY);
    }
}

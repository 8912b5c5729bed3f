//! # GPU Address Space
//!
//! An [`AddressSpace`] owns the page tables of one GPU context and the
//! interval tree that places mappings inside its virtual range.
//!
//! ## Operations
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`map`](AddressSpace::map) | place a request in a window, write PTEs, commit |
//! | [`unmap`](AddressSpace::unmap) | clear PTEs of one mapping, release its range, commit |
//! | [`remap`](AddressSpace::remap) | retarget part of an existing mapping, commit |
//! | [`translate`](AddressSpace::translate) | walk the tables for one address |
//! | [`teardown`](AddressSpace::teardown) | free every table and the directory |
//!
//! "Commit" is the flush protocol described at the crate root. A mapping is
//! only reported as created once both flushes succeeded; on failure the PTE
//! writes are undone before the error is returned.
//!
//! ## Invariants & Notes
//!
//! - Mappings never overlap; each one is contiguous in virtual space.
//! - Every present PTE belongs to exactly one recorded [`Mapping`].
//! - The type is not internally synchronized. Callers hold it behind a lock.

use crate::backend::{AddressSpaceBackend, new_backend};
use crate::entry::{EngineMask, PageTableEntry};
use crate::error::VmError;
use crate::request::{Aperture, MapRequest};
use crate::{MmuHardware, TableAlloc};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::time::Duration;
use gpu_addresses::{AddressRange, PhysicalAddress, VirtualAddress};
use gpu_info::{ChipGeneration, PageTableGeometry};
use gpu_mm::{AllocClass, AllocFlags, Allocation, PageClass, PageGeometry, RangeAllocator};

/// A live mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub va: VirtualAddress,
    pub len: u64,
    pub page: PageClass,
    /// Caller-chosen identifier of the mapped object.
    pub tag: u64,
    handle: Allocation,
}

impl Mapping {
    #[inline]
    #[must_use]
    pub const fn range(&self) -> AddressRange {
        AddressRange::new(self.va.as_u64(), self.va.as_u64() + self.len)
    }
}

/// Result of walking the tables for one address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    pub phys: PhysicalAddress,
    pub aperture: Aperture,
    pub page: PageClass,
    pub entry: PageTableEntry,
}

pub struct AddressSpace {
    generation: ChipGeneration,
    size: u64,
    backend: Box<dyn AddressSpaceBackend>,
    virt: RangeAllocator,
    mappings: BTreeMap<u64, Mapping>,
    flush_timeout: Duration,
}

impl AddressSpace {
    const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

    /// Create an empty space of `size` bytes starting at virtual address 0.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] if `size` is zero, exceeds the generation's
    ///   virtual size, or is not a multiple of its large page.
    /// - [`VmError::OutOfMemory`] if the directory cannot be allocated.
    pub fn new(
        generation: ChipGeneration,
        size: u64,
        tables: &mut dyn TableAlloc,
        seed: u64,
    ) -> Result<Self, VmError> {
        let g = generation.geometry();
        if size == 0 || size > g.vm_size || size % g.large_page != 0 {
            return Err(VmError::InvalidRange);
        }
        let virt = RangeAllocator::new(
            "vspace",
            AddressRange::new(0, size),
            PageGeometry::new(g.small_page, g.large_page, 1),
            seed,
        )?;
        let backend = new_backend(generation, tables)?;
        log::debug!(
            "vmem: new {generation} space of 0x{size:x} bytes, directory at {:?}",
            backend.directory()
        );
        Ok(Self {
            generation,
            size,
            backend,
            virt,
            mappings: BTreeMap::new(),
            flush_timeout: Self::DEFAULT_FLUSH_TIMEOUT,
        })
    }

    #[must_use]
    pub const fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    #[inline]
    #[must_use]
    pub const fn generation(&self) -> ChipGeneration {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn geometry(&self) -> &'static PageTableGeometry {
        self.backend.geometry()
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn page_directory(&self) -> PhysicalAddress {
        self.backend.directory()
    }

    #[must_use]
    pub fn directory_entry(&self, pde: u64) -> crate::DirectoryEntry {
        self.backend.directory_entry(pde)
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.backend.table_count()
    }

    /// Virtual bytes currently mapped.
    #[must_use]
    pub const fn mapped_bytes(&self) -> u64 {
        self.virt.used_bytes()
    }

    /// Map `request` somewhere inside `window`.
    ///
    /// A window `end` of `0` means the end of the space. With `from_back` the
    /// highest fitting address is chosen.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for an empty request, a window outside the
    ///   space, or misaligned segments.
    /// - [`VmError::OutOfMemory`] if no virtual range fits or a page table
    ///   cannot be allocated.
    /// - [`VmError::Flush`] if the commit fails; nothing stays mapped.
    pub fn map(
        &mut self,
        tables: &mut dyn TableAlloc,
        hw: &dyn MmuHardware,
        request: &MapRequest,
        window: AddressRange,
        from_back: bool,
        tag: u64,
    ) -> Result<VirtualAddress, VmError> {
        self.map_parts(
            tables,
            hw,
            core::slice::from_ref(request),
            window,
            from_back,
            tag,
        )
    }

    /// Map `parts` back to back as one contiguous virtual range.
    ///
    /// The range is aligned for the largest page size among the parts, so a
    /// large-page object whose pieces partly live in host memory keeps its
    /// placement when those pieces move back.
    ///
    /// # Errors
    /// As [`map`](Self::map).
    pub fn map_parts(
        &mut self,
        tables: &mut dyn TableAlloc,
        hw: &dyn MmuHardware,
        parts: &[MapRequest],
        window: AddressRange,
        from_back: bool,
        tag: u64,
    ) -> Result<VirtualAddress, VmError> {
        let len: u64 = parts.iter().map(MapRequest::len).sum();
        let window = self.window(window)?;
        if len == 0 {
            return Err(VmError::InvalidRange);
        }
        let page = if parts.iter().any(|p| p.page == PageClass::Large) {
            PageClass::Large
        } else {
            PageClass::Small
        };

        let flags = AllocFlags::new()
            .with_contiguous(true)
            .with_from_back(from_back);
        let handle = self
            .virt
            .alloc(len, AllocClass::new(page, false), flags, window)?;
        let va = match self.virt.regions(handle)?.first() {
            Some(r) => VirtualAddress::new(r.start),
            None => return Err(VmError::OutOfMemory),
        };

        let mut at = va;
        for part in parts {
            if let Err(e) = self.backend.write(tables, at, part) {
                log::debug!("vmem: map of 0x{len:x} at {va:?} failed: {e}");
                self.backend.clear(va, len);
                self.virt.free(handle)?;
                return Err(e);
            }
            at += part.len();
        }
        if let Err(e) = self.commit(hw) {
            self.backend.clear(va, len);
            self.virt.free(handle)?;
            if let Err(undo) = self.commit(hw) {
                log::error!("vmem: cleared PTEs at {va:?} not committed: {undo}");
            }
            return Err(e);
        }

        let mapping = Mapping {
            va,
            len,
            page,
            tag,
            handle,
        };
        self.mappings.insert(va.as_u64(), mapping);
        log::debug!(
            "vmem: mapped 0x{len:x} at {va:?} ({} part{}, {page} pages, tag {tag})",
            parts.len(),
            if parts.len() == 1 { "" } else { "s" },
        );
        Ok(va)
    }

    /// Remove the mapping containing `va`.
    ///
    /// # Errors
    /// - [`VmError::NotMapped`] if no mapping contains `va`.
    /// - [`VmError::Flush`] if the commit fails. The PTEs are already cleared
    ///   and the mapping is gone.
    pub fn unmap(&mut self, hw: &dyn MmuHardware, va: VirtualAddress) -> Result<Mapping, VmError> {
        let mapping = self.mapping_at(va).copied().ok_or(VmError::NotMapped)?;
        self.backend.clear(mapping.va, mapping.len);
        self.virt.free(mapping.handle)?;
        self.mappings.remove(&mapping.va.as_u64());
        log::debug!("vmem: unmapped 0x{:x} at {:?}", mapping.len, mapping.va);
        self.commit(hw)?;
        Ok(mapping)
    }

    /// Point `[va, va + request.len())` at new physical memory.
    ///
    /// The range must lie inside one existing mapping. Small pages may be
    /// placed anywhere; large pages only inside a large-page mapping.
    ///
    /// # Errors
    /// - [`VmError::NotMapped`] if `va` is not mapped.
    /// - [`VmError::InvalidRange`] if the range leaves the mapping or uses
    ///   large pages in a small-page mapping.
    /// - [`VmError::OutOfMemory`] if a page table cannot be allocated.
    /// - [`VmError::Flush`] if the commit fails.
    pub fn remap(
        &mut self,
        tables: &mut dyn TableAlloc,
        hw: &dyn MmuHardware,
        va: VirtualAddress,
        request: &MapRequest,
    ) -> Result<(), VmError> {
        let mapping = self.mapping_at(va).copied().ok_or(VmError::NotMapped)?;
        let len = request.len();
        let range = AddressRange::from_start_len(va.as_u64(), len).ok_or(VmError::InvalidRange)?;
        if len == 0
            || !mapping.range().encloses(&range)
            || (request.page == PageClass::Large && mapping.page == PageClass::Small)
        {
            return Err(VmError::InvalidRange);
        }

        self.backend.clear(va, len);
        if let Err(e) = self.backend.write(tables, va, request) {
            self.backend.clear(va, len);
            if let Err(undo) = self.commit(hw) {
                log::error!("vmem: cleared PTEs at {va:?} not committed: {undo}");
            }
            return Err(e);
        }
        log::trace!("vmem: remapped 0x{len:x} at {va:?} to {:?}", request.aperture);
        self.commit(hw)
    }

    /// Invalidate the TLBs of `engines` for this space.
    ///
    /// # Errors
    /// [`VmError::Flush`] if the invalidation is not acknowledged.
    pub fn flush_tlb(&self, hw: &dyn MmuHardware, engines: EngineMask) -> Result<(), VmError> {
        hw.tlb_invalidate(self.page_directory(), engines, self.flush_timeout)
            .map_err(|e| {
                log::error!("vmem: TLB flush of {:?} failed: {e}", self.page_directory());
                VmError::from(e)
            })
    }

    fn commit(&mut self, hw: &dyn MmuHardware) -> Result<(), VmError> {
        self.backend.sync(hw);
        hw.bar_flush(self.flush_timeout).map_err(|e| {
            log::error!("vmem: BAR flush failed: {e}");
            VmError::from(e)
        })?;
        self.flush_tlb(hw, EngineMask::ALL)
    }

    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        let (entry, page) = self.backend.lookup(va)?;
        let g = self.geometry();
        let page_size = match page {
            PageClass::Small => g.small_page,
            PageClass::Large => g.large_page,
        };
        Some(Translation {
            phys: entry.target() + va.as_u64() % page_size,
            aperture: entry.aperture()?,
            page,
            entry,
        })
    }

    /// The mapping containing `va`.
    #[must_use]
    pub fn mapping_at(&self, va: VirtualAddress) -> Option<&Mapping> {
        let found = self.virt.find(va.as_u64())?;
        self.mappings.get(&found.fragment.start)
    }

    /// Every mapping in address order.
    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> + '_ {
        self.mappings.values()
    }

    /// Every present PTE with the address it translates and its page size.
    #[must_use]
    pub fn present_entries(&self) -> Vec<(VirtualAddress, PageTableEntry, PageClass)> {
        let mut out = Vec::new();
        self.backend
            .for_each_present(&mut |va, e, page| out.push((va, e, page)));
        out
    }

    /// Release every table and the directory.
    ///
    /// Returns the number of mappings that were still live. Their PTEs are
    /// discarded with the tables.
    pub fn teardown(mut self, tables: &mut dyn TableAlloc) -> usize {
        let live = self.mappings.len();
        if live > 0 {
            log::warn!("vmem: tearing down space with {live} live mappings");
        }
        self.backend.release(tables);
        self.virt.take_down(|_, regions| {
            log::trace!("vmem: dropping mapping {regions:?}");
        });
        live
    }

    fn window(&self, window: AddressRange) -> Result<AddressRange, VmError> {
        let end = if window.end == 0 { self.size } else { window.end };
        if window.start >= end || end > self.size {
            return Err(VmError::InvalidRange);
        }
        Ok(AddressRange::new(window.start, end))
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("generation", &self.generation)
            .field("size", &self.size)
            .field("directory", &self.page_directory())
            .field("mappings", &self.mappings.len())
            .finish_non_exhaustive()
    }
}

//! # GPU Virtual Memory
//!
//! Per-context GPU address spaces: placement of objects in a virtual range,
//! the page tables that translate it, and the flush protocol that makes a
//! change visible to the hardware.
//!
//! ## Translation Walk
//!
//! Every virtual address splits into a directory index and a table index. The
//! table index width depends on the page size of the table being walked:
//!
//! ```text
//! Tesla (flat):   | 39‒29 PDE | 28‒12 small PTE | 11‒0 offset |
//! Fermi (dual):   | 39‒27 PDE | 26‒12 small PTE | 11‒0 offset |
//!                 | 39‒27 PDE | 26‒17 large PTE | 16‒0 offset |
//! ```
//!
//! ```text
//!  page directory ──► PDE ──► small page table ──► PTE → 4 KiB page
//!                      │
//!                      └────► large page table ──► PTE → 128 KiB page   (Fermi only)
//! ```
//!
//! | Layout | Backend | Directory | Tables per slot |
//! |--------|---------|-----------|-----------------|
//! | Tesla  | [`FlatBackend`] | dense array of 2048 slots | one 4 KiB table; large objects are expanded |
//! | Fermi  | [`DualBackend`] | 32-bucket hash of 8192 slots | small + large table pair |
//!
//! Page tables are allocated from instance memory through [`TableAlloc`] the
//! first time a directory slot is used, and only released when the whole
//! [`AddressSpace`] is torn down.
//!
//! ## Commit Protocol
//!
//! Tables are edited in a shadow copy; the entries touched since the last
//! commit are written to instance memory through [`MmuHardware::write_entry`]
//! when the change is committed.
//!
//! The GPU caches translations independently of the tables in memory. Every
//! mutation is followed by [`MmuHardware::bar_flush`] and then
//! [`MmuHardware::tlb_invalidate`] before it is reported as done; an
//! invalidation that is not acknowledged in time yields [`FlushError::Busy`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod backend;
mod entry;
mod error;
mod request;

use core::time::Duration;
use gpu_addresses::PhysicalAddress;

pub use crate::address_space::{AddressSpace, Mapping, Translation};
pub use crate::backend::{AddressSpaceBackend, DualBackend, FlatBackend};
pub use crate::entry::{DirectoryEntry, EngineMask, PageTableEntry};
pub use crate::error::{FlushError, VmError};
pub use crate::request::{Aperture, MapRequest, PhysicalSegment};
pub use gpu_info::ChipGeneration;
pub use gpu_mm::PageClass;

/// Source of instance memory for page directories and page tables.
///
/// Returned memory must be zeroed and 4 KiB aligned; `None` means the
/// instance memory is exhausted.
pub trait TableAlloc {
    fn alloc_table(&mut self, bytes: u64) -> Option<PhysicalAddress>;
    fn free_table(&mut self, base: PhysicalAddress, bytes: u64);
}

/// MMU maintenance operations of the device.
pub trait MmuHardware {
    /// Store one 8-byte directory or table entry at `at` in instance memory.
    fn write_entry(&self, at: PhysicalAddress, value: u64);

    /// Make prior writes to instance memory visible to the GPU.
    ///
    /// # Errors
    /// [`FlushError::Timeout`] if the flush is not acknowledged within `timeout`.
    fn bar_flush(&self, timeout: Duration) -> Result<(), FlushError>;

    /// Drop cached translations of the space rooted at `page_directory`.
    ///
    /// # Errors
    /// [`FlushError::Busy`] if the request queue stays full or the
    /// invalidation is not acknowledged within `timeout`.
    fn tlb_invalidate(
        &self,
        page_directory: PhysicalAddress,
        engines: EngineMask,
        timeout: Duration,
    ) -> Result<(), FlushError>;
}

//! # Page-Table and Page-Directory Entries
//!
//! Raw 64-bit entry formats shared by both layouts.
//!
//! ## Semantics
//!
//! A [`PageTableEntry`] maps one page (4 KiB in a small table, the large page
//! size in a large table). The frame is stored in 4 KiB units regardless of
//! the page size it maps; a large page must therefore be large-page aligned.
//!
//! A [`DirectoryEntry`] points at up to two tables for one directory slot.
//! The flat layout only ever uses the small half.
//!
//! ## Invariants & Notes
//!
//! - An all-zero entry is "not present" in both formats.
//! - `system` and `storage_type` together select the aperture; see
//!   [`Aperture`](crate::Aperture).
//! - Frames are 40 bits (PTE) and 28 bits (PDE) of 4 KiB units. Page tables live
//!   in instance memory, which is far below 1 TiB.

use crate::request::{Aperture, MapRequest};
use bitfield_struct::bitfield;
use gpu_addresses::{PhysicalAddress, Size4K};

/// Hardware PTE.
///
/// ```text
/// | 63‒59 | 58‒51 tile | 50‒48 storage | 47‒8 frame | 7‒4 | 3 sys | 2 ro | 1 priv | 0 P |
/// ```
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct PageTableEntry {
    pub present: bool,
    pub privileged: bool,
    pub read_only: bool,
    /// Target lives in host memory.
    pub system: bool,
    #[bits(4)]
    __res4_7: u8,
    /// Target physical address >> 12.
    #[bits(40)]
    pub frame: u64,
    #[bits(3)]
    pub storage_type: u8,
    /// Opaque tiling/compression flags from the map request.
    #[bits(8)]
    pub tile_flags: u8,
    #[bits(5)]
    __res59_63: u8,
}

impl PageTableEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Present entry mapping `pa` with the attributes of `request`.
    #[must_use]
    pub const fn map(pa: PhysicalAddress, request: &MapRequest) -> Self {
        Self::new()
            .with_present(true)
            .with_privileged(request.privileged)
            .with_read_only(request.read_only)
            .with_system(request.aperture.is_system())
            .with_frame(pa.page_number::<Size4K>())
            .with_storage_type(request.aperture.storage_type())
            .with_tile_flags(request.tile_flags)
    }

    #[inline]
    #[must_use]
    pub const fn target(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Aperture encoded in this entry; `None` for an unknown storage type.
    #[must_use]
    pub const fn aperture(self) -> Option<Aperture> {
        Aperture::from_storage_type(self.system(), self.storage_type())
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u64) -> Self {
        Self::from_bits(v)
    }
}

/// Hardware PDE.
///
/// ```text
/// | 63‒36 small table frame | 35‒8 large table frame | 7‒4 | 3‒2 size | 1 SP | 0 LP |
/// ```
#[bitfield(u64)]
#[derive(Eq, PartialEq)]
pub struct DirectoryEntry {
    /// The large-page table is installed.
    pub large_present: bool,
    /// The small-page table is installed.
    pub small_present: bool,
    /// Coverage of the small table; `0` means the full slot.
    #[bits(2)]
    pub small_size: u8,
    #[bits(4)]
    __res4_7: u8,
    #[bits(28)]
    pub large_table: u64,
    #[bits(28)]
    pub small_table: u64,
}

impl DirectoryEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.small_present() || self.large_present()
    }

    #[must_use]
    pub const fn with_small(self, table: PhysicalAddress) -> Self {
        self.with_small_present(true)
            .with_small_table(table.page_number::<Size4K>())
    }

    #[must_use]
    pub const fn with_large(self, table: PhysicalAddress) -> Self {
        self.with_large_present(true)
            .with_large_table(table.page_number::<Size4K>())
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.into_bits()
    }
}

/// Engines whose TLBs an invalidation targets.
#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct EngineMask {
    pub graph: bool,
    pub copy: bool,
    pub fifo: bool,
    /// The BAR translation used for host access to VRAM.
    pub bar: bool,
    /// Only the hub TLB; mutually exclusive with the engine bits.
    pub hub_only: bool,
    #[bits(3)]
    __res5_7: u8,
}

impl EngineMask {
    pub const ALL: Self = Self::new()
        .with_graph(true)
        .with_copy(true)
        .with_fifo(true)
        .with_bar(true);

    pub const HUB_ONLY: Self = Self::new().with_hub_only(true);
}

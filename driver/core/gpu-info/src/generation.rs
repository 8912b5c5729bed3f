//! Chipset generations and their page-table geometry.

use core::fmt;
use core::str::FromStr;

/// Size of every GPU virtual address space (1 TiB).
pub const VM_SIZE: u64 = 1 << 40;

/// Small page size shared by all generations and by host memory.
pub const SMALL_PAGE_SIZE: u64 = 0x1000;

/// Hardware generation, selecting the page-table layout.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ChipGeneration {
    /// Older layout: flat single-size page table per directory slot.
    Tesla,
    /// Newer layout: small + large page table pair per slot, hashed directory.
    #[default]
    Fermi,
}

impl ChipGeneration {
    #[must_use]
    pub const fn geometry(self) -> &'static PageTableGeometry {
        match self {
            Self::Tesla => &PageTableGeometry::TESLA,
            Self::Fermi => &PageTableGeometry::FERMI,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tesla => "tesla",
            Self::Fermi => "fermi",
        }
    }
}

impl fmt::Display for ChipGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChipGeneration {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tesla") || s.eq_ignore_ascii_case("nv50") {
            Ok(Self::Tesla)
        } else if s.eq_ignore_ascii_case("fermi") || s.eq_ignore_ascii_case("nvc0") {
            Ok(Self::Fermi)
        } else {
            Err(())
        }
    }
}

/// Fixed page-table geometry of one generation.
#[derive(Debug, Eq, PartialEq)]
pub struct PageTableGeometry {
    pub generation: ChipGeneration,
    /// Total virtual space covered by the directory.
    pub vm_size: u64,
    /// Number of page-directory entries.
    pub pde_count: u64,
    /// Virtual bytes covered by one directory slot.
    pub block_size: u64,
    pub small_page: u64,
    pub large_page: u64,
    /// Whether a slot carries a separate large-page table.
    pub dual_tables: bool,
    /// Size of one PTE/PDE in bytes.
    pub entry_size: u64,
}

impl PageTableGeometry {
    pub const TESLA: Self = Self {
        generation: ChipGeneration::Tesla,
        vm_size: VM_SIZE,
        pde_count: 0x800,
        block_size: 1 << 29,
        small_page: SMALL_PAGE_SIZE,
        large_page: 0x1_0000,
        dual_tables: false,
        entry_size: 8,
    };

    pub const FERMI: Self = Self {
        generation: ChipGeneration::Fermi,
        vm_size: VM_SIZE,
        pde_count: 0x2000,
        block_size: 1 << 27,
        small_page: SMALL_PAGE_SIZE,
        large_page: 0x2_0000,
        dual_tables: true,
        entry_size: 8,
    };

    /// Small-page entries per directory slot.
    #[inline]
    #[must_use]
    pub const fn small_ptes(&self) -> u64 {
        self.block_size / self.small_page
    }

    /// Large-page entries per directory slot (zero for the flat layout).
    #[inline]
    #[must_use]
    pub const fn large_ptes(&self) -> u64 {
        if self.dual_tables {
            self.block_size / self.large_page
        } else {
            0
        }
    }

    /// Bytes of backing needed for the page directory itself.
    #[inline]
    #[must_use]
    pub const fn directory_bytes(&self) -> u64 {
        self.pde_count * self.entry_size
    }

    /// Directory slot covering `va`.
    #[inline]
    #[must_use]
    pub const fn pde_index(&self, va: u64) -> u64 {
        va / self.block_size
    }
}

const _: () = {
    assert!(PageTableGeometry::TESLA.pde_count * PageTableGeometry::TESLA.block_size == VM_SIZE);
    assert!(PageTableGeometry::FERMI.pde_count * PageTableGeometry::FERMI.block_size == VM_SIZE);
    assert!(PageTableGeometry::TESLA.small_ptes() == 0x2_0000);
    assert!(PageTableGeometry::FERMI.small_ptes() == 0x8000);
    assert!(PageTableGeometry::FERMI.large_ptes() == 0x400);
};

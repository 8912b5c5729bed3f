use alloc::vec::Vec;
use gpu_addresses::PhysicalAddress;
use gpu_info::layout::storage_type;
use gpu_mm::PageClass;

/// Memory a PTE points into.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Aperture {
    Vram,
    /// Host RAM, coherent with CPU caches.
    HostSnooped,
    /// Host RAM, bypassing CPU cache snooping.
    HostNonSnooped,
}

impl Aperture {
    #[inline]
    #[must_use]
    pub const fn is_system(self) -> bool {
        !matches!(self, Self::Vram)
    }

    #[must_use]
    pub const fn storage_type(self) -> u8 {
        match self {
            Self::Vram => storage_type::VRAM,
            Self::HostSnooped => storage_type::SYSRAM_SNOOP,
            Self::HostNonSnooped => storage_type::SYSRAM_NOSNOOP,
        }
    }

    #[must_use]
    pub const fn from_storage_type(system: bool, ty: u8) -> Option<Self> {
        match (system, ty) {
            (false, storage_type::VRAM) => Some(Self::Vram),
            (true, storage_type::SYSRAM_SNOOP) => Some(Self::HostSnooped),
            (true, storage_type::SYSRAM_NOSNOOP) => Some(Self::HostNonSnooped),
            _ => None,
        }
    }
}

/// One physically contiguous piece of a mapping target.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysicalSegment {
    pub base: PhysicalAddress,
    pub len: u64,
}

impl PhysicalSegment {
    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, len: u64) -> Self {
        Self { base, len }
    }
}

/// What to map: the physical segments in virtual order plus PTE attributes.
///
/// Segments are laid out back to back starting at the chosen virtual address.
/// Each segment must be aligned to, and a multiple of, the page size used.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapRequest {
    pub segments: Vec<PhysicalSegment>,
    pub aperture: Aperture,
    pub page: PageClass,
    pub read_only: bool,
    pub privileged: bool,
    pub tile_flags: u8,
}

impl MapRequest {
    /// Host apertures are always mapped with small pages.
    #[must_use]
    pub fn new(segments: Vec<PhysicalSegment>, aperture: Aperture, page: PageClass) -> Self {
        Self {
            segments,
            aperture,
            page: if aperture.is_system() {
                PageClass::Small
            } else {
                page
            },
            read_only: false,
            privileged: false,
            tile_flags: 0,
        }
    }

    #[must_use]
    pub const fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub const fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    #[must_use]
    pub const fn with_tile_flags(mut self, tile_flags: u8) -> Self {
        self.tile_flags = tile_flags;
        self
    }

    /// Total bytes covered by all segments.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

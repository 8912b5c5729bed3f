//! # Memory Objects
//!
//! An object is split into chunks of at most `chunk_size` bytes; the chunk is
//! the unit the swap manager moves between VRAM and host memory.
//!
//! ```text
//! object (10 MiB, chunk_size 4 MiB)
//! ┌──────────────┬──────────────┬────────┐
//! │ chunk 0      │ chunk 1      │ chunk 2│
//! │ VRAM         │ host (swap)  │ VRAM   │
//! └──────────────┴──────────────┴────────┘
//! ```
//!
//! Every mapping of the object covers all chunks; each chunk's PTEs follow its
//! current backing.

use crate::handle::{ClientId, ObjectId, VspaceId};
use crate::vram::VramBlock;
use bitfield_struct::bitfield;
use gpu_addresses::{PhysicalAddress, VirtualAddress};
use gpu_mm::{AllocClass, PageClass};
use gpu_sync::SpinLock;
use gpu_vmem::{Aperture, MapRequest, PhysicalSegment};

/// Where and how an object's memory lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryClass {
    VramSmall,
    VramLarge,
    HostSnooped,
    HostNonSnooped,
}

impl MemoryClass {
    #[must_use]
    pub const fn is_vram(self) -> bool {
        matches!(self, Self::VramSmall | Self::VramLarge)
    }

    #[must_use]
    pub const fn page(self) -> PageClass {
        match self {
            Self::VramLarge => PageClass::Large,
            _ => PageClass::Small,
        }
    }

    /// Aperture of freshly allocated memory of this class.
    #[must_use]
    pub const fn aperture(self) -> Aperture {
        match self {
            Self::VramSmall | Self::VramLarge => Aperture::Vram,
            Self::HostSnooped => Aperture::HostSnooped,
            Self::HostNonSnooped => Aperture::HostNonSnooped,
        }
    }
}

#[bitfield(u8)]
#[derive(Eq, PartialEq)]
pub struct ObjectFlags {
    /// Each chunk must be physically contiguous.
    pub contiguous: bool,
    /// Chunks may be evicted to host memory under pressure.
    pub swappable: bool,
    pub read_only: bool,
    /// Mapped without user access.
    pub privileged: bool,
    #[bits(4)]
    __res4_7: u8,
}

/// Physical backing of one chunk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Backing {
    Vram(VramBlock),
    /// 4 KiB host pages in chunk order.
    Host {
        pages: Vec<PhysicalAddress>,
        aperture: Aperture,
    },
}

impl Backing {
    #[must_use]
    pub const fn aperture(&self) -> Aperture {
        match self {
            Self::Vram(_) => Aperture::Vram,
            Self::Host { aperture, .. } => *aperture,
        }
    }

    #[must_use]
    pub fn segments(&self) -> Vec<PhysicalSegment> {
        match self {
            Self::Vram(block) => block.segments.clone(),
            Self::Host { pages, .. } => pages
                .iter()
                .map(|&pa| PhysicalSegment::new(pa, HOST_PAGE))
                .collect(),
        }
    }
}

/// Host page size.
pub const HOST_PAGE: u64 = 0x1000;

#[derive(Debug)]
pub struct Chunk {
    /// Byte offset inside the object.
    pub offset: u64,
    pub size: u64,
    pub backing: Backing,
}

/// Where an object is mapped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjectMapping {
    pub vspace: VspaceId,
    pub va: VirtualAddress,
}

/// Mutable part of an object.
#[derive(Debug)]
pub struct ObjectState {
    pub chunks: Vec<Chunk>,
    pub mappings: Vec<ObjectMapping>,
}

#[derive(Debug)]
pub struct Object {
    pub id: ObjectId,
    pub client: ClientId,
    pub size: u64,
    pub class: MemoryClass,
    pub tile_flags: u8,
    pub flags: ObjectFlags,
    pub state: SpinLock<ObjectState>,
}

impl Object {
    #[must_use]
    pub fn alloc_class(&self) -> AllocClass {
        AllocClass::new(self.class.page(), self.tile_flags != 0)
    }

    /// PTE request for `backing`, carrying this object's attributes.
    #[must_use]
    pub fn request(&self, backing: &Backing) -> MapRequest {
        MapRequest::new(backing.segments(), backing.aperture(), self.class.page())
            .with_read_only(self.flags.read_only())
            .with_privileged(self.flags.privileged())
            .with_tile_flags(self.tile_flags)
    }

    /// Whether any chunk currently lives in host memory while the object
    /// belongs in VRAM.
    #[must_use]
    pub fn is_swapped(&self) -> bool {
        self.class.is_vram()
            && self
                .state
                .lock()
                .chunks
                .iter()
                .any(|c| matches!(c.backing, Backing::Host { .. }))
    }
}

/// Byte ranges `(offset, size)` of the chunks of an object of `size` bytes.
///
/// A `chunk_size` of `0` yields a single chunk.
#[must_use]
pub fn chunk_layout(size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if chunk_size == 0 || size <= chunk_size {
        return vec![(0, size)];
    }
    let mut out = Vec::with_capacity(usize::try_from(size.div_ceil(chunk_size)).unwrap_or(0));
    let mut offset = 0;
    while offset < size {
        let len = chunk_size.min(size - offset);
        out.push((offset, len));
        offset += len;
    }
    out
}

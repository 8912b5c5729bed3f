//! # Range Allocation for GPU Memory
//!
//! This crate provides [`RangeAllocator`], the best-fit range allocator used for
//! every linear space the driver manages: VRAM, the driver-private instance
//! memory holding page tables, and the virtual range of each GPU address space.
//!
//! ## Allocation Classes
//!
//! Small-page (4 KiB) and large-page regions follow different tiling rules in
//! hardware, so the allocator tracks four gap classes:
//!
//! | Index | [`PageClass`] | tiled | Alignment |
//! |-------|---------------|-------|-----------|
//! | 0     | `Small`       | no    | small page, tile size at class borders |
//! | 1     | `Large`       | no    | large page, tile size at class borders |
//! | 2     | `Small`       | yes   | small page, tile size at both ends |
//! | 3     | `Large`       | yes   | large page, tile size at both ends |
//!
//! Free nodes are **untyped**: the usable part of a free node for a class is
//! computed on demand by rounding each end that borders a used node of the
//! other page type to the tile size, then to the class page size.
//!
//! ## Tree Layout
//!
//! ```text
//!              ┌──────────────────────────┐
//!              │ [0x200000, 0x400000) USED│  maxgap = [a, b, c, d]
//!              └─────────┬────────────────┘
//!          ┌─────────────┴───────────┐
//!   ┌──────▼─────┐             ┌─────▼──────┐
//!   │ FREE ...   │             │ FREE ...   │
//!   └────────────┘             └────────────┘
//! ```
//!
//! Nodes live in an arena and are linked both as a treap (ordered by start
//! address, heap-ordered by random priority) and as an address-ordered list.
//! Each node caches `maxgap[class] = max(gap[class], left.maxgap[class],
//! right.maxgap[class])`, so a search can skip every subtree that cannot hold
//! the request. Two zero-sized sentinel nodes bracket the managed range.
//!
//! ## Fragmentation
//!
//! Unless [`AllocFlags::contiguous`] is set, a request may be satisfied by
//! several fragments; they are chained behind one [`Allocation`] handle and
//! freed together. A request that cannot be completed frees every fragment it
//! already took.
//!
//! ## Example
//!
//! ```rust
//! use gpu_addresses::AddressRange;
//! use gpu_mm::{AllocClass, AllocFlags, PageGeometry, RangeAllocator};
//!
//! let mut vram = RangeAllocator::new(
//!     "vram",
//!     AddressRange::new(0x4_0000, 0x100_0000),
//!     PageGeometry::new(0x1000, 0x2_0000, 0x1000),
//!     7,
//! )
//! .unwrap();
//!
//! let a = vram
//!     .alloc(0x5000, AllocClass::SMALL, AllocFlags::new(), vram.range())
//!     .unwrap();
//! assert_eq!(vram.used_bytes(), 0x5000);
//! vram.free(a).unwrap();
//! assert_eq!(vram.used_bytes(), 0);
//! vram.check_invariants().unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod arena;
mod class;
mod range_allocator;
mod treap;

pub use crate::class::{AllocClass, AllocFlags, PageClass, PageGeometry};
pub use crate::range_allocator::{AllocError, Allocation, Found, RangeAllocator};

/// Number of gap classes tracked per node.
pub const CLASSES: usize = 4;

/// Largest single request accepted by [`RangeAllocator::alloc`].
pub const MAX_REQUEST: u64 = 1 << 60;

//! # GPU Physical and Virtual Address Types
//!
//! Strongly typed wrappers for the two address spaces a GPU memory manager
//! juggles: **physical** addresses (VRAM offsets, host bus addresses,
//! instance memory) and **virtual** addresses inside a per-context GPU
//! address space.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MemoryAddress`] | A raw 64-bit address, either physical or virtual. |
//! | [`PhysicalAddress`] | A VRAM, instance-memory or host bus address. |
//! | [`VirtualAddress`] | An address inside a GPU virtual address space. |
//! | [`AddressRange`] | A half-open `[start, end)` range of raw addresses. |
//!
//! ## Page Sizes
//!
//! GPU page tables use different page sizes than the CPU. The marker types
//! implementing [`PageSize`] cover the sizes used by the supported chipsets:
//!
//! - [`Size4K`]: 4 KiB small pages (both generations, and all host memory)
//! - [`Size64K`]: 64 KiB large pages of the older (Tesla) layout
//! - [`Size128K`]: 128 KiB large pages of the newer (Fermi) layout
//!
//! ## Typical Usage
//!
//! ```rust
//! # use gpu_addresses::*;
//! let va = VirtualAddress::new(0x0802_1234);
//! assert_eq!(va.page_number::<Size4K>(), 0x8021);
//! assert_eq!(va.offset_in::<Size4K>(), 0x234);
//! assert!(!va.is_aligned::<Size128K>());
//!
//! let pa = PhysicalAddress::new(0x4_0000);
//! assert!(pa.is_aligned::<Size128K>());
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`,
//!   and `Hash`, making them usable as map keys.
//! - All alignment calculations are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod address_range;
mod memory_address;
mod page_size;
mod physical_address;
mod virtual_address;

pub use crate::address_range::AddressRange;
pub use crate::memory_address::MemoryAddress;
pub use crate::page_size::{PageSize, Size4K, Size64K, Size128K};
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use gpu_addresses::align_down;
/// assert_eq!(align_down(0,       0x1000), 0);
/// assert_eq!(align_down(0x1fff,  0x1000), 0x1000);
/// assert_eq!(align_down(0x3ffff, 0x20000), 0x20000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u64`; see [`checked_align_up`].
///
/// ### Examples
/// ```rust
/// # use gpu_addresses::align_up;
/// assert_eq!(align_up(0,       0x1000), 0);
/// assert_eq!(align_up(1,       0x1000), 0x1000);
/// assert_eq!(align_up(0x20001, 0x20000), 0x40000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Like [`align_up`], but returns `None` instead of overflowing.
///
/// ```rust
/// # use gpu_addresses::checked_align_up;
/// assert_eq!(checked_align_up(1, 0x1000), Some(0x1000));
/// assert_eq!(checked_align_up(u64::MAX, 0x1000), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Round `x` up to a multiple of `a`, where `a` need not be a power of two.
///
/// The tile size of a VRAM range allocator may be `1` (no tiling) or any
/// page multiple; this helper is used where the divisor is not known to be a
/// power of two.
///
/// ```rust
/// # use gpu_addresses::round_up;
/// assert_eq!(round_up(5, 3), 6);
/// assert_eq!(round_up(6, 3), 6);
/// assert_eq!(round_up(7, 1), 7);
/// ```
#[inline]
#[must_use]
pub const fn round_up(x: u64, a: u64) -> u64 {
    x.div_ceil(a) * a
}

/// Round `x` down to a multiple of `a`, where `a` need not be a power of two.
///
/// ```rust
/// # use gpu_addresses::round_down;
/// assert_eq!(round_down(5, 3), 3);
/// assert_eq!(round_down(7, 1), 7);
/// ```
#[inline]
#[must_use]
pub const fn round_down(x: u64, a: u64) -> u64 {
    x - x % a
}

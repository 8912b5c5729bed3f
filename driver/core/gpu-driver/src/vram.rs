//! # VRAM Store
//!
//! Physical VRAM is managed by one [`RangeAllocator`] behind a lock, plus the
//! global accounting the swap manager converges on:
//!
//! | Counter | Meaning |
//! |---------|---------|
//! | `usage`   | VRAM currently allocated to object chunks |
//! | `demand`  | VRAM that will be allocated once in-flight swaps complete |
//! | `swapped` | bytes of VRAM objects currently held in host memory |
//!
//! Swapping is required while `max(usage, demand) > budget`.
//!
//! The same counters exist per client; see [`Counters`].

use crate::error::DriverResult;
use gpu_addresses::{AddressRange, PhysicalAddress};
use gpu_mm::{AllocClass, AllocFlags, Allocation, PageClass, PageGeometry, RangeAllocator};
use gpu_sync::SpinLock;
use gpu_vmem::PhysicalSegment;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free readable byte counters.
#[derive(Debug, Default)]
pub struct Counters {
    usage: AtomicU64,
    demand: AtomicU64,
    swapped: AtomicU64,
}

macro_rules! counter {
    ($get:ident, $add:ident, $sub:ident) => {
        #[inline]
        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Acquire)
        }

        #[inline]
        pub(crate) fn $add(&self, bytes: u64) {
            self.$get.fetch_add(bytes, Ordering::AcqRel);
        }

        #[inline]
        pub(crate) fn $sub(&self, bytes: u64) {
            let _ = self
                .$get
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(bytes))
                });
        }
    };
}

impl Counters {
    counter!(usage, add_usage, sub_usage);
    counter!(demand, add_demand, sub_demand);
    counter!(swapped, add_swapped, sub_swapped);

    /// `max(usage, demand)`.
    #[must_use]
    pub fn pressure(&self) -> u64 {
        self.usage().max(self.demand())
    }
}

/// Snapshot of the memory accounting.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryStats {
    pub budget: u64,
    pub usage: u64,
    pub demand: u64,
    pub swapped: u64,
    /// Free bytes left in the VRAM allocator.
    pub vram_free: u64,
}

/// Physical VRAM backing of one chunk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VramBlock {
    pub(crate) handle: Allocation,
    pub segments: Vec<PhysicalSegment>,
}

impl VramBlock {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn base(&self) -> Option<PhysicalAddress> {
        self.segments.first().map(|s| s.base)
    }
}

pub struct VramStore {
    alloc: SpinLock<RangeAllocator>,
    budget: AtomicU64,
    counters: Counters,
}

impl VramStore {
    /// # Errors
    /// [`DriverError::InvalidRange`](crate::DriverError::InvalidRange) for an
    /// empty range.
    pub fn new(range: AddressRange, geometry: PageGeometry, budget: u64, seed: u64) -> DriverResult<Self> {
        let alloc = RangeAllocator::new("vram", range, geometry, seed)?;
        let budget = budget.min(alloc.total());
        log::info!(
            "vram: managing {range:?} ({} MiB), budget {} MiB",
            range.len() >> 20,
            budget >> 20
        );
        Ok(Self {
            alloc: SpinLock::new(alloc),
            budget: AtomicU64::new(budget),
            counters: Counters::default(),
        })
    }

    #[inline]
    #[must_use]
    pub const fn counters(&self) -> &Counters {
        &self.counters
    }

    #[inline]
    #[must_use]
    pub fn budget(&self) -> u64 {
        self.budget.load(Ordering::Acquire)
    }

    /// Bytes the allocator manages; the budget never exceeds this.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.alloc.lock().total()
    }

    /// Returns the budget actually installed.
    pub fn set_budget(&self, budget: u64) -> u64 {
        let capacity = self.capacity();
        let budget = if budget > capacity {
            log::warn!("vram: budget 0x{budget:x} exceeds capacity, clamped to 0x{capacity:x}");
            capacity
        } else {
            budget
        };
        log::info!("vram: budget set to 0x{budget:x}");
        self.budget.store(budget, Ordering::Release);
        budget
    }

    /// Bytes by which `max(usage, demand)` exceeds the budget.
    #[must_use]
    pub fn required(&self) -> u64 {
        self.counters.pressure().saturating_sub(self.budget())
    }

    /// Bytes left before the budget is reached.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.budget().saturating_sub(self.counters.pressure())
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.alloc.lock().free_bytes()
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            budget: self.budget(),
            usage: self.counters.usage(),
            demand: self.counters.demand(),
            swapped: self.counters.swapped(),
            vram_free: self.free_bytes(),
        }
    }

    /// Allocate physical VRAM for one chunk. Counters are left to the caller.
    ///
    /// # Errors
    /// Allocator errors lifted into [`DriverError`](crate::DriverError).
    pub fn alloc(&self, size: u64, class: AllocClass, contiguous: bool) -> DriverResult<VramBlock> {
        let mut alloc = self.alloc.lock();
        let window = alloc.range();
        let flags = AllocFlags::new()
            .with_contiguous(contiguous)
            .with_from_back(class.page == PageClass::Large);
        let handle = alloc.alloc(size, class, flags, window)?;
        let segments = alloc
            .regions(handle)?
            .into_iter()
            .map(|r| PhysicalSegment::new(PhysicalAddress::new(r.start), r.len()))
            .collect();
        Ok(VramBlock { handle, segments })
    }

    pub fn free(&self, block: &VramBlock) {
        if let Err(e) = self.alloc.lock().free(block.handle) {
            log::error!("vram: freeing {:?}: {e}", block.base());
        }
    }

    /// Report and count allocations still live at shutdown.
    pub fn take_down(self) -> usize {
        self.alloc.into_inner().take_down(|_, regions| {
            log::warn!("vram: leaked {regions:?}");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(budget: u64) -> VramStore {
        VramStore::new(
            AddressRange::new(0x4_0000, 0x100_0000),
            PageGeometry::new(0x1000, 0x2_0000, 0x1000),
            budget,
            1,
        )
        .unwrap()
    }

    #[test]
    fn pressure_is_max_of_usage_and_demand() {
        let s = store(8 << 20);
        s.counters().add_demand(10 << 20);
        s.counters().add_usage(6 << 20);
        assert_eq!(s.required(), 2 << 20);
        assert_eq!(s.available(), 0);
        s.counters().sub_demand(4 << 20);
        assert_eq!(s.required(), 0);
        assert_eq!(s.available(), 2 << 20);
    }

    #[test]
    fn budget_is_clamped_to_capacity() {
        let s = store(u64::MAX);
        assert_eq!(s.capacity(), 0x100_0000 - 0x4_0000);
        assert_eq!(s.budget(), s.capacity());
        assert_eq!(s.set_budget(1 << 30), s.capacity());
        assert_eq!(s.set_budget(4 << 20), 4 << 20);
        assert_eq!(s.budget(), 4 << 20);
    }

    #[test]
    fn counters_saturate_at_zero() {
        let c = Counters::default();
        c.add_swapped(5);
        c.sub_swapped(9);
        assert_eq!(c.swapped(), 0);
    }

    #[test]
    fn large_blocks_come_from_the_back() {
        let s = store(u64::MAX);
        let small = s.alloc(0x1000, AllocClass::SMALL, true).unwrap();
        let large = s.alloc(0x2_0000, AllocClass::LARGE, true).unwrap();
        assert_eq!(small.base(), Some(PhysicalAddress::new(0x4_0000)));
        assert_eq!(large.base(), Some(PhysicalAddress::new(0x100_0000 - 0x2_0000)));
        assert_eq!(large.len(), 0x2_0000);
        let before = s.free_bytes();
        s.free(&large);
        assert_eq!(s.free_bytes(), before + 0x2_0000);
        s.free(&small);
        assert_eq!(s.take_down(), 0);
    }

    #[test]
    fn fragmented_blocks_list_every_segment() {
        let s = store(u64::MAX);
        let a = s.alloc(0x10_0000, AllocClass::SMALL, true).unwrap();
        let _b = s.alloc(0x1000, AllocClass::SMALL, true).unwrap();
        s.free(&a);
        let total = s.free_bytes();
        let frag = s.alloc(total, AllocClass::SMALL, false).unwrap();
        assert!(frag.segments.len() >= 2);
        assert_eq!(frag.len(), total);
    }
}

use crate::hw::GpuHardware;
use gpu_addresses::{AddressRange, PhysicalAddress};
use gpu_mm::{AllocClass, AllocFlags, Allocation, PageGeometry, RangeAllocator};
use gpu_vmem::TableAlloc;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Driver-private VRAM for page directories, page tables and control pages.
pub struct InstanceMemory {
    alloc: RangeAllocator,
    live: BTreeMap<u64, Allocation>,
    hw: Arc<dyn GpuHardware>,
}

impl InstanceMemory {
    /// # Errors
    /// [`gpu_mm::AllocError::InvalidRange`] for an empty range.
    pub fn new(range: AddressRange, hw: Arc<dyn GpuHardware>, seed: u64) -> Result<Self, gpu_mm::AllocError> {
        Ok(Self {
            alloc: RangeAllocator::new("instance", range, PageGeometry::new(0x1000, 0x1000, 1), seed)?,
            live: BTreeMap::new(),
            hw,
        })
    }

    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.alloc.free_bytes()
    }

    #[must_use]
    pub fn live(&self) -> usize {
        self.live.len()
    }
}

impl TableAlloc for InstanceMemory {
    fn alloc_table(&mut self, bytes: u64) -> Option<PhysicalAddress> {
        let window = self.alloc.range();
        let flags = AllocFlags::new().with_contiguous(true);
        let handle = match self.alloc.alloc(bytes, AllocClass::SMALL, flags, window) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("instance: no room for 0x{bytes:x}: {e}");
                return None;
            }
        };
        let base = self.alloc.regions(handle).ok()?.first()?.start;
        self.hw.clear_vram(PhysicalAddress::new(base), bytes);
        self.live.insert(base, handle);
        Some(PhysicalAddress::new(base))
    }

    fn free_table(&mut self, base: PhysicalAddress, bytes: u64) {
        match self.live.remove(&base.as_u64()) {
            Some(handle) => {
                if let Err(e) = self.alloc.free(handle) {
                    log::error!("instance: freeing {base:?}: {e}");
                }
            }
            None => log::error!("instance: free of unknown block {base:?} (0x{bytes:x})"),
        }
    }
}

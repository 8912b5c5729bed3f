//! Hardware seams.
//!
//! The memory manager never touches registers directly. Everything it needs
//! from the device is expressed through the traits below, bundled as
//! [`GpuHardware`]. The test suite implements them with
//! [`SimulatedGpu`](crate::sim::SimulatedGpu).

use gpu_addresses::{PhysicalAddress, VirtualAddress};
use gpu_vmem::{Aperture, MmuHardware};

/// Hardware channel slot.
pub type ChannelSlot = u32;

/// Command FIFO access for one channel slot.
pub trait FifoHardware {
    /// Attach a slot to a page directory and control page.
    fn bind(&self, chan: ChannelSlot, page_directory: PhysicalAddress, control: PhysicalAddress);

    fn unbind(&self, chan: ChannelSlot);

    /// Point the slot's indirect buffer at `ib` holding `1 << order` entries.
    fn setup_ib(&self, chan: ChannelSlot, ib: VirtualAddress, order: u32);

    fn read_control(&self, chan: ChannelSlot, offset: u32) -> u32;

    fn write_control(&self, chan: ChannelSlot, offset: u32, value: u32);

    /// Queue a barrier that writes `seq` to the channel fence once all prior
    /// work has retired.
    fn emit_fence(&self, chan: ChannelSlot, seq: u32);

    /// Last sequence number written back by the channel.
    fn fence_value(&self, chan: ChannelSlot) -> u32;

    /// Stop fetching commands.
    fn halt(&self, chan: ChannelSlot);

    /// Resume fetching commands.
    fn resume(&self, chan: ChannelSlot);
}

/// Physical location of one side of a copy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryLocation {
    pub aperture: Aperture,
    pub base: PhysicalAddress,
}

impl MemoryLocation {
    #[inline]
    #[must_use]
    pub const fn new(aperture: Aperture, base: PhysicalAddress) -> Self {
        Self { aperture, base }
    }
}

/// Sequence number of a submitted copy.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Fence(pub u64);

/// DMA copy engine.
pub trait MigrationEngine {
    /// Queue a copy of `len` bytes.
    ///
    /// # Errors
    /// A static description if the engine rejected the copy.
    fn copy(&self, src: MemoryLocation, dst: MemoryLocation, len: u64) -> Result<Fence, &'static str>;

    fn fence_reached(&self, fence: Fence) -> bool;
}

/// Host RAM pages used as swap backing and for host-class objects.
pub trait HostMemory {
    /// One zeroed 4 KiB page, or `None` when host memory is exhausted.
    fn alloc_page(&self) -> Option<PhysicalAddress>;

    fn free_page(&self, page: PhysicalAddress);

    fn read_host(&self, pa: PhysicalAddress, buf: &mut [u8]);

    fn write_host(&self, pa: PhysicalAddress, buf: &[u8]);
}

/// CPU access to VRAM through the BAR.
pub trait VramAccess {
    fn read_vram(&self, pa: PhysicalAddress, buf: &mut [u8]);

    fn write_vram(&self, pa: PhysicalAddress, buf: &[u8]);

    /// Zero `len` bytes starting at `pa`.
    fn clear_vram(&self, pa: PhysicalAddress, len: u64);
}

/// Everything the driver needs from a device.
pub trait GpuHardware:
    MmuHardware + FifoHardware + MigrationEngine + HostMemory + VramAccess + Send + Sync
{
}

impl<T> GpuHardware for T where
    T: MmuHardware + FifoHardware + MigrationEngine + HostMemory + VramAccess + Send + Sync
{
}

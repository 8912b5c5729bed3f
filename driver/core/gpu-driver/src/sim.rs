//! # Simulated Device
//!
//! An in-memory implementation of every hardware seam, used by the test
//! suite and by hosts without a real device.
//!
//! | Seam | Behaviour |
//! |------|-----------|
//! | [`MmuHardware`] | entries land in VRAM; flushes succeed unless [`SimulatedGpu::stall_flush`] or [`SimulatedGpu::fail_flushes`] says otherwise |
//! | [`FifoHardware`] | fences retire immediately unless [`SimulatedGpu::stall_fifo`] is set |
//! | [`MigrationEngine`] | copies synchronously; [`SimulatedGpu::fail_dma`] rejects the next copies |
//! | [`HostMemory`] | sparse 4 KiB pages above [`HOST_BASE`], optionally limited |
//! | [`VramAccess`] | sparse byte store |
//!
//! Every hardware call of interest is appended to an event log so tests can
//! check ordering (for example that a channel was halted before its memory
//! was copied).

use crate::hw::{ChannelSlot, FifoHardware, Fence, HostMemory, MemoryLocation, MigrationEngine, VramAccess};
use gpu_addresses::{PhysicalAddress, VirtualAddress};
use gpu_info::layout::CONTROL_PAGE_SIZE;
use gpu_sync::SpinLock;
use gpu_vmem::{Aperture, EngineMask, FlushError, MmuHardware};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// First host page address handed out.
pub const HOST_BASE: u64 = 0x10_0000_0000;

const PAGE: u64 = 0x1000;

/// Something the simulated hardware was asked to do.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SimEvent {
    Bind(ChannelSlot),
    Unbind(ChannelSlot),
    Fence { chan: ChannelSlot, seq: u32 },
    Halt(ChannelSlot),
    Resume(ChannelSlot),
    Copy {
        src: MemoryLocation,
        dst: MemoryLocation,
        len: u64,
    },
    Invalidate(PhysicalAddress),
}

/// Sparse page-granular byte store.
#[derive(Default)]
struct Bytes {
    pages: HashMap<u64, Box<[u8]>>,
}

impl Bytes {
    fn read(&self, addr: u64, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            let off = (at % PAGE) as usize;
            let n = (PAGE as usize - off).min(buf.len() - done);
            match self.pages.get(&(at / PAGE)) {
                Some(page) => buf[done..done + n].copy_from_slice(&page[off..off + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    fn write(&mut self, addr: u64, buf: &[u8]) {
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            let off = (at % PAGE) as usize;
            let n = (PAGE as usize - off).min(buf.len() - done);
            let page = self
                .pages
                .entry(at / PAGE)
                .or_insert_with(|| vec![0; PAGE as usize].into_boxed_slice());
            page[off..off + n].copy_from_slice(&buf[done..done + n]);
            done += n;
        }
    }

    fn clear(&mut self, addr: u64, len: u64) {
        let end = addr + len;
        let mut at = addr;
        while at < end {
            let off = at % PAGE;
            let n = (PAGE - off).min(end - at);
            if off == 0 && n == PAGE {
                self.pages.remove(&(at / PAGE));
            } else if let Some(page) = self.pages.get_mut(&(at / PAGE)) {
                page[off as usize..(off + n) as usize].fill(0);
            }
            at += n;
        }
    }
}

struct HostPool {
    next: u64,
    free: Vec<u64>,
    live: BTreeSet<u64>,
    limit: Option<usize>,
}

struct SimChannel {
    control: Vec<u32>,
    fence: u32,
    /// Highest sequence emitted while the FIFO was stalled.
    queued: u32,
    halted: bool,
    ib: Option<(VirtualAddress, u32)>,
}

impl SimChannel {
    fn new() -> Self {
        Self {
            control: vec![0; (CONTROL_PAGE_SIZE / 4) as usize],
            fence: 0,
            queued: 0,
            halted: false,
            ib: None,
        }
    }
}

pub struct SimulatedGpu {
    vram: SpinLock<Bytes>,
    host: SpinLock<Bytes>,
    host_pool: SpinLock<HostPool>,
    channels: SpinLock<HashMap<ChannelSlot, SimChannel>>,
    events: SpinLock<Vec<SimEvent>>,
    next_fence: AtomicU64,
    fail_dma: AtomicU32,
    stall_fifo: AtomicBool,
    stall_flush: AtomicBool,
    /// Acknowledgements still granted, then acknowledgements to refuse.
    flush_faults: SpinLock<(u32, u32)>,
}

impl Default for SimulatedGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGpu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vram: SpinLock::new(Bytes::default()),
            host: SpinLock::new(Bytes::default()),
            host_pool: SpinLock::new(HostPool {
                next: HOST_BASE,
                free: Vec::new(),
                live: BTreeSet::new(),
                limit: None,
            }),
            channels: SpinLock::new(HashMap::new()),
            events: SpinLock::new(Vec::new()),
            next_fence: AtomicU64::new(0),
            fail_dma: AtomicU32::new(0),
            stall_fifo: AtomicBool::new(false),
            stall_flush: AtomicBool::new(false),
            flush_faults: SpinLock::new((0, 0)),
        }
    }

    /// Reject the next `count` copies.
    pub fn fail_dma(&self, count: u32) {
        self.fail_dma.store(count, Ordering::Release);
    }

    /// Stop retiring fences. Clearing the stall retires everything queued.
    pub fn stall_fifo(&self, stalled: bool) {
        self.stall_fifo.store(stalled, Ordering::Release);
        if !stalled {
            for ch in self.channels.lock().values_mut() {
                ch.fence = ch.fence.max(ch.queued);
            }
        }
    }

    /// Refuse to acknowledge flushes and TLB invalidations.
    pub fn stall_flush(&self, stalled: bool) {
        self.stall_flush.store(stalled, Ordering::Release);
    }

    /// Acknowledge `after` more flushes or invalidations, then refuse the
    /// following `count`. A commit consumes one of each.
    pub fn fail_flushes(&self, after: u32, count: u32) {
        *self.flush_faults.lock() = (after, count);
    }

    /// The 8-byte page-table entry stored at `at`.
    #[must_use]
    pub fn entry_at(&self, at: PhysicalAddress) -> u64 {
        let mut raw = [0; 8];
        self.vram.lock().read(at.as_u64(), &mut raw);
        u64::from_le_bytes(raw)
    }

    fn flush_refused(&self) -> bool {
        if self.stall_flush.load(Ordering::Acquire) {
            return true;
        }
        let mut faults = self.flush_faults.lock();
        match *faults {
            (0, 0) => false,
            (0, ref mut count) => {
                *count -= 1;
                true
            }
            (ref mut after, _) => {
                *after -= 1;
                false
            }
        }
    }

    /// Cap the number of live host pages.
    pub fn limit_host_pages(&self, limit: Option<usize>) {
        self.host_pool.lock().limit = limit;
    }

    #[must_use]
    pub fn host_pages_live(&self) -> usize {
        self.host_pool.lock().live.len()
    }

    #[must_use]
    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    #[must_use]
    pub fn is_halted(&self, chan: ChannelSlot) -> bool {
        self.channels.lock().get(&chan).is_some_and(|c| c.halted)
    }

    #[must_use]
    pub fn is_bound(&self, chan: ChannelSlot) -> bool {
        self.channels.lock().contains_key(&chan)
    }

    #[must_use]
    pub fn indirect_buffer(&self, chan: ChannelSlot) -> Option<(VirtualAddress, u32)> {
        self.channels.lock().get(&chan).and_then(|c| c.ib)
    }

    /// Poke a control word the way the fetcher would.
    pub fn set_control(&self, chan: ChannelSlot, offset: u32, value: u32) {
        self.write_control(chan, offset, value);
    }

    fn record(&self, event: SimEvent) {
        self.events.lock().push(event);
    }

    fn store(&self, aperture: Aperture) -> &SpinLock<Bytes> {
        if aperture.is_system() { &self.host } else { &self.vram }
    }
}

impl MmuHardware for SimulatedGpu {
    fn write_entry(&self, at: PhysicalAddress, value: u64) {
        self.vram.lock().write(at.as_u64(), &value.to_le_bytes());
    }

    fn bar_flush(&self, _timeout: Duration) -> Result<(), FlushError> {
        if self.flush_refused() {
            return Err(FlushError::Timeout);
        }
        Ok(())
    }

    fn tlb_invalidate(
        &self,
        page_directory: PhysicalAddress,
        _engines: EngineMask,
        _timeout: Duration,
    ) -> Result<(), FlushError> {
        if self.flush_refused() {
            return Err(FlushError::Busy);
        }
        self.record(SimEvent::Invalidate(page_directory));
        Ok(())
    }
}

impl FifoHardware for SimulatedGpu {
    fn bind(&self, chan: ChannelSlot, _page_directory: PhysicalAddress, _control: PhysicalAddress) {
        self.channels.lock().insert(chan, SimChannel::new());
        self.record(SimEvent::Bind(chan));
    }

    fn unbind(&self, chan: ChannelSlot) {
        self.channels.lock().remove(&chan);
        self.record(SimEvent::Unbind(chan));
    }

    fn setup_ib(&self, chan: ChannelSlot, ib: VirtualAddress, order: u32) {
        if let Some(c) = self.channels.lock().get_mut(&chan) {
            c.ib = Some((ib, order));
        }
    }

    fn read_control(&self, chan: ChannelSlot, offset: u32) -> u32 {
        self.channels
            .lock()
            .get(&chan)
            .and_then(|c| c.control.get((offset / 4) as usize).copied())
            .unwrap_or(0)
    }

    fn write_control(&self, chan: ChannelSlot, offset: u32, value: u32) {
        if let Some(word) = self
            .channels
            .lock()
            .get_mut(&chan)
            .and_then(|c| c.control.get_mut((offset / 4) as usize))
        {
            *word = value;
        }
    }

    fn emit_fence(&self, chan: ChannelSlot, seq: u32) {
        let stalled = self.stall_fifo.load(Ordering::Acquire);
        if let Some(c) = self.channels.lock().get_mut(&chan) {
            if stalled {
                c.queued = seq;
            } else {
                c.fence = seq;
            }
        }
        self.record(SimEvent::Fence { chan, seq });
    }

    fn fence_value(&self, chan: ChannelSlot) -> u32 {
        self.channels.lock().get(&chan).map_or(0, |c| c.fence)
    }

    fn halt(&self, chan: ChannelSlot) {
        if let Some(c) = self.channels.lock().get_mut(&chan) {
            c.halted = true;
        }
        self.record(SimEvent::Halt(chan));
    }

    fn resume(&self, chan: ChannelSlot) {
        if let Some(c) = self.channels.lock().get_mut(&chan) {
            c.halted = false;
        }
        self.record(SimEvent::Resume(chan));
    }
}

impl MigrationEngine for SimulatedGpu {
    fn copy(&self, src: MemoryLocation, dst: MemoryLocation, len: u64) -> Result<Fence, &'static str> {
        if self
            .fail_dma
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("injected DMA fault");
        }
        let len_bytes = usize::try_from(len).map_err(|_| "copy too large")?;
        let mut buf = vec![0u8; len_bytes];
        self.store(src.aperture).lock().read(src.base.as_u64(), &mut buf);
        self.store(dst.aperture).lock().write(dst.base.as_u64(), &buf);
        self.record(SimEvent::Copy { src, dst, len });
        Ok(Fence(self.next_fence.fetch_add(1, Ordering::AcqRel) + 1))
    }

    fn fence_reached(&self, fence: Fence) -> bool {
        self.next_fence.load(Ordering::Acquire) >= fence.0
    }
}

impl HostMemory for SimulatedGpu {
    fn alloc_page(&self) -> Option<PhysicalAddress> {
        let mut pool = self.host_pool.lock();
        if pool.limit.is_some_and(|l| pool.live.len() >= l) {
            return None;
        }
        let pa = if let Some(pa) = pool.free.pop() {
            pa
        } else {
            let pa = pool.next;
            pool.next += PAGE;
            pa
        };
        pool.live.insert(pa);
        drop(pool);
        self.host.lock().clear(pa, PAGE);
        Some(PhysicalAddress::new(pa))
    }

    fn free_page(&self, page: PhysicalAddress) {
        let mut pool = self.host_pool.lock();
        if pool.live.remove(&page.as_u64()) {
            pool.free.push(page.as_u64());
        } else {
            log::error!("sim: free of unknown host page {page:?}");
        }
    }

    fn read_host(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        self.host.lock().read(pa.as_u64(), buf);
    }

    fn write_host(&self, pa: PhysicalAddress, buf: &[u8]) {
        self.host.lock().write(pa.as_u64(), buf);
    }
}

impl VramAccess for SimulatedGpu {
    fn read_vram(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        self.vram.lock().read(pa.as_u64(), buf);
    }

    fn write_vram(&self, pa: PhysicalAddress, buf: &[u8]) {
        self.vram.lock().write(pa.as_u64(), buf);
    }

    fn clear_vram(&self, pa: PhysicalAddress, len: u64) {
        self.vram.lock().clear(pa.as_u64(), len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_store_spans_pages() {
        let gpu = SimulatedGpu::new();
        let data: Vec<u8> = (0..=255).cycle().take(0x1800).collect();
        gpu.write_vram(PhysicalAddress::new(0x1f00), &data);
        let mut back = vec![0; data.len()];
        gpu.read_vram(PhysicalAddress::new(0x1f00), &mut back);
        assert_eq!(back, data);
        gpu.clear_vram(PhysicalAddress::new(0x2000), 0x1000);
        gpu.read_vram(PhysicalAddress::new(0x1f00), &mut back);
        assert_eq!(&back[..0x100], &data[..0x100]);
        assert!(back[0x100..0x1100].iter().all(|&b| b == 0));
    }

    #[test]
    fn flush_faults_follow_the_granted_acknowledgements() {
        let gpu = SimulatedGpu::new();
        let pd = PhysicalAddress::new(0x1000);
        gpu.fail_flushes(1, 2);
        assert_eq!(gpu.bar_flush(Duration::ZERO), Ok(()));
        assert_eq!(gpu.tlb_invalidate(pd, EngineMask::ALL, Duration::ZERO), Err(FlushError::Busy));
        assert_eq!(gpu.bar_flush(Duration::ZERO), Err(FlushError::Timeout));
        assert_eq!(gpu.bar_flush(Duration::ZERO), Ok(()));
        assert_eq!(gpu.tlb_invalidate(pd, EngineMask::ALL, Duration::ZERO), Ok(()));
    }

    #[test]
    fn entries_are_little_endian_words_in_vram() {
        let gpu = SimulatedGpu::new();
        gpu.write_entry(PhysicalAddress::new(0x2008), 0x1122_3344_5566_7788);
        assert_eq!(gpu.entry_at(PhysicalAddress::new(0x2008)), 0x1122_3344_5566_7788);
        let mut low = [0; 1];
        gpu.read_vram(PhysicalAddress::new(0x2008), &mut low);
        assert_eq!(low, [0x88]);
        assert_eq!(gpu.entry_at(PhysicalAddress::new(0x2000)), 0);
    }

    #[test]
    fn copies_move_bytes_between_apertures() {
        let gpu = SimulatedGpu::new();
        let page = gpu.alloc_page().unwrap();
        gpu.write_vram(PhysicalAddress::new(0x8000), b"chunk");
        let fence = gpu
            .copy(
                MemoryLocation::new(Aperture::Vram, PhysicalAddress::new(0x8000)),
                MemoryLocation::new(Aperture::HostSnooped, page),
                5,
            )
            .unwrap();
        assert!(gpu.fence_reached(fence));
        let mut buf = [0; 5];
        gpu.read_host(page, &mut buf);
        assert_eq!(&buf, b"chunk");

        gpu.fail_dma(1);
        assert!(gpu.copy(MemoryLocation::new(Aperture::Vram, page), MemoryLocation::new(Aperture::Vram, page), 1).is_err());
        assert!(gpu.copy(MemoryLocation::new(Aperture::Vram, page), MemoryLocation::new(Aperture::Vram, page), 1).is_ok());
    }

    #[test]
    fn host_pages_are_recycled_and_limited() {
        let gpu = SimulatedGpu::new();
        gpu.limit_host_pages(Some(1));
        let a = gpu.alloc_page().unwrap();
        assert!(gpu.alloc_page().is_none());
        gpu.write_host(a, &[1, 2, 3]);
        gpu.free_page(a);
        let b = gpu.alloc_page().unwrap();
        assert_eq!(a, b);
        let mut buf = [9; 3];
        gpu.read_host(b, &mut buf);
        assert_eq!(buf, [0, 0, 0]);
    }

    #[test]
    fn stalled_fifo_holds_fences_back() {
        let gpu = SimulatedGpu::new();
        gpu.bind(3, PhysicalAddress::new(0), PhysicalAddress::new(0));
        gpu.stall_fifo(true);
        gpu.emit_fence(3, 7);
        assert_eq!(gpu.fence_value(3), 0);
        gpu.stall_fifo(false);
        assert_eq!(gpu.fence_value(3), 7);
    }
}

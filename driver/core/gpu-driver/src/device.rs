//! # Device
//!
//! The facade the request-dispatch layer talks to. One [`Device`] owns the
//! VRAM store, instance memory, the handle tables and the pause worker pool.
//!
//! ## Lock Order
//!
//! ```text
//! handle tables → object state → vspace → instance memory → client sets
//! ```
//!
//! Handle-table locks are only held long enough to clone an `Arc` out. No lock
//! is held while waiting on a channel pause or a DMA fence.

use crate::channel::{Channel, ChannelState, IbBinding, PauseHandle};
use crate::client::{ChunkRef, ChunkSet, Client, SetSizes};
use crate::error::{DriverError, DriverResult};
use crate::handle::{ChannelId, ClientId, HandleTable, ObjectId, RawHandle, VspaceId};
use crate::hw::GpuHardware;
use crate::instance::InstanceMemory;
use crate::object::{chunk_layout, Backing, Chunk, MemoryClass, Object, ObjectFlags, ObjectMapping, ObjectState, HOST_PAGE};
use crate::swap::{BackgroundSwap, SwapManager};
use crate::vram::{MemoryStats, VramBlock, VramStore};
use crate::vspace::Vspace;
use gpu_addresses::{align_up, AddressRange, PhysicalAddress, VirtualAddress};
use gpu_info::layout::{
    CONTROL_PAGE_SIZE, IB_ENTRY_SIZE, MAX_CHANNELS, MAX_OBJECT_SIZE, MAX_VSPACES, VRAM_FIRST_USABLE,
    VRAM_TAIL_RESERVED, VRAM_TILE_SIZE,
};
use gpu_info::DriverConfig;
use gpu_mm::{PageClass, PageGeometry};
use gpu_sync::{SpinLock, WorkerPool};
use gpu_vmem::{AddressSpace, Aperture, MmuHardware, TableAlloc};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// Large page of the VRAM allocator.
const VRAM_LARGE_PAGE: u64 = 0x2_0000;

const MAX_OBJECTS: usize = 1 << 16;
const MAX_CLIENTS: usize = 1 << 10;

/// Largest indirect-buffer order accepted by `chan_init_submission`.
const MAX_IB_ORDER: u32 = 20;

/// Per-client snapshot returned by [`Device::client_stats`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClientStats {
    pub usage: u64,
    pub demand: u64,
    pub swapped: u64,
    pub sets: SetSizes,
}

pub struct Device {
    pub(crate) config: DriverConfig,
    pub(crate) hw: Arc<dyn GpuHardware>,
    pub(crate) vram: VramStore,
    pub(crate) instance: SpinLock<InstanceMemory>,
    pub(crate) pool: WorkerPool,
    pub(crate) rng: SpinLock<ChaCha8Rng>,
    objects: SpinLock<HandleTable<Arc<Object>>>,
    vspaces: SpinLock<HandleTable<Arc<Vspace>>>,
    channels: SpinLock<HandleTable<Arc<Channel>>>,
    clients: SpinLock<HandleTable<Arc<Client>>>,
}

impl Device {
    /// Build the memory manager for a device of `config.vram_size` bytes.
    ///
    /// VRAM is laid out as:
    ///
    /// ```text
    /// 0 ─ reserved ─ 0x40000 ─── object VRAM ─── │ ─ instance ─ │ ─ 0x20000 tail ─ vram_size
    /// ```
    ///
    /// # Errors
    /// - [`DriverError::InvalidRange`] for a configuration that does not
    ///   validate or leaves no room for objects.
    /// - [`DriverError::Hardware`] if the worker pool cannot be started.
    pub fn new(config: DriverConfig, hw: Arc<dyn GpuHardware>) -> DriverResult<Self> {
        config.validate()?;
        let vram_end = config.vram_size - VRAM_TAIL_RESERVED;
        let instance_start = vram_end
            .checked_sub(config.instance_size)
            .filter(|&s| s > VRAM_FIRST_USABLE)
            .ok_or(DriverError::InvalidRange)?;

        let vram = VramStore::new(
            AddressRange::new(VRAM_FIRST_USABLE, instance_start),
            PageGeometry::new(0x1000, VRAM_LARGE_PAGE, VRAM_TILE_SIZE),
            config.effective_budget(),
            config.rng_seed,
        )?;
        let instance = InstanceMemory::new(
            AddressRange::new(instance_start, vram_end),
            Arc::clone(&hw),
            config.rng_seed.rotate_left(17),
        )?;
        let pool = WorkerPool::new("gpu-pause", config.workers).map_err(|e| {
            log::error!("device: cannot start worker pool: {e}");
            DriverError::Hardware("worker pool")
        })?;

        log::info!(
            "device: {} with {} MiB VRAM, {} MiB instance memory, budget {} MiB",
            config.generation,
            config.vram_size >> 20,
            config.instance_size >> 20,
            config.effective_budget() >> 20
        );
        Ok(Self {
            rng: SpinLock::new(ChaCha8Rng::seed_from_u64(config.rng_seed)),
            config,
            hw,
            vram,
            instance: SpinLock::new(instance),
            pool,
            objects: SpinLock::new(HandleTable::new(MAX_OBJECTS)),
            vspaces: SpinLock::new(HandleTable::new(MAX_VSPACES)),
            channels: SpinLock::new(HandleTable::new(MAX_CHANNELS)),
            clients: SpinLock::new(HandleTable::new(MAX_CLIENTS)),
        })
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        self.vram.stats()
    }

    /// Change the swap budget. Takes effect on the next allocation or swap pass.
    /// A budget beyond the object VRAM is clamped to it.
    pub fn set_budget(&self, budget: u64) {
        self.vram.set_budget(budget);
    }

    #[must_use]
    pub const fn swap(&self) -> SwapManager<'_> {
        SwapManager::new(self)
    }

    /// Start the periodic re-admission pass, if configured.
    #[must_use]
    pub fn start_background(self: &Arc<Self>) -> Option<BackgroundSwap> {
        match self.config.background_interval_ms {
            0 => None,
            ms => Some(SwapManager::background(Arc::clone(self), Duration::from_millis(ms))),
        }
    }

    pub(crate) fn mmu(&self) -> &dyn MmuHardware {
        &*self.hw
    }

    pub(crate) const fn verbose(&self) -> bool {
        self.config.debug_level >= 2
    }

    // --- lookups -----------------------------------------------------------

    pub(crate) fn object(&self, id: ObjectId) -> DriverResult<Arc<Object>> {
        self.objects.lock().get(id.0).cloned().ok_or(DriverError::InvalidHandle)
    }

    pub(crate) fn vspace(&self, id: VspaceId) -> DriverResult<Arc<Vspace>> {
        self.vspaces.lock().get(id.0).cloned().ok_or(DriverError::InvalidHandle)
    }

    pub(crate) fn channel(&self, id: ChannelId) -> DriverResult<Arc<Channel>> {
        self.channels.lock().get(id.0).cloned().ok_or(DriverError::InvalidHandle)
    }

    pub(crate) fn client(&self, id: ClientId) -> DriverResult<Arc<Client>> {
        self.clients.lock().get(id.0).cloned().ok_or(DriverError::InvalidHandle)
    }

    pub(crate) fn all_clients(&self) -> Vec<Arc<Client>> {
        self.clients.lock().iter().map(|(_, c)| Arc::clone(c)).collect()
    }

    // --- clients -----------------------------------------------------------

    /// # Errors
    /// [`DriverError::OutOfMemory`] if the client table is full.
    pub fn client_new(&self) -> DriverResult<ClientId> {
        let raw = self
            .clients
            .lock()
            .insert_with(|h| Arc::new(Client::new(ClientId(h))))?;
        log::debug!("device: new client {}", ClientId(raw));
        Ok(ClientId(raw))
    }

    /// Free every object of the client, then the client.
    ///
    /// # Errors
    /// - [`DriverError::InvalidHandle`] for an unknown client.
    /// - [`DriverError::Busy`] if one of its chunks is mid-migration.
    pub fn client_free(&self, id: ClientId) -> DriverResult<()> {
        self.client(id)?;
        let owned: Vec<ObjectId> = self
            .objects
            .lock()
            .iter()
            .filter(|(_, o)| o.client == id)
            .map(|(_, o)| o.id)
            .collect();
        for object in owned {
            match self.release_object(object) {
                Ok(()) | Err(DriverError::InvalidHandle) => {}
                Err(e) => return Err(e),
            }
        }
        self.clients.lock().remove(id.0);
        log::debug!("device: freed client {id}");
        Ok(())
    }

    /// Accounting and chunk-set sizes of one client.
    ///
    /// # Errors
    /// [`DriverError::InvalidHandle`] for an unknown client.
    pub fn client_stats(&self, id: ClientId) -> DriverResult<ClientStats> {
        let c = self.client(id)?;
        Ok(ClientStats {
            usage: c.counters().usage(),
            demand: c.counters().demand(),
            swapped: c.counters().swapped(),
            sets: c.set_sizes(),
        })
    }

    /// Set holding chunk `chunk` of `object`, if any.
    ///
    /// # Errors
    /// [`DriverError::InvalidHandle`] for an unknown object.
    pub fn chunk_set(&self, object: ObjectId, chunk: u32) -> DriverResult<Option<ChunkSet>> {
        let obj = self.object(object)?;
        let owner = self.client(obj.client)?;
        Ok(owner.set_of(ChunkRef { object, chunk }))
    }

    // --- objects -----------------------------------------------------------

    /// Allocate an object of `size` bytes.
    ///
    /// Sizes are rounded up to 4 KiB, or to 128 KiB for [`MemoryClass::VramLarge`].
    /// VRAM objects are admitted against the budget first; swappable ones may
    /// evict other chunks to make room.
    ///
    /// # Errors
    /// - [`DriverError::InvalidRange`] for a zero or oversized request.
    /// - [`DriverError::OutOfMemory`] if VRAM, host memory or the budget is
    ///   exhausted after the swap retries.
    /// - [`DriverError::InvalidHandle`] for an unknown client.
    pub fn object_new(
        &self,
        client: ClientId,
        size: u64,
        class: MemoryClass,
        tile_flags: u8,
        flags: ObjectFlags,
    ) -> DriverResult<ObjectId> {
        let owner = self.client(client)?;
        if size == 0 || size >= MAX_OBJECT_SIZE {
            return Err(DriverError::InvalidRange);
        }
        let page = match class {
            MemoryClass::VramLarge => VRAM_LARGE_PAGE,
            _ => HOST_PAGE,
        };
        let size = align_up(size, page);
        let tile_flags = if class.is_vram() { tile_flags } else { 0 };
        let flags = if class.is_vram() { flags } else { flags.with_swappable(false) };

        let chunks = if class.is_vram() {
            self.admit(&owner, size, flags.swappable())?;
            self.alloc_vram_chunks(&owner, size, class, tile_flags, flags)?
        } else {
            self.alloc_host_chunks(size, class.aperture())?
        };

        let count = chunks.len();
        let mut table = self.objects.lock();
        if table.len() >= MAX_OBJECTS {
            drop(table);
            log::warn!("device: object table full");
            for chunk in &chunks {
                self.release_backing(&chunk.backing);
            }
            if class.is_vram() {
                self.vram.counters().sub_usage(size);
                self.vram.counters().sub_demand(size);
                owner.counters().sub_usage(size);
                owner.counters().sub_demand(size);
            }
            return Err(DriverError::OutOfMemory);
        }
        let raw = table.insert_with(|h| {
            Arc::new(Object {
                id: ObjectId(h),
                client,
                size,
                class,
                tile_flags,
                flags,
                state: SpinLock::new(ObjectState {
                    chunks,
                    mappings: Vec::new(),
                }),
            })
        })?;
        drop(table);
        let id = ObjectId(raw);

        if class.is_vram() && flags.swappable() {
            for chunk in 0..count {
                #[allow(clippy::cast_possible_truncation)]
                owner.insert(ChunkRef { object: id, chunk: chunk as u32 }, ChunkSet::Candidate);
            }
        }
        log::debug!("device: {id} of 0x{size:x} bytes ({class:?}, {count} chunks) for {client}");
        Ok(id)
    }

    /// Raise demand by `size` and swap until it fits the budget.
    fn admit(&self, owner: &Client, size: u64, swappable: bool) -> DriverResult<()> {
        self.vram.counters().add_demand(size);
        owner.counters().add_demand(size);
        if !swappable {
            return Ok(());
        }

        let mut attempts = 0;
        loop {
            let required = self.vram.required();
            if required == 0 {
                return Ok(());
            }
            if attempts >= self.config.swap_retries {
                self.vram.counters().sub_demand(size);
                owner.counters().sub_demand(size);
                log::warn!("device: 0x{required:x} bytes over budget after {attempts} swap attempts");
                return Err(DriverError::OutOfMemory);
            }
            attempts += 1;
            let freed = self.swap().reduce(required);
            log::debug!("device: swap attempt {attempts} freed 0x{freed:x} of 0x{required:x}");
        }
    }

    fn alloc_vram_chunks(
        &self,
        owner: &Client,
        size: u64,
        class: MemoryClass,
        tile_flags: u8,
        flags: ObjectFlags,
    ) -> DriverResult<Vec<Chunk>> {
        let alloc_class = gpu_mm::AllocClass::new(class.page(), tile_flags != 0);
        let mut chunks = Vec::new();
        for (offset, len) in chunk_layout(size, self.config.chunk_size) {
            match self.alloc_vram_block(len, alloc_class, flags.contiguous()) {
                Ok(block) => {
                    for seg in &block.segments {
                        self.hw.clear_vram(seg.base, seg.len);
                    }
                    if self.verbose() {
                        log::trace!("device: chunk +0x{offset:x} at {:?}", block.segments);
                    }
                    self.vram.counters().add_usage(len);
                    owner.counters().add_usage(len);
                    chunks.push(Chunk {
                        offset,
                        size: len,
                        backing: Backing::Vram(block),
                    });
                }
                Err(e) => {
                    log::debug!("device: chunk +0x{offset:x} of 0x{len:x} failed: {e}");
                    for chunk in &chunks {
                        self.release_backing(&chunk.backing);
                        self.vram.counters().sub_usage(chunk.size);
                        owner.counters().sub_usage(chunk.size);
                    }
                    self.vram.counters().sub_demand(size);
                    owner.counters().sub_demand(size);
                    return Err(e);
                }
            }
        }
        Ok(chunks)
    }

    /// Carve one block, evicting swappable chunks when the allocator itself is
    /// exhausted even though the budget admitted the request.
    fn alloc_vram_block(&self, len: u64, class: gpu_mm::AllocClass, contiguous: bool) -> DriverResult<VramBlock> {
        let mut attempts = 0;
        loop {
            match self.vram.alloc(len, class, contiguous) {
                Err(DriverError::OutOfMemory) if attempts < self.config.swap_retries => {
                    attempts += 1;
                    let freed = self.swap().reduce(len);
                    log::debug!("device: vram exhausted, swap attempt {attempts} freed 0x{freed:x} of 0x{len:x}");
                    if freed == 0 {
                        return Err(DriverError::OutOfMemory);
                    }
                }
                other => return other,
            }
        }
    }

    fn alloc_host_chunks(&self, size: u64, aperture: Aperture) -> DriverResult<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = Vec::new();
        for (offset, len) in chunk_layout(size, self.config.chunk_size) {
            match self.alloc_host(len, aperture) {
                Ok(backing) => chunks.push(Chunk { offset, size: len, backing }),
                Err(e) => {
                    for chunk in &chunks {
                        self.release_backing(&chunk.backing);
                    }
                    return Err(e);
                }
            }
        }
        Ok(chunks)
    }

    /// Host pages for `len` bytes.
    pub(crate) fn alloc_host(&self, len: u64, aperture: Aperture) -> DriverResult<Backing> {
        let count = usize::try_from(len.div_ceil(HOST_PAGE)).map_err(|_| DriverError::InvalidRange)?;
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(page) = self.hw.alloc_page() else {
                log::warn!("device: host memory exhausted after {} pages", pages.len());
                for p in pages {
                    self.hw.free_page(p);
                }
                return Err(DriverError::OutOfMemory);
            };
            pages.push(page);
        }
        Ok(Backing::Host { pages, aperture })
    }

    pub(crate) fn release_backing(&self, backing: &Backing) {
        match backing {
            Backing::Vram(block) => self.vram.free(block),
            Backing::Host { pages, .. } => {
                for &p in pages {
                    self.hw.free_page(p);
                }
            }
        }
    }

    /// Unmap and free an object.
    ///
    /// # Errors
    /// - [`DriverError::InvalidHandle`] for an unknown object.
    /// - [`DriverError::InvalidState`] if a channel uses it as indirect buffer.
    /// - [`DriverError::Busy`] if one of its chunks is mid-migration.
    pub fn object_free(&self, id: ObjectId) -> DriverResult<()> {
        let in_use = self
            .channels
            .lock()
            .iter()
            .any(|(_, c)| c.ib().is_some_and(|ib| ib.object == id));
        if in_use {
            return Err(DriverError::InvalidState);
        }
        self.release_object(id)
    }

    fn release_object(&self, id: ObjectId) -> DriverResult<()> {
        let object = self.object(id)?;
        let owner = self.client(object.client).ok();
        let count = object.state.lock().chunks.len();

        if let Some(owner) = &owner
            && object.class.is_vram()
            && object.flags.swappable()
        {
            let mut removed = Vec::new();
            for chunk in 0..count {
                #[allow(clippy::cast_possible_truncation)]
                let c = ChunkRef { object: id, chunk: chunk as u32 };
                match owner.remove(c) {
                    Some(ChunkSet::Pending) => {
                        for (c, set) in removed {
                            owner.insert(c, set);
                        }
                        return Err(DriverError::Busy);
                    }
                    Some(set) => removed.push((c, set)),
                    None => {}
                }
            }
        }
        if self.objects.lock().remove(id.0).is_none() {
            return Err(DriverError::InvalidHandle);
        }

        let (chunks, mappings) = {
            let mut st = object.state.lock();
            (core::mem::take(&mut st.chunks), core::mem::take(&mut st.mappings))
        };
        let tag = id.raw().to_bits();
        for m in mappings {
            let Ok(vs) = self.vspace(m.vspace) else { continue };
            let result = vs.with_space(|space| {
                if space.mapping_at(m.va).is_some_and(|x| x.tag == tag && x.va == m.va) {
                    space.unmap(self.mmu(), m.va)?;
                }
                Ok(())
            });
            if let Err(e) = result
                && e != DriverError::InvalidHandle
            {
                log::warn!("device: unmapping {id} from {} failed: {e}", m.vspace);
            }
        }

        for chunk in &chunks {
            self.release_backing(&chunk.backing);
            match chunk.backing {
                Backing::Vram(_) => {
                    self.vram.counters().sub_usage(chunk.size);
                    self.vram.counters().sub_demand(chunk.size);
                    if let Some(owner) = &owner {
                        owner.counters().sub_usage(chunk.size);
                        owner.counters().sub_demand(chunk.size);
                    }
                }
                Backing::Host { .. } if object.class.is_vram() => {
                    self.vram.counters().sub_swapped(chunk.size);
                    if let Some(owner) = &owner {
                        owner.counters().sub_swapped(chunk.size);
                    }
                }
                Backing::Host { .. } => {}
            }
        }
        log::debug!("device: freed {id}");
        Ok(())
    }

    /// Whether any chunk of the object currently lives in host memory.
    ///
    /// # Errors
    /// [`DriverError::InvalidHandle`] for an unknown object.
    pub fn object_swapped(&self, id: ObjectId) -> DriverResult<bool> {
        Ok(self.object(id)?.is_swapped())
    }

    // --- address spaces ----------------------------------------------------

    /// # Errors
    /// - [`DriverError::InvalidRange`] for a size of zero, above the
    ///   generation's limit, or not a multiple of its large page.
    /// - [`DriverError::OutOfMemory`] if the directory or the handle slot
    ///   cannot be allocated.
    pub fn vspace_new(&self, size: u64) -> DriverResult<VspaceId> {
        let seed = self.rng.lock().next_u64();
        let mut table = self.vspaces.lock();
        if table.len() >= MAX_VSPACES {
            return Err(DriverError::OutOfMemory);
        }
        let space = {
            let mut inst = self.instance.lock();
            AddressSpace::new(self.config.generation, size, &mut *inst, seed)?
                .with_flush_timeout(self.config.flush_timeout())
        };
        let raw = table.insert_with(|h| Arc::new(Vspace::new(VspaceId(h), space)))?;
        drop(table);
        log::info!("device: {} of 0x{size:x} bytes", VspaceId(raw));
        Ok(VspaceId(raw))
    }

    /// # Errors
    /// - [`DriverError::InvalidHandle`] for an unknown space.
    /// - [`DriverError::InvalidState`] while channels are bound to it.
    pub fn vspace_free(&self, id: VspaceId) -> DriverResult<()> {
        let vs = self.vspace(id)?;
        if !vs.channels().is_empty() {
            return Err(DriverError::InvalidState);
        }
        self.vspaces.lock().remove(id.0);

        let live: Vec<(VirtualAddress, u64)> =
            vs.with_space(|s| Ok(s.mappings().map(|m| (m.va, m.tag)).collect()))?;
        for (va, tag) in live {
            if let Ok(object) = self.object(ObjectId(RawHandle::from_bits(tag))) {
                object
                    .state
                    .lock()
                    .mappings
                    .retain(|m| !(m.vspace == id && m.va == va));
            }
        }
        if let Some(space) = vs.take() {
            let left = space.teardown(&mut *self.instance.lock());
            log::info!("device: freed {id} ({left} mappings dropped)");
        }
        Ok(())
    }

    /// Map every chunk of `object` into one contiguous range of `id` inside
    /// `[start, end)` (`end == 0` means the end of the space), placed from
    /// the top when `back_bias` is set.
    ///
    /// # Errors
    /// - [`DriverError::InvalidHandle`] for an unknown space or object.
    /// - [`DriverError::InvalidRange`] for a window outside the space.
    /// - [`DriverError::OutOfMemory`] if no virtual range or page table is left.
    /// - [`DriverError::Busy`]/[`DriverError::Timeout`] if the commit flush failed.
    pub fn vspace_map(
        &self,
        id: VspaceId,
        object: ObjectId,
        start: u64,
        end: u64,
        back_bias: bool,
    ) -> DriverResult<VirtualAddress> {
        let vs = self.vspace(id)?;
        let obj = self.object(object)?;
        let mut st = obj.state.lock();
        let parts: Vec<_> = st.chunks.iter().map(|c| obj.request(&c.backing)).collect();
        let va = vs.with_space(|space| {
            let mut inst = self.instance.lock();
            Ok(space.map_parts(
                &mut *inst,
                self.mmu(),
                &parts,
                AddressRange::new(start, end),
                back_bias,
                object.raw().to_bits(),
            )?)
        })?;
        st.mappings.push(ObjectMapping { vspace: id, va });
        drop(st);
        log::debug!("device: mapped {object} into {id} at {va:?}");
        Ok(va)
    }

    /// Remove the mapping containing `va`.
    ///
    /// # Errors
    /// [`DriverError::NotMapped`] if nothing is mapped at `va`.
    pub fn vspace_unmap(&self, id: VspaceId, va: VirtualAddress) -> DriverResult<()> {
        let vs = self.vspace(id)?;
        let mapping = vs.with_space(|space| Ok(space.unmap(self.mmu(), va)?))?;
        let object = ObjectId(RawHandle::from_bits(mapping.tag));
        if let Ok(obj) = self.object(object) {
            obj.state
                .lock()
                .mappings
                .retain(|m| !(m.vspace == id && m.va == mapping.va));
        }
        log::debug!("device: unmapped {object} from {id} at {:?}", mapping.va);
        Ok(())
    }

    /// Read object bytes through the page tables of `id`.
    ///
    /// # Errors
    /// [`DriverError::NotMapped`] if any byte of the range is unmapped.
    pub fn vspace_read(&self, id: VspaceId, va: VirtualAddress, buf: &mut [u8]) -> DriverResult<()> {
        let vs = self.vspace(id)?;
        vs.with_space(|space| {
            walk(space, va, buf.len(), |aperture, pa, range| {
                let piece = &mut buf[range];
                if aperture.is_system() {
                    self.hw.read_host(pa, piece);
                } else {
                    self.hw.read_vram(pa, piece);
                }
            })
        })
    }

    /// Write object bytes through the page tables of `id`.
    ///
    /// # Errors
    /// [`DriverError::NotMapped`] if any byte of the range is unmapped.
    pub fn vspace_write(&self, id: VspaceId, va: VirtualAddress, buf: &[u8]) -> DriverResult<()> {
        let vs = self.vspace(id)?;
        vs.with_space(|space| {
            walk(space, va, buf.len(), |aperture, pa, range| {
                let piece = &buf[range];
                if aperture.is_system() {
                    self.hw.write_host(pa, piece);
                } else {
                    self.hw.write_vram(pa, piece);
                }
            })
        })
    }

    /// Physical target and aperture of `va`.
    ///
    /// # Errors
    /// [`DriverError::NotMapped`] if `va` has no present PTE.
    pub fn vspace_translate(&self, id: VspaceId, va: VirtualAddress) -> DriverResult<(PhysicalAddress, Aperture)> {
        self.vspace(id)?.with_space(|space| {
            space
                .translate(va)
                .map(|t| (t.phys, t.aperture))
                .ok_or(DriverError::NotMapped)
        })
    }

    /// Instance-memory address of the page directory of `id`.
    ///
    /// # Errors
    /// [`DriverError::InvalidHandle`] for an unknown space.
    pub fn vspace_directory(&self, id: VspaceId) -> DriverResult<PhysicalAddress> {
        self.vspace(id)?.page_directory()
    }

    // --- channels ----------------------------------------------------------

    /// Create a channel on `vspace`. The channel starts Initialized.
    ///
    /// # Errors
    /// - [`DriverError::InvalidHandle`] for an unknown space.
    /// - [`DriverError::OutOfMemory`] if no control page or channel slot is left.
    pub fn chan_new(&self, vspace: VspaceId) -> DriverResult<ChannelId> {
        let vs = self.vspace(vspace)?;
        let page_directory = vs.page_directory()?;
        let control = self
            .instance
            .lock()
            .alloc_table(CONTROL_PAGE_SIZE)
            .ok_or(DriverError::OutOfMemory)?;
        let hw = Arc::clone(&self.hw);
        let inserted = self
            .channels
            .lock()
            .insert_with(|h| Arc::new(Channel::new(ChannelId(h), vspace, control, hw)));
        let id = match inserted {
            Ok(raw) => ChannelId(raw),
            Err(e) => {
                self.instance.lock().free_table(control, CONTROL_PAGE_SIZE);
                return Err(e);
            }
        };
        let chan = self.channel(id)?;
        chan.bind(page_directory)?;
        vs.attach(id);
        log::info!("device: {id} on {vspace}, control page at {control:?}");
        Ok(id)
    }

    /// Tear a channel down, pausing it first if it is running. The indirect
    /// buffer object goes with it.
    ///
    /// # Errors
    /// [`DriverError::InvalidHandle`] for an unknown channel.
    pub fn chan_free(&self, id: ChannelId) -> DriverResult<()> {
        let chan = self.channels.lock().remove(id.0).ok_or(DriverError::InvalidHandle)?;
        if chan.state() == ChannelState::Running {
            let paused = chan
                .request_pause(&self.pool, self.config.pause_timeout())
                .and_then(|(h, _)| h.wait(self.config.pause_timeout()));
            if let Err(e) = paused {
                log::warn!("device: {id} did not quiesce before teardown: {e}");
            }
        }
        chan.unbind();
        if let Ok(vs) = self.vspace(chan.vspace) {
            vs.detach(id);
        }
        if let Some(ib) = chan.ib() {
            match self.vspace_unmap(chan.vspace, ib.va) {
                Ok(()) | Err(DriverError::NotMapped | DriverError::InvalidHandle) => {}
                Err(e) => log::warn!("device: unmapping IB of {id}: {e}"),
            }
            if let Err(e) = self.release_object(ib.object) {
                log::warn!("device: freeing IB {} of {id}: {e}", ib.object);
            }
        }
        self.instance.lock().free_table(chan.control, CONTROL_PAGE_SIZE);
        log::info!("device: freed {id}");
        Ok(())
    }

    /// Bind an indirect buffer of `1 << order` entries and start the channel.
    ///
    /// # Errors
    /// - [`DriverError::InvalidRange`] if the object is not `8 << order` bytes
    ///   (after page rounding) or the order is out of range.
    /// - [`DriverError::InvalidState`] unless the channel is Initialized.
    /// - Mapping errors of [`vspace_map`](Self::vspace_map).
    pub fn chan_init_submission(&self, id: ChannelId, ib_object: ObjectId, order: u32) -> DriverResult<()> {
        let chan = self.channel(id)?;
        let object = self.object(ib_object)?;
        if order == 0 || order > MAX_IB_ORDER {
            return Err(DriverError::InvalidRange);
        }
        if object.size != align_up(IB_ENTRY_SIZE << order, HOST_PAGE) {
            return Err(DriverError::InvalidRange);
        }
        match chan.state() {
            ChannelState::Initialized => {}
            ChannelState::Failed => return Err(DriverError::ChannelFailed),
            _ => return Err(DriverError::InvalidState),
        }
        let va = self.vspace_map(chan.vspace, ib_object, 0, 0, false)?;
        let ib = IbBinding {
            object: ib_object,
            va,
            order,
        };
        if let Err(e) = chan.init_submission(ib) {
            self.unmap_ib(chan.vspace, va);
            return Err(e);
        }
        log::info!("device: {id} running, IB {ib_object} at {va:?} ({} entries)", 1u32 << order);
        Ok(())
    }

    /// Undo the IB mapping of a channel that could not start.
    fn unmap_ib(&self, vspace: VspaceId, va: VirtualAddress) {
        if let Err(e) = self.vspace_unmap(vspace, va) {
            log::warn!("device: unmapping IB at {va:?} from {vspace}: {e}");
        }
    }

    /// Request quiescence of a channel.
    ///
    /// # Errors
    /// [`DriverError::AlreadyPaused`] if a pause is already in progress or in
    /// effect; the request is still counted and needs its own
    /// [`chan_continue`](Self::chan_continue).
    pub fn chan_pause(&self, id: ChannelId) -> DriverResult<PauseHandle> {
        let chan = self.channel(id)?;
        let (handle, joined) = chan.request_pause(&self.pool, self.config.pause_timeout())?;
        if joined {
            return Err(DriverError::AlreadyPaused);
        }
        Ok(handle)
    }

    /// Balance one pause and wait for the channel to run again if it was the
    /// last.
    ///
    /// # Errors
    /// [`DriverError::InvalidState`] unless Paused, [`DriverError::ChannelFailed`]
    /// if Failed.
    pub fn chan_continue(&self, id: ChannelId) -> DriverResult<()> {
        let chan = self.channel(id)?;
        chan.request_continue(&self.pool)?
            .wait(self.config.pause_timeout())
    }

    /// # Errors
    /// See [`Channel::submit`].
    pub fn chan_submit(&self, id: ChannelId, entries: u32) -> DriverResult<u32> {
        self.channel(id)?.submit(entries)
    }

    /// # Errors
    /// See [`Channel::read_control`].
    pub fn chan_read_control(&self, id: ChannelId, offset: u32) -> DriverResult<u32> {
        self.channel(id)?.read_control(offset)
    }

    /// # Errors
    /// [`DriverError::InvalidHandle`] for an unknown channel.
    pub fn chan_state(&self, id: ChannelId) -> DriverResult<ChannelState> {
        Ok(self.channel(id)?.state())
    }

    /// Channels bound to `vspace`.
    pub(crate) fn channels_of(&self, vspace: VspaceId) -> Vec<Arc<Channel>> {
        let Ok(vs) = self.vspace(vspace) else {
            return Vec::new();
        };
        vs.channels()
            .into_iter()
            .filter_map(|c| self.channel(c).ok())
            .collect()
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Bytes of instance memory still free.
    #[must_use]
    pub fn instance_free(&self) -> u64 {
        self.instance.lock().free_bytes()
    }
}

/// Walk `[va, va + len)` page by page, handing each piece's physical target
/// and its range inside the caller's buffer to `f`.
fn walk(
    space: &AddressSpace,
    va: VirtualAddress,
    len: usize,
    mut f: impl FnMut(Aperture, PhysicalAddress, core::ops::Range<usize>),
) -> DriverResult<()> {
    let g = space.geometry();
    let mut done = 0usize;
    while done < len {
        let at = va + done as u64;
        let tr = space.translate(at).ok_or(DriverError::NotMapped)?;
        let page = match tr.page {
            PageClass::Small => g.small_page,
            PageClass::Large => g.large_page,
        };
        let left = usize::try_from(page - at.as_u64() % page).unwrap_or(usize::MAX);
        let n = left.min(len - done);
        f(tr.aperture, tr.phys, done..done + n);
        done += n;
    }
    Ok(())
}

impl core::fmt::Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("generation", &self.config.generation)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedGpu;
    use gpu_trace::TraceLogger;
    use log::LevelFilter;

    #[test]
    fn refused_ib_unmap_is_reported() {
        let logger = TraceLogger::install(LevelFilter::Info);
        let gpu = Arc::new(SimulatedGpu::new());
        let config = DriverConfig::default()
            .with_vram_size(32 << 20)
            .with_instance_size(4 << 20)
            .with_flush_timeout_ms(50);
        let dev = Device::new(config, gpu.clone()).unwrap();
        let client = dev.client_new().unwrap();
        let vs = dev.vspace_new(1 << 30).unwrap();
        let ib = dev
            .object_new(client, 0x1000, MemoryClass::HostSnooped, 0, ObjectFlags::new())
            .unwrap();
        let va = dev.vspace_map(vs, ib, 0, 0, false).unwrap();

        gpu.fail_flushes(0, 1);
        dev.unmap_ib(vs, va);
        assert!(logger.contains("gpu_driver::device", "unmapping IB"));
        assert_eq!(dev.vspace_translate(vs, va), Err(DriverError::NotMapped));
    }
}

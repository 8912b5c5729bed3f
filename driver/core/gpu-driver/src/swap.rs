//! # Swap Manager
//!
//! Moves swappable VRAM chunks to host memory while `max(usage, demand)`
//! exceeds the budget, and back once there is room again.
//!
//! ## Victim Selection
//!
//! | Pass | Client order | Drawn from |
//! |------|--------------|------------|
//! | [`reduce`](SwapManager::reduce) | descending demand, ties by id | candidates |
//! | [`increase`](SwapManager::increase) | ascending demand, ties by id | swapped |
//!
//! Each client contributes at most `swap_ops_per_client` uniformly drawn
//! chunks per pass, for at most `swap_max_passes` passes. A drawn chunk sits
//! in the client's pending set until its migration finishes, so no other
//! pass can draw it.
//!
//! ## One Migration
//!
//! ```text
//! draw ─► pause channels ─► alloc destination ─► DMA copy ─► rewrite PTEs
//!   │         │                    │                 │            │
//!   │      timeout             no memory          fault        flush error
//!   │         └──────────┬─────────┴─────────────────┴────────────┘
//!   │                    ▼
//!   │         unwind: chunk back to its set, counters restored
//!   ▼
//! free source ─► update counters ─► continue channels ─► chunk to new set
//! ```
//!
//! Every channel whose address space maps the owning object is paused
//! before the copy and continued only after the page tables point at the new
//! backing. Failed migrations count toward `swap_retries` per call.

use crate::channel::Channel;
use crate::client::{ChunkRef, ChunkSet, Client};
use crate::device::Device;
use crate::error::{DriverError, DriverResult};
use crate::handle::VspaceId;
use crate::migrate::copy_backing;
use crate::object::{Backing, Object, ObjectMapping};
use core::cmp::Reverse;
use gpu_sync::Deadline;
use gpu_vmem::{Aperture, MapRequest, PageClass};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Direction {
    /// VRAM to host.
    Out,
    /// Host to VRAM.
    In,
}

pub struct SwapManager<'a> {
    dev: &'a Device,
}

impl<'a> SwapManager<'a> {
    pub(crate) const fn new(dev: &'a Device) -> Self {
        Self { dev }
    }

    /// Bytes by which `max(usage, demand)` exceeds the budget.
    #[must_use]
    pub fn required(&self) -> u64 {
        self.dev.vram.required()
    }

    /// Evict chunks until `req` bytes are freed. Returns the bytes freed.
    pub fn reduce(&self, req: u64) -> u64 {
        let cfg = &self.dev.config;
        let mut freed = 0;
        let mut failures = 0;
        if req == 0 {
            return 0;
        }
        log::info!("swap: reducing VRAM by 0x{req:x}");

        for pass in 0..cfg.swap_max_passes {
            let mut clients = self.dev.all_clients();
            clients.sort_by_key(|c| (Reverse(c.counters().demand()), c.id));
            let mut progress = false;

            for client in &clients {
                for _ in 0..cfg.swap_ops_per_client {
                    if freed >= req {
                        return freed;
                    }
                    let Some(chunk) = self.draw(client, ChunkSet::Candidate) else {
                        break;
                    };
                    match self.swap_out(client, chunk) {
                        Ok(bytes) => {
                            freed += bytes;
                            progress = true;
                        }
                        Err(e) => {
                            failures += 1;
                            log::warn!(
                                "swap: evicting {}/{} failed ({failures}/{}): {e}",
                                chunk.object,
                                chunk.chunk,
                                cfg.swap_retries
                            );
                            if failures >= cfg.swap_retries {
                                return freed;
                            }
                        }
                    }
                }
            }
            if !progress {
                log::debug!("swap: pass {pass} made no progress");
                break;
            }
        }
        freed
    }

    /// Re-admit swapped chunks while the budget has room. Returns the bytes
    /// moved back to VRAM.
    pub fn increase(&self) -> u64 {
        let cfg = &self.dev.config;
        let mut admitted = 0;
        let mut failures = 0;

        for _ in 0..cfg.swap_max_passes {
            let mut clients = self.dev.all_clients();
            clients.sort_by_key(|c| (c.counters().demand(), c.id));
            let mut progress = false;

            for client in &clients {
                for _ in 0..cfg.swap_ops_per_client {
                    let Some(chunk) = self.draw(client, ChunkSet::Swapped) else {
                        break;
                    };
                    match self.swap_in(client, chunk) {
                        Ok(0) => break,
                        Ok(bytes) => {
                            admitted += bytes;
                            progress = true;
                        }
                        Err(e) => {
                            failures += 1;
                            log::warn!(
                                "swap: re-admitting {}/{} failed ({failures}/{}): {e}",
                                chunk.object,
                                chunk.chunk,
                                cfg.swap_retries
                            );
                            if failures >= cfg.swap_retries {
                                return admitted;
                            }
                        }
                    }
                }
            }
            if !progress {
                break;
            }
        }
        if admitted > 0 {
            log::info!("swap: re-admitted 0x{admitted:x} bytes");
        }
        admitted
    }

    /// Run [`increase`](Self::increase) every `interval` until stopped.
    #[must_use]
    pub fn background(dev: Arc<Device>, interval: Duration) -> BackgroundSwap {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("gpu-swap".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    dev.swap().increase();
                    std::thread::park_timeout(interval);
                }
            });
        let thread = match thread {
            Ok(t) => Some(t),
            Err(e) => {
                log::error!("swap: cannot start background pass: {e}");
                None
            }
        };
        BackgroundSwap { stop, thread }
    }

    fn draw(&self, client: &Client, from: ChunkSet) -> Option<ChunkRef> {
        let mut rng = self.dev.rng.lock();
        client.take_random(from, &mut *rng)
    }

    /// Size of a pending chunk if its backing matches `dir`'s source.
    fn pending_size(&self, client: &Client, c: ChunkRef, dir: Direction) -> DriverResult<(Arc<Object>, u64)> {
        let Ok(object) = self.dev.object(c.object) else {
            client.forget_pending(c);
            return Err(DriverError::InvalidHandle);
        };
        let found = {
            let st = object.state.lock();
            st.chunks.get(c.chunk as usize).map(|ch| {
                let in_vram = matches!(ch.backing, Backing::Vram(_));
                (ch.size, in_vram == (dir == Direction::Out))
            })
        };
        match found {
            Some((size, true)) => Ok((object, size)),
            Some((_, false)) => {
                client.unwind(c);
                Err(DriverError::InvalidState)
            }
            None => {
                client.forget_pending(c);
                Err(DriverError::InvalidHandle)
            }
        }
    }

    fn swap_out(&self, client: &Client, c: ChunkRef) -> DriverResult<u64> {
        let (object, size) = self.pending_size(client, c, Direction::Out)?;
        let global = self.dev.vram.counters();
        let local = client.counters();
        global.sub_demand(size);
        local.sub_demand(size);

        if let Err(e) = self.migrate(&object, c.chunk as usize, Direction::Out) {
            global.add_demand(size);
            local.add_demand(size);
            client.unwind(c);
            return Err(e);
        }

        global.sub_usage(size);
        local.sub_usage(size);
        global.add_swapped(size);
        local.add_swapped(size);
        client.finish(c, ChunkSet::Swapped);
        log::info!("swap: evicted {}/{} (0x{size:x} bytes) to host", c.object, c.chunk);
        Ok(size)
    }

    /// Returns `Ok(0)` if the chunk does not fit the budget right now.
    fn swap_in(&self, client: &Client, c: ChunkRef) -> DriverResult<u64> {
        let (object, size) = self.pending_size(client, c, Direction::In)?;
        if size > self.dev.vram.available() {
            client.unwind(c);
            return Ok(0);
        }

        if let Err(e) = self.migrate(&object, c.chunk as usize, Direction::In) {
            client.unwind(c);
            return Err(e);
        }

        for counters in [self.dev.vram.counters(), client.counters()] {
            counters.add_demand(size);
            counters.add_usage(size);
            counters.sub_swapped(size);
        }
        client.finish(c, ChunkSet::Candidate);
        log::info!("swap: re-admitted {}/{} (0x{size:x} bytes)", c.object, c.chunk);
        Ok(size)
    }

    fn migrate(&self, object: &Object, index: usize, dir: Direction) -> DriverResult<()> {
        let paused = self.pause_users(object)?;
        let result = self.move_chunk(object, index, dir);
        self.continue_all(&paused);
        result
    }

    /// Pause every executing channel whose space maps `object`.
    fn pause_users(&self, object: &Object) -> DriverResult<Vec<Arc<Channel>>> {
        let mut spaces: Vec<VspaceId> = object.state.lock().mappings.iter().map(|m| m.vspace).collect();
        spaces.sort_unstable();
        spaces.dedup();

        let timeout = self.dev.config.pause_timeout();
        let mut paused = Vec::new();
        for vs in spaces {
            for chan in self.dev.channels_of(vs) {
                match self.pause(&chan, timeout) {
                    Ok(true) => paused.push(chan),
                    Ok(false) => {}
                    Err(e) => {
                        log::warn!("swap: {} did not quiesce: {e}", chan.id);
                        self.continue_all(&paused);
                        return Err(DriverError::ChannelFailed);
                    }
                }
            }
        }
        Ok(paused)
    }

    /// `Ok(false)` for a channel that is not executing commands.
    fn pause(&self, chan: &Arc<Channel>, timeout: Duration) -> DriverResult<bool> {
        let deadline = Deadline::after(timeout);
        loop {
            match chan.request_pause(&self.dev.pool, timeout) {
                Ok((handle, _)) => {
                    handle.wait(deadline.remaining())?;
                    return Ok(true);
                }
                Err(DriverError::InvalidState | DriverError::ChannelFailed) => return Ok(false),
                Err(DriverError::Busy) if !deadline.expired() => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
    }

    fn continue_all(&self, paused: &[Arc<Channel>]) {
        let timeout = self.dev.config.pause_timeout();
        for chan in paused {
            if let Err(e) = chan.request_continue(&self.dev.pool).and_then(|h| h.wait(timeout)) {
                log::warn!("swap: continuing {}: {e}", chan.id);
            }
        }
    }

    fn move_chunk(&self, object: &Object, index: usize, dir: Direction) -> DriverResult<()> {
        let (src, size) = {
            let st = object.state.lock();
            let chunk = st.chunks.get(index).ok_or(DriverError::InvalidHandle)?;
            (chunk.backing.clone(), chunk.size)
        };
        let dst = match dir {
            Direction::Out => self.dev.alloc_host(size, Aperture::HostSnooped)?,
            Direction::In => Backing::Vram(self.dev.vram.alloc(
                size,
                object.alloc_class(),
                object.flags.contiguous(),
            )?),
        };
        if self.dev.verbose() {
            log::trace!("swap: {}/{index} {:?} -> {:?}", object.id, src.segments(), dst.segments());
        }

        let copied = copy_backing(&*self.dev.hw, &src, &dst, size, self.dev.config.fence_timeout());
        if let Err(e) = copied {
            self.dev.release_backing(&dst);
            return Err(e);
        }
        match self.repoint(object, index, &src, &dst) {
            Ok(()) => {}
            Err(Repoint::RolledBack(e)) => {
                self.dev.release_backing(&dst);
                return Err(e);
            }
            Err(Repoint::Stranded(e)) => {
                log::error!(
                    "swap: {}/{index} keeps both backings, {:?} is never reused",
                    object.id,
                    dst.segments()
                );
                return Err(e);
            }
        }
        self.dev.release_backing(&src);
        Ok(())
    }

    /// Switch the chunk to `new` and rewrite its PTEs in every mapping.
    ///
    /// On failure every mapping touched so far is pointed back at `old` and
    /// the chunk keeps `old`. If a rollback commit is refused, the GPU may
    /// still translate through `new`: the channels of that space are failed
    /// and the error is [`Repoint::Stranded`].
    fn repoint(&self, object: &Object, index: usize, old: &Backing, new: &Backing) -> Result<(), Repoint> {
        let mut st = object.state.lock();
        let mappings = st.mappings.clone();
        let chunk = st
            .chunks
            .get_mut(index)
            .ok_or(Repoint::RolledBack(DriverError::InvalidHandle))?;
        let offset = chunk.offset;
        chunk.backing = new.clone();

        let request = object.request(new);
        let Some(failed) = mappings
            .iter()
            .enumerate()
            .find_map(|(n, m)| self.remap(object, m, offset, &request).err().map(|e| (n, e)))
        else {
            return Ok(());
        };
        let (n, e) = failed;
        log::warn!("swap: rewriting {} in {} failed: {e}", object.id, mappings[n].vspace);

        // The failing mapping may hold new PTEs whose commit was refused.
        let back = object.request(old);
        let mut stranded = Vec::new();
        for m in mappings[..=n].iter().rev() {
            if let Err(undo) = self.remap(object, m, offset, &back) {
                log::error!("swap: {} in {} stranded on the new backing: {undo}", object.id, m.vspace);
                stranded.push(m.vspace);
            }
        }
        if let Some(chunk) = st.chunks.get_mut(index) {
            chunk.backing = old.clone();
        }
        drop(st);

        if stranded.is_empty() {
            return Err(Repoint::RolledBack(e));
        }
        stranded.sort_unstable();
        stranded.dedup();
        for vs in stranded {
            for chan in self.dev.channels_of(vs) {
                chan.fail("page tables stranded by a failed migration");
            }
        }
        Err(Repoint::Stranded(e))
    }

    fn remap(&self, object: &Object, m: &ObjectMapping, offset: u64, request: &MapRequest) -> DriverResult<()> {
        let Ok(vs) = self.dev.vspace(m.vspace) else {
            return Ok(());
        };
        let tag = object.id.raw().to_bits();
        let result = vs.with_space(|space| {
            let Some(mapping) = space.mapping_at(m.va).filter(|x| x.tag == tag && x.va == m.va) else {
                return Ok(());
            };
            // A mapping made while every chunk was in host memory only has
            // small pages.
            let small;
            let request = if mapping.page == PageClass::Small && request.page == PageClass::Large {
                small = MapRequest {
                    page: PageClass::Small,
                    ..request.clone()
                };
                &small
            } else {
                request
            };
            let mut inst = self.dev.instance.lock();
            Ok(space.remap(&mut *inst, self.dev.mmu(), m.va + offset, request)?)
        });
        match result {
            Ok(()) | Err(DriverError::NotMapped | DriverError::InvalidHandle) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// How a failed repoint left the page tables.
enum Repoint {
    /// Every mapping points at the old backing again.
    RolledBack(DriverError),
    /// Some space may still translate through the new backing.
    Stranded(DriverError),
}

/// Handle of the background re-admission thread; stops it on drop.
pub struct BackgroundSwap {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundSwap {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            t.thread().unpark();
            let _ = t.join();
        }
    }
}

impl Drop for BackgroundSwap {
    fn drop(&mut self) {
        self.halt();
    }
}

//! # Channels and Quiescence
//!
//! A channel is a command-submission context bound to one address space.
//!
//! ## State Machine
//!
//! ```text
//!  Uninitialized ──bind──► Initialized ──init_submission──► Running
//!                                                         │    ▲
//!                                                   pause │    │ continue (last)
//!                                                         ▼    │
//!                                                     Pausing ──► Paused
//!
//!  any state ──fatal error / pause timeout──► Failed (terminal)
//! ```
//!
//! ## Pause
//!
//! [`Channel::request_pause`] moves a Running channel to Pausing and queues
//! the quiescence work on the worker pool:
//!
//! 1. emit a fence barrier with the next sequence number,
//! 2. poll until the channel fence reaches it (bounded by the pause timeout),
//! 3. halt the fetcher and refresh the shadow from the live control page,
//! 4. mark the channel Paused and complete the [`PauseHandle`].
//!
//! The shadow is first captured when the channel enters Pausing, so
//! [`Channel::read_control`] is served from it for the whole pause.
//!
//! Pause requests nest. A request arriving while Pausing or Paused is counted
//! and joins the existing completion; each must be balanced by one continue,
//! and only the last one writes the shadow back and resumes the hardware.

use crate::error::{DriverError, DriverResult};
use crate::handle::{ChannelId, ObjectId, VspaceId};
use crate::hw::{ChannelSlot, GpuHardware};
use gpu_addresses::{PhysicalAddress, VirtualAddress};
use gpu_info::layout::{CONTROL_PAGE_SIZE, CTRL_IB_GET, CTRL_IB_PUT};
use gpu_sync::{Completion, Deadline, SpinLock, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChannelState {
    Uninitialized,
    Initialized,
    Running,
    Pausing,
    Paused,
    Failed,
}

type Outcome = Result<(), DriverError>;

/// Waitable result of a pause request.
#[derive(Clone)]
pub struct PauseHandle {
    done: Completion<Outcome>,
    channel: Arc<Channel>,
}

impl PauseHandle {
    /// Wait for the channel to become Paused.
    ///
    /// # Errors
    /// - [`DriverError::Timeout`] if quiescence was not reached; the channel is
    ///   Failed afterwards.
    /// - [`DriverError::ChannelFailed`] if the channel failed meanwhile.
    pub fn wait(&self, timeout: Duration) -> DriverResult<()> {
        if let Some(outcome) = self.done.wait(timeout) {
            outcome
        } else {
            self.channel.fail("pause was not acknowledged");
            Err(DriverError::Timeout)
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done.is_complete()
    }

    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel.id
    }
}

/// Waitable result of a continue request.
#[derive(Clone)]
pub struct ContinueHandle {
    done: Completion<Outcome>,
}

impl ContinueHandle {
    /// # Errors
    /// [`DriverError::Timeout`] if the resume task did not run in time, or the
    /// task's own error.
    pub fn wait(&self, timeout: Duration) -> DriverResult<()> {
        self.done.wait(timeout).unwrap_or(Err(DriverError::Timeout))
    }
}

/// Indirect buffer bound by `chan_init_submission`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IbBinding {
    pub object: ObjectId,
    pub va: VirtualAddress,
    pub order: u32,
}

struct Inner {
    state: ChannelState,
    /// Outstanding pause requests.
    pausing: u32,
    pause: Option<Completion<Outcome>>,
    /// The last continue is writing the shadow back.
    resuming: bool,
    shadow: Option<Box<[u32]>>,
    ib: Option<IbBinding>,
    ib_put: u32,
    next_fence: u32,
}

pub struct Channel {
    pub id: ChannelId,
    pub vspace: VspaceId,
    /// Control page in instance memory.
    pub control: PhysicalAddress,
    slot: ChannelSlot,
    hw: Arc<dyn GpuHardware>,
    inner: SpinLock<Inner>,
}

const CONTROL_WORDS: u32 = (CONTROL_PAGE_SIZE / 4) as u32;

/// `a` is at or after `b` in wrapping sequence space.
const fn seq_reached(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) < 0x8000_0000
}

impl Channel {
    #[must_use]
    pub fn new(
        id: ChannelId,
        vspace: VspaceId,
        control: PhysicalAddress,
        hw: Arc<dyn GpuHardware>,
    ) -> Self {
        Self {
            id,
            vspace,
            control,
            slot: id.index(),
            hw,
            inner: SpinLock::new(Inner {
                state: ChannelState::Uninitialized,
                pausing: 0,
                pause: None,
                resuming: false,
                shadow: None,
                ib: None,
                ib_put: 0,
                next_fence: 1,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn ib(&self) -> Option<IbBinding> {
        self.inner.lock().ib
    }

    /// Last sequence number handed out by [`submit`](Self::submit).
    #[must_use]
    pub fn last_submitted(&self) -> u32 {
        self.inner.lock().next_fence.wrapping_sub(1)
    }

    #[must_use]
    pub fn pause_count(&self) -> u32 {
        self.inner.lock().pausing
    }

    fn transition(&self, inner: &mut Inner, to: ChannelState) {
        log::debug!("channel: {} {:?} -> {to:?}", self.id, inner.state);
        inner.state = to;
    }

    /// Attach the hardware slot. Uninitialized → Initialized.
    ///
    /// # Errors
    /// [`DriverError::InvalidState`] unless Uninitialized.
    pub fn bind(&self, page_directory: PhysicalAddress) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Uninitialized {
            return Err(DriverError::InvalidState);
        }
        self.hw.bind(self.slot, page_directory, self.control);
        self.transition(&mut inner, ChannelState::Initialized);
        Ok(())
    }

    /// Program the indirect buffer and start the channel. Initialized → Running.
    ///
    /// # Errors
    /// [`DriverError::ChannelFailed`] or [`DriverError::InvalidState`].
    pub fn init_submission(&self, ib: IbBinding) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::Initialized => {}
            ChannelState::Failed => return Err(DriverError::ChannelFailed),
            _ => return Err(DriverError::InvalidState),
        }
        self.hw.setup_ib(self.slot, ib.va, ib.order);
        self.hw.write_control(self.slot, CTRL_IB_GET, 0);
        self.hw.write_control(self.slot, CTRL_IB_PUT, 0);
        inner.ib = Some(ib);
        inner.ib_put = 0;
        inner.next_fence = 1;
        self.transition(&mut inner, ChannelState::Running);
        Ok(())
    }

    /// Queue `entries` indirect-buffer entries and a fence; returns the fence
    /// sequence number.
    ///
    /// # Errors
    /// [`DriverError::ChannelFailed`] or [`DriverError::InvalidState`] unless
    /// Running; [`DriverError::InvalidRange`] for more entries than the IB holds.
    pub fn submit(&self, entries: u32) -> DriverResult<u32> {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::Running if !inner.resuming => {}
            ChannelState::Failed => return Err(DriverError::ChannelFailed),
            _ => return Err(DriverError::InvalidState),
        }
        let Some(ib) = inner.ib else {
            return Err(DriverError::InvalidState);
        };
        let slots = 1u32 << ib.order;
        if entries == 0 || entries >= slots {
            return Err(DriverError::InvalidRange);
        }
        inner.ib_put = (inner.ib_put + entries) & (slots - 1);
        let seq = inner.next_fence;
        inner.next_fence = seq.wrapping_add(1);
        self.hw.write_control(self.slot, CTRL_IB_PUT, inner.ib_put);
        self.hw.emit_fence(self.slot, seq);
        Ok(seq)
    }

    /// Read a control-page word, from the shadow while one exists.
    ///
    /// # Errors
    /// [`DriverError::InvalidRange`] for an offset outside the page or not
    /// word aligned.
    pub fn read_control(&self, offset: u32) -> DriverResult<u32> {
        if offset % 4 != 0 || offset / 4 >= CONTROL_WORDS {
            return Err(DriverError::InvalidRange);
        }
        let inner = self.inner.lock();
        if let Some(shadow) = &inner.shadow {
            return Ok(shadow[(offset / 4) as usize]);
        }
        drop(inner);
        Ok(self.hw.read_control(self.slot, offset))
    }

    /// Request quiescence.
    ///
    /// Returns the handle to wait on and whether the request joined a pause
    /// already in progress or in effect.
    ///
    /// # Errors
    /// - [`DriverError::ChannelFailed`] if Failed.
    /// - [`DriverError::InvalidState`] if the channel never ran.
    /// - [`DriverError::Busy`] while the previous continue is still resuming.
    pub fn request_pause(
        self: &Arc<Self>,
        pool: &WorkerPool,
        timeout: Duration,
    ) -> DriverResult<(PauseHandle, bool)> {
        let mut inner = self.inner.lock();
        if inner.resuming {
            return Err(DriverError::Busy);
        }
        match inner.state {
            ChannelState::Running => {}
            ChannelState::Pausing | ChannelState::Paused => {
                inner.pausing += 1;
                let done = inner.pause.clone().unwrap_or_else(|| Completion::ready(Ok(())));
                log::debug!("channel: {} pause joined ({} outstanding)", self.id, inner.pausing);
                return Ok((
                    PauseHandle {
                        done,
                        channel: Arc::clone(self),
                    },
                    true,
                ));
            }
            ChannelState::Failed => return Err(DriverError::ChannelFailed),
            ChannelState::Uninitialized | ChannelState::Initialized => {
                return Err(DriverError::InvalidState);
            }
        }

        let done = Completion::new();
        inner.pausing = 1;
        inner.pause = Some(done.clone());
        inner.shadow = Some(self.snapshot_control());
        self.transition(&mut inner, ChannelState::Pausing);
        drop(inner);

        let this = Arc::clone(self);
        let job_done = done.clone();
        let job = move || this.quiesce(&job_done, timeout);
        if let Err(rejected) = pool.execute(job) {
            log::warn!("channel: worker pool closed ({rejected:?}), pausing inline");
            self.quiesce(&done, timeout);
        }
        Ok((
            PauseHandle {
                done,
                channel: Arc::clone(self),
            },
            false,
        ))
    }

    fn quiesce(&self, done: &Completion<Outcome>, timeout: Duration) {
        let seq = {
            let mut inner = self.inner.lock();
            let seq = inner.next_fence;
            inner.next_fence = seq.wrapping_add(1);
            seq
        };
        self.hw.emit_fence(self.slot, seq);
        let reached = Deadline::after(timeout).poll(|| seq_reached(self.hw.fence_value(self.slot), seq));
        if !reached {
            done.complete(Err(DriverError::Timeout));
            self.fail("quiescence barrier did not retire");
            return;
        }

        self.hw.halt(self.slot);
        let shadow = self.snapshot_control();

        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Pausing {
            drop(inner);
            done.complete(Err(DriverError::ChannelFailed));
            return;
        }
        inner.shadow = Some(shadow);
        self.transition(&mut inner, ChannelState::Paused);
        drop(inner);
        done.complete(Ok(()));
    }

    fn snapshot_control(&self) -> Box<[u32]> {
        (0..CONTROL_WORDS)
            .map(|i| self.hw.read_control(self.slot, i * 4))
            .collect()
    }

    /// Balance one pause request; the last one resumes the channel on the pool.
    ///
    /// # Errors
    /// [`DriverError::ChannelFailed`] if Failed, [`DriverError::InvalidState`]
    /// unless Paused.
    pub fn request_continue(self: &Arc<Self>, pool: &WorkerPool) -> DriverResult<ContinueHandle> {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::Paused if !inner.resuming => {}
            ChannelState::Failed => return Err(DriverError::ChannelFailed),
            _ => return Err(DriverError::InvalidState),
        }
        inner.pausing = inner.pausing.saturating_sub(1);
        if inner.pausing > 0 {
            log::debug!("channel: {} continue deferred ({} outstanding)", self.id, inner.pausing);
            return Ok(ContinueHandle {
                done: Completion::ready(Ok(())),
            });
        }
        inner.resuming = true;
        drop(inner);

        let done = Completion::new();
        let this = Arc::clone(self);
        let job_done = done.clone();
        if let Err(rejected) = pool.execute(move || this.resume(&job_done)) {
            log::warn!("channel: worker pool closed ({rejected:?}), resuming inline");
            self.resume(&done);
        }
        Ok(ContinueHandle { done })
    }

    fn resume(&self, done: &Completion<Outcome>) {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Paused {
            inner.resuming = false;
            drop(inner);
            done.complete(Err(DriverError::ChannelFailed));
            return;
        }
        if let Some(shadow) = inner.shadow.take() {
            for (i, word) in (0u32..).zip(shadow.iter()) {
                self.hw.write_control(self.slot, i * 4, *word);
            }
        }
        self.hw.resume(self.slot);
        inner.pause = None;
        inner.resuming = false;
        self.transition(&mut inner, ChannelState::Running);
        drop(inner);
        done.complete(Ok(()));
    }

    /// Move to Failed and release anyone waiting on a pause.
    pub fn fail(&self, why: &str) {
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::Failed {
            return;
        }
        log::error!("channel: {} failed: {why}", self.id);
        self.transition(&mut inner, ChannelState::Failed);
        inner.resuming = false;
        inner.shadow = None;
        if let Some(p) = inner.pause.take() {
            p.complete(Err(DriverError::ChannelFailed));
        }
    }

    /// Detach the hardware slot.
    pub fn unbind(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Uninitialized {
            self.hw.unbind(self.slot);
        }
        inner.shadow = None;
        inner.ib = None;
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("vspace", &self.vspace)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

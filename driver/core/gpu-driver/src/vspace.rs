use crate::error::{DriverError, DriverResult};
use crate::handle::{ChannelId, VspaceId};
use gpu_addresses::PhysicalAddress;
use gpu_sync::{SpinLock, SpinLockGuard};
use gpu_vmem::AddressSpace;

/// A GPU address space and the channels bound to it.
///
/// The space itself is taken out on `vspace_free`; later accesses through a
/// stale `Arc` see [`DriverError::InvalidHandle`].
pub struct Vspace {
    pub id: VspaceId,
    space: SpinLock<Option<AddressSpace>>,
    channels: SpinLock<Vec<ChannelId>>,
}

impl Vspace {
    #[must_use]
    pub fn new(id: VspaceId, space: AddressSpace) -> Self {
        Self {
            id,
            space: SpinLock::new(Some(space)),
            channels: SpinLock::new(Vec::new()),
        }
    }

    /// Run `f` with the address space locked.
    ///
    /// # Errors
    /// [`DriverError::InvalidHandle`] once the space was freed, or whatever `f`
    /// returns.
    pub fn with_space<R>(&self, f: impl FnOnce(&mut AddressSpace) -> DriverResult<R>) -> DriverResult<R> {
        let mut guard: SpinLockGuard<'_, Option<AddressSpace>> = self.space.lock();
        let space = guard.as_mut().ok_or(DriverError::InvalidHandle)?;
        f(space)
    }

    /// # Errors
    /// [`DriverError::InvalidHandle`] once the space was freed.
    pub fn page_directory(&self) -> DriverResult<PhysicalAddress> {
        self.with_space(|s| Ok(s.page_directory()))
    }

    pub(crate) fn take(&self) -> Option<AddressSpace> {
        self.space.lock().take()
    }

    #[must_use]
    pub fn channels(&self) -> Vec<ChannelId> {
        self.channels.lock().clone()
    }

    pub(crate) fn attach(&self, chan: ChannelId) {
        self.channels.lock().push(chan);
    }

    pub(crate) fn detach(&self, chan: ChannelId) {
        self.channels.lock().retain(|c| *c != chan);
    }
}

impl core::fmt::Debug for Vspace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vspace")
            .field("id", &self.id)
            .field("channels", &self.channels.lock().len())
            .finish_non_exhaustive()
    }
}

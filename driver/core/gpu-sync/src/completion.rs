use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// One-shot, cloneable completion carrying a result.
///
/// The producing task calls [`complete`](Self::complete) exactly once; any
/// number of clones may [`wait`](Self::wait) for it with a bound. Later
/// `complete` calls are ignored so a racing timeout path cannot overwrite the
/// first outcome.
///
/// ```rust
/// # use gpu_sync::Completion;
/// # use std::time::Duration;
/// let done = Completion::<u32>::new();
/// let waiter = done.clone();
/// std::thread::spawn(move || done.complete(7));
/// assert_eq!(waiter.wait(Duration::from_secs(5)), Some(7));
/// ```
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// A completion that is already done with `value`.
    #[must_use]
    pub fn ready(value: T) -> Self {
        let c = Self::new();
        c.complete(value);
        c
    }

    /// Store `value` and wake all waiters. Returns `false` if already completed.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.inner.cond.notify_all();
        true
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Whether two handles refer to the same completion.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> Completion<T> {
    /// Block until completed or `timeout` elapses.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .inner
            .cond
            .wait_timeout_while(slot, timeout, |v| v.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.clone()
    }

    /// The result, if already completed.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

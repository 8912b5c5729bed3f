use std::time::{Duration, Instant};

/// A point in time after which a hardware wait is considered failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Poll `cond` until it holds or the deadline passes.
    ///
    /// The condition is always evaluated at least once, so a zero timeout
    /// still observes an already-satisfied condition.
    ///
    /// ```rust
    /// # use gpu_sync::Deadline;
    /// # use std::time::Duration;
    /// let mut n = 0;
    /// assert!(Deadline::after(Duration::from_secs(1)).poll(|| { n += 1; n == 3 }));
    /// assert!(!Deadline::after(Duration::ZERO).poll(|| false));
    /// ```
    pub fn poll(&self, mut cond: impl FnMut() -> bool) -> bool {
        let mut spins = 0_u32;
        loop {
            if cond() {
                return true;
            }
            if self.expired() {
                return false;
            }
            spins = spins.wrapping_add(1);
            if spins < 64 {
                core::hint::spin_loop();
            } else {
                std::thread::sleep(Duration::from_micros(50));
            }
        }
    }
}

//! # Synchronization primitives
//!
//! | Type | Use |
//! |------|-----|
//! | [`SpinLock`] | short critical sections: allocator trees, page tables, chunk sets |
//! | [`Completion`] | one-shot result handed from a worker task to a waiter |
//! | [`Deadline`] | bounded polling of hardware acknowledgements |
//! | [`WorkerPool`] | fixed set of threads running deferred pause/continue work |
//!
//! Nothing here sleeps while holding a [`SpinLock`]; blocking waits go through
//! [`Completion`] or [`Deadline::poll`].

#![allow(unsafe_code)]

mod completion;
mod deadline;
mod pool;
mod spin_lock;

pub use completion::Completion;
pub use deadline::Deadline;
pub use pool::{PoolClosed, WorkerPool};
pub use spin_lock::{SpinLock, SpinLockGuard};

use gpu_info::ConfigError;
use gpu_mm::AllocError;
use gpu_vmem::{FlushError, VmError};

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DriverError {
    /// VRAM, host memory, instance memory or a virtual range is exhausted,
    /// including after the swap retries ran out.
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid range")]
    InvalidRange,
    /// A flush or TLB invalidation was not acknowledged.
    #[error("hardware busy")]
    Busy,
    /// Quiescence or a fence was not reached in time.
    #[error("timed out")]
    Timeout,
    #[error("address not mapped")]
    NotMapped,
    /// The channel failed and rejects everything until recreated.
    #[error("channel failed")]
    ChannelFailed,
    /// Unknown or stale handle.
    #[error("invalid handle")]
    InvalidHandle,
    #[error("operation not valid in the current state")]
    InvalidState,
    /// Another pause is in progress or in effect. The request is still
    /// counted and must be balanced by a continue.
    #[error("channel already paused")]
    AlreadyPaused,
    #[error("hardware error: {0}")]
    Hardware(&'static str),
}

impl From<AllocError> for DriverError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory => Self::OutOfMemory,
            AllocError::InvalidRange => Self::InvalidRange,
            AllocError::StaleHandle => Self::InvalidHandle,
        }
    }
}

impl From<FlushError> for DriverError {
    fn from(e: FlushError) -> Self {
        match e {
            FlushError::Busy => Self::Busy,
            FlushError::Timeout => Self::Timeout,
        }
    }
}

impl From<VmError> for DriverError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::OutOfMemory => Self::OutOfMemory,
            VmError::InvalidRange => Self::InvalidRange,
            VmError::NotMapped => Self::NotMapped,
            VmError::Flush(f) => f.into(),
        }
    }
}

impl From<ConfigError> for DriverError {
    fn from(e: ConfigError) -> Self {
        log::error!("driver: {e}");
        Self::InvalidRange
    }
}

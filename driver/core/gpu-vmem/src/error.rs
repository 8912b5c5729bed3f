#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FlushError {
    /// The invalidation queue stayed full or the request was not acknowledged.
    #[error("TLB invalidation not acknowledged")]
    Busy,
    /// The BAR flush was not acknowledged.
    #[error("BAR flush timed out")]
    Timeout,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    /// Virtual range or instance memory for page tables exhausted.
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid range")]
    InvalidRange,
    #[error("address not mapped")]
    NotMapped,
    #[error(transparent)]
    Flush(#[from] FlushError),
}

impl From<gpu_mm::AllocError> for VmError {
    fn from(e: gpu_mm::AllocError) -> Self {
        match e {
            gpu_mm::AllocError::OutOfMemory => Self::OutOfMemory,
            gpu_mm::AllocError::InvalidRange => Self::InvalidRange,
            gpu_mm::AllocError::StaleHandle => Self::NotMapped,
        }
    }
}

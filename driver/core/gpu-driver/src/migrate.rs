//! Chunk copies through the [`MigrationEngine`](crate::hw::MigrationEngine).
//!
//! Source and destination may be split into differently sized segments
//! (fragmented VRAM on one side, 4 KiB host pages on the other). The copy walks
//! both lists in lockstep and queues one DMA per overlapping piece:
//!
//! ```text
//! src  |---- 64K ----|-- 32K --|------- 96K -------|
//! dst  |4K|4K|4K|... one piece per host page ...   |
//! ```
//!
//! Fences retire in order, so only the last one is waited for.

use crate::error::{DriverError, DriverResult};
use crate::hw::{Fence, GpuHardware, MemoryLocation};
use crate::object::Backing;
use gpu_sync::Deadline;
use std::time::Duration;

/// Copy the first `len` bytes of `src` into `dst` and wait for completion.
///
/// # Errors
/// - [`DriverError::Hardware`] if the engine rejected a copy.
/// - [`DriverError::Timeout`] if the final fence did not retire in time.
/// - [`DriverError::InvalidRange`] if either side is shorter than `len`.
pub fn copy_backing(
    hw: &dyn GpuHardware,
    src: &Backing,
    dst: &Backing,
    len: u64,
    timeout: Duration,
) -> DriverResult<()> {
    let (src_ap, dst_ap) = (src.aperture(), dst.aperture());
    let src = src.segments();
    let dst = dst.segments();

    let mut last: Option<Fence> = None;
    let (mut si, mut so) = (0usize, 0u64);
    let (mut di, mut doff) = (0usize, 0u64);
    let mut done = 0u64;
    while done < len {
        let (Some(s), Some(d)) = (src.get(si), dst.get(di)) else {
            return Err(DriverError::InvalidRange);
        };
        let n = (s.len - so).min(d.len - doff).min(len - done);
        let fence = hw
            .copy(
                MemoryLocation::new(src_ap, s.base + so),
                MemoryLocation::new(dst_ap, d.base + doff),
                n,
            )
            .map_err(|e| {
                log::warn!("migrate: copy of 0x{n:x} bytes rejected: {e}");
                DriverError::Hardware(e)
            })?;
        last = Some(fence);
        done += n;
        so += n;
        doff += n;
        if so == s.len {
            si += 1;
            so = 0;
        }
        if doff == d.len {
            di += 1;
            doff = 0;
        }
    }

    if let Some(fence) = last
        && !Deadline::after(timeout).poll(|| hw.fence_reached(fence))
    {
        log::warn!("migrate: fence {fence:?} did not retire");
        return Err(DriverError::Timeout);
    }
    Ok(())
}

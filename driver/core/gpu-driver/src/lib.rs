//! # GPU Driver Memory Manager
//!
//! VRAM allocation, per-context address spaces, command channels and the
//! swap manager that keeps VRAM usage within a budget by migrating chunks to
//! host memory and back while channels are quiesced.
//!
//! ```text
//!                         ┌──────────────────────┐
//!   dispatch layer ─────► │       Device         │
//!                         └─┬────────┬─────────┬─┘
//!                           │        │         │
//!                    ┌──────▼──┐ ┌───▼────┐ ┌──▼──────────┐
//!                    │ Objects │ │Vspaces │ │  Channels   │
//!                    │ Clients │ │(vmem)  │ │ pause/cont. │
//!                    └──┬───┬──┘ └───┬────┘ └──────┬──────┘
//!                       │   │        │             │
//!               ┌───────▼┐ ┌▼────────▼──┐  ┌───────▼──────┐
//!               │ VRAM   │ │ Instance   │  │ SwapManager  │
//!               │ store  │ │ memory     │  │ + migration  │
//!               └────────┘ └────────────┘  └──────────────┘
//! ```
//!
//! All hardware access goes through the traits in [`hw`]; [`sim`] provides an
//! in-memory device.
//!
//! ## Operations
//!
//! | Operation | Method |
//! |-----------|--------|
//! | create / free address space | [`Device::vspace_new`], [`Device::vspace_free`] |
//! | map / unmap an object | [`Device::vspace_map`], [`Device::vspace_unmap`] |
//! | create / free channel | [`Device::chan_new`], [`Device::chan_free`] |
//! | allocate an object | [`Device::object_new`] |
//! | start command submission | [`Device::chan_init_submission`] |
//!
//! ```
//! use gpu_driver::{Device, MemoryClass, ObjectFlags, sim::SimulatedGpu};
//! use gpu_info::DriverConfig;
//! use std::sync::Arc;
//!
//! let config = DriverConfig::default()
//!     .with_vram_size(64 << 20)
//!     .with_instance_size(4 << 20);
//! let dev = Device::new(config, Arc::new(SimulatedGpu::new())).unwrap();
//! let client = dev.client_new().unwrap();
//! let vs = dev.vspace_new(1 << 30).unwrap();
//! let obj = dev
//!     .object_new(client, 0x1_0000, MemoryClass::VramSmall, 0, ObjectFlags::new())
//!     .unwrap();
//! let va = dev.vspace_map(vs, obj, 0, 0, false).unwrap();
//! dev.vspace_write(vs, va, b"hello").unwrap();
//! let mut buf = [0; 5];
//! dev.vspace_read(vs, va, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

mod channel;
mod client;
mod device;
mod error;
mod handle;
pub mod hw;
mod instance;
mod migrate;
mod object;
pub mod sim;
mod swap;
mod vram;
mod vspace;

pub use crate::channel::{ChannelState, ContinueHandle, IbBinding, PauseHandle};
pub use crate::client::{ChunkRef, ChunkSet, SetSizes};
pub use crate::device::{ClientStats, Device};
pub use crate::error::{DriverError, DriverResult};
pub use crate::handle::{ChannelId, ClientId, ObjectId, RawHandle, VspaceId};
pub use crate::object::{MemoryClass, ObjectFlags};
pub use crate::swap::{BackgroundSwap, SwapManager};
pub use crate::vram::MemoryStats;
pub use gpu_info::DriverConfig;

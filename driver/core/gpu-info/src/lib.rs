//! # Chipset Geometry and Driver Configuration
//!
//! This crate is the single source of truth for the numbers the memory
//! manager shares between its layers: page-table geometry per chipset
//! generation, the fixed layout of VRAM and channel control pages, and the
//! tunable [`DriverConfig`].
//!
//! ## Architecture
//!
//! ### Generations ([`generation`])
//! The two supported page-table layouts differ in directory granularity and
//! large-page size:
//!
//! | Generation | Directory slots | Slot span | Small page | Large page | Tables per slot |
//! |------------|-----------------|-----------|------------|------------|-----------------|
//! | Tesla      | 2048            | 512 MiB   | 4 KiB      | 64 KiB     | one (flat)      |
//! | Fermi      | 8192            | 128 MiB   | 4 KiB      | 128 KiB    | small + large   |
//!
//! Both expose a 1 TiB virtual address space.
//!
//! ### Layout ([`layout`])
//! ```text
//! VRAM:
//! 0x0000_0000 ┌──────────────────────────┐
//!             │ firmware / scanout       │  not managed
//! 0x0004_0000 ├──────────────────────────┤  VRAM_FIRST_USABLE
//!             │                          │
//!             │ range allocator          │
//!             │                          │
//! size-128K   ├──────────────────────────┤  vram_size - VRAM_TAIL_RESERVED
//!             │ tail reserve             │
//! size        └──────────────────────────┘
//! ```
//!
//! ### Configuration ([`config`])
//! [`DriverConfig`] carries every tunable with sensible defaults and can be
//! overridden from `GPU_*` environment variables.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod config;
pub mod generation;
pub mod layout;

pub use crate::config::{ConfigError, DriverConfig};
pub use crate::generation::{ChipGeneration, PageTableGeometry};

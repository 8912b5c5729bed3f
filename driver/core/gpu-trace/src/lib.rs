//! # Driver Trace Logging
//!
//! A [`log::Log`] implementation that keeps the most recent records in a ring
//! buffer and optionally echoes them to standard error.
//!
//! The memory manager logs through the `log` facade only. Installing a
//! [`TraceLogger`] makes those records observable: tests inspect the buffer to
//! assert that an eviction or a channel failure was reported, and a debugging
//! session can dump it after the fact.
//!
//! ## Output Format
//!
//! ```text
//! [LEVEL] target: message
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use gpu_trace::TraceLogger;
//! use log::LevelFilter;
//!
//! let trace = TraceLogger::install(LevelFilter::Debug);
//! log::info!(target: "swap", "evicted object 3");
//! assert!(trace.contains("swap", "evicted"));
//! ```
//!
//! ## Features
//!
//! * `stderr` (default): echo every accepted record to standard error.

mod logger;

pub use logger::{TraceLogger, TraceRecord};

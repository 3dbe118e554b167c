//! castsink - timing and ordered-delivery core of a low-latency A/V sink
//!
//! High-level entry point re-exporting the protocol, render and I/O crates.

pub use castsink_io as io;
pub use castsink_protocol as protocol;
pub use castsink_render as render;

// Re-export commonly used types
pub use io::{ManualClock, MediaClock, SystemClock};
pub use protocol::{
    ClockSync, ClockSyncConfig, ExtSeqNumber, LossEvent, ReorderBuffer, ReorderConfig,
    SeqExtender, TimestampedUnit,
};
pub use render::{
    AccessUnit, MediaBackend, MediaFormat, RenderError, SessionHandle, SinkSession,
    VideoSchedulerConfig,
};

//! castsink I/O and platform abstraction
//!
//! This crate provides the UDP socket wrapper and the time sources used by
//! the sink core.

pub mod socket;
pub mod time;

pub use socket::{resolve, DatagramSocket, SocketError};
pub use time::{duration_to_us, us_to_duration, ManualClock, MediaClock, SystemClock};

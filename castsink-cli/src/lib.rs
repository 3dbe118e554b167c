//! castsink CLI Library
//!
//! Shared functionality for the castsink command-line tools.

pub mod config;
pub mod receiver;
pub mod stats;

pub use config::{Config, ConfigError, ReceiverSection, ReorderSection, SntpSection, VideoSection};
pub use receiver::RtpReceiver;
pub use stats::{
    format_bandwidth, format_bytes, format_duration, format_micros, format_receiver_stats,
    format_unix_micros, ReceiverStats,
};

//! castsink protocol core
//!
//! This crate implements the network-facing half of the streaming sink:
//! SNTP clock synchronization, RTP header parsing and sequence extension,
//! the reorder buffer that turns arbitrarily ordered datagrams into an
//! in-order unit stream, the generic NACK used to request retransmission,
//! and the receiver reports sent back to the source.

pub mod clock_sync;
pub mod nack;
pub mod ntp;
pub mod reorder;
pub mod report;
pub mod rtp;
pub mod sequence;
pub mod unit;

pub use clock_sync::{ClockState, ClockSync, ClockSyncConfig, SyncError};
pub use nack::{GenericNack, NackError};
pub use ntp::{NtpDuration, NtpError, NtpPacket, NtpTimestamp};
pub use reorder::{
    DeliveredUnit, LossEvent, LossNotifier, ReorderBuffer, ReorderConfig, ReorderStats,
    RetransmissionRequest,
};
pub use report::{ReceiverReport, ReportBlock, ReportError};
pub use rtp::{RtpError, RtpPacket};
pub use sequence::{ExtSeqNumber, ReceptionReport, SeqExtender};
pub use unit::TimestampedUnit;

//! Sequence-numbered media units

use crate::sequence::ExtSeqNumber;
use bytes::Bytes;

/// One media unit as it travels from the network to the demuxer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedUnit {
    /// Extended sequence number, strictly ordered
    pub seq: ExtSeqNumber,
    /// Opaque payload
    pub payload: Bytes,
    /// Presentation time in microseconds
    pub pts_us: i64,
    /// Track the unit belongs to
    pub track: usize,
}

impl TimestampedUnit {
    /// Create a new unit
    pub fn new(seq: ExtSeqNumber, payload: Bytes, pts_us: i64, track: usize) -> Self {
        TimestampedUnit {
            seq,
            payload,
            pts_us,
            track,
        }
    }

    /// Payload size in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

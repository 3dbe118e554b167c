//! RTCP generic NACK feedback
//!
//! Transport-layer feedback (payload type 205, format 1) naming one lost
//! packet id plus a bitmask of the 16 packets following it.

use crate::reorder::RetransmissionRequest;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Size of a single-entry generic NACK
pub const NACK_PACKET_SIZE: usize = 16;

/// RTCP transport-layer feedback payload type
pub const RTCP_PT_RTPFB: u8 = 205;

/// Feedback message type of a generic NACK
pub const NACK_FMT: u8 = 1;

/// Length field: packet size in 32-bit words minus one
const NACK_LENGTH_WORDS: u16 = (NACK_PACKET_SIZE / 4 - 1) as u16;

/// NACK parse errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NackError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Not a generic NACK (version {version}, fmt {fmt}, pt {pt})")]
    NotGenericNack { version: u8, fmt: u8, pt: u8 },
}

/// Generic NACK with a single FCI entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    /// Wire sequence number of the first lost packet
    pub pid: u16,
    /// Bit `i` set means `pid + i + 1` is lost as well
    pub blp: u16,
}

impl GenericNack {
    /// NACK for one missing unit
    pub fn for_request(sender_ssrc: u32, media_ssrc: u32, request: &RetransmissionRequest) -> Self {
        GenericNack {
            sender_ssrc,
            media_ssrc,
            pid: request.wire_seq,
            blp: 0,
        }
    }

    /// All wire sequence numbers this NACK reports lost
    pub fn lost_sequences(&self) -> Vec<u16> {
        let mut lost = vec![self.pid];
        for bit in 0..16u16 {
            if self.blp & (1 << bit) != 0 {
                lost.push(self.pid.wrapping_add(bit + 1));
            }
        }
        lost
    }

    /// Serialize to the 16-byte wire form
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(NACK_PACKET_SIZE);
        buf.put_u8(0x80 | NACK_FMT);
        buf.put_u8(RTCP_PT_RTPFB);
        buf.put_u16(NACK_LENGTH_WORDS);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.put_u16(self.pid);
        buf.put_u16(self.blp);
        buf
    }

    /// Parse from the wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NackError> {
        if bytes.len() < NACK_PACKET_SIZE {
            return Err(NackError::InsufficientData {
                expected: NACK_PACKET_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let first = buf.get_u8();
        let pt = buf.get_u8();
        let version = first >> 6;
        let fmt = first & 0x1F;
        if version != 2 || fmt != NACK_FMT || pt != RTCP_PT_RTPFB {
            return Err(NackError::NotGenericNack { version, fmt, pt });
        }
        buf.advance(2);

        Ok(GenericNack {
            sender_ssrc: buf.get_u32(),
            media_ssrc: buf.get_u32(),
            pid: buf.get_u16(),
            blp: buf.get_u16(),
        })
    }
}

//! RTP fixed header parsing
//!
//! Media arrives as RTP version 2 datagrams. The fixed 12-byte header is
//! followed by an optional CSRC list and header extension, and the datagram
//! may end in padding. Parsing strips all of these and leaves the payload as
//! a zero-copy slice of the datagram.

use crate::sequence::ExtSeqNumber;
use crate::unit::TimestampedUnit;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed RTP header
pub const RTP_HEADER_SIZE: usize = 12;

/// The only RTP version understood
pub const RTP_VERSION: u8 = 2;

/// Media clock rate of the video timeline
pub const RTP_CLOCK_RATE: u32 = 90_000;

const PADDING_FLAG: u8 = 0x20;
const EXTENSION_FLAG: u8 = 0x10;
const CSRC_COUNT_MASK: u8 = 0x0F;

/// RTP parse errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RtpError {
    #[error("Datagram too short for an RTP header: {0} bytes")]
    TooShort(usize),

    #[error("Unsupported RTP version {0}")]
    UnsupportedVersion(u8),

    #[error("Padding length {padding} exceeds datagram of {size} bytes")]
    BadPadding { padding: usize, size: usize },

    #[error("CSRC list of {count} entries does not fit")]
    TruncatedCsrc { count: usize },

    #[error("Header extension does not fit")]
    TruncatedExtension,
}

/// A parsed RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub rtp_time: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a packet with no CSRCs, extension or padding
    pub fn new(payload_type: u8, sequence: u16, rtp_time: u32, ssrc: u32, payload: Bytes) -> Self {
        RtpPacket {
            payload_type: payload_type & 0x7F,
            marker: false,
            sequence,
            rtp_time,
            ssrc,
            payload,
        }
    }

    /// Parse a datagram
    pub fn parse(datagram: Bytes) -> Result<Self, RtpError> {
        let mut size = datagram.len();
        if size < RTP_HEADER_SIZE {
            return Err(RtpError::TooShort(size));
        }

        let first = datagram[0];
        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::UnsupportedVersion(version));
        }

        if first & PADDING_FLAG != 0 {
            let padding = datagram[size - 1] as usize;
            if padding + RTP_HEADER_SIZE > size {
                return Err(RtpError::BadPadding { padding, size });
            }
            size -= padding;
        }

        let csrc_count = (first & CSRC_COUNT_MASK) as usize;
        let mut payload_offset = RTP_HEADER_SIZE + 4 * csrc_count;
        if size < payload_offset {
            return Err(RtpError::TruncatedCsrc { count: csrc_count });
        }

        if first & EXTENSION_FLAG != 0 {
            if size < payload_offset + 4 {
                return Err(RtpError::TruncatedExtension);
            }
            let words = u16::from_be_bytes([
                datagram[payload_offset + 2],
                datagram[payload_offset + 3],
            ]) as usize;
            let extension_len = 4 * words;
            if size < payload_offset + 4 + extension_len {
                return Err(RtpError::TruncatedExtension);
            }
            payload_offset += 4 + extension_len;
        }

        let mut header = &datagram[1..RTP_HEADER_SIZE];
        let second = header.get_u8();
        let sequence = header.get_u16();
        let rtp_time = header.get_u32();
        let ssrc = header.get_u32();

        Ok(RtpPacket {
            payload_type: second & 0x7F,
            marker: second & 0x80 != 0,
            sequence,
            rtp_time,
            ssrc,
            payload: datagram.slice(payload_offset..size),
        })
    }

    /// Serialize with the fixed header only
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_SIZE + self.payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8((self.marker as u8) << 7 | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.rtp_time);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
        buf
    }

    /// RTP time on the 90 kHz clock converted to microseconds
    #[inline]
    pub fn time_us(&self) -> i64 {
        rtp_time_to_us(self.rtp_time)
    }

    /// Turn the packet into a unit once its sequence number is extended
    pub fn into_unit(self, seq: ExtSeqNumber, track: usize) -> TimestampedUnit {
        let pts_us = self.time_us();
        TimestampedUnit::new(seq, self.payload, pts_us, track)
    }
}

/// Convert 90 kHz RTP time to microseconds
#[inline]
pub fn rtp_time_to_us(rtp_time: u32) -> i64 {
    rtp_time as i64 * 100 / 9
}

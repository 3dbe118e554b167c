//! RTCP receiver reports
//!
//! A receiver periodically tells the sender how the stream is arriving: one
//! report block (payload type 201) per media source, followed by a source
//! description (payload type 202) naming the receiver. Both packets go out
//! together as one compound datagram.

use crate::sequence::{ExtSeqNumber, ReceptionReport};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// RTCP receiver report payload type
pub const RTCP_PT_RR: u8 = 201;

/// RTCP source description payload type
pub const RTCP_PT_SDES: u8 = 202;

/// Size of one report block
pub const REPORT_BLOCK_SIZE: usize = 24;

/// Report blocks that fit the 5-bit count field
pub const MAX_REPORT_BLOCKS: usize = 31;

const RR_HEADER_SIZE: usize = 8;

const SDES_CNAME: u8 = 1;
const SDES_TOOL: u8 = 6;

/// Receiver report errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReportError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Not a receiver report (version {version}, pt {pt})")]
    NotReceiverReport { version: u8, pt: u8 },

    #[error("Too many report blocks: {0}")]
    TooManyBlocks(usize),
}

/// Reception statistics for one media source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    /// Loss since the previous report, in 1/256 units
    pub fraction_lost: u8,
    /// Cumulative loss, 24-bit signed on the wire
    pub cumulative_lost: i32,
    pub extended_max: ExtSeqNumber,
    pub jitter: u32,
    /// Middle 32 bits of the last sender report timestamp
    pub last_sr: u32,
    /// Delay since that sender report, in 1/65536 s
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    /// Block for `ssrc` from the extender's report figures
    ///
    /// Jitter and sender-report fields are zero: the receiver does not
    /// track them.
    pub fn from_reception(ssrc: u32, report: &ReceptionReport) -> Self {
        ReportBlock {
            ssrc,
            fraction_lost: report.fraction_lost,
            cumulative_lost: report.cumulative_lost,
            extended_max: report.extended_max,
            jitter: 0,
            last_sr: 0,
            delay_since_last_sr: 0,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        // 24-bit two's complement
        let lost = (self.cumulative_lost.clamp(-0x80_0000, 0x7F_FFFF) as u32) & 0x00FF_FFFF;
        buf.put_uint(lost as u64, 3);
        buf.put_u32(self.extended_max.as_raw());
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }

    fn read(buf: &mut &[u8]) -> Self {
        let ssrc = buf.get_u32();
        let fraction_lost = buf.get_u8();
        let raw = buf.get_uint(3) as u32;
        // Sign-extend from 24 bits
        let cumulative_lost = ((raw << 8) as i32) >> 8;

        ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost,
            extended_max: ExtSeqNumber::new(buf.get_u32()),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        }
    }
}

/// Receiver report packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// SSRC of the reporting receiver
    pub sender_ssrc: u32,
    pub blocks: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn new(sender_ssrc: u32) -> Self {
        ReceiverReport {
            sender_ssrc,
            blocks: Vec::new(),
        }
    }

    /// Report carrying a single block
    pub fn single(sender_ssrc: u32, block: ReportBlock) -> Self {
        ReceiverReport {
            sender_ssrc,
            blocks: vec![block],
        }
    }

    /// Size of the wire form
    pub fn len(&self) -> usize {
        RR_HEADER_SIZE + self.blocks.len() * REPORT_BLOCK_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Serialize, appending to `buf`
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), ReportError> {
        if self.blocks.len() > MAX_REPORT_BLOCKS {
            return Err(ReportError::TooManyBlocks(self.blocks.len()));
        }

        buf.reserve(self.len());
        buf.put_u8(0x80 | self.blocks.len() as u8);
        buf.put_u8(RTCP_PT_RR);
        buf.put_u16((self.len() / 4 - 1) as u16);
        buf.put_u32(self.sender_ssrc);
        for block in &self.blocks {
            block.write(buf);
        }
        Ok(())
    }

    /// Receiver report followed by a source description naming `cname`
    pub fn to_compound(&self, cname: &str, tool: &str) -> Result<BytesMut, ReportError> {
        let mut buf = BytesMut::with_capacity(self.len() + 64);
        self.write(&mut buf)?;
        write_sdes(&mut buf, self.sender_ssrc, cname, tool);
        Ok(buf)
    }

    /// Parse a receiver report from the start of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReportError> {
        if bytes.len() < RR_HEADER_SIZE {
            return Err(ReportError::InsufficientData {
                expected: RR_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let first = buf.get_u8();
        let pt = buf.get_u8();
        let version = first >> 6;
        if version != 2 || pt != RTCP_PT_RR {
            return Err(ReportError::NotReceiverReport { version, pt });
        }
        let count = (first & 0x1F) as usize;
        buf.advance(2);

        let expected = RR_HEADER_SIZE + count * REPORT_BLOCK_SIZE;
        if bytes.len() < expected {
            return Err(ReportError::InsufficientData {
                expected,
                actual: bytes.len(),
            });
        }

        let sender_ssrc = buf.get_u32();
        let blocks = (0..count).map(|_| ReportBlock::read(&mut buf)).collect();
        Ok(ReceiverReport {
            sender_ssrc,
            blocks,
        })
    }
}

/// Append a source description chunk with CNAME and TOOL items
///
/// Item text longer than 255 bytes is truncated.
pub fn write_sdes(buf: &mut BytesMut, ssrc: u32, cname: &str, tool: &str) {
    let start = buf.len();
    buf.put_u8(0x80 | 1);
    buf.put_u8(RTCP_PT_SDES);
    buf.put_u16(0);
    buf.put_u32(ssrc);

    for (kind, text) in [(SDES_CNAME, cname), (SDES_TOOL, tool)] {
        let text = &text.as_bytes()[..text.len().min(255)];
        buf.put_u8(kind);
        buf.put_u8(text.len() as u8);
        buf.put_slice(text);
    }
    buf.put_u8(0);
    while (buf.len() - start) % 4 != 0 {
        buf.put_u8(0);
    }

    let words = ((buf.len() - start) / 4 - 1) as u16;
    buf[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
}

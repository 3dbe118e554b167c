//! Sequence Number Handling
//!
//! Media datagrams carry 16-bit sequence numbers that wrap every 65536
//! packets. Everything past the receive socket works on *extended* sequence
//! numbers: a 32-bit counter whose upper half counts wrap cycles, so ordering
//! is plain integer ordering. [`SeqExtender`] performs the widening and keeps
//! the reception counters that loss reports are built from.

use std::fmt;
use std::ops::{Add, Sub};

/// Size of the 16-bit wire sequence space
pub const SEQ_MOD: u32 = 1 << 16;

/// Forward jump still accepted as "in order, with a permissible gap"
pub const MAX_DROPOUT: u16 = 3000;

/// Backward distance still accepted as a reordered or duplicate packet
pub const MAX_MISORDER: u16 = 100;

/// Extended (wraparound-free) sequence number
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ExtSeqNumber(u32);

impl ExtSeqNumber {
    /// Create a new extended sequence number
    #[inline]
    pub const fn new(value: u32) -> Self {
        ExtSeqNumber(value)
    }

    /// Build from a wrap cycle count and the 16-bit wire value
    #[inline]
    pub fn from_parts(cycles: u32, seq: u16) -> Self {
        ExtSeqNumber(cycles.wrapping_mul(SEQ_MOD).wrapping_add(seq as u32))
    }

    /// Get the raw value
    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// The 16-bit value this number had on the wire
    #[inline]
    pub fn wire(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Number of completed wrap cycles
    #[inline]
    pub fn cycles(self) -> u32 {
        self.0 >> 16
    }

    /// Get the next sequence number
    #[inline]
    pub fn next(self) -> Self {
        ExtSeqNumber(self.0.wrapping_add(1))
    }

    /// Signed distance from this sequence number to `other`
    ///
    /// Positive values mean `other` is ahead of `self`.
    #[inline]
    pub fn distance_to(self, other: ExtSeqNumber) -> i64 {
        other.0 as i64 - self.0 as i64
    }
}

impl fmt::Debug for ExtSeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtSeqNumber({})", self.0)
    }
}

impl fmt::Display for ExtSeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ExtSeqNumber {
    fn from(value: u32) -> Self {
        ExtSeqNumber(value)
    }
}

impl From<ExtSeqNumber> for u32 {
    fn from(seq: ExtSeqNumber) -> u32 {
        seq.0
    }
}

impl Add<u32> for ExtSeqNumber {
    type Output = ExtSeqNumber;

    fn add(self, rhs: u32) -> ExtSeqNumber {
        ExtSeqNumber(self.0.wrapping_add(rhs))
    }
}

impl Sub for ExtSeqNumber {
    type Output = i64;

    /// Signed distance between two sequence numbers
    fn sub(self, rhs: ExtSeqNumber) -> i64 {
        rhs.distance_to(self)
    }
}

/// Reception report block figures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionReport {
    /// Highest extended sequence number seen
    pub extended_max: ExtSeqNumber,
    /// Packets expected since the first one
    pub expected: u32,
    /// Cumulative packets lost, clamped to the 24-bit signed wire range
    pub cumulative_lost: i32,
    /// Fraction lost since the previous report, in 1/256 units
    pub fraction_lost: u8,
}

/// Widens 16-bit wire sequence numbers to [`ExtSeqNumber`]s
///
/// Packets within [`MAX_DROPOUT`] ahead of the highest sequence number seen
/// advance it (counting a wrap cycle when the value rolls over). Packets
/// within [`MAX_MISORDER`] behind it are reordered or duplicate packets and
/// are extended into the cycle they belong to. Anything else is a jump too
/// large to trust and is rejected.
#[derive(Debug, Default)]
pub struct SeqExtender {
    started: bool,
    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
}

impl SeqExtender {
    /// Create a new extender
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend a wire sequence number
    ///
    /// Returns `None` for packets that made a very large jump.
    pub fn extend(&mut self, seq: u16) -> Option<ExtSeqNumber> {
        if !self.started {
            self.started = true;
            self.base_seq = seq as u32;
            self.max_seq = seq;
            self.received += 1;
            return Some(ExtSeqNumber::from_parts(self.cycles, seq));
        }

        let udelta = seq.wrapping_sub(self.max_seq);

        if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                // Sequence number wrapped
                self.cycles += 1;
            }
            self.max_seq = seq;
            self.received += 1;
            Some(ExtSeqNumber::from_parts(self.cycles, seq))
        } else if (udelta as u32) <= SEQ_MOD - MAX_MISORDER as u32 {
            tracing::debug!(
                "dropping packet {} after large sequence jump from {}",
                seq,
                self.max_seq
            );
            None
        } else if seq > self.max_seq && self.cycles > 0 {
            // Reordered packet from before the most recent wrap
            Some(ExtSeqNumber::from_parts(self.cycles - 1, seq))
        } else {
            Some(ExtSeqNumber::from_parts(self.cycles, seq))
        }
    }

    /// Highest extended sequence number seen so far
    pub fn extended_max(&self) -> Option<ExtSeqNumber> {
        self.started
            .then(|| ExtSeqNumber::from_parts(self.cycles, self.max_seq))
    }

    /// Packets counted as received (in-order arrivals)
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Packets expected from the first sequence number to the highest
    pub fn expected(&self) -> u32 {
        match self.extended_max() {
            Some(max) => max.as_raw().wrapping_sub(self.base_seq).wrapping_add(1),
            None => 0,
        }
    }

    /// Produce report figures and start a new reporting interval
    pub fn report(&mut self) -> ReceptionReport {
        let report = self.peek_report();
        self.expected_prior = report.expected;
        self.received_prior = self.received;
        report
    }

    /// Report figures for the current interval, leaving it open
    pub fn peek_report(&self) -> ReceptionReport {
        let expected = self.expected();
        let lost = (expected as i64 - self.received as i64).clamp(-0x80_0000, 0x7F_FFFF);

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);

        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        ReceptionReport {
            extended_max: self.extended_max().unwrap_or(ExtSeqNumber::new(0)),
            expected,
            cumulative_lost: lost as i32,
            fraction_lost,
        }
    }
}

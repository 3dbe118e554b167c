//! NTP fixed-point timestamps and the 48-byte SNTP packet
//!
//! NTP time is a 64-bit fixed-point value: the high 32 bits count seconds
//! since 1900-01-01 00:00:00 UTC, the low 32 bits are a fraction of a second
//! over 2^32. Differences between two timestamps are carried as signed
//! fixed-point durations.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use thiserror::Error;

/// Well-known UDP port of time servers
pub const NTP_PORT: u16 = 123;

/// Size of an SNTP request/response packet in bytes
pub const NTP_PACKET_SIZE: usize = 48;

/// Association mode of a client request
pub const NTP_MODE_CLIENT: u8 = 3;

/// Association mode of a server response
pub const NTP_MODE_SERVER: u8 = 4;

/// Protocol version stamped on requests
pub const NTP_VERSION: u8 = 3;

/// Byte offset of the originate timestamp
pub const ORIGINATE_TIME_OFFSET: usize = 24;

/// Byte offset of the receive timestamp
pub const RECEIVE_TIME_OFFSET: usize = 32;

/// Byte offset of the transmit timestamp
pub const TRANSMIT_TIME_OFFSET: usize = 40;

/// Seconds from the NTP epoch (1900) to the Unix epoch (1970): 70 years plus
/// 17 leap days
pub const NTP_UNIX_OFFSET_SECS: u64 = (70 * 365 + 17) * 24 * 60 * 60;

/// [`NTP_UNIX_OFFSET_SECS`] in microseconds
pub const NTP_UNIX_OFFSET_US: i64 = NTP_UNIX_OFFSET_SECS as i64 * 1_000_000;

const US_PER_SEC: u64 = 1_000_000;

/// Encode a non-negative microsecond span as 32.32 fixed point
#[inline]
fn fixed_from_micros(us: u64) -> u64 {
    let hi = us / US_PER_SEC;
    let lo = ((1u64 << 32) * (us % US_PER_SEC)) / US_PER_SEC;
    (hi << 32) | lo
}

/// Absolute NTP timestamp (32.32 fixed point, seconds since 1900)
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct NtpTimestamp(u64);

impl NtpTimestamp {
    /// Wrap a raw 64-bit wire value
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        NtpTimestamp(raw)
    }

    /// Get the raw 64-bit wire value
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Whole seconds since the NTP epoch
    #[inline]
    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Fractional second numerator over 2^32
    #[inline]
    pub fn fraction(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Convert Unix-epoch microseconds to an NTP timestamp
    ///
    /// Times before 1900 clamp to the NTP epoch.
    pub fn from_unix_micros(unix_us: i64) -> Self {
        let ntp_us = unix_us.saturating_add(NTP_UNIX_OFFSET_US).max(0) as u64;
        NtpTimestamp(fixed_from_micros(ntp_us))
    }

    /// Microseconds since the NTP epoch
    ///
    /// The high 32 bits count whole seconds; the low 32 bits contribute
    /// `fraction * 10^6 / 2^32` microseconds, rounded down.
    pub fn as_ntp_micros(self) -> i64 {
        let secs = (self.0 >> 32) as i64;
        let frac_us = ((self.0 & 0xFFFF_FFFF) * US_PER_SEC) >> 32;
        secs * US_PER_SEC as i64 + frac_us as i64
    }

    /// Microseconds since the Unix epoch
    pub fn to_unix_micros(self) -> i64 {
        self.as_ntp_micros() - NTP_UNIX_OFFSET_US
    }

    /// Signed span from `earlier` to `self`
    #[inline]
    pub fn duration_since(self, earlier: NtpTimestamp) -> NtpDuration {
        NtpDuration(self.0.wrapping_sub(earlier.0) as i64)
    }
}

impl Add<NtpDuration> for NtpTimestamp {
    type Output = NtpTimestamp;

    fn add(self, rhs: NtpDuration) -> NtpTimestamp {
        NtpTimestamp(self.0.wrapping_add(rhs.0 as u64))
    }
}

impl Sub for NtpTimestamp {
    type Output = NtpDuration;

    fn sub(self, rhs: NtpTimestamp) -> NtpDuration {
        self.duration_since(rhs)
    }
}

impl fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NtpTimestamp({}.{:08x})", self.seconds(), self.fraction())
    }
}

/// Signed 32.32 fixed-point duration
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct NtpDuration(i64);

impl NtpDuration {
    pub const ZERO: NtpDuration = NtpDuration(0);

    /// Wrap a raw signed fixed-point value
    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        NtpDuration(raw)
    }

    /// Get the raw signed fixed-point value
    #[inline]
    pub fn as_raw(self) -> i64 {
        self.0
    }

    /// Encode a signed microsecond span
    pub fn from_micros(us: i64) -> Self {
        let magnitude = fixed_from_micros(us.unsigned_abs()) as i64;
        if us < 0 {
            NtpDuration(-magnitude)
        } else {
            NtpDuration(magnitude)
        }
    }

    /// Decode to microseconds, rounding toward negative infinity
    pub fn as_micros(self) -> i64 {
        ((self.0 as i128 * US_PER_SEC as i128) >> 32) as i64
    }

    /// Half of this duration (integer division of the fixed-point value)
    #[inline]
    pub fn half(self) -> NtpDuration {
        NtpDuration(self.0 / 2)
    }

    /// Arithmetic mean, `None` for an empty slice
    pub fn mean(durations: &[NtpDuration]) -> Option<NtpDuration> {
        if durations.is_empty() {
            return None;
        }
        let sum: i128 = durations.iter().map(|d| d.0 as i128).sum();
        Some(NtpDuration((sum / durations.len() as i128) as i64))
    }
}

impl Add for NtpDuration {
    type Output = NtpDuration;

    fn add(self, rhs: NtpDuration) -> NtpDuration {
        NtpDuration(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for NtpDuration {
    type Output = NtpDuration;

    fn sub(self, rhs: NtpDuration) -> NtpDuration {
        NtpDuration(self.0.wrapping_sub(rhs.0))
    }
}

impl Neg for NtpDuration {
    type Output = NtpDuration;

    fn neg(self) -> NtpDuration {
        NtpDuration(self.0.wrapping_neg())
    }
}

impl fmt::Debug for NtpDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NtpDuration({}us)", self.as_micros())
    }
}

/// NTP packet decoding errors
#[derive(Error, Debug)]
pub enum NtpError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },
}

/// The fields of an SNTP packet the sink uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpPacket {
    /// Leap indicator (bits 6-7 of byte 0)
    pub leap: u8,
    /// Protocol version (bits 3-5 of byte 0)
    pub version: u8,
    /// Association mode (bits 0-2 of byte 0)
    pub mode: u8,
    /// Server stratum
    pub stratum: u8,
    /// Client transmit time echoed by the server
    pub originate: NtpTimestamp,
    /// Time the request arrived at the server
    pub receive: NtpTimestamp,
    /// Time the response left the server (or the request left the client)
    pub transmit: NtpTimestamp,
}

impl NtpPacket {
    /// Client request stamped with the local transmit time
    pub fn client_request(transmit: NtpTimestamp) -> Self {
        NtpPacket {
            leap: 0,
            version: NTP_VERSION,
            mode: NTP_MODE_CLIENT,
            stratum: 0,
            originate: NtpTimestamp::default(),
            receive: NtpTimestamp::default(),
            transmit,
        }
    }

    /// Serialize to the fixed 48-byte layout (network byte order)
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(NTP_PACKET_SIZE);

        buf.put_u8((self.leap & 0b11) << 6 | (self.version & 0b111) << 3 | (self.mode & 0b111));
        buf.put_u8(self.stratum);
        // Poll, precision, root delay, root dispersion, reference id and
        // reference timestamp are left zero by clients.
        buf.put_bytes(0, ORIGINATE_TIME_OFFSET - 2);
        buf.put_u64(self.originate.as_raw());
        buf.put_u64(self.receive.as_raw());
        buf.put_u64(self.transmit.as_raw());

        debug_assert_eq!(buf.len(), NTP_PACKET_SIZE);
        buf
    }

    /// Parse from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NtpError> {
        if bytes.len() < NTP_PACKET_SIZE {
            return Err(NtpError::InsufficientData {
                expected: NTP_PACKET_SIZE,
                actual: bytes.len(),
            });
        }

        let first = bytes[0];
        let mut buf = &bytes[ORIGINATE_TIME_OFFSET..NTP_PACKET_SIZE];

        Ok(NtpPacket {
            leap: first >> 6,
            version: (first >> 3) & 0b111,
            mode: first & 0b111,
            stratum: bytes[1],
            originate: NtpTimestamp::from_raw(buf.get_u64()),
            receive: NtpTimestamp::from_raw(buf.get_u64()),
            transmit: NtpTimestamp::from_raw(buf.get_u64()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_offset() {
        assert_eq!(NTP_UNIX_OFFSET_SECS, 2_208_988_800);
    }

    #[test]
    fn test_unix_epoch_conversion() {
        let ts = NtpTimestamp::from_unix_micros(0);
        assert_eq!(ts.seconds() as u64, NTP_UNIX_OFFSET_SECS);
        assert_eq!(ts.fraction(), 0);
        assert_eq!(ts.to_unix_micros(), 0);
    }

    #[test]
    fn test_half_second_fraction() {
        let ts = NtpTimestamp::from_unix_micros(1_500_000);
        assert_eq!(ts.fraction(), 0x8000_0000);
        assert_eq!(ts.to_unix_micros(), 1_500_000);
    }

    #[test]
    fn test_microsecond_precision_is_preserved() {
        // 2036-ish: keeps working close to the 32-bit seconds rollover
        let unix_us = 2_000_000_000_123_457;
        let ts = NtpTimestamp::from_unix_micros(unix_us);
        let back = ts.to_unix_micros();
        assert!(unix_us - back <= 1 && unix_us >= back);
    }

    #[test]
    fn test_duration_sign() {
        let d = NtpDuration::from_micros(-250_000);
        assert_eq!(d.as_micros(), -250_000);
        assert_eq!((-d).as_micros(), 250_000);
        assert_eq!(NtpDuration::from_micros(3_000_000).half().as_micros(), 1_500_000);
    }

    #[test]
    fn test_timestamp_difference() {
        let a = NtpTimestamp::from_unix_micros(10_000_000);
        let b = NtpTimestamp::from_unix_micros(12_500_000);
        assert_eq!((b - a).as_micros(), 2_500_000);
        assert_eq!((a - b).as_micros(), -2_500_000);
        assert_eq!(a + (b - a), b);
    }

    #[test]
    fn test_client_request_layout() {
        let transmit = NtpTimestamp::from_raw(0x0102_0304_0506_0708);
        let bytes = NtpPacket::client_request(transmit).to_bytes();

        assert_eq!(bytes.len(), NTP_PACKET_SIZE);
        assert_eq!(bytes[0], 3 | (3 << 3));
        assert_eq!(
            &bytes[TRANSMIT_TIME_OFFSET..TRANSMIT_TIME_OFFSET + 8],
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert!(bytes[2..TRANSMIT_TIME_OFFSET].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_response() {
        let mut raw = [0u8; NTP_PACKET_SIZE];
        raw[0] = NTP_MODE_SERVER | (NTP_VERSION << 3);
        raw[1] = 2;
        raw[ORIGINATE_TIME_OFFSET + 7] = 1;
        raw[RECEIVE_TIME_OFFSET + 7] = 2;
        raw[TRANSMIT_TIME_OFFSET + 7] = 3;

        let packet = NtpPacket::from_bytes(&raw).unwrap();
        assert_eq!(packet.mode, NTP_MODE_SERVER);
        assert_eq!(packet.version, NTP_VERSION);
        assert_eq!(packet.stratum, 2);
        assert_eq!(packet.originate.as_raw(), 1);
        assert_eq!(packet.receive.as_raw(), 2);
        assert_eq!(packet.transmit.as_raw(), 3);
    }

    #[test]
    fn test_parse_short_packet() {
        let err = NtpPacket::from_bytes(&[0u8; 20]).unwrap_err();
        assert!(matches!(
            err,
            NtpError::InsufficientData {
                expected: 48,
                actual: 20
            }
        ));
    }
}

//! Clock synchronization with a remote time server
//!
//! One SNTP exchange yields a [`ClockState`]: a remote reference time paired
//! with the local monotonic instant it corresponds to. Any later local
//! timestamp is translated into the remote time base by adding the elapsed
//! local time to that reference.
//!
//! A single exchange is at the mercy of queueing delay on the path, so
//! [`ClockSync::request_time_best_of`] runs a batch and trusts only the
//! exchanges with the shortest round trips.
//!
//! [`ClockSync::request_time`] blocks on the network for a full round trip.
//! It belongs on a dedicated thread (session start-up or a periodic refresh),
//! never on the session control thread. Reads through
//! [`ClockSync::adjust_time_us`] are cheap and may happen concurrently with a
//! refresh.

use crate::ntp::{NtpDuration, NtpError, NtpPacket, NtpTimestamp, NTP_PACKET_SIZE, NTP_PORT};
use castsink_io::{DatagramSocket, MediaClock, SocketError, SystemClock};
use parking_lot::RwLock;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Clock synchronization errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// The socket could not be created or the host could not be resolved
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(#[source] SocketError),

    /// Sending the request or receiving the response failed (including timeout)
    #[error("Transport error: {0}")]
    TransportError(#[source] SocketError),

    /// The response datagram was too short to carry the timestamps
    #[error("Malformed time response: {0}")]
    MalformedResponse(#[from] NtpError),

    /// Time translation was requested before any successful exchange
    #[error("Clock not synchronized")]
    NotSynchronized,
}

/// Clock exchange configuration
#[derive(Debug, Clone)]
pub struct ClockSyncConfig {
    /// Server UDP port
    pub port: u16,
    /// Upper bound on the wait for the response
    pub timeout: Duration,
    /// Pause between the exchanges of a batch
    pub batch_spacing: Duration,
}

/// Exchanges in a full batch
pub const DEFAULT_BATCH_SIZE: usize = 30;

impl Default for ClockSyncConfig {
    fn default() -> Self {
        ClockSyncConfig {
            port: NTP_PORT,
            timeout: Duration::from_secs(5),
            batch_spacing: Duration::from_micros(1_000_000 / 30),
        }
    }
}

/// Result of one successful exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    /// Remote time at `reference_local_us`
    pub reference_remote: NtpTimestamp,
    /// Local monotonic time at which the response was received
    pub reference_local_us: i64,
    /// Round-trip network delay, excluding server processing time
    pub round_trip: NtpDuration,
    /// Estimated offset of the remote clock relative to the local wall clock
    pub offset: NtpDuration,
}

impl ClockState {
    /// Compute the state from one request/response pair
    ///
    /// * `request_ntp` - local wall time stamped on the request
    /// * `request_us` - local monotonic time when the request was sent
    /// * `response_us` - local monotonic time when the response arrived
    pub fn from_exchange(
        request_ntp: NtpTimestamp,
        request_us: i64,
        response_us: i64,
        response: &NtpPacket,
    ) -> Self {
        let elapsed = NtpDuration::from_micros(response_us - request_us);
        let response_ntp = request_ntp + elapsed;

        let round_trip = elapsed - (response.transmit - response.receive);
        let offset = ((response.receive - response.originate)
            + (response.transmit - response_ntp))
            .half();

        ClockState {
            reference_remote: response_ntp + offset,
            reference_local_us: response_us,
            round_trip,
            offset,
        }
    }

    /// Combine a batch of exchanges
    ///
    /// The exchanges are ranked by round trip. The offsets of the best third
    /// (at least one exchange) are averaged and applied to the exchange with
    /// the shortest round trip.
    pub fn best_of(samples: &mut [ClockState]) -> Option<ClockState> {
        samples.sort_by_key(|s| s.round_trip);
        let best = *samples.first()?;
        let keep = (samples.len() / 3).max(1);

        let offsets: Vec<NtpDuration> = samples[..keep].iter().map(|s| s.offset).collect();
        let offset = NtpDuration::mean(&offsets)?;

        Some(ClockState {
            reference_remote: best.reference_remote + (offset - best.offset),
            offset,
            ..best
        })
    }

    /// Translate a local monotonic timestamp to remote-base Unix microseconds
    ///
    /// The reference is decoded from fixed point once and the local elapsed
    /// time is added in microseconds, so the translation is exact per
    /// microsecond and strictly increasing in `local_us`.
    pub fn adjust_time_us(&self, local_us: i64) -> i64 {
        self.reference_remote.to_unix_micros() + (local_us - self.reference_local_us)
    }
}

/// SNTP client holding the most recent clock state
pub struct ClockSync<C: MediaClock = SystemClock> {
    clock: C,
    config: ClockSyncConfig,
    state: RwLock<Option<ClockState>>,
}

impl ClockSync<SystemClock> {
    /// Create a client on the process clock
    pub fn new(config: ClockSyncConfig) -> Self {
        ClockSync::with_clock(SystemClock::new(), config)
    }
}

impl<C: MediaClock> ClockSync<C> {
    /// Create a client reading time from `clock`
    pub fn with_clock(clock: C, config: ClockSyncConfig) -> Self {
        ClockSync {
            clock,
            config,
            state: RwLock::new(None),
        }
    }

    /// Perform one blocking exchange with `host`
    ///
    /// On success the new state replaces the previous one. On any failure the
    /// previous state is left untouched.
    pub fn request_time(&self, host: &str) -> Result<ClockState, SyncError> {
        let socket = self.connect(host)?;
        let state = self.exchange(&socket)?;

        tracing::info!(
            "synchronized with {}: offset={}us round_trip={}us",
            host,
            state.offset.as_micros(),
            state.round_trip.as_micros()
        );

        Ok(state)
    }

    /// Perform a batch of `count` exchanges with `host` and keep the best
    ///
    /// Failed exchanges are skipped; the batch fails with the last error only
    /// if none succeeds, leaving the previous state untouched. See
    /// [`ClockState::best_of`] for how the batch is combined.
    pub fn request_time_best_of(&self, host: &str, count: usize) -> Result<ClockState, SyncError> {
        let socket = self.connect(host)?;

        let mut samples = Vec::with_capacity(count);
        let mut last_error = None;
        for attempt in 0..count.max(1) {
            if attempt > 0 && !self.config.batch_spacing.is_zero() {
                thread::sleep(self.config.batch_spacing);
            }
            match self.measure(&socket) {
                Ok(state) => {
                    tracing::debug!(
                        "exchange {}: offset={}us round_trip={}us",
                        attempt + 1,
                        state.offset.as_micros(),
                        state.round_trip.as_micros()
                    );
                    samples.push(state);
                }
                Err(e) => {
                    tracing::debug!("exchange {} with {} failed: {}", attempt + 1, host, e);
                    last_error = Some(e);
                }
            }
        }

        let Some(state) = ClockState::best_of(&mut samples) else {
            return Err(last_error.unwrap_or(SyncError::NotSynchronized));
        };
        *self.state.write() = Some(state);

        tracing::info!(
            "synchronized with {} over {}/{} exchanges: offset={}us round_trip={}us",
            host,
            samples.len(),
            count.max(1),
            state.offset.as_micros(),
            state.round_trip.as_micros()
        );

        Ok(state)
    }

    fn connect(&self, host: &str) -> Result<DatagramSocket, SyncError> {
        let socket = DatagramSocket::connect(host, self.config.port)
            .map_err(SyncError::NetworkUnavailable)?;
        socket
            .set_read_timeout(Some(self.config.timeout))
            .map_err(SyncError::NetworkUnavailable)?;
        Ok(socket)
    }

    /// Perform one exchange over an already connected socket
    pub fn exchange(&self, socket: &DatagramSocket) -> Result<ClockState, SyncError> {
        let state = self.measure(socket)?;
        *self.state.write() = Some(state);
        Ok(state)
    }

    /// One exchange whose result is returned but not stored
    fn measure(&self, socket: &DatagramSocket) -> Result<ClockState, SyncError> {
        let request_ntp = NtpTimestamp::from_unix_micros(self.clock.wall_us());
        let request_us = self.clock.now_us();

        let request = NtpPacket::client_request(request_ntp).to_bytes();
        socket.send(&request).map_err(SyncError::TransportError)?;

        let mut buf = [0u8; NTP_PACKET_SIZE];
        let n = socket.recv(&mut buf).map_err(SyncError::TransportError)?;
        let response_us = self.clock.now_us();

        let response = NtpPacket::from_bytes(&buf[..n])?;
        tracing::trace!(
            "time response: mode={} stratum={} rx={:?} tx={:?}",
            response.mode,
            response.stratum,
            response.receive,
            response.transmit
        );

        Ok(ClockState::from_exchange(
            request_ntp,
            request_us,
            response_us,
            &response,
        ))
    }

    /// Translate a local monotonic timestamp to remote-base Unix microseconds
    pub fn adjust_time_us(&self, local_us: i64) -> Result<i64, SyncError> {
        self.state
            .read()
            .as_ref()
            .map(|state| state.adjust_time_us(local_us))
            .ok_or(SyncError::NotSynchronized)
    }

    /// Remote-base time right now
    pub fn remote_now_us(&self) -> Result<i64, SyncError> {
        self.adjust_time_us(self.clock.now_us())
    }

    /// Most recent state, if any exchange has succeeded
    pub fn state(&self) -> Option<ClockState> {
        *self.state.read()
    }

    /// Round trip measured by the most recent exchange
    pub fn round_trip(&self) -> Option<Duration> {
        self.state()
            .map(|s| castsink_io::us_to_duration(s.round_trip.as_micros()))
    }

    /// Whether at least one exchange has succeeded
    pub fn is_synchronized(&self) -> bool {
        self.state.read().is_some()
    }
}

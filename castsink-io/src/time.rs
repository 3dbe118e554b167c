//! Time sources for the sink
//!
//! Every timing decision in the sink (reorder grace windows, audio pacing,
//! video deadlines, clock exchanges) reads the time through [`MediaClock`], so
//! production code runs on the process monotonic clock while tests drive a
//! [`ManualClock`] forward by hand.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of local time
///
/// `now_us` is a monotonic microsecond counter with an arbitrary origin that
/// is shared by every clock instance in the process. `wall_us` is the
/// calendar time in microseconds since the Unix epoch and is only used to
/// stamp outgoing clock-exchange requests.
pub trait MediaClock: Send + Sync {
    /// Local monotonic time in microseconds
    fn now_us(&self) -> i64;

    /// Wall-clock time in microseconds since 1970-01-01 00:00:00 UTC
    fn wall_us(&self) -> i64;
}

impl<C: MediaClock + ?Sized> MediaClock for Arc<C> {
    #[inline]
    fn now_us(&self) -> i64 {
        (**self).now_us()
    }

    #[inline]
    fn wall_us(&self) -> i64 {
        (**self).wall_us()
    }
}

impl<C: MediaClock + ?Sized> MediaClock for &C {
    #[inline]
    fn now_us(&self) -> i64 {
        (**self).now_us()
    }

    #[inline]
    fn wall_us(&self) -> i64 {
        (**self).wall_us()
    }
}

fn process_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Process monotonic clock
///
/// All instances share one anchor, so timestamps taken by different
/// components are directly comparable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        // Pin the anchor so the first reading is not taken lazily mid-session.
        let _ = process_anchor();
        SystemClock
    }
}

impl MediaClock for SystemClock {
    fn now_us(&self) -> i64 {
        duration_to_us(process_anchor().elapsed())
    }

    fn wall_us(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => duration_to_us(d),
            Err(e) => -duration_to_us(e.duration()),
        }
    }
}

#[derive(Debug)]
struct ManualTime {
    now_us: i64,
    wall_us: i64,
}

/// Hand-driven clock for deterministic tests
///
/// Clones share the same underlying time, so a test can keep one handle and
/// give another to the component under test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

impl ManualClock {
    /// Create a clock reading `now_us` locally and `wall_us` on the calendar
    pub fn new(now_us: i64, wall_us: i64) -> Self {
        ManualClock {
            inner: Arc::new(Mutex::new(ManualTime { now_us, wall_us })),
        }
    }

    /// Move both readings forward
    pub fn advance(&self, by: Duration) {
        let delta = duration_to_us(by);
        let mut time = self.inner.lock();
        time.now_us += delta;
        time.wall_us += delta;
    }

    /// Move both readings forward by `us` microseconds
    pub fn advance_us(&self, us: i64) {
        let mut time = self.inner.lock();
        time.now_us += us;
        time.wall_us += us;
    }

    /// Jump the monotonic reading to an absolute value
    pub fn set_now_us(&self, now_us: i64) {
        self.inner.lock().now_us = now_us;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new(0, 0)
    }
}

impl MediaClock for ManualClock {
    fn now_us(&self) -> i64 {
        self.inner.lock().now_us
    }

    fn wall_us(&self) -> i64 {
        self.inner.lock().wall_us
    }
}

/// Convert a duration to whole microseconds, saturating at `i64::MAX`
#[inline]
pub fn duration_to_us(d: Duration) -> i64 {
    d.as_micros().try_into().unwrap_or(i64::MAX)
}

/// Convert a non-negative microsecond delay to a duration
///
/// Negative delays (deadlines already in the past) become zero.
#[inline]
pub fn us_to_duration(us: i64) -> Duration {
    if us <= 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(us as u64)
    }
}

//! Sequence-ordered delivery with bounded retransmission
//!
//! [`ReorderBuffer`] accepts units in any order, duplicates included, and
//! hands them out in strictly increasing sequence order. When the next
//! expected unit is missing it opens a wait window, asks once for a
//! retransmission, and gives up on the unit once the grace window has
//! elapsed. A missing unit therefore stalls delivery for at most one grace
//! window.

use crate::sequence::ExtSeqNumber;
use crate::unit::TimestampedUnit;
use castsink_io::duration_to_us;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Reorder buffer configuration
#[derive(Debug, Clone)]
pub struct ReorderConfig {
    /// How long a gap may stay open before the missing unit is skipped
    pub grace_window: Duration,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        ReorderConfig {
            grace_window: Duration::from_millis(50),
        }
    }
}

/// Request to resend one unit
///
/// The absolute-time discontinuity flag is not carried here: requests are
/// only raised once a unit has been delivered, and the unit that starts a
/// fresh time base is flagged through [`DeliveredUnit::discontinuity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmissionRequest {
    /// Extended sequence number of the missing unit
    pub seq: ExtSeqNumber,
    /// The 16-bit value the sender used on the wire
    pub wire_seq: u16,
}

impl RetransmissionRequest {
    fn new(seq: ExtSeqNumber) -> Self {
        RetransmissionRequest {
            seq,
            wire_seq: seq.wire(),
        }
    }
}

/// Loss notifications emitted while delivering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossEvent {
    /// The next expected unit is missing; ask the sender for it
    RetransmissionRequested(RetransmissionRequest),
    /// The range was given up on; the stream continues after it
    DeclaredLost {
        first: ExtSeqNumber,
        last: ExtSeqNumber,
    },
}

/// Receiver of [`LossEvent`]s
pub type LossNotifier = Box<dyn FnMut(LossEvent) + Send>;

/// A unit handed out by [`ReorderBuffer::dequeue_next`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredUnit {
    pub unit: TimestampedUnit,
    /// Set on the first unit of the stream; timestamps start fresh here
    ///
    /// This is the absolute-time discontinuity of the delivery stream. It is
    /// always seen before any [`LossEvent`] for the stream.
    pub discontinuity: bool,
}

/// Reorder buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub skipped: u64,
    pub retransmission_requests: u64,
    pub recovered: u64,
}

/// Sequence-ordered buffer with a bounded wait for missing units
pub struct ReorderBuffer {
    config: ReorderConfig,
    /// Pending units, strictly increasing by sequence number
    pending: VecDeque<TimestampedUnit>,
    pending_bytes: usize,
    last_delivered: Option<ExtSeqNumber>,
    /// Local time the current wait window opened
    gap_opened_at_us: Option<i64>,
    retransmission_requested: bool,
    notifier: Option<LossNotifier>,
    stats: ReorderStats,
}

impl ReorderBuffer {
    /// Create a buffer without a loss notifier
    pub fn new(config: ReorderConfig) -> Self {
        ReorderBuffer {
            config,
            pending: VecDeque::new(),
            pending_bytes: 0,
            last_delivered: None,
            gap_opened_at_us: None,
            retransmission_requested: false,
            notifier: None,
            stats: ReorderStats::default(),
        }
    }

    /// Create a buffer reporting loss events to `notifier`
    pub fn with_notifier<F>(config: ReorderConfig, notifier: F) -> Self
    where
        F: FnMut(LossEvent) + Send + 'static,
    {
        let mut buffer = ReorderBuffer::new(config);
        buffer.set_notifier(notifier);
        buffer
    }

    /// Replace the loss notifier
    pub fn set_notifier<F>(&mut self, notifier: F)
    where
        F: FnMut(LossEvent) + Send + 'static,
    {
        self.notifier = Some(Box::new(notifier));
    }

    /// Insert a unit in sequence order
    ///
    /// Returns `false` if a unit with the same sequence number is already
    /// pending; the new one is dropped.
    pub fn enqueue(&mut self, unit: TimestampedUnit) -> bool {
        // Units usually arrive in order, so scan from the back
        let mut idx = self.pending.len();
        while idx > 0 {
            let seq = self.pending[idx - 1].seq;
            if seq == unit.seq {
                tracing::debug!("dropping duplicate unit {}", unit.seq);
                self.stats.duplicates += 1;
                return false;
            }
            if seq < unit.seq {
                break;
            }
            idx -= 1;
        }

        tracing::trace!("queued unit {} ({} bytes)", unit.seq, unit.len());
        self.pending_bytes += unit.len();
        self.pending.insert(idx, unit);
        true
    }

    /// Hand out the next unit in order, if policy allows it at `now_us`
    pub fn dequeue_next(&mut self, now_us: i64) -> Option<DeliveredUnit> {
        self.drop_stale();

        let head = match self.pending.front() {
            Some(unit) => unit.seq,
            None => {
                self.gap_opened_at_us.get_or_insert(now_us);
                self.retransmission_requested = false;
                return None;
            }
        };

        let expected = match self.last_delivered {
            None => return self.deliver_front(true),
            Some(last) => last.next(),
        };

        if head == expected {
            if self.retransmission_requested {
                tracing::info!("unit {} recovered after retransmission request", head);
                self.stats.recovered += 1;
            }
            return self.deliver_front(false);
        }

        let opened_at = match self.gap_opened_at_us {
            Some(t) => t,
            None => {
                tracing::debug!("gap before unit {}, waiting for {}", head, expected);
                self.gap_opened_at_us = Some(now_us);
                return None;
            }
        };

        if now_us - opened_at < duration_to_us(self.config.grace_window) {
            if !self.retransmission_requested {
                tracing::info!("requesting retransmission of unit {}", expected);
                self.retransmission_requested = true;
                self.stats.retransmission_requests += 1;
                self.notify(LossEvent::RetransmissionRequested(
                    RetransmissionRequest::new(expected),
                ));
            }
            return None;
        }

        let last = ExtSeqNumber::new(head.as_raw().wrapping_sub(1));
        tracing::warn!("giving up on units {}..={}", expected, last);
        self.stats.skipped += (head - expected) as u64;
        self.notify(LossEvent::DeclaredLost {
            first: expected,
            last,
        });
        self.deliver_front(false)
    }

    /// Time at which a stalled buffer will skip its gap
    pub fn skip_deadline_us(&self) -> Option<i64> {
        match (self.pending.front(), self.gap_opened_at_us) {
            (Some(_), Some(t)) => Some(t + duration_to_us(self.config.grace_window)),
            _ => None,
        }
    }

    /// Number of pending units
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no units are pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total payload bytes pending
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Most recently delivered sequence number
    pub fn last_delivered(&self) -> Option<ExtSeqNumber> {
        self.last_delivered
    }

    /// Whether a retransmission has been requested for the current gap
    pub fn retransmission_requested(&self) -> bool {
        self.retransmission_requested
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Drop pending units at or before the last delivered one
    fn drop_stale(&mut self) {
        let Some(last) = self.last_delivered else {
            return;
        };

        while let Some(unit) = self.pending.front() {
            if unit.seq > last {
                break;
            }
            tracing::debug!("dropping stale unit {}", unit.seq);
            self.pending_bytes -= unit.len();
            self.stats.stale += 1;
            self.pending.pop_front();
        }
    }

    fn deliver_front(&mut self, discontinuity: bool) -> Option<DeliveredUnit> {
        let unit = self.pending.pop_front()?;
        self.pending_bytes -= unit.len();
        self.last_delivered = Some(unit.seq);
        self.gap_opened_at_us = None;
        self.retransmission_requested = false;
        self.stats.delivered += 1;

        tracing::trace!("delivering unit {}", unit.seq);
        Some(DeliveredUnit {
            unit,
            discontinuity,
        })
    }

    fn notify(&mut self, event: LossEvent) {
        if let Some(notifier) = self.notifier.as_mut() {
            notifier(event);
        }
    }
}

impl fmt::Debug for ReorderBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReorderBuffer")
            .field("pending", &self.pending.len())
            .field("pending_bytes", &self.pending_bytes)
            .field("last_delivered", &self.last_delivered)
            .field("gap_opened_at_us", &self.gap_opened_at_us)
            .field("retransmission_requested", &self.retransmission_requested)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn unit(seq: u32) -> TimestampedUnit {
        TimestampedUnit::new(
            ExtSeqNumber::new(seq),
            Bytes::from(vec![seq as u8; 10]),
            seq as i64 * 1000,
            0,
        )
    }

    fn recording_buffer() -> (ReorderBuffer, Arc<Mutex<Vec<LossEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let buffer = ReorderBuffer::with_notifier(ReorderConfig::default(), move |e| {
            sink.lock().push(e)
        });
        (buffer, events)
    }

    fn drain(buffer: &mut ReorderBuffer, now_us: i64) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(d) = buffer.dequeue_next(now_us) {
            out.push(d.unit.seq.as_raw());
        }
        out
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buffer = ReorderBuffer::new(ReorderConfig::default());
        for seq in 1..=3 {
            assert!(buffer.enqueue(unit(seq)));
        }
        assert_eq!(buffer.pending_bytes(), 30);

        let first = buffer.dequeue_next(0).unwrap();
        assert!(first.discontinuity);
        assert_eq!(drain(&mut buffer, 0), vec![2, 3]);
        assert_eq!(buffer.pending_bytes(), 0);
        assert_eq!(buffer.last_delivered(), Some(ExtSeqNumber::new(3)));
    }

    #[test]
    fn test_duplicate_dropped_on_enqueue() {
        let mut buffer = ReorderBuffer::new(ReorderConfig::default());
        assert!(buffer.enqueue(unit(4)));
        assert!(!buffer.enqueue(unit(4)));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.pending_bytes(), 10);
        assert_eq!(buffer.stats().duplicates, 1);
    }

    #[test]
    fn test_out_of_order_insert() {
        let mut buffer = ReorderBuffer::new(ReorderConfig::default());
        for seq in [3, 1, 2] {
            buffer.enqueue(unit(seq));
        }
        assert_eq!(drain(&mut buffer, 0), vec![1, 2, 3]);
    }

    #[test]
    fn test_stale_units_discarded() {
        let mut buffer = ReorderBuffer::new(ReorderConfig::default());
        buffer.enqueue(unit(5));
        assert_eq!(drain(&mut buffer, 0), vec![5]);

        buffer.enqueue(unit(3));
        buffer.enqueue(unit(5));
        buffer.enqueue(unit(6));
        assert_eq!(drain(&mut buffer, 0), vec![6]);
        assert_eq!(buffer.stats().stale, 2);
        assert_eq!(buffer.pending_bytes(), 0);
    }

    #[test]
    fn test_reordered_unit_recovered_within_window() {
        let (mut buffer, events) = recording_buffer();

        buffer.enqueue(unit(5));
        buffer.enqueue(unit(6));
        assert_eq!(drain(&mut buffer, 0), vec![5, 6]);

        buffer.enqueue(unit(8));
        assert!(buffer.dequeue_next(1_000).is_none());
        assert!(buffer.dequeue_next(10_000).is_none());
        assert!(buffer.retransmission_requested());

        buffer.enqueue(unit(7));
        assert_eq!(drain(&mut buffer, 20_000), vec![7, 8]);
        assert!(!buffer.retransmission_requested());

        let events = events.lock();
        assert_eq!(
            *events,
            vec![LossEvent::RetransmissionRequested(RetransmissionRequest {
                seq: ExtSeqNumber::new(7),
                wire_seq: 7,
            })]
        );
        assert_eq!(buffer.stats().recovered, 1);
    }

    #[test]
    fn test_missing_unit_skipped_after_grace_window() {
        let (mut buffer, events) = recording_buffer();

        buffer.enqueue(unit(1));
        buffer.enqueue(unit(3));
        assert_eq!(buffer.dequeue_next(0).unwrap().unit.seq.as_raw(), 1);

        // Gap detected: window opens
        assert!(buffer.dequeue_next(0).is_none());
        assert_eq!(buffer.skip_deadline_us(), Some(50_000));
        // Inside the window: exactly one request
        assert!(buffer.dequeue_next(1_000).is_none());
        assert!(buffer.dequeue_next(49_999).is_none());

        let delivered = buffer.dequeue_next(50_000).unwrap();
        assert_eq!(delivered.unit.seq.as_raw(), 3);
        assert!(!delivered.discontinuity);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            LossEvent::RetransmissionRequested(r) if r.seq == ExtSeqNumber::new(2)
        ));
        assert_eq!(
            events[1],
            LossEvent::DeclaredLost {
                first: ExtSeqNumber::new(2),
                last: ExtSeqNumber::new(2),
            }
        );
        assert_eq!(buffer.stats().skipped, 1);
    }

    #[test]
    fn test_empty_buffer_opens_window() {
        let (mut buffer, events) = recording_buffer();

        buffer.enqueue(unit(1));
        assert_eq!(drain(&mut buffer, 0), vec![1]);

        // Buffer ran dry at t=0; the window is already open when 4 shows up
        buffer.enqueue(unit(4));
        assert_eq!(drain(&mut buffer, 60_000), vec![4]);

        let events = events.lock();
        assert_eq!(
            *events,
            vec![LossEvent::DeclaredLost {
                first: ExtSeqNumber::new(2),
                last: ExtSeqNumber::new(3),
            }]
        );
        assert_eq!(buffer.stats().skipped, 2);
    }

    #[test]
    fn test_custom_grace_window() {
        let config = ReorderConfig {
            grace_window: Duration::from_millis(5),
        };
        let mut buffer = ReorderBuffer::new(config);
        buffer.enqueue(unit(10));
        buffer.enqueue(unit(12));
        assert_eq!(drain(&mut buffer, 0), vec![10]);
        assert!(buffer.dequeue_next(4_999).is_none());
        assert_eq!(drain(&mut buffer, 5_000), vec![12]);
    }

    #[test]
    fn test_discontinuity_delivered_before_any_request() {
        let (mut buffer, events) = recording_buffer();
        buffer.enqueue(unit(12));
        buffer.enqueue(unit(10));

        let first = buffer.dequeue_next(0).unwrap();
        assert_eq!(first.unit.seq.as_raw(), 10);
        assert!(first.discontinuity);
        assert!(events.lock().is_empty());

        assert!(buffer.dequeue_next(0).is_none());
        assert!(buffer.dequeue_next(1).is_none());
        assert_eq!(
            *events.lock(),
            vec![LossEvent::RetransmissionRequested(RetransmissionRequest {
                seq: ExtSeqNumber::new(11),
                wire_seq: 11,
            })]
        );
    }

    #[test]
    fn test_wire_seq_of_request_after_wrap() {
        let (mut buffer, events) = recording_buffer();
        buffer.enqueue(unit(65535));
        buffer.enqueue(unit(65537));
        assert_eq!(drain(&mut buffer, 0), vec![65535]);
        assert!(buffer.dequeue_next(1).is_none());

        let events = events.lock();
        assert_eq!(
            events[0],
            LossEvent::RetransmissionRequested(RetransmissionRequest {
                seq: ExtSeqNumber::new(65536),
                wire_seq: 0,
            })
        );
    }
}

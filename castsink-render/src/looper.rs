//! Deferred message queue
//!
//! The session never sleeps inside a handler. Work that has to happen later
//! is posted here with an absolute due time and picked up by the session
//! loop once the clock reaches it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry<T> {
    due_us: i64,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due_us == other.due_us && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Reversed: BinaryHeap is a max-heap and the earliest entry must be on top
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_us
            .cmp(&self.due_us)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of deferred items keyed by due time, then posting order
pub struct TimerQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Post `item` for delivery at `due_us`
    pub fn schedule(&mut self, due_us: i64, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { due_us, seq, item });
    }

    /// Remove and return the earliest item if it is due at `now_us`
    pub fn pop_due(&mut self, now_us: i64) -> Option<T> {
        if self.heap.peek()?.due_us > now_us {
            return None;
        }
        self.heap.pop().map(|e| e.item)
    }

    /// Due time of the earliest item
    pub fn next_due_us(&self) -> Option<i64> {
        self.heap.peek().map(|e| e.due_us)
    }

    /// Drop every pending item
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_due_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(300, "c");
        timers.schedule(100, "a");
        timers.schedule(200, "b");

        assert_eq!(timers.next_due_us(), Some(100));
        assert_eq!(timers.pop_due(50), None);
        assert_eq!(timers.pop_due(250), Some("a"));
        assert_eq!(timers.pop_due(250), Some("b"));
        assert_eq!(timers.pop_due(250), None);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_equal_due_times_keep_posting_order() {
        let mut timers = TimerQueue::new();
        for i in 0..5 {
            timers.schedule(10, i);
        }
        let order: Vec<_> = std::iter::from_fn(|| timers.pop_due(10)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_clear() {
        let mut timers = TimerQueue::new();
        timers.schedule(0, ());
        timers.clear();
        assert!(timers.is_empty());
        assert_eq!(timers.pop_due(i64::MAX), None);
    }

    proptest::proptest! {
        #[test]
        fn prop_pops_sorted_by_due_then_posting(dues in proptest::collection::vec(0i64..50, 0..100)) {
            let mut timers = TimerQueue::new();
            for (i, due) in dues.iter().enumerate() {
                timers.schedule(*due, i);
            }
            let popped: Vec<usize> = std::iter::from_fn(|| timers.pop_due(i64::MAX)).collect();

            let mut expected: Vec<usize> = (0..dues.len()).collect();
            expected.sort_by_key(|&i| (dues[i], i));
            proptest::prop_assert_eq!(popped, expected);
        }
    }
}

//! Deadline-scheduled video presentation
//!
//! Decoded frames are held until their presentation time and then rendered
//! onto the video surface through the decoder. A single wake-up is kept
//! armed for the earliest held frame.

use crate::decoder::{OutputReleaser, PendingOutput};
use crate::error::RenderError;
use bytes::Bytes;
use castsink_io::us_to_duration;
use std::collections::VecDeque;
use std::time::Duration;

/// Output surface for decoded video
///
/// Handed to the video decoder at configure time; the decoder presents each
/// rendered output slot on it.
pub trait VideoSink: Send + Sync {
    fn present(&self, pts_us: i64, frame: Bytes);

    fn stop(&self) {}
}

/// Video scheduler configuration
#[derive(Debug, Clone)]
pub struct VideoSchedulerConfig {
    /// Frames rendered more than this after their deadline count as late
    pub late_tolerance: Duration,
}

impl Default for VideoSchedulerConfig {
    fn default() -> Self {
        VideoSchedulerConfig {
            late_tolerance: Duration::from_millis(15),
        }
    }
}

/// Holds decoded frames until their deadline
pub struct VideoScheduler {
    late_tolerance_us: i64,
    /// Ordered by presentation time
    queue: VecDeque<PendingOutput>,
    /// Deadline the current wake-up was armed for
    armed_for: Option<i64>,
    frames: u64,
    frames_late: u64,
}

impl VideoScheduler {
    pub fn new(config: VideoSchedulerConfig) -> Self {
        VideoScheduler {
            late_tolerance_us: castsink_io::duration_to_us(config.late_tolerance),
            queue: VecDeque::new(),
            armed_for: None,
            frames: 0,
            frames_late: 0,
        }
    }

    /// Hold a decoded frame
    ///
    /// Returns a delay when the wake-up has to be (re)armed; a returned
    /// delay supersedes any wake-up armed before.
    pub fn enqueue(&mut self, output: PendingOutput, now_us: i64) -> Option<Duration> {
        let idx = self
            .queue
            .iter()
            .rposition(|o| o.pts_us <= output.pts_us)
            .map_or(0, |i| i + 1);
        self.queue.insert(idx, output);

        match self.armed_for {
            Some(deadline) if self.front_pts().map_or(true, |pts| pts >= deadline) => None,
            _ => {
                self.armed_for = None;
                self.schedule_if_necessary(now_us)
            }
        }
    }

    /// Render every frame whose deadline has passed
    ///
    /// Returns the delay of the next wake-up, if any frame is left.
    pub fn render_due(
        &mut self,
        now_us: i64,
        releaser: &mut dyn OutputReleaser,
    ) -> Result<Option<Duration>, RenderError> {
        self.armed_for = None;

        while let Some(front) = self.queue.front() {
            if front.pts_us > now_us {
                break;
            }

            if front.pts_us + self.late_tolerance_us < now_us {
                self.frames_late += 1;
                tracing::warn!(
                    "frame pts={} rendered {}us late",
                    front.pts_us,
                    now_us - front.pts_us
                );
            }
            self.frames += 1;

            let slot = front.slot;
            self.queue.pop_front();
            releaser.render_output(slot)?;
        }

        Ok(self.schedule_if_necessary(now_us))
    }

    fn schedule_if_necessary(&mut self, now_us: i64) -> Option<Duration> {
        if self.armed_for.is_some() {
            return None;
        }
        let pts = self.front_pts()?;
        self.armed_for = Some(pts);
        Some(us_to_duration(pts - now_us))
    }

    fn front_pts(&self) -> Option<i64> {
        self.queue.front().map(|o| o.pts_us)
    }

    /// Disarm and hand every held frame back unrendered
    pub fn release_all(&mut self, releaser: &mut dyn OutputReleaser) -> Result<(), RenderError> {
        self.armed_for = None;
        while let Some(output) = self.queue.pop_front() {
            releaser.release_output(output.slot)?;
        }
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn frames_late(&self) -> u64 {
        self.frames_late
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    pub fn is_armed(&self) -> bool {
        self.armed_for.is_some()
    }
}

//! Non-blocking audio output pacing
//!
//! The audio sink is push-mode with a fixed ring of `frame_count` frames.
//! [`AudioPacer`] only ever writes what fits in that ring, keeps the
//! remainder of a partially written buffer for the next push, and asks to be
//! woken again after about half of the audio already queued in the sink has
//! played out.

use crate::decoder::{OutputReleaser, PendingOutput};
use crate::error::RenderError;
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

/// Push-mode PCM output
pub trait AudioSink: Send {
    /// Write up to `data.len()` bytes without blocking
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Frames played since start (wraps)
    fn play_position(&self) -> u32;

    /// Capacity of the sink ring, in frames
    fn frame_count(&self) -> u32;

    /// Bytes per frame
    fn frame_size(&self) -> usize;

    fn sample_rate(&self) -> u32;

    fn stop(&mut self);
}

struct QueuedAudio {
    output: PendingOutput,
    offset: usize,
}

/// Paces decoded audio into an [`AudioSink`]
pub struct AudioPacer {
    sink: Box<dyn AudioSink>,
    queue: VecDeque<QueuedAudio>,
    /// Frames written since start (wraps, like the sink position)
    frames_written: u32,
    /// Bytes of a frame the sink accepted only part of
    partial_frame_bytes: usize,
    bytes_written: u64,
    push_pending: bool,
}

impl AudioPacer {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        AudioPacer {
            sink,
            queue: VecDeque::new(),
            frames_written: 0,
            partial_frame_bytes: 0,
            bytes_written: 0,
            push_pending: false,
        }
    }

    /// Queue a decoded buffer
    ///
    /// Returns the delay of the next push if one has to be scheduled.
    pub fn enqueue(&mut self, output: PendingOutput) -> Option<Duration> {
        tracing::trace!(
            "audio buffer slot={} pts={} ({} bytes)",
            output.slot,
            output.pts_us,
            output.payload.len()
        );
        self.queue.push_back(QueuedAudio { output, offset: 0 });
        self.schedule_push_if_necessary()
    }

    /// Write as much queued audio as the sink has room for
    ///
    /// Fully written buffers go back to the decoder through `releaser`.
    /// Returns the delay of the next push if one has to be scheduled.
    pub fn push(
        &mut self,
        releaser: &mut dyn OutputReleaser,
    ) -> Result<Option<Duration>, RenderError> {
        self.push_pending = false;

        while let Some(front) = self.queue.front_mut() {
            let remaining = &front.output.payload[front.offset..];
            let wanted = remaining.len();
            let headroom = headroom_bytes(self.sink.as_ref(), self.frames_written);

            let n = if headroom == 0 || wanted == 0 {
                0
            } else {
                self.sink.write(&remaining[..wanted.min(headroom)])?
            };

            let frame_size = self.sink.frame_size().max(1);
            let pending = self.partial_frame_bytes + n;
            self.frames_written = self
                .frames_written
                .wrapping_add((pending / frame_size) as u32);
            self.partial_frame_bytes = pending % frame_size;
            self.bytes_written += n as u64;

            if n < wanted {
                front.offset += n;
                tracing::trace!(
                    "audio sink full, {} bytes of slot {} left",
                    wanted - n,
                    front.output.slot
                );
                break;
            }

            let slot = front.output.slot;
            self.queue.pop_front();
            releaser.release_output(slot)?;
        }

        Ok(self.schedule_push_if_necessary())
    }

    fn schedule_push_if_necessary(&mut self) -> Option<Duration> {
        if self.push_pending || self.queue.is_empty() {
            return None;
        }
        self.push_pending = true;

        let pending_frames = self
            .frames_written
            .wrapping_sub(self.sink.play_position()) as u64;
        let sample_rate = self.sink.sample_rate().max(1) as u64;
        let playout_us = pending_frames * 1_000_000 / sample_rate;

        Some(Duration::from_micros(playout_us / 2))
    }

    /// Hand every queued buffer back without writing it
    pub fn release_all(&mut self, releaser: &mut dyn OutputReleaser) -> Result<(), RenderError> {
        self.push_pending = false;
        while let Some(queued) = self.queue.pop_front() {
            releaser.release_output(queued.output.slot)?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.sink.stop();
    }

    pub fn queued_buffers(&self) -> usize {
        self.queue.len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn frames_written(&self) -> u32 {
        self.frames_written
    }

    pub fn push_pending(&self) -> bool {
        self.push_pending
    }
}

/// Bytes the sink can take right now
fn headroom_bytes(sink: &dyn AudioSink, frames_written: u32) -> usize {
    let in_flight = frames_written.wrapping_sub(sink.play_position());
    sink.frame_count().saturating_sub(in_flight) as usize * sink.frame_size()
}

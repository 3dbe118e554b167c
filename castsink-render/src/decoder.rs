//! Decoder pipeline
//!
//! A [`DecodePipeline`] sits between the demuxer and one external decoder.
//! Encoded access units queue up until the decoder announces a free input
//! slot; decoded output slots are held on the decoder's behalf until a
//! renderer hands them back, exactly once, through [`OutputReleaser`].
//!
//! Slot ownership is tracked per slot index. Every transition is checked,
//! so an out-of-range index, a double release or a duplicate notification
//! surfaces as [`RenderError::SlotMisuse`] instead of corrupting the decoder.

use crate::error::{DecoderError, RenderError};
use crate::video::VideoSink;
use bytes::Bytes;
use castsink_protocol::TimestampedUnit;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Stream format handed to the decoder at configure time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    pub mime: String,
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Codec-specific setup data
    pub codec_config: Vec<Bytes>,
}

impl MediaFormat {
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        MediaFormat {
            mime: mime.to_string(),
            kind: MediaKind::Video,
            width,
            height,
            sample_rate: 0,
            channels: 0,
            codec_config: Vec::new(),
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channels: u16) -> Self {
        MediaFormat {
            mime: mime.to_string(),
            kind: MediaKind::Audio,
            width: 0,
            height: 0,
            sample_rate,
            channels,
            codec_config: Vec::new(),
        }
    }
}

/// One encoded access unit for a track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub pts_us: i64,
    pub payload: Bytes,
}

impl AccessUnit {
    pub fn new(pts_us: i64, payload: Bytes) -> Self {
        AccessUnit { pts_us, payload }
    }
}

impl From<TimestampedUnit> for AccessUnit {
    fn from(unit: TimestampedUnit) -> Self {
        AccessUnit {
            pts_us: unit.pts_us,
            payload: unit.payload,
        }
    }
}

/// External decoder
///
/// Slot availability is not polled: the decoder reports free input slots and
/// finished output slots asynchronously through the session mailbox.
pub trait Decoder: Send {
    /// Configure for `format`; video decoders render into `surface`
    fn configure(
        &mut self,
        format: &MediaFormat,
        surface: Option<Arc<dyn VideoSink>>,
    ) -> Result<(), DecoderError>;

    fn start(&mut self) -> Result<(), DecoderError>;

    fn stop(&mut self) -> Result<(), DecoderError>;

    /// Free every decoder resource; the decoder is unusable afterwards
    fn release(&mut self);

    fn input_slot_count(&self) -> usize;

    fn output_slot_count(&self) -> usize;

    /// Copy `data` into input slot `slot` and hand it to the decoder
    fn queue_input(&mut self, slot: usize, data: &[u8], pts_us: i64) -> Result<(), DecoderError>;

    /// Return an output slot without presenting it
    fn release_output(&mut self, slot: usize) -> Result<(), DecoderError>;

    /// Present an output slot on the configured surface and return it
    fn render_output(&mut self, slot: usize) -> Result<(), DecoderError>;
}

/// Return path for decoded output slots
pub trait OutputReleaser {
    fn release_output(&mut self, slot: usize) -> Result<(), RenderError>;

    fn render_output(&mut self, slot: usize) -> Result<(), RenderError>;
}

/// Decoded output waiting for its renderer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutput {
    pub slot: usize,
    pub pts_us: i64,
    pub payload: Bytes,
}

/// Ownership of one decoder slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the decoder
    Pending,
    /// Input slot handed to the pipeline, waiting to be filled
    Free,
    /// Output slot held until a renderer returns it
    HoldingOutput,
    /// Returned by its renderer; the decoder deferred taking it back
    Returning,
}

/// Per-slot ownership table
#[derive(Debug)]
pub struct SlotTable {
    track: usize,
    states: Vec<SlotState>,
}

impl SlotTable {
    /// Create a table with every slot owned by the decoder
    pub fn new(track: usize, count: usize) -> Self {
        SlotTable {
            track,
            states: vec![SlotState::Pending; count],
        }
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.states.get(slot).copied()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Slots currently in `state`
    pub fn slots_in(&self, state: SlotState) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(move |(_, s)| **s == state)
            .map(|(i, _)| i)
    }

    /// Move `slot` from `from` to `to`
    pub fn transition(
        &mut self,
        slot: usize,
        from: SlotState,
        to: SlotState,
        reason: &'static str,
    ) -> Result<(), RenderError> {
        let track = self.track;
        match self.states.get_mut(slot) {
            Some(state) if *state == from => {
                *state = to;
                Ok(())
            }
            Some(_) => Err(RenderError::SlotMisuse {
                track,
                slot,
                reason,
            }),
            None => Err(RenderError::SlotMisuse {
                track,
                slot,
                reason: "slot index out of range",
            }),
        }
    }
}

/// Feeds one external decoder and tracks its slots
pub struct DecodePipeline {
    track: usize,
    decoder: Box<dyn Decoder>,
    inputs: SlotTable,
    outputs: SlotTable,
    free_inputs: VecDeque<usize>,
    pending_units: VecDeque<AccessUnit>,
    /// Output returns the decoder asked to retry, with the render flag
    deferred_returns: VecDeque<(usize, bool)>,
    retry_needed: bool,
    started: bool,
}

impl DecodePipeline {
    pub fn new(track: usize, decoder: Box<dyn Decoder>) -> Self {
        DecodePipeline {
            track,
            decoder,
            inputs: SlotTable::new(track, 0),
            outputs: SlotTable::new(track, 0),
            free_inputs: VecDeque::new(),
            pending_units: VecDeque::new(),
            deferred_returns: VecDeque::new(),
            retry_needed: false,
            started: false,
        }
    }

    /// Configure and start the decoder
    pub fn configure(
        &mut self,
        format: &MediaFormat,
        surface: Option<Arc<dyn VideoSink>>,
    ) -> Result<(), RenderError> {
        let track = self.track;
        self.decoder
            .configure(format, surface)
            .map_err(|e| RenderError::decoder(track, e))?;
        self.decoder
            .start()
            .map_err(|e| RenderError::decoder(track, e))?;

        self.inputs = SlotTable::new(track, self.decoder.input_slot_count());
        self.outputs = SlotTable::new(track, self.decoder.output_slot_count());
        self.started = true;

        tracing::debug!(
            "track {} decoder started for {} ({} input / {} output slots)",
            track,
            format.mime,
            self.inputs.len(),
            self.outputs.len()
        );
        Ok(())
    }

    /// Queue an access unit and feed the decoder as far as slots allow
    pub fn submit(&mut self, unit: AccessUnit) -> Result<(), RenderError> {
        tracing::trace!(
            "track {} access unit pts={} ({} bytes)",
            self.track,
            unit.pts_us,
            unit.payload.len()
        );
        self.pending_units.push_back(unit);
        self.fill_inputs()
    }

    /// The decoder gave input slot `slot` back
    pub fn on_input_slot_available(&mut self, slot: usize) -> Result<(), RenderError> {
        self.on_input_slots_available([slot])
    }

    /// The decoder gave several input slots back at once
    pub fn on_input_slots_available(
        &mut self,
        slots: impl IntoIterator<Item = usize>,
    ) -> Result<(), RenderError> {
        for slot in slots {
            self.inputs.transition(
                slot,
                SlotState::Pending,
                SlotState::Free,
                "input slot is already free",
            )?;
            self.free_inputs.push_back(slot);
        }
        self.fill_inputs()
    }

    /// The decoder finished output slot `slot`
    pub fn on_output_ready(
        &mut self,
        slot: usize,
        pts_us: i64,
        payload: Bytes,
    ) -> Result<PendingOutput, RenderError> {
        self.outputs.transition(
            slot,
            SlotState::Pending,
            SlotState::HoldingOutput,
            "output slot is already held",
        )?;
        Ok(PendingOutput {
            slot,
            pts_us,
            payload,
        })
    }

    fn fill_inputs(&mut self) -> Result<(), RenderError> {
        while let (Some(&slot), Some(unit)) = (self.free_inputs.front(), self.pending_units.front()) {
            match self.decoder.queue_input(slot, &unit.payload, unit.pts_us) {
                Ok(()) => {}
                Err(DecoderError::TryAgainLater) => {
                    tracing::trace!("track {} decoder busy, keeping unit queued", self.track);
                    self.retry_needed = true;
                    return Ok(());
                }
                Err(e) => return Err(RenderError::decoder(self.track, e)),
            }

            self.inputs
                .transition(slot, SlotState::Free, SlotState::Pending, "input slot not free")?;
            self.free_inputs.pop_front();
            self.pending_units.pop_front();
        }
        Ok(())
    }

    /// Whether the decoder deferred work since the last call
    ///
    /// The caller is expected to call [`DecodePipeline::retry`] later.
    pub fn take_retry(&mut self) -> bool {
        std::mem::take(&mut self.retry_needed)
    }

    /// Re-attempt deferred output returns, then refill input slots
    pub fn retry(&mut self) -> Result<(), RenderError> {
        let deferred = std::mem::take(&mut self.deferred_returns);
        for (slot, render) in deferred {
            self.finish_return(slot, render)?;
        }
        self.fill_inputs()
    }

    /// Drop access units not yet handed to the decoder
    pub fn flush(&mut self) -> usize {
        let dropped = self.pending_units.len();
        self.pending_units.clear();
        dropped
    }

    /// Return every held output, then stop and release the decoder
    ///
    /// Returns the decoder still defers are reclaimed by stopping it.
    pub fn teardown(&mut self) -> Result<(), RenderError> {
        let held: Vec<usize> = self.outputs.slots_in(SlotState::HoldingOutput).collect();
        for slot in held {
            self.release_output(slot)?;
        }
        for (slot, _) in std::mem::take(&mut self.deferred_returns) {
            self.finish_return(slot, false)?;
        }
        self.deferred_returns.clear();
        self.retry_needed = false;

        self.pending_units.clear();
        self.free_inputs.clear();

        if self.started {
            self.started = false;
            self.decoder
                .stop()
                .map_err(|e| RenderError::decoder(self.track, e))?;
        }
        self.decoder.release();

        tracing::debug!("track {} decoder released", self.track);
        Ok(())
    }

    pub fn track(&self) -> usize {
        self.track
    }

    pub fn pending_units(&self) -> usize {
        self.pending_units.len()
    }

    pub fn free_input_slots(&self) -> usize {
        self.free_inputs.len()
    }

    pub fn held_outputs(&self) -> usize {
        self.outputs.slots_in(SlotState::HoldingOutput).count()
    }

    pub fn output_state(&self, slot: usize) -> Option<SlotState> {
        self.outputs.state(slot)
    }

    pub fn deferred_returns(&self) -> usize {
        self.deferred_returns.len()
    }

    fn return_output(&mut self, slot: usize, render: bool) -> Result<(), RenderError> {
        self.outputs.transition(
            slot,
            SlotState::HoldingOutput,
            SlotState::Returning,
            "output slot is not held",
        )?;
        self.finish_return(slot, render)
    }

    /// Hand a `Returning` slot to the decoder; it stays ours until accepted
    fn finish_return(&mut self, slot: usize, render: bool) -> Result<(), RenderError> {
        let result = if render {
            self.decoder.render_output(slot)
        } else {
            self.decoder.release_output(slot)
        };

        match result {
            Ok(()) => self.outputs.transition(
                slot,
                SlotState::Returning,
                SlotState::Pending,
                "output slot is not being returned",
            ),
            Err(DecoderError::TryAgainLater) => {
                tracing::debug!("track {} decoder deferred return of slot {}", self.track, slot);
                self.deferred_returns.push_back((slot, render));
                self.retry_needed = true;
                Ok(())
            }
            Err(e) => Err(RenderError::decoder(self.track, e)),
        }
    }
}

impl OutputReleaser for DecodePipeline {
    fn release_output(&mut self, slot: usize) -> Result<(), RenderError> {
        self.return_output(slot, false)
    }

    fn render_output(&mut self, slot: usize) -> Result<(), RenderError> {
        self.return_output(slot, true)
    }
}

impl fmt::Debug for DecodePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodePipeline")
            .field("track", &self.track)
            .field("pending_units", &self.pending_units.len())
            .field("free_inputs", &self.free_inputs)
            .field("started", &self.started)
            .finish()
    }
}

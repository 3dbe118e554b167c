//! Two-track sink session
//!
//! [`SinkSession`] is a single-threaded actor. Decoder callbacks, the
//! demuxer and the network side post [`SessionMessage`]s into its mailbox
//! through a [`SessionHandle`]; the session processes one message at a time
//! to completion and never blocks inside a handler. Work due later (the next
//! audio push, the next video deadline) goes into a [`TimerQueue`].
//!
//! Track 0 is video, rendered through the [`VideoSink`] surface handed to its
//! decoder. Track 1 is audio, paced into the [`AudioSink`] created with it.

use crate::audio::{AudioPacer, AudioSink};
use crate::decoder::{AccessUnit, DecodePipeline, Decoder, MediaFormat};
use crate::error::RenderError;
use crate::looper::TimerQueue;
use crate::video::{VideoScheduler, VideoSchedulerConfig, VideoSink};
use bytes::Bytes;
use castsink_io::{duration_to_us, us_to_duration, MediaClock, SystemClock};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const VIDEO_TRACK: usize = 0;
pub const AUDIO_TRACK: usize = 1;
pub const TRACK_COUNT: usize = 2;

/// Delay before work a decoder deferred is attempted again
pub const DECODER_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Session mailbox messages
#[derive(Debug)]
pub enum SessionMessage {
    SetFormat { track: usize, format: MediaFormat },
    QueueAccessUnit { track: usize, unit: AccessUnit },
    InputSlotsAvailable { track: usize, slots: Vec<usize> },
    OutputReady {
        track: usize,
        slot: usize,
        pts_us: i64,
        payload: Bytes,
    },
    PushAudio,
    /// Re-attempt work the track's decoder asked to retry
    RetryDecoder { track: usize },
    /// Carries the arming generation; superseded wake-ups are ignored
    RenderVideo { generation: u64 },
    Shutdown,
}

/// Creates the external components for a track
pub trait MediaBackend: Send {
    /// Create the decoder for `track`; it reports slot events through `events`
    fn create_decoder(
        &mut self,
        track: usize,
        format: &MediaFormat,
        events: SessionHandle,
    ) -> Result<Box<dyn Decoder>, RenderError>;

    fn create_audio_sink(&mut self, format: &MediaFormat) -> Result<Box<dyn AudioSink>, RenderError>;
}

/// Cloneable sender side of the session mailbox
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: Sender<SessionMessage>,
}

impl SessionHandle {
    pub fn post(&self, msg: SessionMessage) -> Result<(), RenderError> {
        self.tx.send(msg).map_err(|_| RenderError::MailboxClosed)
    }

    pub fn set_format(&self, track: usize, format: MediaFormat) -> Result<(), RenderError> {
        self.post(SessionMessage::SetFormat { track, format })
    }

    pub fn queue_access_unit(&self, track: usize, unit: AccessUnit) -> Result<(), RenderError> {
        self.post(SessionMessage::QueueAccessUnit { track, unit })
    }

    pub fn input_slots_available(&self, track: usize, slots: Vec<usize>) -> Result<(), RenderError> {
        self.post(SessionMessage::InputSlotsAvailable { track, slots })
    }

    pub fn output_ready(
        &self,
        track: usize,
        slot: usize,
        pts_us: i64,
        payload: Bytes,
    ) -> Result<(), RenderError> {
        self.post(SessionMessage::OutputReady {
            track,
            slot,
            pts_us,
            payload,
        })
    }

    pub fn shutdown(&self) -> Result<(), RenderError> {
        self.post(SessionMessage::Shutdown)
    }
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub video_frames: u64,
    pub video_frames_late: u64,
    pub audio_bytes_written: u64,
    pub access_units: u64,
}

/// Two-track decode and render actor
pub struct SinkSession<C: MediaClock = SystemClock> {
    clock: C,
    backend: Box<dyn MediaBackend>,
    video_sink: Arc<dyn VideoSink>,
    pipelines: [Option<DecodePipeline>; TRACK_COUNT],
    audio: Option<AudioPacer>,
    video: VideoScheduler,
    timers: TimerQueue<SessionMessage>,
    video_generation: u64,
    retry_armed: [bool; TRACK_COUNT],
    tx: Sender<SessionMessage>,
    rx: Receiver<SessionMessage>,
    stats: Arc<Mutex<SessionStats>>,
    access_units: u64,
    stopped: bool,
}

impl<C: MediaClock> SinkSession<C> {
    pub fn new(
        clock: C,
        backend: Box<dyn MediaBackend>,
        video_sink: Arc<dyn VideoSink>,
        video_config: VideoSchedulerConfig,
    ) -> Self {
        let (tx, rx) = channel::unbounded();
        SinkSession {
            clock,
            backend,
            video_sink,
            pipelines: [None, None],
            audio: None,
            video: VideoScheduler::new(video_config),
            timers: TimerQueue::new(),
            video_generation: 0,
            retry_armed: [false; TRACK_COUNT],
            tx,
            rx,
            stats: Arc::new(Mutex::new(SessionStats::default())),
            access_units: 0,
            stopped: false,
        }
    }

    /// A sender for the mailbox
    pub fn mailbox(&self) -> SessionHandle {
        SessionHandle {
            tx: self.tx.clone(),
        }
    }

    /// Shared view of the counters, refreshed after every message
    pub fn stats_handle(&self) -> Arc<Mutex<SessionStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            video_frames: self.video.frames(),
            video_frames_late: self.video.frames_late(),
            audio_bytes_written: self.audio.as_ref().map_or(0, |a| a.bytes_written()),
            access_units: self.access_units,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Due time of the earliest deferred message
    pub fn next_timer_due_us(&self) -> Option<i64> {
        self.timers.next_due_us()
    }

    /// Process one message to completion
    ///
    /// A fatal error tears the session down before it is returned; later
    /// messages are dropped.
    pub fn handle(&mut self, msg: SessionMessage) -> Result<(), RenderError> {
        if self.stopped {
            tracing::debug!("session stopped, dropping {:?}", msg);
            return Ok(());
        }

        let result = self.dispatch(msg);
        if !self.stopped {
            self.schedule_retries();
        }
        *self.stats.lock() = self.stats();

        match result {
            Err(e) if e.is_fatal() => {
                tracing::error!("session failed: {}", e);
                if let Err(teardown) = self.teardown() {
                    tracing::error!("teardown after failure: {}", teardown);
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Process every deferred message due now
    pub fn fire_due(&mut self) -> Result<usize, RenderError> {
        let mut fired = 0;
        while let Some(msg) = self.timers.pop_due(self.clock.now_us()) {
            self.handle(msg)?;
            fired += 1;
        }
        Ok(fired)
    }

    /// Process every message already in the mailbox, then any due timers
    pub fn drain_mailbox(&mut self) -> Result<usize, RenderError> {
        let mut handled = 0;
        while let Ok(msg) = self.rx.try_recv() {
            self.handle(msg)?;
            handled += 1;
        }
        Ok(handled + self.fire_due()?)
    }

    /// Run the session until shutdown or a fatal error
    ///
    /// Rejected messages are logged and skipped. The session is torn down on
    /// the way out either way.
    pub fn run(mut self) -> Result<SessionStats, RenderError> {
        let result = self.run_loop();
        let teardown = self.teardown();
        result?;
        teardown?;
        Ok(self.stats())
    }

    fn run_loop(&mut self) -> Result<(), RenderError> {
        loop {
            if let Err(e) = self.fire_due() {
                skip_rejected(e)?;
            }
            if self.stopped {
                return Ok(());
            }

            let msg = match self.timers.next_due_us() {
                Some(due_us) => {
                    let wait = us_to_duration(due_us - self.clock.now_us());
                    match self.rx.recv_timeout(wait) {
                        Ok(msg) => msg,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => return Ok(()),
                    }
                }
                None => match self.rx.recv() {
                    Ok(msg) => msg,
                    Err(_) => return Ok(()),
                },
            };

            if let Err(e) = self.handle(msg) {
                skip_rejected(e)?;
            }
            if self.stopped {
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, msg: SessionMessage) -> Result<(), RenderError> {
        match msg {
            SessionMessage::SetFormat { track, format } => self.on_set_format(track, format),
            SessionMessage::QueueAccessUnit { track, unit } => {
                self.access_units += 1;
                self.pipeline(track)?.submit(unit)
            }
            SessionMessage::InputSlotsAvailable { track, slots } => {
                self.pipeline(track)?.on_input_slots_available(slots)
            }
            SessionMessage::OutputReady {
                track,
                slot,
                pts_us,
                payload,
            } => self.on_output_ready(track, slot, pts_us, payload),
            SessionMessage::PushAudio => self.on_push_audio(),
            SessionMessage::RetryDecoder { track } => {
                if let Some(armed) = self.retry_armed.get_mut(track) {
                    *armed = false;
                }
                self.pipeline(track)?.retry()
            }
            SessionMessage::RenderVideo { generation } => self.on_render_video(generation),
            SessionMessage::Shutdown => self.teardown(),
        }
    }

    fn on_set_format(&mut self, track: usize, format: MediaFormat) -> Result<(), RenderError> {
        if track >= TRACK_COUNT {
            return Err(RenderError::UnknownTrack(track));
        }
        if self.pipelines[track].is_some() {
            return Err(RenderError::AlreadyConfigured(track));
        }

        let events = self.mailbox();
        let decoder = self.backend.create_decoder(track, &format, events)?;
        let mut pipeline = DecodePipeline::new(track, decoder);
        let surface = (track == VIDEO_TRACK).then(|| self.video_sink.clone());
        pipeline.configure(&format, surface)?;

        if track == AUDIO_TRACK {
            let sink = self.backend.create_audio_sink(&format)?;
            self.audio = Some(AudioPacer::new(sink));
        }
        self.pipelines[track] = Some(pipeline);

        tracing::info!("track {} configured as {}", track, format.mime);
        Ok(())
    }

    fn on_output_ready(
        &mut self,
        track: usize,
        slot: usize,
        pts_us: i64,
        payload: Bytes,
    ) -> Result<(), RenderError> {
        let output = self.pipeline(track)?.on_output_ready(slot, pts_us, payload)?;
        let now_us = self.clock.now_us();

        if track == AUDIO_TRACK {
            let audio = self
                .audio
                .as_mut()
                .ok_or(RenderError::NotConfigured(track))?;
            if let Some(delay) = audio.enqueue(output) {
                self.schedule(delay, SessionMessage::PushAudio);
            }
        } else if let Some(delay) = self.video.enqueue(output, now_us) {
            self.arm_video(delay);
        }
        Ok(())
    }

    fn on_push_audio(&mut self) -> Result<(), RenderError> {
        let (Some(audio), Some(pipeline)) =
            (self.audio.as_mut(), self.pipelines[AUDIO_TRACK].as_mut())
        else {
            return Ok(());
        };

        if let Some(delay) = audio.push(pipeline)? {
            self.schedule(delay, SessionMessage::PushAudio);
        }
        Ok(())
    }

    fn on_render_video(&mut self, generation: u64) -> Result<(), RenderError> {
        if generation != self.video_generation {
            tracing::trace!("ignoring superseded video wake-up {}", generation);
            return Ok(());
        }
        let Some(pipeline) = self.pipelines[VIDEO_TRACK].as_mut() else {
            return Ok(());
        };

        let now_us = self.clock.now_us();
        if let Some(delay) = self.video.render_due(now_us, pipeline)? {
            self.arm_video(delay);
        }
        Ok(())
    }

    fn arm_video(&mut self, delay: Duration) {
        self.video_generation += 1;
        let generation = self.video_generation;
        self.schedule(delay, SessionMessage::RenderVideo { generation });
    }

    /// Arm one retry per track whose decoder deferred work
    fn schedule_retries(&mut self) {
        for track in 0..TRACK_COUNT {
            let Some(pipeline) = self.pipelines[track].as_mut() else {
                continue;
            };
            if pipeline.take_retry() && !self.retry_armed[track] {
                self.retry_armed[track] = true;
                self.schedule(DECODER_RETRY_DELAY, SessionMessage::RetryDecoder { track });
            }
        }
    }

    fn schedule(&mut self, delay: Duration, msg: SessionMessage) {
        let due_us = self.clock.now_us() + duration_to_us(delay);
        self.timers.schedule(due_us, msg);
    }

    fn pipeline(&mut self, track: usize) -> Result<&mut DecodePipeline, RenderError> {
        if track >= TRACK_COUNT {
            return Err(RenderError::UnknownTrack(track));
        }
        self.pipelines[track]
            .as_mut()
            .ok_or(RenderError::NotConfigured(track))
    }

    /// Stop timers, return held outputs, tear down decoders, stop sinks
    ///
    /// Safe to call more than once.
    pub fn teardown(&mut self) -> Result<(), RenderError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.timers.clear();
        self.retry_armed = [false; TRACK_COUNT];

        if let Some(pipeline) = self.pipelines[VIDEO_TRACK].as_mut() {
            self.video.release_all(pipeline)?;
        }
        if let (Some(audio), Some(pipeline)) =
            (self.audio.as_mut(), self.pipelines[AUDIO_TRACK].as_mut())
        {
            audio.release_all(pipeline)?;
        }

        for pipeline in self.pipelines.iter_mut().flatten() {
            pipeline.teardown()?;
        }

        if let Some(audio) = self.audio.as_mut() {
            audio.stop();
        }
        self.video_sink.stop();

        let stats = self.stats();
        *self.stats.lock() = stats;
        tracing::info!(
            "session stopped: {} video frames ({} late), {} audio bytes",
            stats.video_frames,
            stats.video_frames_late,
            stats.audio_bytes_written
        );
        Ok(())
    }
}

fn skip_rejected(e: RenderError) -> Result<(), RenderError> {
    if e.is_fatal() {
        return Err(e);
    }
    tracing::warn!("message rejected: {}", e);
    Ok(())
}

//! Shared fakes for the castsink integration tests
//!
//! The fakes stand in for the external pieces the sink drives: a decoder
//! that "decodes" by echoing input payloads into output slots, a push-mode
//! audio ring, a recording video surface, and a one-shot SNTP server on the
//! loopback interface.

use bytes::Bytes;
use castsink_protocol::ntp::{NtpPacket, NtpTimestamp, NTP_MODE_SERVER, NTP_PACKET_SIZE};
use castsink_protocol::NtpDuration;
use castsink_render::{
    AudioSink, Decoder, DecoderError, MediaBackend, MediaFormat, RenderError, SessionHandle,
    VideoSink,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Ordered record of teardown-relevant calls across all fakes
pub type Journal = Arc<Mutex<Vec<String>>>;

/// Calls observed by one fake decoder
#[derive(Debug, Default)]
pub struct DecoderLog {
    /// Presentation times of queued inputs, in queue order
    pub queued: Vec<i64>,
    pub released: Vec<usize>,
    pub rendered: Vec<usize>,
    /// Output slots handed to the session and not yet returned
    pub outstanding: BTreeSet<usize>,
    /// Every `queue_input` call, including rejected ones
    pub queue_attempts: usize,
    pub stopped: bool,
    pub freed: bool,
}

/// Failures the fake decoders inject
#[derive(Debug, Default)]
pub struct FaultPlan {
    /// Remaining `queue_input` calls answered with "try again later"
    pub busy_queues: usize,
    /// Remaining output returns answered with "try again later"
    pub deferred_returns: usize,
    /// Track whose decoder fails every `queue_input`
    pub failing_track: Option<usize>,
}

/// PCM ring state shared with a [`FakeAudioSink`]
#[derive(Debug, Default)]
pub struct AudioState {
    /// Frames played; advanced by the test
    pub played: u32,
    pub frames_written: u32,
    pub written: Vec<u8>,
    /// Largest number of unplayed frames ever in the ring
    pub max_in_flight: u32,
    pub stopped: bool,
}

impl AudioState {
    /// Play up to `frames` of what has been written
    pub fn play(&mut self, frames: u32) {
        let in_flight = self.frames_written.wrapping_sub(self.played);
        self.played = self.played.wrapping_add(frames.min(in_flight));
    }
}

/// Everything a test can observe about a session's external components
#[derive(Clone, Default)]
pub struct Recorder {
    pub journal: Journal,
    pub decoders: Arc<Mutex<HashMap<usize, DecoderLog>>>,
    pub audio: Arc<Mutex<AudioState>>,
    pub surface: Arc<RecordingSurface>,
    pub faults: Arc<Mutex<FaultPlan>>,
}

impl Recorder {
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Output slots of `track` the session still holds
    pub fn outstanding(&self, track: usize) -> usize {
        self.decoders
            .lock()
            .get(&track)
            .map_or(0, |log| log.outstanding.len())
    }

    pub fn presented(&self) -> Vec<(i64, Bytes)> {
        self.surface.frames.lock().clone()
    }
}

/// Video surface that records presented frames
#[derive(Default)]
pub struct RecordingSurface {
    pub frames: Mutex<Vec<(i64, Bytes)>>,
    journal: Journal,
}

impl RecordingSurface {
    pub fn new(journal: Journal) -> Self {
        RecordingSurface {
            frames: Mutex::new(Vec::new()),
            journal,
        }
    }
}

impl VideoSink for RecordingSurface {
    fn present(&self, pts_us: i64, frame: Bytes) {
        self.frames.lock().push((pts_us, frame));
    }

    fn stop(&self) {
        self.journal.lock().push("surface stop".to_string());
    }
}

/// Decoder that turns every input into one output of the same payload
pub struct FakeDecoder {
    track: usize,
    events: SessionHandle,
    recorder: Recorder,
    input_slots: usize,
    output_slots: usize,
    surface: Option<Arc<dyn VideoSink>>,
    free_outputs: VecDeque<usize>,
    decoded: VecDeque<(i64, Bytes)>,
    frames: Vec<Option<(i64, Bytes)>>,
}

impl FakeDecoder {
    pub fn new(
        track: usize,
        events: SessionHandle,
        recorder: Recorder,
        input_slots: usize,
        output_slots: usize,
    ) -> Self {
        recorder.decoders.lock().insert(track, DecoderLog::default());
        FakeDecoder {
            track,
            events,
            recorder,
            input_slots,
            output_slots,
            surface: None,
            free_outputs: (0..output_slots).collect(),
            decoded: VecDeque::new(),
            frames: vec![None; output_slots],
        }
    }

    fn with_log<R>(&self, f: impl FnOnce(&mut DecoderLog) -> R) -> R {
        let mut decoders = self.recorder.decoders.lock();
        f(decoders.entry(self.track).or_default())
    }

    fn journal(&self, entry: String) {
        self.recorder.journal.lock().push(entry);
    }

    /// Hand decoded frames to the session while output slots are free
    fn emit(&mut self) {
        while !self.decoded.is_empty() && !self.free_outputs.is_empty() {
            let (Some(slot), Some((pts_us, payload))) =
                (self.free_outputs.pop_front(), self.decoded.pop_front())
            else {
                break;
            };
            self.frames[slot] = Some((pts_us, payload.clone()));
            self.with_log(|log| log.outstanding.insert(slot));
            let _ = self.events.output_ready(self.track, slot, pts_us, payload);
        }
    }

    fn defer_return(&self) -> bool {
        let mut faults = self.recorder.faults.lock();
        if faults.deferred_returns == 0 {
            return false;
        }
        faults.deferred_returns -= 1;
        true
    }

    fn take_back(&mut self, slot: usize) -> Result<Option<(i64, Bytes)>, DecoderError> {
        if slot >= self.output_slots || !self.with_log(|log| log.outstanding.remove(&slot)) {
            return Err(DecoderError::Failed(format!("slot {} not handed out", slot)));
        }
        self.free_outputs.push_back(slot);
        Ok(self.frames[slot].take())
    }
}

impl Decoder for FakeDecoder {
    fn configure(
        &mut self,
        _format: &MediaFormat,
        surface: Option<Arc<dyn VideoSink>>,
    ) -> Result<(), DecoderError> {
        self.surface = surface;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        let _ = self
            .events
            .input_slots_available(self.track, (0..self.input_slots).collect());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DecoderError> {
        self.with_log(|log| log.stopped = true);
        self.journal(format!("track{} stop", self.track));
        Ok(())
    }

    fn release(&mut self) {
        self.with_log(|log| log.freed = true);
        self.journal(format!("track{} release", self.track));
    }

    fn input_slot_count(&self) -> usize {
        self.input_slots
    }

    fn output_slot_count(&self) -> usize {
        self.output_slots
    }

    fn queue_input(&mut self, slot: usize, data: &[u8], pts_us: i64) -> Result<(), DecoderError> {
        self.with_log(|log| log.queue_attempts += 1);
        {
            let mut faults = self.recorder.faults.lock();
            if faults.failing_track == Some(self.track) {
                return Err(DecoderError::Failed("injected failure".to_string()));
            }
            if faults.busy_queues > 0 {
                faults.busy_queues -= 1;
                return Err(DecoderError::TryAgainLater);
            }
        }
        self.with_log(|log| log.queued.push(pts_us));
        self.decoded
            .push_back((pts_us, Bytes::copy_from_slice(data)));
        let _ = self.events.input_slots_available(self.track, vec![slot]);
        self.emit();
        Ok(())
    }

    fn release_output(&mut self, slot: usize) -> Result<(), DecoderError> {
        if self.defer_return() {
            return Err(DecoderError::TryAgainLater);
        }
        self.take_back(slot)?;
        self.with_log(|log| log.released.push(slot));
        self.journal(format!("track{} release_output {}", self.track, slot));
        self.emit();
        Ok(())
    }

    fn render_output(&mut self, slot: usize) -> Result<(), DecoderError> {
        if self.defer_return() {
            return Err(DecoderError::TryAgainLater);
        }
        let frame = self.take_back(slot)?;
        if let (Some(surface), Some((pts_us, payload))) = (self.surface.as_ref(), frame) {
            surface.present(pts_us, payload);
        }
        self.with_log(|log| log.rendered.push(slot));
        self.emit();
        Ok(())
    }
}

/// 48 kHz stereo 16-bit ring
pub struct FakeAudioSink {
    state: Arc<Mutex<AudioState>>,
    journal: Journal,
    frames: u32,
}

pub const FAKE_FRAME_SIZE: usize = 4;
pub const FAKE_SAMPLE_RATE: u32 = 48_000;

impl FakeAudioSink {
    pub fn new(state: Arc<Mutex<AudioState>>, journal: Journal, frames: u32) -> Self {
        FakeAudioSink {
            state,
            journal,
            frames,
        }
    }
}

impl AudioSink for FakeAudioSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let in_flight = state.frames_written.wrapping_sub(state.played);
        let room = self.frames.saturating_sub(in_flight) as usize * FAKE_FRAME_SIZE;
        let n = data.len().min(room) / FAKE_FRAME_SIZE * FAKE_FRAME_SIZE;

        state.written.extend_from_slice(&data[..n]);
        state.frames_written = state
            .frames_written
            .wrapping_add((n / FAKE_FRAME_SIZE) as u32);
        let in_flight = state.frames_written.wrapping_sub(state.played);
        state.max_in_flight = state.max_in_flight.max(in_flight);
        Ok(n)
    }

    fn play_position(&self) -> u32 {
        self.state.lock().played
    }

    fn frame_count(&self) -> u32 {
        self.frames
    }

    fn frame_size(&self) -> usize {
        FAKE_FRAME_SIZE
    }

    fn sample_rate(&self) -> u32 {
        FAKE_SAMPLE_RATE
    }

    fn stop(&mut self) {
        self.state.lock().stopped = true;
        self.journal.lock().push("audio stop".to_string());
    }
}

/// Backend handing out fakes wired to one [`Recorder`]
pub struct FakeBackend {
    recorder: Recorder,
    pub input_slots: usize,
    pub output_slots: usize,
    pub audio_frames: u32,
}

impl FakeBackend {
    pub fn new(recorder: Recorder) -> Self {
        FakeBackend {
            recorder,
            input_slots: 4,
            output_slots: 16,
            audio_frames: 480,
        }
    }
}

impl MediaBackend for FakeBackend {
    fn create_decoder(
        &mut self,
        track: usize,
        _format: &MediaFormat,
        events: SessionHandle,
    ) -> Result<Box<dyn Decoder>, RenderError> {
        Ok(Box::new(FakeDecoder::new(
            track,
            events,
            self.recorder.clone(),
            self.input_slots,
            self.output_slots,
        )))
    }

    fn create_audio_sink(&mut self, _format: &MediaFormat) -> Result<Box<dyn AudioSink>, RenderError> {
        Ok(Box::new(FakeAudioSink::new(
            self.recorder.audio.clone(),
            self.recorder.journal.clone(),
            self.audio_frames,
        )))
    }
}

/// A recorder whose surface writes into its journal
pub fn recorder() -> Recorder {
    let journal = Journal::default();
    Recorder {
        surface: Arc::new(RecordingSurface::new(journal.clone())),
        journal,
        ..Default::default()
    }
}

/// SNTP server on 127.0.0.1 answering `requests` requests
///
/// The receive and transmit timestamps are the request's own transmit time
/// plus `receive_us` and `transmit_us`.
pub fn spawn_time_server(
    requests: usize,
    receive_us: i64,
    transmit_us: i64,
) -> io::Result<(SocketAddr, JoinHandle<io::Result<()>>)> {
    spawn_time_server_script(vec![Some((receive_us, transmit_us)); requests])
}

/// SNTP server on 127.0.0.1 following a per-request script
///
/// Each entry answers one request with receive and transmit offsets from the
/// request's transmit time. `None` reads the request and never answers it.
pub fn spawn_time_server_script(
    replies: Vec<Option<(i64, i64)>>,
) -> io::Result<(SocketAddr, JoinHandle<io::Result<()>>)> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    let addr = socket.local_addr()?;

    let handle = thread::spawn(move || {
        let mut buf = [0u8; NTP_PACKET_SIZE];
        for reply in replies {
            let (n, peer) = socket.recv_from(&mut buf)?;
            let Some((receive_us, transmit_us)) = reply else {
                continue;
            };
            let request = NtpPacket::from_bytes(&buf[..n])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let originate = request.transmit;
            let response = NtpPacket {
                leap: 0,
                version: request.version,
                mode: NTP_MODE_SERVER,
                stratum: 1,
                originate,
                receive: offset(originate, receive_us),
                transmit: offset(originate, transmit_us),
            };
            socket.send_to(&response.to_bytes(), peer)?;
        }
        Ok(())
    });

    Ok((addr, handle))
}

fn offset(ts: NtpTimestamp, us: i64) -> NtpTimestamp {
    ts + NtpDuration::from_micros(us)
}

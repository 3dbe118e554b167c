//! castsink decode and render core
//!
//! This crate drives external decoders and output devices for a two-track
//! (video + audio) stream: slot bookkeeping between demuxer and decoder,
//! non-blocking audio pacing, deadline-scheduled video presentation, and the
//! session actor that ties them together.

pub mod audio;
pub mod decoder;
pub mod error;
pub mod looper;
pub mod session;
pub mod video;

pub use audio::{AudioPacer, AudioSink};
pub use decoder::{
    AccessUnit, DecodePipeline, Decoder, MediaFormat, MediaKind, OutputReleaser, PendingOutput,
    SlotState, SlotTable,
};
pub use error::{DecoderError, RenderError};
pub use looper::TimerQueue;
pub use session::{
    MediaBackend, SessionHandle, SessionMessage, SessionStats, SinkSession, AUDIO_TRACK,
    DECODER_RETRY_DELAY, TRACK_COUNT, VIDEO_TRACK,
};
pub use video::{VideoScheduler, VideoSchedulerConfig, VideoSink};

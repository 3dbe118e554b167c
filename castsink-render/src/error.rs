//! Render-side errors

use std::io;
use thiserror::Error;

/// Errors reported by an external decoder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecoderError {
    /// Transient: the decoder cannot accept the request right now
    #[error("Decoder busy, try again later")]
    TryAgainLater,

    #[error("Decoder failure: {0}")]
    Failed(String),
}

/// Session and pipeline errors
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Decoder fault on track {track}: {source}")]
    DecoderFault {
        track: usize,
        #[source]
        source: DecoderError,
    },

    #[error("Slot misuse on track {track}, slot {slot}: {reason}")]
    SlotMisuse {
        track: usize,
        slot: usize,
        reason: &'static str,
    },

    #[error("Unknown track {0}")]
    UnknownTrack(usize),

    #[error("Track {0} has no format yet")]
    NotConfigured(usize),

    #[error("Track {0} is already configured")]
    AlreadyConfigured(usize),

    #[error("Audio sink error: {0}")]
    AudioSink(#[from] io::Error),

    #[error("Session mailbox closed")]
    MailboxClosed,
}

impl RenderError {
    pub(crate) fn decoder(track: usize, source: DecoderError) -> Self {
        RenderError::DecoderFault { track, source }
    }

    /// Whether the session must end
    ///
    /// Decoder faults, slot misuse and sink failures are fatal. A message
    /// naming an unknown or wrongly configured track is rejected on its own.
    pub fn is_fatal(&self) -> bool {
        match self {
            RenderError::DecoderFault { source, .. } => *source != DecoderError::TryAgainLater,
            RenderError::SlotMisuse { .. }
            | RenderError::AudioSink(_)
            | RenderError::MailboxClosed => true,
            RenderError::UnknownTrack(_)
            | RenderError::NotConfigured(_)
            | RenderError::AlreadyConfigured(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RenderError::decoder(0, DecoderError::Failed("boom".into())).is_fatal());
        assert!(!RenderError::decoder(0, DecoderError::TryAgainLater).is_fatal());
        assert!(RenderError::SlotMisuse {
            track: 1,
            slot: 3,
            reason: "double release",
        }
        .is_fatal());
        assert!(RenderError::AudioSink(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).is_fatal());
        assert!(!RenderError::UnknownTrack(7).is_fatal());
        assert!(!RenderError::NotConfigured(1).is_fatal());
        assert!(!RenderError::AlreadyConfigured(0).is_fatal());
    }
}

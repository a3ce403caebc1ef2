//! Error types for voice-engine.
//!
//! Errors are split into two categories:
//! - **Call errors** ([`VoiceAudioError`]): validation and I/O failures returned at the API
//!   boundary before anything is handed to the engine thread
//! - **Session events**: failures after a request was accepted are reported through the
//!   session's callback or synchronous completion (see [`crate::event`])

use std::path::PathBuf;

/// Errors returned by the client-facing API.
///
/// Every variant maps onto a stable numeric result code via [`VoiceAudioError::code`].
#[derive(Debug, thiserror::Error)]
pub enum VoiceAudioError {
    /// The object is not usable (closed, destroyed, or resource management unavailable).
    #[error("invalid object")]
    Object,

    /// An internal failure such as a thread launch or a dropped engine mailbox.
    #[error("internal error: {reason}")]
    Internal {
        /// What went wrong.
        reason: String,
    },

    /// The speaker is not available for this operation.
    #[error("speaker error: {reason}")]
    Output {
        /// What went wrong.
        reason: String,
    },

    /// The microphone is not available for this operation.
    #[error("microphone error: {reason}")]
    Input {
        /// What went wrong.
        reason: String,
    },

    /// The object is already open (or not open when it must be).
    #[error("invalid open state")]
    Open,

    /// A parameter is out of range.
    #[error("invalid parameters: {reason}")]
    Params {
        /// Which parameter was rejected.
        reason: String,
    },

    /// The operation is not allowed from the current session state.
    #[error("invalid state transition: {operation} not allowed in {state}")]
    State {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the session was in.
        state: String,
    },

    /// Unsupported container.
    #[error("invalid container: {container}")]
    Container {
        /// The rejected container.
        container: String,
    },

    /// Unsupported encoding.
    #[error("invalid encoding: {encoding}")]
    Encoding {
        /// The rejected encoding.
        encoding: String,
    },

    /// A file could not be opened.
    #[error("file open failed: {path}: {source}")]
    FileOpen {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Seeking within a file failed.
    #[error("file seek failed: {path}: {source}")]
    FileSeek {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A named fifo could not be opened.
    #[error("fifo open failed: {path}: {source}")]
    FifoOpen {
        /// Path to the fifo.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Fifo or pipe parameters (non-blocking mode) could not be applied.
    #[error("fifo control failed: {source}")]
    FifoControl {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The speaker device could not be opened.
    #[error("speaker open failed")]
    OutputOpen,

    /// The speaker volume could not be applied.
    #[error("speaker volume error: {reason}")]
    OutputVolume {
        /// What went wrong.
        reason: String,
    },

    /// The WAV header of a playback file is malformed or unsupported.
    #[error("invalid wave header: {reason}")]
    WaveHeader {
        /// What was wrong with the header.
        reason: String,
    },

    /// The required hardware resources have not been granted.
    #[error("resources have not been granted")]
    Resource,

    /// Invalid capture request.
    #[error("invalid capture: {reason}")]
    Capture {
        /// What went wrong.
        reason: String,
    },

    /// The microphone could not be opened by the HAL.
    #[error("microphone open failed")]
    MicOpen,
}

impl VoiceAudioError {
    /// Numeric result code of this error (OK is 0 and never an error).
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::Object => 1,
            Self::Internal { .. } => 2,
            Self::Output { .. } => 3,
            Self::Input { .. } => 4,
            Self::Open => 5,
            Self::Params { .. } => 6,
            Self::State { .. } => 7,
            Self::Container { .. } => 8,
            Self::Encoding { .. } => 9,
            Self::FileOpen { .. } => 10,
            Self::FileSeek { .. } => 11,
            Self::FifoOpen { .. } => 12,
            Self::FifoControl { .. } => 13,
            Self::OutputOpen => 14,
            Self::OutputVolume { .. } => 15,
            Self::WaveHeader { .. } => 16,
            Self::Resource => 17,
            Self::Capture { .. } => 18,
            Self::MicOpen => 19,
        }
    }

    pub(crate) fn params(reason: impl Into<String>) -> Self {
        Self::Params {
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub(crate) fn state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Self::State {
            operation,
            state: format!("{state:?}"),
        }
    }

    pub(crate) fn input(reason: impl Into<String>) -> Self {
        Self::Input {
            reason: reason.into(),
        }
    }

    pub(crate) fn output(reason: impl Into<String>) -> Self {
        Self::Output {
            reason: reason.into(),
        }
    }

    pub(crate) fn wave_header(reason: impl Into<String>) -> Self {
        Self::WaveHeader {
            reason: reason.into(),
        }
    }

    pub(crate) fn capture(reason: impl Into<String>) -> Self {
        Self::Capture {
            reason: reason.into(),
        }
    }
}

/// Errors raised by a [`RecordSink`](crate::sink::RecordSink) or playback source.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// A write operation failed.
    #[error("write failed: {reason}")]
    WriteFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// File I/O error.
    #[error("file error: {path}: {source}")]
    FileError {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A non-blocking pipe could not accept the frame right now.
    #[error("destination would block")]
    WouldBlock,

    /// The reader side of the destination went away.
    #[error("destination closed")]
    Closed,

    /// Custom error for user destinations.
    #[error("{0}")]
    Custom(String),
}

impl SinkError {
    /// Creates a custom sink error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Creates a write failed error with the given reason.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            reason: reason.into(),
        }
    }

    /// Creates a file error for the given path.
    pub fn file_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileError {
            path: path.into(),
            source,
        }
    }

    /// Maps an I/O error from a pipe write onto the sink taxonomy.
    pub(crate) fn from_pipe_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => Self::WouldBlock,
            std::io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::write_failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes_are_stable() {
        assert_eq!(VoiceAudioError::Object.code(), 1);
        assert_eq!(VoiceAudioError::params("x").code(), 6);
        assert_eq!(VoiceAudioError::state("record", "Idling").code(), 7);
        assert_eq!(VoiceAudioError::Resource.code(), 17);
        assert_eq!(VoiceAudioError::MicOpen.code(), 19);
    }

    #[test]
    fn test_state_error_display() {
        let err = VoiceAudioError::state("record_to_file", "Created");
        assert_eq!(
            err.to_string(),
            "invalid state transition: record_to_file not allowed in \"Created\""
        );
    }

    #[test]
    fn test_file_open_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = VoiceAudioError::FileOpen {
            path: "/tmp/out.wav".into(),
            source: io_err,
        };
        assert!(err.to_string().contains("/tmp/out.wav"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_sink_error_from_pipe_io() {
        let would_block = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert!(matches!(SinkError::from_pipe_io(would_block), SinkError::WouldBlock));
        let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert!(matches!(SinkError::from_pipe_io(broken), SinkError::Closed));
    }

    #[test]
    fn test_sink_error_custom() {
        let err = SinkError::custom("something went wrong");
        assert_eq!(err.to_string(), "something went wrong");
    }
}

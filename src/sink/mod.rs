//! Record and stream destinations.
//!
//! A [`RecordSink`] receives microphone bytes from the engine thread, already converted to
//! the session's delivered format. The crate provides four destinations:
//!
//! - [`FileSink`]: writes raw or WAV files, patching the header when the session ends
//! - [`MemorySink`]: fills a caller-provided [`MemoryBuffer`] until it is full
//! - [`PipeSink`]: writes to a non-blocking pipe or fifo; a full pipe is an overflow
//! - [`UserSink`]: hands every frame to a user callback

mod file;
mod memory;
mod pipe;
mod user;

pub use file::FileSink;
pub use memory::{MemoryBuffer, MemorySink};
pub use pipe::PipeSink;
pub use user::UserSink;

use async_trait::async_trait;

use crate::SinkError;

/// A destination for microphone data.
///
/// Sinks are owned by the engine thread for the lifetime of one record or stream
/// session and are written once per frame (or frame group).
///
/// # Implementation Notes
///
/// - `write` returns how many bytes the destination accepted; fewer than offered means
///   the destination is full and the session ends with
///   [`AudioInEvent::EndOfBuffer`](crate::AudioInEvent::EndOfBuffer)
/// - [`SinkError::WouldBlock`] drops the frame and reports
///   [`AudioInEvent::Overflow`](crate::AudioInEvent::Overflow); the session continues
/// - `finish` runs once when the session ends, however it ends
///
/// # Example
///
/// ```
/// use voice_engine::{RecordSink, SinkError};
/// use async_trait::async_trait;
///
/// struct CountingSink {
///     bytes: usize,
/// }
///
/// #[async_trait]
/// impl RecordSink for CountingSink {
///     fn name(&self) -> &str {
///         "counting"
///     }
///
///     async fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
///         self.bytes += data.len();
///         Ok(data.len())
///     }
/// }
/// ```
#[async_trait]
pub trait RecordSink: Send {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Writes one frame or frame group; returns the number of bytes accepted.
    async fn write(&mut self, data: &[u8]) -> Result<usize, SinkError>;

    /// Flushes and closes the destination.
    ///
    /// Default implementation does nothing.
    async fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

//! Non-blocking pipe destination.

use std::io;
use std::os::fd::OwnedFd;

use async_trait::async_trait;
use tokio::net::unix::pipe;

use crate::sink::RecordSink;
use crate::SinkError;

/// A sink that writes to a pipe or fifo without ever blocking the engine.
///
/// If the pipe cannot take any part of a frame the frame is dropped and the write fails
/// with [`SinkError::WouldBlock`]. When only part of a frame fits, the tail is kept and
/// sent ahead of the next frame so the stream never tears mid-sample.
///
/// Must be created from within the engine's runtime, since the pipe is registered with
/// its reactor.
pub struct PipeSink {
    name: String,
    sender: Option<pipe::Sender>,
    pending: Vec<u8>,
}

impl PipeSink {
    /// Wraps the write end of a pipe or fifo and switches it to non-blocking mode.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self::new(pipe::Sender::from_owned_fd(fd)?))
    }

    /// Wraps an already registered pipe sender.
    pub fn new(sender: pipe::Sender) -> Self {
        Self {
            name: "pipe".to_string(),
            sender: Some(sender),
            pending: Vec::new(),
        }
    }

    /// Sets a custom name for logging.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Writes as much of `data` as the pipe takes without blocking.
    fn try_write_all(sender: &pipe::Sender, data: &[u8]) -> Result<usize, SinkError> {
        let mut offset = 0;
        while offset < data.len() {
            match sender.try_write(&data[offset..]) {
                Ok(0) => return Err(SinkError::Closed),
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SinkError::from_pipe_io(e)),
            }
        }
        Ok(offset)
    }
}

#[async_trait]
impl RecordSink for PipeSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        let sender = self.sender.as_ref().ok_or(SinkError::Closed)?;

        if !self.pending.is_empty() {
            let sent = Self::try_write_all(sender, &self.pending)?;
            self.pending.drain(..sent);
            if !self.pending.is_empty() {
                return Err(SinkError::WouldBlock);
            }
        }

        let sent = Self::try_write_all(sender, data)?;
        if sent == 0 && !data.is_empty() {
            return Err(SinkError::WouldBlock);
        }
        self.pending.extend_from_slice(&data[sent..]);
        Ok(data.len())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(sender) = self.sender.take() {
            if !self.pending.is_empty() {
                let sent = Self::try_write_all(&sender, &self.pending).unwrap_or(0);
                if sent < self.pending.len() {
                    tracing::debug!(
                        sink = %self.name,
                        dropped = self.pending.len() - sent,
                        "pipe closed with unsent bytes"
                    );
                }
                self.pending.clear();
            }
        }
        Ok(())
    }
}

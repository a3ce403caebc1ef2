//! Fixed-capacity memory destination.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::sink::RecordSink;
use crate::SinkError;

/// A caller-owned buffer that a [`MemorySink`] fills.
///
/// Cloning yields another handle to the same storage, so the caller can keep one handle and
/// read the recording back while (or after) the engine writes.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    data: Arc<Mutex<Vec<u8>>>,
    capacity: usize,
}

impl MemoryBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::with_capacity(capacity))),
            capacity,
        }
    }

    /// Maximum bytes the buffer accepts.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out the recorded bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Recorded bytes as 16-bit little-endian samples.
    pub fn samples(&self) -> Vec<i16> {
        crate::format::convert::le_bytes_to_i16(&self.data.lock())
    }
}

/// A sink that appends to a [`MemoryBuffer`] until it is full.
///
/// A write that does not fit completely is truncated to the remaining space; the engine
/// then ends the session with `EndOfBuffer`.
pub struct MemorySink {
    buffer: MemoryBuffer,
}

impl MemorySink {
    /// Creates a sink writing into `buffer`.
    pub fn new(buffer: MemoryBuffer) -> Self {
        Self { buffer }
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        let mut stored = self.buffer.data.lock();
        let room = self.buffer.capacity.saturating_sub(stored.len());
        let accepted = data.len().min(room);
        stored.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fills_until_capacity() {
        let buffer = MemoryBuffer::with_capacity(1000);
        let mut sink = MemorySink::new(buffer.clone());

        assert_eq!(sink.write(&[1u8; 640]).await.unwrap(), 640);
        assert_eq!(sink.write(&[2u8; 640]).await.unwrap(), 360);
        assert_eq!(sink.write(&[3u8; 640]).await.unwrap(), 0);

        assert_eq!(buffer.len(), 1000);
        let data = buffer.to_vec();
        assert_eq!(data[639], 1);
        assert_eq!(data[640], 2);
    }

    #[test]
    fn test_samples_view() {
        let buffer = MemoryBuffer::with_capacity(4);
        buffer.data.lock().extend_from_slice(&[0x01, 0x00, 0xff, 0xff]);
        assert_eq!(buffer.samples(), vec![1, -1]);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.capacity(), 4);
    }
}

//! User callback destination.

use async_trait::async_trait;

use crate::device::InputDevices;
use crate::event::AudioInDataCallback;
use crate::sink::RecordSink;
use crate::SinkError;

/// A sink that hands every frame to a user callback on the engine thread.
///
/// The callback must return quickly; it runs inside the frame tick.
pub struct UserSink {
    source: InputDevices,
    callback: AudioInDataCallback,
}

impl UserSink {
    /// Creates a sink reporting frames of `source` to `callback`.
    pub fn new(source: InputDevices, callback: AudioInDataCallback) -> Self {
        Self { source, callback }
    }
}

#[async_trait]
impl RecordSink for UserSink {
    fn name(&self) -> &str {
        "user"
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        (self.callback)(self.source, data);
        Ok(data.len())
    }
}

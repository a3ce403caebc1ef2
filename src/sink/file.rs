//! Raw and WAV file destination.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::format::{wav, Container, InputFormat};
use crate::sink::RecordSink;
use crate::{SinkError, VoiceAudioError};

/// A sink that writes microphone data to a file.
///
/// With [`Container::Wav`] the file starts with a zeroed header placeholder, and the real
/// header (with the final data length) is written by [`finish`](RecordSink::finish).
///
/// # Example
///
/// ```no_run
/// use voice_engine::FileSink;
/// use voice_engine::format::{Container, InputFormat};
///
/// let format = InputFormat { container: Container::Wav, ..InputFormat::default() };
/// let sink = FileSink::create("utterance.wav", format)?;
/// # Ok::<(), voice_engine::VoiceAudioError>(())
/// ```
pub struct FileSink {
    name: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    format: InputFormat,
    bytes_written: u64,
}

impl FileSink {
    /// Creates (or truncates) the file and writes the WAV placeholder if needed.
    pub fn create(path: impl AsRef<Path>, format: InputFormat) -> Result<Self, VoiceAudioError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| VoiceAudioError::FileOpen {
            path: path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        if format.container == Container::Wav {
            wav::write_placeholder(&mut writer).map_err(|source| VoiceAudioError::FileOpen {
                path: path.clone(),
                source,
            })?;
        }

        Ok(Self {
            name: format!("file:{}", path.display()),
            path,
            writer: Some(writer),
            format,
            bytes_written: 0,
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of audio written so far (excluding the header).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[async_trait]
impl RecordSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        writer
            .write_all(data)
            .map_err(|e| SinkError::file_error(&self.path, e))?;
        self.bytes_written += data.len() as u64;
        Ok(data.len())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        if self.format.container == Container::Wav {
            let data_size = u32::try_from(self.bytes_written).unwrap_or(u32::MAX);
            wav::finalize(
                &mut writer,
                u16::from(self.format.channel_qty),
                self.format.sample_rate,
                self.format.sample_size,
                data_size,
            )
            .map_err(|e| SinkError::file_error(&self.path, e))?;
        }
        writer
            .flush()
            .map_err(|e| SinkError::file_error(&self.path, e))?;
        tracing::debug!(path = %self.path.display(), bytes = self.bytes_written, "file sink closed");
        Ok(())
    }
}

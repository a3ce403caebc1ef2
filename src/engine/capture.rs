//! Diagnostic capture of pipeline stages to disk.
//!
//! Two mechanisms share the same file writer:
//!
//! - A client-requested capture session writes one file per selected stage (microphone
//!   input, keyword detector input, end-of-speech input, keyword chunk, delivered output)
//! - Rolling internal capture records every record/stream session into
//!   `voice_capture_NNNNN[_id].wav`, keeping at most `file_qty_max` files

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::InternalCaptureConfig;
use crate::format::{convert, wav, CaptureKind, Container, INPUT_SAMPLE_RATE};
use crate::frame::MicFrame;

const INTERNAL_PREFIX: &str = "voice_capture_";

/// One capture file.
pub(crate) struct CapturePoint {
    path: PathBuf,
    writer: BufWriter<File>,
    container: Container,
    channels: u16,
    bytes: u64,
    limit: Option<u64>,
}

impl CapturePoint {
    pub(crate) fn create(path: PathBuf, container: Container, channels: u16) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(&path)?);
        if container == Container::Wav {
            wav::write_placeholder(&mut writer)?;
        }
        Ok(Self {
            path,
            writer,
            container,
            channels,
            bytes: 0,
            limit: None,
        })
    }

    #[must_use]
    pub(crate) fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Appends samples; returns `false` once the size limit is reached.
    pub(crate) fn write(&mut self, samples: &[i16]) -> io::Result<bool> {
        let mut bytes = convert::i16_to_le_bytes(samples);
        if let Some(limit) = self.limit {
            let room = limit.saturating_sub(self.bytes) as usize;
            bytes.truncate(room);
        }
        self.writer.write_all(&bytes)?;
        self.bytes += bytes.len() as u64;
        Ok(self.limit.map_or(true, |limit| self.bytes < limit))
    }

    pub(crate) fn finish(mut self) -> io::Result<PathBuf> {
        if self.container == Container::Wav {
            let data_size = u32::try_from(self.bytes).unwrap_or(u32::MAX);
            wav::finalize(&mut self.writer, self.channels, INPUT_SAMPLE_RATE, 2, data_size)?;
        }
        self.writer.flush()?;
        Ok(self.path)
    }
}

fn extension(container: Container) -> &'static str {
    if container == Container::Wav {
        "wav"
    } else {
        "pcm"
    }
}

/// A client-requested diagnostic capture.
pub(crate) struct CaptureSession {
    kind: CaptureKind,
    container: Container,
    prefix: PathBuf,
    input: Option<CapturePoint>,
    kwd: Vec<CapturePoint>,
    eos: Option<CapturePoint>,
    output: Option<CapturePoint>,
}

impl CaptureSession {
    /// Opens one file per selected stage next to `prefix` (`<prefix>_input.wav`, ...).
    pub(crate) fn start(
        kind: CaptureKind,
        container: Container,
        prefix: &Path,
        chan_qty: usize,
    ) -> io::Result<Self> {
        let file = |stage: &str| {
            let mut name = prefix.as_os_str().to_owned();
            name.push(format!("_{stage}.{}", extension(container)));
            PathBuf::from(name)
        };

        let input_channels = if kind.contains(CaptureKind::INPUT_ALL) {
            chan_qty as u16
        } else {
            1
        };
        let input = Some(CapturePoint::create(file("input"), container, input_channels)?);
        let kwd = if kind.contains(CaptureKind::KWD) {
            (0..chan_qty)
                .map(|chan| CapturePoint::create(file(&format!("kwd_{chan}")), container, 1))
                .collect::<io::Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        let eos = if kind.contains(CaptureKind::EOS) {
            Some(CapturePoint::create(file("eos"), container, 1)?)
        } else {
            None
        };
        let output = if kind.contains(CaptureKind::OUTPUT) {
            Some(CapturePoint::create(file("output"), container, 1)?)
        } else {
            None
        };

        tracing::info!(prefix = %prefix.display(), ?kind, "capture session started");
        Ok(Self {
            kind,
            container,
            prefix: prefix.to_path_buf(),
            input,
            kwd,
            eos,
            output,
        })
    }

    /// Records the unprocessed microphone frame and the detector inputs.
    pub(crate) fn on_frame(&mut self, frame: &MicFrame, active_chan: usize) -> io::Result<()> {
        if let Some(point) = self.input.as_mut() {
            if self.kind.contains(CaptureKind::INPUT_ALL) {
                let chans: Vec<&[i16]> = frame.chans_i16.iter().map(Vec::as_slice).collect();
                let interleaved = convert::le_bytes_to_i16(&convert::pack_i16(&chans));
                point.write(&interleaved)?;
            } else if let Some(chan) = frame.chans_i16.get(active_chan) {
                point.write(chan)?;
            }
        }
        for (point, chan) in self.kwd.iter_mut().zip(&frame.chans_i16) {
            point.write(chan)?;
        }
        if let (Some(point), Some(chan)) = (self.eos.as_mut(), frame.chans_i16.get(active_chan)) {
            point.write(chan)?;
        }
        Ok(())
    }

    /// Records bytes delivered to a destination.
    pub(crate) fn on_output(&mut self, samples: &[i16]) -> io::Result<()> {
        if let Some(point) = self.output.as_mut() {
            point.write(samples)?;
        }
        Ok(())
    }

    /// Writes the keyword chunk measured by dynamic gain to its own file.
    pub(crate) fn on_keyword(&self, samples: &[i16]) -> io::Result<()> {
        if !self.kind.contains(CaptureKind::DGA) || samples.is_empty() {
            return Ok(());
        }
        let mut name = self.prefix.as_os_str().to_owned();
        name.push(format!("_keyword.{}", extension(self.container)));
        let mut point = CapturePoint::create(PathBuf::from(name), self.container, 1)?;
        point.write(samples)?;
        point.finish()?;
        Ok(())
    }

    pub(crate) fn finish(self) -> io::Result<()> {
        let points = self
            .input
            .into_iter()
            .chain(self.kwd)
            .chain(self.eos)
            .chain(self.output);
        for point in points {
            let path = point.finish()?;
            tracing::debug!(path = %path.display(), "capture file closed");
        }
        Ok(())
    }
}

/// Rolling capture of every record session.
pub(crate) struct InternalCapture {
    config: InternalCaptureConfig,
    counter: u32,
    active: Option<CapturePoint>,
}

impl InternalCapture {
    pub(crate) fn new(config: InternalCaptureConfig) -> Self {
        Self {
            config,
            counter: 0,
            active: None,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.config.enable
    }

    /// Starts a new capture file, deleting the oldest ones beyond the configured quantity.
    pub(crate) fn begin(&mut self, stream_id: Option<&str>) -> io::Result<()> {
        if !self.config.enable {
            return Ok(());
        }
        self.end()?;

        let mut existing = list_capture_files(&self.config.dir_path)?;
        if self.counter == 0 {
            self.counter = existing
                .iter()
                .filter_map(|path| capture_index(path))
                .max()
                .map_or(0, |index| index + 1);
        }
        let keep = self.config.file_qty_max.saturating_sub(1) as usize;
        while existing.len() > keep {
            let oldest = existing.remove(0);
            fs::remove_file(&oldest)?;
            tracing::debug!(path = %oldest.display(), "internal capture file rotated out");
        }

        let name = match stream_id {
            Some(id) => format!("{INTERNAL_PREFIX}{:05}_{id}.wav", self.counter),
            None => format!("{INTERNAL_PREFIX}{:05}.wav", self.counter),
        };
        self.counter += 1;
        let point = CapturePoint::create(self.config.dir_path.join(name), Container::Wav, 1)?
            .with_limit(u64::from(self.config.file_size_max));
        self.active = Some(point);
        Ok(())
    }

    pub(crate) fn write(&mut self, samples: &[i16]) -> io::Result<()> {
        if let Some(point) = self.active.as_mut() {
            if !point.write(samples)? {
                tracing::debug!("internal capture file size limit reached");
                self.end()?;
            }
        }
        Ok(())
    }

    pub(crate) fn end(&mut self) -> io::Result<()> {
        if let Some(point) = self.active.take() {
            point.finish()?;
        }
        Ok(())
    }
}

fn capture_index(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix(INTERNAL_PREFIX)?.get(..5)?;
    digits.parse().ok()
}

/// Internal capture files in `dir`, oldest first.
fn list_capture_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| capture_index(path).is_some())
        .collect();
    files.sort();
    Ok(files)
}

/// Deletes every internal capture file in `dir`; returns how many were removed.
pub fn internal_capture_delete_files(dir: impl AsRef<Path>) -> io::Result<usize> {
    let files = list_capture_files(dir.as_ref())?;
    for path in &files {
        fs::remove_file(path)?;
    }
    Ok(files.len())
}

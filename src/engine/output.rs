//! Speaker side of the engine.

use std::fs::File;
use std::io::{self, Read};
use std::time::Duration;

use tokio::net::unix::pipe;
use tokio::sync::oneshot;

use crate::config::OutputConfig;
use crate::dsp::DspSuite;
use crate::engine::mailbox::{PlayRequest, PlaySource};
use crate::engine::volume::VolumeState;
use crate::engine::write_intensity;
use crate::event::{AudioOutCallback, AudioOutDataCallback, AudioOutEvent, StatisticsMask};
use crate::format::{convert, OutputFormat};
use crate::hal::HalOutput;
use crate::VoiceAudioError;

/// Frames written back to back when playback starts so the speaker never starves on the
/// first tick.
const PRIME_FRAME_QTY: usize = 2;

enum Source {
    File { reader: File, remaining: u64 },
    Memory { data: Vec<u8>, pos: usize },
    /// `carry` holds the odd trailing byte of the previous read.
    Pipe { receiver: pipe::Receiver, carry: Option<u8> },
    User(AudioOutDataCallback),
}

/// What a source produced for one frame.
enum Fill {
    /// A frame (padded with silence when short); `last` ends playback after it.
    Frame { last: bool },
    /// No data was ready; the frame is silence.
    Underflow,
    Eof,
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Source {
    fn open(source: PlaySource) -> io::Result<Self> {
        Ok(match source {
            PlaySource::File { reader, remaining } => Self::File { reader, remaining },
            PlaySource::Memory(data) => Self::Memory { data, pos: 0 },
            PlaySource::Pipe(fd) => Self::Pipe {
                receiver: pipe::Receiver::from_owned_fd(fd)?,
                carry: None,
            },
            PlaySource::User(callback) => Self::User(callback),
        })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::Memory { .. } => "memory",
            Self::Pipe { .. } => "pipe",
            Self::User(_) => "user",
        }
    }

    /// Fills `samples` with the next frame. `samples` arrives zeroed.
    fn fill(&mut self, samples: &mut [i16]) -> io::Result<Fill> {
        let want = samples.len() * 2;
        match self {
            Self::File { reader, remaining } => {
                let take = want.min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let mut bytes = vec![0u8; take];
                let n = read_full(reader, &mut bytes)?;
                *remaining -= n as u64;
                if n == 0 {
                    return Ok(Fill::Eof);
                }
                decode_into(&bytes[..n], samples);
                Ok(Fill::Frame { last: n < want })
            }
            Self::Memory { data, pos } => {
                let n = want.min(data.len() - *pos);
                if n == 0 {
                    return Ok(Fill::Eof);
                }
                decode_into(&data[*pos..*pos + n], samples);
                *pos += n;
                Ok(Fill::Frame { last: *pos == data.len() })
            }
            Self::Pipe { receiver, carry } => {
                let mut bytes = vec![0u8; want];
                let start = usize::from(carry.is_some());
                if let Some(byte) = *carry {
                    bytes[0] = byte;
                }
                match receiver.try_read(&mut bytes[start..]) {
                    Ok(0) => Ok(Fill::Eof),
                    Ok(n) => {
                        let total = start + n;
                        let even = total & !1;
                        *carry = (total != even).then(|| bytes[even]);
                        decode_into(&bytes[..even], samples);
                        Ok(Fill::Frame { last: false })
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Fill::Underflow),
                    Err(e) => Err(e),
                }
            }
            Self::User(callback) => {
                let n = callback(samples);
                if n == 0 {
                    Ok(Fill::Eof)
                } else {
                    let len = samples.len();
                    samples[n.min(len)..].fill(0);
                    Ok(Fill::Frame { last: false })
                }
            }
        }
    }
}

fn decode_into(bytes: &[u8], samples: &mut [i16]) {
    for (sample, chunk) in samples.iter_mut().zip(bytes.chunks_exact(2)) {
        *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
    }
}

struct PlaySession {
    source: Source,
    callback: Option<AudioOutCallback>,
    done: Option<oneshot::Sender<AudioOutEvent>>,
    first_frame: bool,
}

impl PlaySession {
    fn emit(&self, event: AudioOutEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }

    /// Delivers the terminal event to whoever waits for it.
    fn finish(mut self, event: AudioOutEvent) {
        if let Some(done) = self.done.take() {
            let _ = done.send(event);
        } else {
            self.emit(event);
        }
    }
}

#[derive(Debug, Default)]
struct OutputCounters {
    frames: u64,
    underflows: u64,
    write_errors: u64,
    sessions: u64,
    ticks_late: u64,
    late_max: Duration,
}

pub(crate) struct OutputEngine {
    hal: Option<Box<dyn HalOutput>>,
    format: OutputFormat,
    hal_volume_control: bool,
    volume: VolumeState,
    session: Option<PlaySession>,
    paused: bool,
    intensity: Option<File>,
    counters: OutputCounters,
}

impl OutputEngine {
    pub(crate) fn new(config: &OutputConfig) -> Self {
        Self {
            hal: None,
            format: OutputFormat::default(),
            hal_volume_control: false,
            volume: VolumeState::new(config),
            session: None,
            paused: false,
            intensity: None,
            counters: OutputCounters::default(),
        }
    }

    /// True while frames must be produced every period.
    pub(crate) fn is_playing(&self) -> bool {
        self.hal.is_some() && self.session.is_some() && !self.paused
    }

    pub(crate) fn idle_start(&mut self, output: Box<dyn HalOutput>, format: OutputFormat, hal_volume_control: bool) {
        tracing::info!(?format, hal_volume_control, latency_us = output.latency_us(), "speaker idle");
        self.hal = Some(output);
        self.format = format;
        self.hal_volume_control = hal_volume_control;
    }

    pub(crate) fn idle_stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.finish(AudioOutEvent::Ok);
        }
        self.paused = false;
        self.hal = None;
        tracing::info!("speaker released");
    }

    /// Accepts a playback request and primes the speaker.
    pub(crate) fn play_start(&mut self, request: PlayRequest, dsp: &mut DspSuite) {
        let PlayRequest {
            source,
            callback,
            done,
            accepted,
        } = request;
        if self.hal.is_none() {
            let _ = accepted.send(Err(VoiceAudioError::output("speaker is not open")));
            return;
        }
        if self.session.is_some() {
            let _ = accepted.send(Err(VoiceAudioError::state("play_start", "playing")));
            return;
        }
        let source = match Source::open(source) {
            Ok(source) => source,
            Err(source) => {
                let _ = accepted.send(Err(VoiceAudioError::FifoControl { source }));
                return;
            }
        };
        tracing::info!(source = source.name(), sync = done.is_some(), "playback started");
        self.counters.sessions += 1;
        self.paused = false;
        self.session = Some(PlaySession {
            source,
            callback,
            done,
            first_frame: true,
        });
        let _ = accepted.send(Ok(()));

        for _ in 0..PRIME_FRAME_QTY {
            if !self.tick(dsp) {
                break;
            }
        }
    }

    /// Plays one frame. Returns `false` once playback is over.
    pub(crate) fn tick(&mut self, dsp: &mut DspSuite) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let mut samples = vec![0i16; self.format.frame_sample_qty()];
        let last = match session.source.fill(&mut samples) {
            Ok(Fill::Frame { last }) => last,
            Ok(Fill::Underflow) => {
                self.counters.underflows += 1;
                session.emit(AudioOutEvent::Underflow);
                false
            }
            Ok(Fill::Eof) => {
                self.end(AudioOutEvent::Eof);
                return false;
            }
            Err(e) => {
                tracing::error!(error = %e, "playback source read failed");
                self.end(AudioOutEvent::Error);
                return false;
            }
        };

        if let Err(e) = self.write_hal(&mut samples, dsp) {
            tracing::error!(error = %e, "speaker write failed");
            self.counters.write_errors += 1;
            self.end(AudioOutEvent::Error);
            return false;
        }
        if let Some(session) = self.session.as_mut() {
            if session.first_frame {
                session.first_frame = false;
                session.emit(AudioOutEvent::FirstFrame);
            }
        }
        if last {
            self.end(AudioOutEvent::Eof);
            return false;
        }
        true
    }

    fn write_hal(&mut self, samples: &mut [i16], dsp: &mut DspSuite) -> io::Result<()> {
        let Some(hal) = self.hal.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "speaker closed"));
        };
        if self.intensity.is_some() {
            write_intensity(&mut self.intensity, convert::peak_level(samples), 0);
        }
        self.volume
            .apply(samples, dsp.volume.as_mut(), hal.as_mut(), self.hal_volume_control);
        let written = hal.write(samples)?;
        if written < samples.len() {
            tracing::warn!(written, expected = samples.len(), "short speaker write");
        }
        self.counters.frames += 1;
        Ok(())
    }

    fn end(&mut self, event: AudioOutEvent) {
        if let Some(session) = self.session.take() {
            tracing::info!(?event, "playback ended");
            session.finish(event);
        }
        self.paused = false;
    }

    pub(crate) fn pause(&mut self) {
        if self.session.is_some() {
            self.paused = true;
            tracing::debug!("playback paused");
        }
    }

    pub(crate) fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            tracing::debug!("playback resumed");
        }
    }

    pub(crate) fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::info!("playback stopped");
            if let Some(done) = session.done {
                let _ = done.send(AudioOutEvent::Ok);
            }
        }
        self.paused = false;
    }

    pub(crate) fn volume_set(&mut self, step: i8, ramp: bool, bumper: bool) {
        self.volume.set(step, ramp, bumper);
        if self.hal_volume_control {
            if let Some(hal) = self.hal.as_mut() {
                if !hal.volume_set(step, step) {
                    tracing::warn!(step, "hardware refused volume step");
                }
            }
        }
    }

    pub(crate) fn volume_config(&mut self, max: i8, min: i8, step_db: f32, use_ext_gain: bool) {
        self.volume.configure(max, min, step_db, use_ext_gain);
        tracing::debug!(max, min, step_db, use_ext_gain, "volume configured");
    }

    pub(crate) fn set_intensity_fifo(&mut self, fifo: Option<File>) {
        self.intensity = fifo;
    }

    pub(crate) fn note_lateness(&mut self, late: Duration) {
        self.counters.ticks_late += 1;
        self.counters.late_max = self.counters.late_max.max(late);
    }

    pub(crate) fn statistics_clear(&mut self, mask: StatisticsMask) {
        if mask.contains(StatisticsMask::OUTPUT_GENERAL) {
            self.counters = OutputCounters {
                ticks_late: self.counters.ticks_late,
                late_max: self.counters.late_max,
                ..OutputCounters::default()
            };
        }
        if mask.contains(StatisticsMask::OUTPUT_TIMING) {
            self.counters.ticks_late = 0;
            self.counters.late_max = Duration::ZERO;
        }
    }

    pub(crate) fn statistics_print(&self, mask: StatisticsMask) {
        let c = &self.counters;
        if mask.contains(StatisticsMask::OUTPUT_GENERAL) {
            tracing::info!(
                frames = c.frames,
                underflows = c.underflows,
                write_errors = c.write_errors,
                sessions = c.sessions,
                volume = self.volume.current(),
                "output statistics"
            );
        }
        if mask.contains(StatisticsMask::OUTPUT_TIMING) {
            tracing::info!(
                ticks_late = c.ticks_late,
                late_max_us = c.late_max.as_micros() as u64,
                "output timing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::device::{OutputDevices, ResourceId};
    use crate::event::audio_out_callback;
    use crate::hal::{Hal, MockHal, OutputOpenParams};

    fn engine(hal: &mut MockHal) -> OutputEngine {
        let mut engine = OutputEngine::new(&OutputConfig::default());
        let output = hal
            .output_open(&OutputOpenParams {
                device: OutputDevices::NORMAL,
                resource: ResourceId::new(0).unwrap(),
                user_id: 0,
                format: OutputFormat::default(),
            })
            .unwrap();
        engine.idle_start(output, OutputFormat::default(), false);
        engine
    }

    fn request(
        source: PlaySource,
        callback: Option<AudioOutCallback>,
    ) -> (PlayRequest, oneshot::Receiver<Result<(), VoiceAudioError>>, oneshot::Receiver<AudioOutEvent>) {
        let (accepted, accepted_rx) = oneshot::channel();
        let (done, done_rx) = oneshot::channel();
        let sync = callback.is_none();
        let request = PlayRequest {
            source,
            callback,
            done: sync.then_some(done),
            accepted,
        };
        (request, accepted_rx, done_rx)
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        convert::i16_to_le_bytes(samples)
    }

    #[test]
    fn test_memory_playback_pads_last_frame() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let mut engine = engine(&mut hal);

        let (request, mut accepted, mut done) = request(PlaySource::Memory(pcm(&[7i16; 800])), None);
        engine.play_start(request, &mut dsp);
        accepted.try_recv().unwrap().unwrap();
        // Primed with two frames.
        assert_eq!(hal.speaker_samples().len(), 640);
        assert!(engine.is_playing());

        assert!(!engine.tick(&mut dsp));
        assert_eq!(done.try_recv().unwrap(), AudioOutEvent::Eof);
        let played = hal.speaker_samples();
        assert_eq!(played.len(), 960);
        assert_eq!(played[799], 7);
        assert_eq!(played[800], 0);
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_user_source_events() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let mut engine = engine(&mut hal);

        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let mut calls = 0;
        let source = PlaySource::User(Box::new(move |samples: &mut [i16]| {
            calls += 1;
            if calls > 3 {
                return 0;
            }
            samples.fill(100);
            samples.len()
        }));
        let (request, _accepted, _done) =
            request(source, Some(audio_out_callback(move |event| seen.lock().push(event))));
        engine.play_start(request, &mut dsp);
        while engine.tick(&mut dsp) {}

        assert_eq!(*events.lock(), vec![AudioOutEvent::FirstFrame, AudioOutEvent::Eof]);
        assert_eq!(hal.speaker_samples().len(), 960);
    }

    #[tokio::test]
    async fn test_empty_pipe_underflows_with_silence() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let mut engine = engine(&mut hal);

        let (tx, rx) = pipe::pipe().unwrap();
        let fd = rx.into_blocking_fd().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let (request, _accepted, _done) = request(
            PlaySource::Pipe(fd),
            Some(audio_out_callback(move |event| seen.lock().push(event))),
        );
        engine.play_start(request, &mut dsp);
        assert!(events.lock().contains(&AudioOutEvent::Underflow));
        assert!(hal.speaker_samples().iter().all(|&s| s == 0));

        drop(tx);
        // Let the reactor observe the hang-up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!engine.tick(&mut dsp));
        assert_eq!(events.lock().last(), Some(&AudioOutEvent::Eof));
    }

    #[tokio::test]
    async fn test_pipe_keeps_odd_byte_for_next_read() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let mut engine = engine(&mut hal);

        let (tx, rx) = pipe::pipe().unwrap();
        let fd = rx.into_blocking_fd().unwrap();
        let (request, _accepted, _done) = request(PlaySource::Pipe(fd), Some(audio_out_callback(|_| {})));
        engine.play_start(request, &mut dsp);
        // Primed with silence while the pipe is empty.
        assert_eq!(hal.speaker_samples().len(), 640);

        // 10000 followed by the low byte of 30000.
        tx.writable().await.unwrap();
        tx.try_write(&[0x10, 0x27, 0x30]).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.tick(&mut dsp));
        assert_eq!(&hal.speaker_samples()[640..642], &[10_000, 0]);

        // High byte of 30000, then 20000.
        tx.writable().await.unwrap();
        tx.try_write(&[0x75, 0x20, 0x4e]).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.tick(&mut dsp));
        assert_eq!(&hal.speaker_samples()[960..963], &[30_000, 20_000, 0]);
    }

    #[test]
    fn test_pause_resume_and_stop() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let mut engine = engine(&mut hal);

        let (request, _accepted, mut done) = request(PlaySource::Memory(pcm(&[1i16; 32_000])), None);
        engine.play_start(request, &mut dsp);
        engine.pause();
        assert!(!engine.is_playing());
        engine.resume();
        assert!(engine.is_playing());
        engine.stop();
        assert_eq!(done.try_recv().unwrap(), AudioOutEvent::Ok);
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_second_playback_rejected() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let mut engine = engine(&mut hal);

        let (first, _a, _d) = request(PlaySource::Memory(pcm(&[1i16; 32_000])), None);
        engine.play_start(first, &mut dsp);
        let (second, mut accepted, _d2) = request(PlaySource::Memory(pcm(&[1i16; 320])), None);
        engine.play_start(second, &mut dsp);
        assert_eq!(accepted.try_recv().unwrap().unwrap_err().code(), 7);
    }

    #[test]
    fn test_volume_applied_to_samples() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let mut engine = engine(&mut hal);
        engine.volume_set(-3, false, false);

        let (request, _accepted, _done) = request(PlaySource::Memory(pcm(&[10_000i16; 320])), None);
        engine.play_start(request, &mut dsp);
        let played = hal.speaker_samples();
        assert!((i32::from(played[0]) - 5011).abs() <= 2);
    }
}

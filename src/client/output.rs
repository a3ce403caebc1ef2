//! Speaker side of the object: playback sources, pause/resume and volume.

use std::fs::File;
use std::io::Cursor;
use std::os::fd::OwnedFd;
use std::path::Path;

use tokio::sync::oneshot;

use super::input::log_failure;
use super::{check_intensity_name, VoiceAudio};
use crate::config::OutputConfig;
use crate::device::{OutputCaps, OutputDevices};
use crate::engine::mailbox::{EngineMessage, IntensityTarget, Mailbox, PlayRequest, PlaySource};
use crate::engine::volume::{clamp_step, VOLUME_NOMINAL};
use crate::error::VoiceAudioError;
use crate::event::{AudioOutCallback, AudioOutDataCallback, AudioOutEvent};
use crate::format::wav::{self, WavInfo, WavParseError};
use crate::format::{Container, Encoding, OutputFormat};
use crate::hal::OutputOpenParams;

/// Speaker session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// The speaker is not open.
    Created,
    /// Open, nothing playing.
    Idling,
    /// A playback runs.
    Playing,
    /// A playback is paused.
    Paused,
}

/// Volume as requested by the client; the engine ramps towards `step`.
#[derive(Debug, Clone, Copy)]
pub(super) struct VolumeSettings {
    pub(super) step: i8,
    pub(super) ramp: bool,
    pub(super) max: i8,
    pub(super) min: i8,
    pub(super) step_db: f32,
    pub(super) use_ext_gain: bool,
}

pub(super) struct OutputSide {
    devices: OutputDevices,
    state: OutputState,
    pub(super) volume: VolumeSettings,
    pub(super) intensity_name: Option<String>,
}

impl OutputSide {
    pub(super) fn new(config: &OutputConfig) -> Self {
        Self {
            devices: OutputDevices::NONE,
            state: OutputState::Created,
            volume: VolumeSettings {
                step: VOLUME_NOMINAL,
                ramp: config.ramp_enabled,
                max: config.volume_max,
                min: config.volume_min,
                step_db: config.volume_step_db,
                use_ext_gain: config.use_ext_gain,
            },
            intensity_name: None,
        }
    }

    pub(super) fn opened(&mut self, devices: OutputDevices) {
        self.devices = devices;
        self.state = if devices.is_none() {
            OutputState::Created
        } else {
            OutputState::Idling
        };
    }
}

fn wave_header_error(e: WavParseError) -> VoiceAudioError {
    VoiceAudioError::wave_header(e.to_string())
}

fn wav_format(info: &WavInfo) -> OutputFormat {
    OutputFormat {
        container: Container::Wav,
        encoding: Encoding::Pcm,
        sample_rate: info.sample_rate,
        sample_size: (info.bits_per_sample / 8) as u8,
        channel_qty: info.channel_qty as u8,
    }
}

fn check_supported(format: &OutputFormat) -> Result<(), VoiceAudioError> {
    if format.is_supported() {
        Ok(())
    } else {
        tracing::error!(?format, "unsupported playback format");
        Err(VoiceAudioError::params(format!(
            "playback format {:?} {} Hz {}-bit {} ch",
            format.encoding,
            format.sample_rate,
            u32::from(format.sample_size) * 8,
            format.channel_qty
        )))
    }
}

/// Pipes and user callbacks carry raw PCM only.
fn check_raw_pcm(format: &OutputFormat) -> Result<(), VoiceAudioError> {
    if format.container != Container::None || format.encoding != Encoding::Pcm {
        return Err(VoiceAudioError::Container {
            container: format!("{:?}/{:?}", format.container, format.encoding),
        });
    }
    check_supported(format)
}

impl VoiceAudio {
    /// Speaker session state.
    pub fn play_state(&self) -> OutputState {
        self.output.state
    }

    fn output_mailbox(&self, operation: &'static str) -> Result<Mailbox, VoiceAudioError> {
        let mailbox = self.mailbox(operation)?.clone();
        if self.output.devices.is_none() {
            tracing::error!(operation, "speaker not opened");
            return Err(VoiceAudioError::output("speaker not opened"));
        }
        Ok(mailbox)
    }

    fn play_check(&self, operation: &'static str) -> Result<(), VoiceAudioError> {
        let state = self.output.state;
        if state != OutputState::Idling {
            tracing::error!(operation, ?state, "playback in progress");
            return Err(VoiceAudioError::state(operation, state));
        }
        Ok(())
    }

    async fn play_dispatch(
        &mut self,
        mailbox: Mailbox,
        operation: &'static str,
        format: OutputFormat,
        source: PlaySource,
        callback: Option<AudioOutCallback>,
    ) -> Result<Option<AudioOutEvent>, VoiceAudioError> {
        let grant = self.grant().unwrap_or_default();
        let resource = grant.playback.ok_or(VoiceAudioError::Resource)?;
        let params = OutputOpenParams {
            device: self.output.devices,
            resource,
            user_id: self.user_id.unwrap_or_default(),
            format,
        };
        let speaker = self.hal.output_open(&params).ok_or(VoiceAudioError::OutputOpen)?;
        let hal_volume_control = grant.playback_caps.contains(OutputCaps::HAL_VOLUME_CONTROL);
        mailbox
            .request(|ack| EngineMessage::PlayIdle {
                output: speaker,
                format,
                hal_volume_control,
                ack,
            })
            .await?;

        let (done, finished) = match callback {
            Some(_) => (None, None),
            None => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
        };
        let accepted = mailbox
            .request(|accepted| {
                EngineMessage::PlayStart(Box::new(PlayRequest {
                    source,
                    callback,
                    done,
                    accepted,
                }))
            })
            .await
            .and_then(|accepted| accepted);
        if let Err(e) = accepted {
            log_failure("play idle stop", mailbox.request(|ack| EngineMessage::PlayIdleStop { ack }).await);
            return Err(e);
        }
        self.output.state = OutputState::Playing;
        tracing::info!(operation, ?format, sync = finished.is_some(), "playback started");

        let Some(finished) = finished else {
            return Ok(None);
        };
        let event = finished
            .await
            .map_err(|_| VoiceAudioError::internal("engine dropped the playback"))?;
        tracing::info!(operation, ?event, "playback finished");
        mailbox.request(|ack| EngineMessage::PlayIdleStop { ack }).await?;
        self.output.state = OutputState::Idling;
        Ok(Some(event))
    }

    /// Plays a WAV file (16-bit PCM, mono or stereo).
    ///
    /// Without a callback the call returns once playback has ended, with its terminal
    /// event.
    ///
    /// # Errors
    ///
    /// * `Open` when the object is not open, `Output` without a speaker.
    /// * `State` while another playback runs.
    /// * `Params` for a name not ending in `.wav` or an unsupported format.
    /// * `FileOpen` and `WaveHeader` when the file cannot be read.
    /// * `Resource` and `OutputOpen` when the speaker cannot be opened.
    pub async fn play_from_file(
        &mut self,
        path: impl AsRef<Path>,
        callback: Option<AudioOutCallback>,
    ) -> Result<Option<AudioOutEvent>, VoiceAudioError> {
        let mailbox = self.output_mailbox("play_from_file")?;
        self.play_check("play_from_file")?;
        let path = path.as_ref();
        if path.extension().and_then(|ext| ext.to_str()) != Some("wav") {
            return Err(VoiceAudioError::params(format!("not a .wav file: {}", path.display())));
        }
        let mut reader = File::open(path).map_err(|source| VoiceAudioError::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let info = wav::parse(&mut reader).map_err(wave_header_error)?;
        let format = wav_format(&info);
        check_supported(&format)?;
        tracing::debug!(path = %path.display(), data_len = info.data_len, "wave file parsed");
        let source = PlaySource::File {
            reader,
            remaining: u64::from(info.data_len),
        };
        self.play_dispatch(mailbox, "play_from_file", format, source, callback).await
    }

    /// Plays audio held in memory, raw PCM or a complete WAV image.
    ///
    /// # Errors
    ///
    /// As [`play_from_file`](Self::play_from_file); `Params` for empty data, `Encoding` for
    /// raw data that is not PCM, `Container` for containers other than WAV.
    pub async fn play_from_memory(
        &mut self,
        format: OutputFormat,
        data: Vec<u8>,
        callback: Option<AudioOutCallback>,
    ) -> Result<Option<AudioOutEvent>, VoiceAudioError> {
        let mailbox = self.output_mailbox("play_from_memory")?;
        self.play_check("play_from_memory")?;
        if data.is_empty() {
            return Err(VoiceAudioError::params("no audio data"));
        }
        let (format, pcm) = match format.container {
            Container::None => {
                if format.encoding != Encoding::Pcm {
                    return Err(VoiceAudioError::Encoding {
                        encoding: format!("{:?}", format.encoding),
                    });
                }
                (format, data)
            }
            Container::Wav => {
                let info = wav::parse(&mut Cursor::new(data.as_slice())).map_err(wave_header_error)?;
                let start = usize::try_from(info.data_offset)
                    .map_err(|_| VoiceAudioError::wave_header("data offset out of range"))?;
                if start >= data.len() {
                    return Err(VoiceAudioError::wave_header("no samples after the header"));
                }
                let end = start.saturating_add(info.data_len as usize).min(data.len());
                (wav_format(&info), data[start..end].to_vec())
            }
            other => {
                return Err(VoiceAudioError::Container {
                    container: format!("{other:?}"),
                })
            }
        };
        check_supported(&format)?;
        self.play_dispatch(mailbox, "play_from_memory", format, PlaySource::Memory(pcm), callback)
            .await
    }

    /// Plays raw PCM read from a pipe. A pipe that runs dry underflows: the speaker plays
    /// silence and `Underflow` is reported.
    ///
    /// # Errors
    ///
    /// As [`play_from_file`](Self::play_from_file); `Container` for anything but raw PCM,
    /// `FifoControl` when the descriptor is not a readable pipe.
    pub async fn play_from_pipe(
        &mut self,
        format: OutputFormat,
        pipe: impl Into<OwnedFd>,
        callback: Option<AudioOutCallback>,
    ) -> Result<Option<AudioOutEvent>, VoiceAudioError> {
        let mailbox = self.output_mailbox("play_from_pipe")?;
        self.play_check("play_from_pipe")?;
        check_raw_pcm(&format)?;
        self.play_dispatch(mailbox, "play_from_pipe", format, PlaySource::Pipe(pipe.into()), callback)
            .await
    }

    /// Plays raw PCM produced by a data callback on the engine thread. The callback fills
    /// the frame it is given and returns the samples written; zero ends the playback.
    ///
    /// # Errors
    ///
    /// As [`play_from_pipe`](Self::play_from_pipe).
    pub async fn play_from_user(
        &mut self,
        format: OutputFormat,
        data: AudioOutDataCallback,
        callback: Option<AudioOutCallback>,
    ) -> Result<Option<AudioOutEvent>, VoiceAudioError> {
        let mailbox = self.output_mailbox("play_from_user")?;
        self.play_check("play_from_user")?;
        check_raw_pcm(&format)?;
        self.play_dispatch(mailbox, "play_from_user", format, PlaySource::User(data), callback)
            .await
    }

    /// Pauses the running playback; the speaker is kept open.
    ///
    /// # Errors
    ///
    /// `State` unless playing.
    pub async fn play_pause(&mut self) -> Result<(), VoiceAudioError> {
        let mailbox = self.output_mailbox("play_pause")?;
        if self.output.state != OutputState::Playing {
            return Err(VoiceAudioError::state("play_pause", self.output.state));
        }
        mailbox.request(|ack| EngineMessage::PlayPause { ack }).await?;
        self.output.state = OutputState::Paused;
        Ok(())
    }

    /// Resumes a paused playback.
    ///
    /// # Errors
    ///
    /// `State` unless paused.
    pub async fn play_resume(&mut self) -> Result<(), VoiceAudioError> {
        let mailbox = self.output_mailbox("play_resume")?;
        if self.output.state != OutputState::Paused {
            return Err(VoiceAudioError::state("play_resume", self.output.state));
        }
        mailbox.request(|ack| EngineMessage::PlayResume { ack }).await?;
        self.output.state = OutputState::Playing;
        Ok(())
    }

    /// Stops playback and closes the speaker. Stopping while idle succeeds.
    ///
    /// # Errors
    ///
    /// `Open` or `Output` when no speaker is open.
    pub async fn play_stop(&mut self) -> Result<(), VoiceAudioError> {
        let mailbox = self.output_mailbox("play_stop")?;
        match self.output.state {
            OutputState::Created => Err(VoiceAudioError::state("play_stop", OutputState::Created)),
            OutputState::Idling => Ok(()),
            OutputState::Playing | OutputState::Paused => {
                mailbox.request(|ack| EngineMessage::PlayStop { ack }).await?;
                mailbox.request(|ack| EngineMessage::PlayIdleStop { ack }).await?;
                self.output.state = OutputState::Idling;
                tracing::info!("playback stopped");
                Ok(())
            }
        }
    }

    /// Sets the volume step without ramping.
    ///
    /// Channels cannot be set apart: `right` applies to both. Steps outside the configured
    /// range are clamped and arm the bumper.
    ///
    /// # Errors
    ///
    /// `Open` or `Output` when no speaker is open.
    pub async fn play_volume_set(&mut self, left: i8, right: i8) -> Result<(), VoiceAudioError> {
        self.volume_apply("play_volume_set", left, right, false).await
    }

    /// Sets the volume step, ramping one step per frame when `ramp` is set.
    ///
    /// # Errors
    ///
    /// `Open` or `Output` when no speaker is open.
    pub async fn play_volume_ramp_set(&mut self, left: i8, right: i8, ramp: bool) -> Result<(), VoiceAudioError> {
        self.volume_apply("play_volume_ramp_set", left, right, ramp).await
    }

    /// Changes the volume step by a relative amount.
    ///
    /// # Errors
    ///
    /// `Open` or `Output` when no speaker is open.
    pub async fn play_volume_set_rel(&mut self, left: i8, right: i8, ramp: bool) -> Result<(), VoiceAudioError> {
        let step = self.output.volume.step;
        let left = step.checked_add(left).unwrap_or(VOLUME_NOMINAL);
        let right = step.checked_add(right).unwrap_or(VOLUME_NOMINAL);
        self.volume_apply("play_volume_set_rel", left, right, ramp).await
    }

    async fn volume_apply(&mut self, operation: &'static str, left: i8, right: i8, ramp: bool) -> Result<(), VoiceAudioError> {
        let mailbox = self.output_mailbox(operation)?;
        let volume = &mut self.output.volume;
        let (step, bumper) = clamp_step(right, volume.min, volume.max);
        if bumper {
            tracing::debug!(requested = right, step, "volume clamped");
        }
        if left != right {
            tracing::debug!(left, right, "channels share one volume step");
        }
        volume.step = step;
        volume.ramp = ramp;
        mailbox.send(EngineMessage::VolumeSet { step, ramp, bumper }).await
    }

    /// Current volume as `(left, right, ramp)`.
    pub fn play_volume_get(&self) -> (i8, i8, bool) {
        let volume = &self.output.volume;
        (volume.step, volume.step, volume.ramp)
    }

    /// Replaces the volume range and step size.
    ///
    /// The current step is pulled into the new range.
    ///
    /// # Errors
    ///
    /// `Params` when `min` exceeds `max` or the step size is not a positive number.
    pub async fn play_volume_config_set(
        &mut self,
        max: i8,
        min: i8,
        step_db: f32,
        use_ext_gain: bool,
    ) -> Result<(), VoiceAudioError> {
        if min > max || !step_db.is_finite() || step_db <= 0.0 {
            return Err(VoiceAudioError::params(format!("volume range {min}..={max} step {step_db} dB")));
        }
        let volume = &mut self.output.volume;
        volume.max = max;
        volume.min = min;
        volume.step_db = step_db;
        volume.use_ext_gain = use_ext_gain;
        volume.step = clamp_step(volume.step, min, max).0;
        tracing::info!(max, min, step_db, use_ext_gain, "volume config");
        if let Some(engine) = &self.engine {
            engine
                .mailbox()
                .send(EngineMessage::VolumeConfig {
                    max,
                    min,
                    step_db,
                    use_ext_gain,
                })
                .await?;
        }
        Ok(())
    }

    /// Volume range and step size as `(max, min, step_db, use_ext_gain)`.
    pub fn play_volume_config_get(&self) -> (i8, i8, f32, bool) {
        let volume = &self.output.volume;
        (volume.max, volume.min, volume.step_db, volume.use_ext_gain)
    }

    /// Sends the speaker peak level to the named fifo every frame, or stops when `name`
    /// is `None`.
    ///
    /// # Errors
    ///
    /// `Params` for names shorter than 2 or longer than 63 bytes.
    pub async fn play_sound_intensity_transfer(&mut self, name: Option<&str>) -> Result<(), VoiceAudioError> {
        check_intensity_name(name)?;
        self.output.intensity_name = name.map(str::to_string);
        if self.is_open() {
            self.intensity_send(IntensityTarget::Output, name).await?;
        }
        Ok(())
    }

    /// Stops playback and releases the speaker.
    pub(super) async fn output_shutdown(&mut self, mailbox: &Mailbox) {
        if matches!(self.output.state, OutputState::Playing | OutputState::Paused) {
            log_failure("play stop", mailbox.request(|ack| EngineMessage::PlayStop { ack }).await);
            log_failure("play idle stop", mailbox.request(|ack| EngineMessage::PlayIdleStop { ack }).await);
        }
        if self.output.intensity_name.is_some() {
            log_failure(
                "sound intensity close",
                mailbox
                    .send(EngineMessage::SoundIntensity {
                        target: IntensityTarget::Output,
                        fifo: None,
                    })
                    .await,
            );
        }
        self.output.devices = OutputDevices::NONE;
        self.output.state = OutputState::Created;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::client::tests::{fixture, opened};
    use crate::device::InputDevices;
    use crate::event::audio_out_callback;
    use crate::format::convert;

    fn pcm(samples: usize) -> Vec<u8> {
        convert::i16_to_le_bytes(&vec![1000i16; samples])
    }

    #[tokio::test]
    async fn test_play_from_memory_sync() {
        let mut fx = opened(InputDevices::SINGLE).await;
        let event = fx
            .audio
            .play_from_memory(OutputFormat::default(), pcm(1600), None)
            .await
            .unwrap();
        assert_eq!(event, Some(AudioOutEvent::Eof));
        assert_eq!(fx.hal.speaker_samples().len(), 1600);
        assert_eq!(fx.audio.play_state(), OutputState::Idling);
        fx.audio.resource_release().await.unwrap();
    }

    #[tokio::test]
    async fn test_play_wav_image_from_memory() {
        let mut fx = opened(InputDevices::SINGLE).await;
        let mut image = wav::header(1, 16_000, 2, 640).to_vec();
        image.extend(pcm(320));
        let format = OutputFormat {
            container: Container::Wav,
            ..OutputFormat::default()
        };
        let event = fx.audio.play_from_memory(format, image, None).await.unwrap();
        assert_eq!(event, Some(AudioOutEvent::Eof));
        assert_eq!(fx.hal.speaker_samples().len(), 320);
        fx.audio.resource_release().await.unwrap();
    }

    #[tokio::test]
    async fn test_play_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chime.wav");
        let mut image = wav::header(1, 16_000, 2, 1280).to_vec();
        image.extend(pcm(640));
        std::fs::write(&path, image).unwrap();

        let mut fx = opened(InputDevices::SINGLE).await;
        let event = fx.audio.play_from_file(&path, None).await.unwrap();
        assert_eq!(event, Some(AudioOutEvent::Eof));
        assert_eq!(fx.hal.speaker_samples().len(), 640);

        let not_wav = fx.audio.play_from_file(dir.path().join("chime.mp3"), None).await;
        assert!(matches!(not_wav, Err(VoiceAudioError::Params { .. })));
        let missing = fx.audio.play_from_file(dir.path().join("gone.wav"), None).await;
        assert!(matches!(missing, Err(VoiceAudioError::FileOpen { .. })));
        let junk = dir.path().join("junk.wav");
        std::fs::write(&junk, b"not a wave file at all, just text").unwrap();
        let bad = fx.audio.play_from_file(&junk, None).await;
        assert!(matches!(bad, Err(VoiceAudioError::WaveHeader { .. })));
        fx.audio.resource_release().await.unwrap();
    }

    #[tokio::test]
    async fn test_play_rejections() {
        let mut fx = opened(InputDevices::SINGLE).await;
        let empty = fx.audio.play_from_memory(OutputFormat::default(), Vec::new(), None).await;
        assert!(matches!(empty, Err(VoiceAudioError::Params { .. })));

        let opus = OutputFormat {
            encoding: Encoding::Opus,
            ..OutputFormat::default()
        };
        let encoded = fx.audio.play_from_memory(opus, pcm(10), None).await;
        assert!(matches!(encoded, Err(VoiceAudioError::Encoding { .. })));

        let mp3 = OutputFormat {
            container: Container::Mp3,
            ..OutputFormat::default()
        };
        let container = fx.audio.play_from_memory(mp3, pcm(10), None).await;
        assert!(matches!(container, Err(VoiceAudioError::Container { .. })));

        let slow = OutputFormat {
            sample_rate: 8000,
            ..OutputFormat::default()
        };
        let rate = fx.audio.play_from_memory(slow, pcm(10), None).await;
        assert!(matches!(rate, Err(VoiceAudioError::Params { .. })));

        let user = fx
            .audio
            .play_from_user(mp3, Box::new(|_: &mut [i16]| 0usize), None)
            .await;
        assert!(matches!(user, Err(VoiceAudioError::Container { .. })));

        fx.hal.fail_output_open(true);
        let refused = fx.audio.play_from_memory(OutputFormat::default(), pcm(10), None).await;
        assert!(matches!(refused, Err(VoiceAudioError::OutputOpen)));
        assert_eq!(fx.audio.play_state(), OutputState::Idling);
        fx.audio.resource_release().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_stop() {
        let mut fx = opened(InputDevices::SINGLE).await;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback = audio_out_callback(move |event| sink.lock().push(event));
        // Ten seconds of audio keeps the playback running for the whole test.
        fx.audio
            .play_from_memory(OutputFormat::default(), pcm(160_000), Some(callback))
            .await
            .unwrap();
        assert_eq!(fx.audio.play_state(), OutputState::Playing);
        assert!(matches!(fx.audio.play_resume().await, Err(VoiceAudioError::State { .. })));

        fx.audio.play_pause().await.unwrap();
        assert_eq!(fx.audio.play_state(), OutputState::Paused);
        let busy = fx.audio.play_from_memory(OutputFormat::default(), pcm(10), None).await;
        assert!(matches!(busy, Err(VoiceAudioError::State { .. })));

        fx.audio.play_resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        fx.audio.play_stop().await.unwrap();
        assert_eq!(fx.audio.play_state(), OutputState::Idling);
        fx.audio.play_stop().await.unwrap();
        assert!(events.lock().contains(&AudioOutEvent::FirstFrame));
        fx.audio.resource_release().await.unwrap();
    }

    #[tokio::test]
    async fn test_volume_clamps_and_configures() {
        let mut fx = opened(InputDevices::SINGLE).await;
        fx.audio.play_volume_set(-3, 9).await.unwrap();
        assert_eq!(fx.audio.play_volume_get(), (3, 3, false));
        fx.audio.play_volume_ramp_set(0, -40, true).await.unwrap();
        assert_eq!(fx.audio.play_volume_get(), (-12, -12, true));
        fx.audio.play_volume_set_rel(0, 2, false).await.unwrap();
        assert_eq!(fx.audio.play_volume_get().1, -10);
        fx.audio.play_volume_set_rel(0, i8::MIN, false).await.unwrap();
        assert_eq!(fx.audio.play_volume_get().1, VOLUME_NOMINAL);

        fx.audio.play_volume_config_set(0, -6, 1.5, true).await.unwrap();
        assert_eq!(fx.audio.play_volume_config_get(), (0, -6, 1.5, true));
        assert!(fx.audio.play_volume_config_set(-6, 0, 1.5, false).await.is_err());
        fx.audio.resource_release().await.unwrap();
    }

    #[tokio::test]
    async fn test_playback_requires_speaker() {
        let mut fx = fixture();
        let closed = fx.audio.play_from_memory(OutputFormat::default(), pcm(10), None).await;
        assert!(matches!(closed, Err(VoiceAudioError::Open)));
        assert!(matches!(fx.audio.play_stop().await, Err(VoiceAudioError::Open)));
        assert_eq!(fx.audio.play_state(), OutputState::Created);
        // Volume settings are kept while closed.
        fx.audio.play_volume_config_set(6, -6, 2.0, false).await.unwrap();
        assert_eq!(fx.audio.play_volume_config_get().0, 6);
    }
}

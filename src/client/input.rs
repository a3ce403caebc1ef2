//! Microphone side of the object: record, stream, keyword detection and diagnostic capture.

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tokio::sync::oneshot;

use super::{check_intensity_name, VoiceAudio};
use crate::config::{EngineConfig, FRAME_GROUP_QTY_RANGE, STREAM_TIME_MINIMUM_MAX_MS};
use crate::device::InputDevices;
use crate::engine::mailbox::{
    Destination, EngineMessage, IntensityTarget, Mailbox, PipeRequest, RecordRequest, StreamParams,
};
use crate::engine::PIPE_QTY_MAX;
use crate::error::VoiceAudioError;
use crate::event::{AudioInCallback, AudioInDataCallback, AudioInEvent, KeywordCallback};
use crate::format::{
    CaptureKind, Container, Encoding, InputFormat, LatencyMode, RecordFrom, RecordUntil,
    INPUT_MAX_CHANNEL_QTY, INPUT_SAMPLE_RATE,
};
use crate::registry::SessionGroup;
use crate::sink::{FileSink, MemoryBuffer, MemorySink, RecordSink, UserSink};

const STREAM_IDENTIFIER_LEN_MAX: usize = 64;

/// Microphone session state of one session group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    /// The microphone is not open.
    Created,
    /// Open, no session running.
    Idling,
    /// Recording to a file or memory buffer.
    Recording,
    /// Streaming to pipes or a user callback.
    Streaming,
    /// Keyword detection armed.
    Detecting,
}

impl InputState {
    fn is_active(self) -> bool {
        matches!(self, Self::Recording | Self::Streaming | Self::Detecting)
    }
}

/// Portion of the audio history a destination receives.
///
/// `offset` is in samples: skipped audio for [`RecordFrom::Beginning`], a shift of the
/// keyword point for the keyword anchors (negative reaches earlier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordWindow {
    /// Start point.
    pub from: RecordFrom,
    /// Shift of the start point.
    pub offset: i32,
    /// End condition.
    pub until: RecordUntil,
}

impl RecordWindow {
    /// Live audio until stopped.
    pub fn live() -> Self {
        Self {
            from: RecordFrom::Live,
            offset: 0,
            until: RecordUntil::EndOfStream,
        }
    }

    /// Audio from the keyword begin point, shifted by `offset` samples, until `until`.
    pub fn keyword(offset: i32, until: RecordUntil) -> Self {
        Self {
            from: RecordFrom::KeywordBegin,
            offset,
            until,
        }
    }

    fn check(&self, source: InputDevices) -> Result<(), VoiceAudioError> {
        if self.from == RecordFrom::KeywordBegin && source.local().is_none() {
            return Err(VoiceAudioError::params("keyword anchor on a non-local source"));
        }
        if self.from == RecordFrom::Beginning && self.offset < 0 {
            return Err(VoiceAudioError::params("negative offset from beginning"));
        }
        Ok(())
    }
}

/// One pipe of [`VoiceAudio::stream_to_pipe`].
#[derive(Debug)]
pub struct PipeDestination {
    /// Write end of the pipe; it is switched to non-blocking.
    pub fd: OwnedFd,
    /// Portion of the audio this pipe receives.
    pub window: RecordWindow,
}

impl PipeDestination {
    /// Wraps the write end of a pipe.
    pub fn new(fd: impl Into<OwnedFd>, window: RecordWindow) -> Self {
        Self {
            fd: fd.into(),
            window,
        }
    }
}

pub(super) struct InputSide {
    devices: InputDevices,
    format: InputFormat,
    states: [InputState; SessionGroup::QTY],
    sources: [InputDevices; SessionGroup::QTY],
    /// Bit per pipe index still streaming.
    pipes: [u8; SessionGroup::QTY],
    params: StreamParams,
    sensitivity: f32,
    phrase: Option<String>,
    pub(super) intensity_name: Option<String>,
    capture_active: bool,
}

impl InputSide {
    pub(super) fn new(config: &EngineConfig) -> Self {
        Self {
            devices: InputDevices::NONE,
            format: InputFormat::default(),
            states: [InputState::Created; SessionGroup::QTY],
            sources: [InputDevices::NONE; SessionGroup::QTY],
            pipes: [0; SessionGroup::QTY],
            params: StreamParams::default(),
            sensitivity: config.input.default_sensitivity,
            phrase: None,
            intensity_name: None,
            capture_active: false,
        }
    }

    pub(super) fn opened(&mut self, devices: InputDevices, format: InputFormat) {
        let state = if devices.is_none() {
            InputState::Created
        } else {
            InputState::Idling
        };
        self.devices = devices;
        self.format = format;
        self.states = [state; SessionGroup::QTY];
    }

    fn closed(&mut self) {
        self.devices = InputDevices::NONE;
        self.states = [InputState::Created; SessionGroup::QTY];
        self.sources = [InputDevices::NONE; SessionGroup::QTY];
        self.pipes = [0; SessionGroup::QTY];
        self.capture_active = false;
    }

    fn begin(&mut self, source: InputDevices, state: InputState, pipes: u8) {
        let slot = SessionGroup::for_source(source).index();
        self.states[slot] = state;
        self.sources[slot] = source;
        self.pipes[slot] = pipes;
    }

    fn end(&mut self, slot: usize) {
        self.states[slot] = InputState::Idling;
        self.sources[slot] = InputDevices::NONE;
        self.pipes[slot] = 0;
        self.params.time_minimum_ms = 0;
        self.params.keyword_begin = 0;
        self.params.keyword_duration = 0;
    }

    /// Format delivered to a pipe: the full array in 32-bit for the multi-channel sources.
    fn pipe_format(&self, source: InputDevices) -> InputFormat {
        let (channel_qty, sample_size) = if source == InputDevices::QUAD {
            (4, 4)
        } else if source == InputDevices::TRI {
            (3, 4)
        } else {
            (1, 2)
        };
        InputFormat {
            container: Container::None,
            encoding: Encoding::Pcm,
            sample_rate: self.format.sample_rate,
            sample_size,
            channel_qty,
        }
    }

    fn mono_format(&self, container: Container) -> InputFormat {
        InputFormat {
            container,
            encoding: Encoding::Pcm,
            sample_rate: self.format.sample_rate,
            sample_size: 2,
            channel_qty: 1,
        }
    }
}

impl VoiceAudio {
    /// Session state of the group serving `source`.
    pub fn record_state(&self, source: InputDevices) -> InputState {
        self.input.states[SessionGroup::for_source(source).index()]
    }

    fn input_mailbox(&self, operation: &'static str) -> Result<Mailbox, VoiceAudioError> {
        let mailbox = self.mailbox(operation)?.clone();
        if self.input.devices.is_none() {
            tracing::error!(operation, "microphone not opened");
            return Err(VoiceAudioError::input("microphone not opened"));
        }
        Ok(mailbox)
    }

    /// Checks that `source` is open and its group is idle.
    ///
    /// Streams may ask for `SINGLE` from an open array; they get its primary channel.
    fn session_check(
        &self,
        operation: &'static str,
        source: InputDevices,
        stream: bool,
    ) -> Result<(), VoiceAudioError> {
        let devices = self.input.devices;
        let from_array = stream
            && source == InputDevices::SINGLE
            && devices.contains(InputDevices::TRI | InputDevices::QUAD);
        if source.is_none() || !(devices.contains(source) || from_array) {
            tracing::error!(operation, source = source.0, devices = devices.0, "invalid source");
            return Err(VoiceAudioError::input(format!("source {:#06x} is not open", source.0)));
        }
        let state = self.record_state(source);
        if state != InputState::Idling {
            tracing::error!(operation, ?state, "session in progress");
            return Err(VoiceAudioError::state(operation, state));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_dispatch(
        &mut self,
        mailbox: Mailbox,
        operation: &'static str,
        source: InputDevices,
        format_out: InputFormat,
        destination: Destination,
        state: InputState,
        pipes: u8,
        callback: Option<AudioInCallback>,
    ) -> Result<Option<AudioInEvent>, VoiceAudioError> {
        let finished = self
            .record_begin(&mailbox, operation, source, format_out, destination, state, pipes, callback)
            .await?;
        self.record_wait(&mailbox, operation, source, finished).await
    }

    /// Hands a session to the engine; the receiver is set for synchronous calls.
    #[allow(clippy::too_many_arguments)]
    async fn record_begin(
        &mut self,
        mailbox: &Mailbox,
        operation: &'static str,
        source: InputDevices,
        format_out: InputFormat,
        destination: Destination,
        state: InputState,
        pipes: u8,
        callback: Option<AudioInCallback>,
    ) -> Result<Option<oneshot::Receiver<AudioInEvent>>, VoiceAudioError> {
        let (done, finished) = match callback {
            Some(_) => (None, None),
            None => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
        };
        let params = self.input.params.clone();
        mailbox
            .request(|accepted| {
                EngineMessage::RecordStart(Box::new(RecordRequest {
                    source,
                    format_out,
                    destination,
                    params,
                    callback,
                    done,
                    accepted,
                }))
            })
            .await??;
        self.input.begin(source, state, pipes);
        tracing::info!(operation, source = source.0, ?state, sync = finished.is_some(), "session started");
        Ok(finished)
    }

    async fn record_wait(
        &mut self,
        mailbox: &Mailbox,
        operation: &'static str,
        source: InputDevices,
        finished: Option<oneshot::Receiver<AudioInEvent>>,
    ) -> Result<Option<AudioInEvent>, VoiceAudioError> {
        let Some(finished) = finished else {
            return Ok(None);
        };
        let event = finished
            .await
            .map_err(|_| VoiceAudioError::internal("engine dropped the session"))?;
        tracing::info!(operation, ?event, "session finished");
        mailbox
            .request(|ack| EngineMessage::RecordStop {
                source,
                index: None,
                ack,
            })
            .await?;
        self.input.end(SessionGroup::for_source(source).index());
        Ok(Some(event))
    }

    /// Records `source` into a WAV file.
    ///
    /// Without a callback the call returns once the recording has ended, with its terminal
    /// event.
    ///
    /// # Errors
    ///
    /// * `Open` when the object is not open, `Input` for a source that is not open.
    /// * `State` while another session of the group runs.
    /// * `Container` for anything but WAV, `Params` for an invalid window.
    /// * `FileOpen` when the file cannot be created.
    pub async fn record_to_file(
        &mut self,
        source: InputDevices,
        container: Container,
        path: impl AsRef<Path>,
        window: RecordWindow,
        callback: Option<AudioInCallback>,
    ) -> Result<Option<AudioInEvent>, VoiceAudioError> {
        let mailbox = self.input_mailbox("record_to_file")?;
        self.session_check("record_to_file", source, false)?;
        if container != Container::Wav {
            return Err(VoiceAudioError::Container {
                container: format!("{container:?}"),
            });
        }
        window.check(source)?;
        let format_out = self.input.mono_format(Container::Wav);
        let path = path.as_ref();
        let sink = FileSink::create(path, format_out)?;
        let destination = sink_destination(Box::new(sink), window);
        let begun = self
            .record_begin(&mailbox, "record_to_file", source, format_out, destination, InputState::Recording, 0, callback)
            .await;
        let finished = match begun {
            Ok(finished) => finished,
            Err(e) => {
                // Refused by the engine: the sink was dropped unwritten.
                if let Err(remove) = std::fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %remove, "unable to remove refused record file");
                }
                return Err(e);
            }
        };
        self.record_wait(&mailbox, "record_to_file", source, finished).await
    }

    /// Records `source` into a shared memory buffer until it is full.
    ///
    /// # Errors
    ///
    /// As [`record_to_file`](Self::record_to_file); `Params` for a buffer without capacity.
    pub async fn record_to_memory(
        &mut self,
        source: InputDevices,
        buffer: MemoryBuffer,
        window: RecordWindow,
        callback: Option<AudioInCallback>,
    ) -> Result<Option<AudioInEvent>, VoiceAudioError> {
        let mailbox = self.input_mailbox("record_to_memory")?;
        self.session_check("record_to_memory", source, false)?;
        if buffer.capacity() == 0 {
            return Err(VoiceAudioError::params("memory buffer has no capacity"));
        }
        window.check(source)?;
        let format_out = self.input.mono_format(Container::None);
        let destination = sink_destination(Box::new(MemorySink::new(buffer)), window);
        self.record_dispatch(mailbox, "record_to_memory", source, format_out, destination, InputState::Recording, 0, callback)
            .await
    }

    /// Stops the recording of `source`.
    ///
    /// # Errors
    ///
    /// `State` when nothing is recording.
    pub async fn record_stop(&mut self, source: InputDevices) -> Result<(), VoiceAudioError> {
        self.input_stop("record_stop", source, None).await
    }

    /// Streams `source` into a named fifo.
    ///
    /// # Errors
    ///
    /// As [`stream_to_pipe`](Self::stream_to_pipe); `FifoOpen` when the fifo cannot be
    /// opened.
    pub async fn stream_to_fifo(
        &mut self,
        source: InputDevices,
        fifo: impl AsRef<Path>,
        window: RecordWindow,
        callback: Option<AudioInCallback>,
    ) -> Result<Option<AudioInEvent>, VoiceAudioError> {
        let mailbox = self.input_mailbox("stream_to_fifo")?;
        self.session_check("stream_to_fifo", source, true)?;
        window.check(source)?;
        let path = fifo.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| VoiceAudioError::FifoOpen {
                path: path.to_path_buf(),
                source,
            })?;
        let pipes = vec![PipeRequest {
            fd: OwnedFd::from(file),
            from: window.from,
            offset: window.offset,
            until: window.until,
        }];
        let format_out = self.input.pipe_format(source);
        self.record_dispatch(mailbox, "stream_to_fifo", source, format_out, Destination::Pipes(pipes), InputState::Streaming, 1, callback)
            .await
    }

    /// Streams `source` into up to three pipes, each with its own window.
    ///
    /// Pipes of `QUAD` and `TRI` sources carry every channel as 32-bit samples; all others
    /// carry 16-bit mono.
    ///
    /// # Errors
    ///
    /// * `Open`, `Input` and `State` as for records.
    /// * `Params` for no pipes, too many pipes or an invalid window.
    /// * `FifoControl` when a descriptor is not a writable pipe.
    pub async fn stream_to_pipe(
        &mut self,
        source: InputDevices,
        pipes: Vec<PipeDestination>,
        callback: Option<AudioInCallback>,
    ) -> Result<Option<AudioInEvent>, VoiceAudioError> {
        let mailbox = self.input_mailbox("stream_to_pipe")?;
        self.session_check("stream_to_pipe", source, true)?;
        if pipes.is_empty() || pipes.len() > PIPE_QTY_MAX {
            return Err(VoiceAudioError::params(format!("pipe quantity {}", pipes.len())));
        }
        for pipe in &pipes {
            pipe.window.check(source)?;
        }
        let open_mask = (1u8 << pipes.len()) - 1;
        let requests = pipes
            .into_iter()
            .map(|pipe| PipeRequest {
                fd: pipe.fd,
                from: pipe.window.from,
                offset: pipe.window.offset,
                until: pipe.window.until,
            })
            .collect();
        let format_out = self.input.pipe_format(source);
        self.record_dispatch(mailbox, "stream_to_pipe", source, format_out, Destination::Pipes(requests), InputState::Streaming, open_mask, callback)
            .await
    }

    /// Streams `source` to a data callback invoked on the engine thread.
    ///
    /// # Errors
    ///
    /// `Open`, `Input`, `State` and `Params` as for pipes.
    pub async fn stream_to_user(
        &mut self,
        source: InputDevices,
        data: AudioInDataCallback,
        window: RecordWindow,
        callback: Option<AudioInCallback>,
    ) -> Result<Option<AudioInEvent>, VoiceAudioError> {
        let mailbox = self.input_mailbox("stream_to_user")?;
        self.session_check("stream_to_user", source, true)?;
        window.check(source)?;
        let format_out = self.input.mono_format(Container::None);
        let destination = sink_destination(Box::new(UserSink::new(source, data)), window);
        self.record_dispatch(mailbox, "stream_to_user", source, format_out, destination, InputState::Streaming, 0, callback)
            .await
    }

    /// Stops the stream of `source`, or only its pipe `index`.
    ///
    /// Stopping one pipe of several leaves the others streaming. Stopping a stream that
    /// followed a keyword detection returns the voice session.
    ///
    /// # Errors
    ///
    /// `State` when nothing is streaming.
    pub async fn stream_stop(&mut self, source: InputDevices, index: Option<usize>) -> Result<(), VoiceAudioError> {
        self.input_stop("stream_stop", source, index).await
    }

    async fn input_stop(
        &mut self,
        operation: &'static str,
        source: InputDevices,
        index: Option<usize>,
    ) -> Result<(), VoiceAudioError> {
        let mailbox = self.input_mailbox(operation)?;
        let slot = SessionGroup::for_source(source).index();
        let state = self.input.states[slot];
        if !state.is_active() {
            tracing::error!(operation, ?state, "nothing to stop");
            return Err(VoiceAudioError::state(operation, state));
        }
        if state == InputState::Detecting {
            mailbox.request(|ack| EngineMessage::DetectStop { ack }).await?;
        }
        let session_source = if self.input.sources[slot].is_none() {
            source
        } else {
            self.input.sources[slot]
        };
        mailbox
            .request(|ack| EngineMessage::RecordStop {
                source: session_source,
                index,
                ack,
            })
            .await?;
        if let Some(index) = index.filter(|&i| i < PIPE_QTY_MAX) {
            self.input.pipes[slot] &= !(1u8 << index);
            if self.input.pipes[slot] != 0 {
                tracing::info!(operation, index, "pipe stopped, others still streaming");
                return Ok(());
            }
        }
        self.input.end(slot);
        tracing::info!(operation, source = source.0, "session stopped");
        Ok(())
    }

    /// Sets the keyword sensitivity used by the next (or the running) detection.
    ///
    /// # Errors
    ///
    /// `Params` for a sensitivity that is not a finite, non-negative number.
    pub async fn detect_params(&mut self, phrase: Option<&str>, sensitivity: f32) -> Result<(), VoiceAudioError> {
        if !sensitivity.is_finite() || sensitivity < 0.0 {
            return Err(VoiceAudioError::params(format!("keyword sensitivity {sensitivity}")));
        }
        self.input.phrase = phrase.map(str::to_string);
        if self.input.sensitivity == sensitivity {
            return Ok(());
        }
        self.input.sensitivity = sensitivity;
        let detecting = self.input.states[SessionGroup::Default.index()] == InputState::Detecting;
        tracing::info!(sensitivity, detecting, phrase = ?self.input.phrase, "keyword sensitivity");
        if detecting {
            self.mailbox("detect_params")?
                .send(EngineMessage::DetectParams { sensitivity })
                .await?;
        }
        Ok(())
    }

    /// Arms keyword detection on the local microphone.
    ///
    /// The callback fires once per detection; the detector must be re-armed (stop, then
    /// detect again) before it fires another time. The voice session stays claimed by the
    /// detection until the stream that follows it stops.
    ///
    /// # Errors
    ///
    /// * `Open` or `Input` when no local microphone is open.
    /// * `State` while another session runs.
    /// * `Params` when the microphone is not 16 kHz with 1 to 4 channels.
    pub async fn detect_keyword(&mut self, callback: KeywordCallback) -> Result<(), VoiceAudioError> {
        let mailbox = self.input_mailbox("detect_keyword")?;
        let source = self.input.devices.local();
        if source.is_none() {
            return Err(VoiceAudioError::input("keyword detection needs a local microphone"));
        }
        let slot = SessionGroup::Default.index();
        let state = self.input.states[slot];
        if state != InputState::Idling {
            return Err(VoiceAudioError::state("detect_keyword", state));
        }
        let format = self.input.format;
        if format.sample_rate != INPUT_SAMPLE_RATE || !(1..=INPUT_MAX_CHANNEL_QTY).contains(&format.channel_qty) {
            tracing::error!(sample_rate = format.sample_rate, channels = format.channel_qty, "unsupported detection format");
            return Err(VoiceAudioError::params("keyword detection needs 16 kHz with 1 to 4 channels"));
        }
        let sensitivity = self.input.sensitivity;
        mailbox
            .request(|ack| EngineMessage::Detect {
                callback,
                sensitivity,
                ack,
            })
            .await?;
        self.input.states[slot] = InputState::Detecting;
        self.input.sources[slot] = source;
        tracing::info!(source = source.0, sensitivity, "keyword detection armed");
        Ok(())
    }

    /// Disarms keyword detection.
    ///
    /// # Errors
    ///
    /// `State` when detection is not armed.
    pub async fn detect_stop(&mut self) -> Result<(), VoiceAudioError> {
        let mailbox = self.input_mailbox("detect_stop")?;
        let slot = SessionGroup::Default.index();
        let state = self.input.states[slot];
        if state != InputState::Detecting {
            return Err(VoiceAudioError::state("detect_stop", state));
        }
        mailbox.request(|ack| EngineMessage::DetectStop { ack }).await?;
        self.input.states[slot] = InputState::Idling;
        self.input.sources[slot] = InputDevices::NONE;
        Ok(())
    }

    /// Lowest and highest sensitivity the keyword detector accepts.
    ///
    /// # Errors
    ///
    /// `Open` when the object is not open.
    pub async fn detect_sensitivity_limits(&self) -> Result<(f32, f32), VoiceAudioError> {
        self.mailbox("detect_sensitivity_limits")?
            .request(|reply| EngineMessage::DetectSensitivityLimits { reply })
            .await
    }

    /// Emits `StreamTimeMinimum` once `ms` of audio has been streamed; clamped to 500 ms.
    pub fn stream_time_minimum(&mut self, ms: u16) {
        if ms > STREAM_TIME_MINIMUM_MAX_MS {
            tracing::warn!(ms, max = STREAM_TIME_MINIMUM_MAX_MS, "stream time minimum clamped");
        }
        self.input.params.time_minimum_ms = ms.min(STREAM_TIME_MINIMUM_MAX_MS);
    }

    /// Keyword position within the next stream, in samples, to emit `StreamKeywordInfo`
    /// once the keyword end has been delivered.
    pub fn stream_keyword_info(&mut self, keyword_begin: u32, keyword_duration: u32) {
        self.input.params.keyword_begin = keyword_begin;
        self.input.params.keyword_duration = keyword_duration;
    }

    /// Frames grouped into each stream write.
    ///
    /// # Errors
    ///
    /// `Params` outside 1 to 10.
    pub fn stream_frame_group_quantity_set(&mut self, quantity: u8) -> Result<(), VoiceAudioError> {
        if !FRAME_GROUP_QTY_RANGE.contains(&quantity) {
            return Err(VoiceAudioError::params(format!("frame group quantity {quantity}")));
        }
        self.input.params.frame_group_qty = quantity;
        Ok(())
    }

    /// Identifier of the next streams, used to name internal capture files.
    ///
    /// # Errors
    ///
    /// `Params` for identifiers longer than 64 bytes.
    pub fn stream_identifier_set(&mut self, identifier: Option<&str>) -> Result<(), VoiceAudioError> {
        if let Some(id) = identifier {
            if id.len() > STREAM_IDENTIFIER_LEN_MAX {
                return Err(VoiceAudioError::params(format!("identifier length {}", id.len())));
            }
        }
        self.input.params.identifier = identifier.map(str::to_string);
        Ok(())
    }

    /// Latency mode of the next streams. Low latency disables frame grouping.
    pub fn stream_latency_mode_set(&mut self, mode: LatencyMode) {
        self.input.params.latency = mode;
    }

    /// Sends the microphone signal level to the named fifo every frame, or stops when
    /// `name` is `None`.
    ///
    /// # Errors
    ///
    /// `Params` for names shorter than 2 or longer than 63 bytes.
    pub async fn record_sound_intensity_transfer(&mut self, name: Option<&str>) -> Result<(), VoiceAudioError> {
        check_intensity_name(name)?;
        self.input.intensity_name = name.map(str::to_string);
        if self.is_open() {
            self.intensity_send(IntensityTarget::Input, name).await?;
        }
        Ok(())
    }

    /// Starts a diagnostic capture into files prefixed by `path`.
    ///
    /// # Errors
    ///
    /// * `Open` or `Input` when no microphone is open.
    /// * `State` when a capture is already running.
    /// * `Params` for unknown capture bits, `Container` for anything but WAV or raw.
    /// * `Capture` when the files cannot be created.
    pub async fn capture_to_file_start(
        &mut self,
        kind: CaptureKind,
        container: Container,
        path: impl Into<PathBuf>,
        raw_mic: bool,
    ) -> Result<(), VoiceAudioError> {
        let mailbox = self.input_mailbox("capture_to_file_start")?;
        if self.input.capture_active {
            return Err(VoiceAudioError::state("capture_to_file_start", "capturing"));
        }
        if !kind.is_valid() {
            return Err(VoiceAudioError::params(format!("capture kind {:#04x}", kind.0)));
        }
        if !matches!(container, Container::Wav | Container::None) {
            return Err(VoiceAudioError::Container {
                container: format!("{container:?}"),
            });
        }
        let prefix = path.into();
        tracing::info!(kind = kind.0, ?container, prefix = %prefix.display(), raw_mic, "capture start");
        mailbox
            .request(|reply| EngineMessage::CaptureStart {
                kind,
                container,
                prefix,
                raw_mic,
                reply,
            })
            .await??;
        self.input.capture_active = true;
        Ok(())
    }

    /// Stops the diagnostic capture and finalizes its files.
    ///
    /// # Errors
    ///
    /// `State` when no capture runs.
    pub async fn capture_stop(&mut self) -> Result<(), VoiceAudioError> {
        let mailbox = self.input_mailbox("capture_stop")?;
        if !self.input.capture_active {
            return Err(VoiceAudioError::state("capture_stop", "idle"));
        }
        mailbox.request(|ack| EngineMessage::CaptureStop { ack }).await?;
        self.input.capture_active = false;
        Ok(())
    }

    /// Stops every microphone session and closes the microphone.
    pub(super) async fn input_shutdown(&mut self, mailbox: &Mailbox) {
        for slot in 0..SessionGroup::QTY {
            let state = self.input.states[slot];
            if state == InputState::Detecting {
                log_failure("detect stop", mailbox.request(|ack| EngineMessage::DetectStop { ack }).await);
            }
            if state.is_active() {
                let source = self.input.sources[slot];
                log_failure(
                    "record stop",
                    mailbox
                        .request(|ack| EngineMessage::RecordStop {
                            source,
                            index: None,
                            ack,
                        })
                        .await,
                );
            }
        }
        if self.input.capture_active {
            log_failure("capture stop", mailbox.request(|ack| EngineMessage::CaptureStop { ack }).await);
        }
        if self.input.intensity_name.is_some() {
            log_failure(
                "sound intensity close",
                mailbox
                    .send(EngineMessage::SoundIntensity {
                        target: IntensityTarget::Input,
                        fifo: None,
                    })
                    .await,
            );
        }
        if !self.input.devices.local().is_none() {
            log_failure("record idle stop", mailbox.request(|ack| EngineMessage::RecordIdleStop { ack }).await);
        }
        self.input.closed();
    }
}

fn sink_destination(sink: Box<dyn RecordSink>, window: RecordWindow) -> Destination {
    Destination::Sink {
        sink,
        from: window.from,
        offset: window.offset,
        until: window.until,
    }
}

pub(super) fn log_failure(operation: &str, result: Result<(), VoiceAudioError>) {
    if let Err(e) = result {
        tracing::warn!(operation, error = %e, "shutdown step failed");
    }
}

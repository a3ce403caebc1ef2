//! Typed engine messages and the bounded mailbox that carries them.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::device::InputDevices;
use crate::event::{
    AudioInCallback, AudioInDataCallback, AudioInEvent, AudioOutCallback, AudioOutDataCallback,
    AudioOutEvent, KeywordCallback, StatisticsMask,
};
use crate::format::{CaptureKind, Container, InputFormat, LatencyMode, OutputFormat, RecordFrom, RecordUntil};
use crate::hal::{HalInput, HalOutput};
use crate::sink::RecordSink;
use crate::VoiceAudioError;

/// Stream options snapshotted from the client when a record/stream request is sent.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamParams {
    pub time_minimum_ms: u16,
    pub keyword_begin: u32,
    pub keyword_duration: u32,
    pub frame_group_qty: u8,
    pub identifier: Option<String>,
    pub latency: LatencyMode,
}

/// One pipe of a multi-pipe stream, each with its own window.
pub(crate) struct PipeRequest {
    pub fd: OwnedFd,
    pub from: RecordFrom,
    pub offset: i32,
    pub until: RecordUntil,
}

pub(crate) enum Destination {
    /// A single sink (file, memory, user or caller-provided) with one window.
    Sink {
        sink: Box<dyn RecordSink>,
        from: RecordFrom,
        offset: i32,
        until: RecordUntil,
    },
    /// Up to [`PIPE_QTY_MAX`](crate::engine::PIPE_QTY_MAX) pipes, registered on the engine
    /// runtime when the request is accepted.
    Pipes(Vec<PipeRequest>),
}

pub(crate) struct RecordRequest {
    pub source: InputDevices,
    pub format_out: InputFormat,
    pub destination: Destination,
    pub params: StreamParams,
    pub callback: Option<AudioInCallback>,
    /// Completed with the terminal event of a synchronous session.
    pub done: Option<oneshot::Sender<AudioInEvent>>,
    /// Completed once the engine accepted (or refused) the request.
    pub accepted: oneshot::Sender<Result<(), VoiceAudioError>>,
}

pub(crate) enum PlaySource {
    /// A WAV file positioned at the start of its data chunk.
    File { reader: File, remaining: u64 },
    Memory(Vec<u8>),
    Pipe(OwnedFd),
    User(AudioOutDataCallback),
}

pub(crate) struct PlayRequest {
    pub source: PlaySource,
    pub callback: Option<AudioOutCallback>,
    pub done: Option<oneshot::Sender<AudioOutEvent>>,
    pub accepted: oneshot::Sender<Result<(), VoiceAudioError>>,
}

/// Which pipeline a sound intensity fifo belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IntensityTarget {
    Input,
    Output,
}

pub(crate) enum EngineMessage {
    RecordIdleStart {
        input: Box<dyn HalInput>,
        devices: InputDevices,
        hal_name: String,
        ack: oneshot::Sender<()>,
    },
    RecordIdleStop {
        ack: oneshot::Sender<()>,
    },
    RecordStart(Box<RecordRequest>),
    RecordStop {
        source: InputDevices,
        index: Option<usize>,
        ack: oneshot::Sender<()>,
    },
    Detect {
        callback: KeywordCallback,
        sensitivity: f32,
        ack: oneshot::Sender<()>,
    },
    DetectParams {
        sensitivity: f32,
    },
    DetectStop {
        ack: oneshot::Sender<()>,
    },
    DetectSensitivityLimits {
        reply: oneshot::Sender<(f32, f32)>,
    },
    SoundIntensity {
        target: IntensityTarget,
        fifo: Option<File>,
    },
    CaptureStart {
        kind: CaptureKind,
        container: Container,
        prefix: PathBuf,
        raw_mic: bool,
        reply: oneshot::Sender<Result<(), VoiceAudioError>>,
    },
    CaptureStop {
        ack: oneshot::Sender<()>,
    },
    StatisticsClear {
        mask: StatisticsMask,
    },
    StatisticsPrint {
        mask: StatisticsMask,
    },
    ThreadPoll {
        callback: Box<dyn FnOnce() + Send>,
    },
    PlayIdle {
        output: Box<dyn HalOutput>,
        format: OutputFormat,
        hal_volume_control: bool,
        ack: oneshot::Sender<()>,
    },
    PlayIdleStop {
        ack: oneshot::Sender<()>,
    },
    PlayStart(Box<PlayRequest>),
    PlayPause {
        ack: oneshot::Sender<()>,
    },
    PlayResume {
        ack: oneshot::Sender<()>,
    },
    PlayStop {
        ack: oneshot::Sender<()>,
    },
    VolumeSet {
        step: i8,
        ramp: bool,
        bumper: bool,
    },
    VolumeConfig {
        max: i8,
        min: i8,
        step_db: f32,
        use_ext_gain: bool,
    },
    Terminate {
        ack: oneshot::Sender<()>,
    },
}

impl EngineMessage {
    /// Short name for logging.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::RecordIdleStart { .. } => "record_idle_start",
            Self::RecordIdleStop { .. } => "record_idle_stop",
            Self::RecordStart(_) => "record_start",
            Self::RecordStop { .. } => "record_stop",
            Self::Detect { .. } => "detect",
            Self::DetectParams { .. } => "detect_params",
            Self::DetectStop { .. } => "detect_stop",
            Self::DetectSensitivityLimits { .. } => "detect_sensitivity_limits",
            Self::SoundIntensity { .. } => "sound_intensity",
            Self::CaptureStart { .. } => "capture_start",
            Self::CaptureStop { .. } => "capture_stop",
            Self::StatisticsClear { .. } => "statistics_clear",
            Self::StatisticsPrint { .. } => "statistics_print",
            Self::ThreadPoll { .. } => "thread_poll",
            Self::PlayIdle { .. } => "play_idle",
            Self::PlayIdleStop { .. } => "play_idle_stop",
            Self::PlayStart(_) => "play_start",
            Self::PlayPause { .. } => "play_pause",
            Self::PlayResume { .. } => "play_resume",
            Self::PlayStop { .. } => "play_stop",
            Self::VolumeSet { .. } => "volume_set",
            Self::VolumeConfig { .. } => "volume_config",
            Self::Terminate { .. } => "terminate",
        }
    }
}

/// Producer side of the engine mailbox.
///
/// Every client call enqueues exactly one message and, when it needs a result, waits on a
/// private oneshot that the engine completes.
#[derive(Clone)]
pub(crate) struct Mailbox {
    tx: mpsc::Sender<EngineMessage>,
}

impl Mailbox {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueues a message, waiting for room if the engine is behind.
    pub(crate) async fn send(&self, msg: EngineMessage) -> Result<(), VoiceAudioError> {
        let name = msg.name();
        tracing::trace!(msg = name, "mailbox push");
        self.tx
            .send(msg)
            .await
            .map_err(|_| VoiceAudioError::internal(format!("engine mailbox closed ({name})")))
    }

    /// Enqueues without waiting; used from `Drop`.
    pub(crate) fn try_send(&self, msg: EngineMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Sends a message built around a fresh oneshot and waits for the engine's answer.
    pub(crate) async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineMessage,
    ) -> Result<T, VoiceAudioError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await
            .map_err(|_| VoiceAudioError::internal("engine dropped the request"))
    }
}

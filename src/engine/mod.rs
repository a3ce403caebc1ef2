//! The audio engine thread.
//!
//! All frame work happens on one dedicated thread running a single-threaded Tokio
//! runtime. Client calls arrive as [`EngineMessage`]s on a bounded mailbox; the loop
//! selects between the next message and the next frame deadline:
//!
//! ```text
//!   client calls ──► Mailbox ──► ┌──────────────────────────────┐
//!                                │ Engine::run (select! loop)    │
//!   HAL mic  ──read every 20 ms─►│   InputEngine  ─► sinks       │
//!   HAL spk  ◄─write every 20 ms─│   OutputEngine ◄─ play source │
//!                                └──────────────────────────────┘
//! ```
//!
//! Capture and playback share one frame tick while either is active. Each tick is
//! rescheduled one frame period after its previous deadline, or immediately when that
//! deadline has already passed.

pub(crate) mod capture;
pub(crate) mod input;
pub(crate) mod keyword;
pub(crate) mod mailbox;
pub(crate) mod output;
pub(crate) mod timer;
pub(crate) mod volume;

use std::fs::File;
use std::io::{self, Write};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::dsp::DspSuite;
use crate::format::FRAME_PERIOD_MS;
use crate::registry::VoiceSessionRegistry;
use crate::VoiceAudioError;

use input::InputEngine;
use mailbox::{EngineMessage, IntensityTarget, Mailbox};
use output::OutputEngine;

/// Most pipes a single stream may feed.
pub(crate) const PIPE_QTY_MAX: usize = 3;

const FRAME_PERIOD: Duration = Duration::from_millis(FRAME_PERIOD_MS as u64);

/// Ticks firing later than this are counted in the timing statistics.
const LATE_THRESHOLD: Duration = Duration::from_millis(5);

/// Writes one sound intensity record (`u16` level, `u16` direction) to a fifo.
///
/// A full fifo drops the record; any other failure closes the fifo.
pub(crate) fn write_intensity(fifo: &mut Option<File>, level: u8, direction: u16) {
    let Some(file) = fifo.as_mut() else {
        return;
    };
    let mut record = [0u8; 4];
    record[..2].copy_from_slice(&u16::from(level).to_ne_bytes());
    record[2..].copy_from_slice(&direction.to_ne_bytes());
    match file.write(&record) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => {
            tracing::warn!(error = %e, "sound intensity fifo closed");
            *fifo = None;
        }
    }
}

/// Next deadline of a periodic tick.
fn next_deadline(previous: Instant, now: Instant) -> Instant {
    let next = previous + FRAME_PERIOD;
    if next <= now {
        now
    } else {
        next
    }
}

pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Engine {
    dsp: DspSuite,
    input: InputEngine,
    output: OutputEngine,
    /// Deadline of the frame tick, set while either side has work.
    frame_at: Option<Instant>,
}

impl Engine {
    fn new(config: &EngineConfig, dsp: DspSuite, registry: VoiceSessionRegistry) -> Self {
        Self {
            dsp,
            input: InputEngine::new(config, registry),
            output: OutputEngine::new(&config.output),
            frame_at: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EngineMessage>) -> DspSuite {
        tracing::debug!("engine started");
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(EngineMessage::Terminate { ack }) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(msg) => {
                        self.handle(msg).await;
                        self.sync_ticks();
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                () = wait_until(self.frame_at) => self.on_frame().await,
            }
        }
        tracing::debug!("engine stopped");
        self.dsp
    }

    fn needs_ticks(&self) -> bool {
        self.input.is_open() || self.output.is_playing()
    }

    /// One frame for every side that is active. Either side ending its work leaves the
    /// timer running for the other.
    async fn on_frame(&mut self) {
        let Some(deadline) = self.frame_at.take() else {
            return;
        };
        let late = Instant::now().saturating_duration_since(deadline);
        let (capture, playback) = (self.input.is_open(), self.output.is_playing());
        if late > LATE_THRESHOLD {
            if capture {
                self.input.note_lateness(late);
            }
            if playback {
                self.output.note_lateness(late);
            }
        }
        if capture && !self.input.tick(&mut self.dsp).await {
            tracing::debug!("microphone stopped ticking");
        }
        if playback && !self.output.tick(&mut self.dsp) {
            tracing::debug!("playback stopped ticking");
        }
        if self.needs_ticks() {
            self.frame_at = Some(next_deadline(deadline, Instant::now()));
        }
    }

    /// Starts or cancels the frame tick to match what the pipelines need.
    fn sync_ticks(&mut self) {
        match (self.needs_ticks(), self.frame_at) {
            (true, None) => self.frame_at = Some(Instant::now() + FRAME_PERIOD),
            (false, Some(_)) => self.frame_at = None,
            _ => {}
        }
    }

    async fn handle(&mut self, msg: EngineMessage) {
        tracing::trace!(msg = msg.name(), "engine message");
        match msg {
            EngineMessage::RecordIdleStart {
                input,
                devices,
                hal_name,
                ack,
            } => {
                self.input.idle_start(input, devices, hal_name, &mut self.dsp);
                let _ = ack.send(());
            }
            EngineMessage::RecordIdleStop { ack } => {
                self.input.idle_stop().await;
                let _ = ack.send(());
            }
            EngineMessage::RecordStart(request) => self.input.record_start(*request).await,
            EngineMessage::RecordStop { source, index, ack } => {
                self.input.record_stop(source, index).await;
                let _ = ack.send(());
            }
            EngineMessage::Detect {
                callback,
                sensitivity,
                ack,
            } => {
                self.input.detect(callback, sensitivity, &mut self.dsp);
                let _ = ack.send(());
            }
            EngineMessage::DetectParams { sensitivity } => {
                self.input.detect_params(sensitivity, &mut self.dsp);
            }
            EngineMessage::DetectStop { ack } => {
                self.input.detect_stop(&mut self.dsp);
                let _ = ack.send(());
            }
            EngineMessage::DetectSensitivityLimits { reply } => {
                let _ = reply.send(self.dsp.keyword.sensitivity_limits());
            }
            EngineMessage::SoundIntensity { target, fifo } => match target {
                IntensityTarget::Input => self.input.set_intensity_fifo(fifo),
                IntensityTarget::Output => self.output.set_intensity_fifo(fifo),
            },
            EngineMessage::CaptureStart {
                kind,
                container,
                prefix,
                raw_mic,
                reply,
            } => {
                let _ = reply.send(self.input.capture_start(kind, container, &prefix, raw_mic));
            }
            EngineMessage::CaptureStop { ack } => {
                self.input.capture_stop();
                let _ = ack.send(());
            }
            EngineMessage::StatisticsClear { mask } => {
                self.input.statistics_clear(mask);
                self.output.statistics_clear(mask);
            }
            EngineMessage::StatisticsPrint { mask } => {
                self.input.statistics_print(mask);
                self.output.statistics_print(mask);
            }
            EngineMessage::ThreadPoll { callback } => callback(),
            EngineMessage::PlayIdle {
                output,
                format,
                hal_volume_control,
                ack,
            } => {
                self.output.idle_start(output, format, hal_volume_control);
                let _ = ack.send(());
            }
            EngineMessage::PlayIdleStop { ack } => {
                self.output.idle_stop();
                let _ = ack.send(());
            }
            EngineMessage::PlayStart(request) => self.output.play_start(*request, &mut self.dsp),
            EngineMessage::PlayPause { ack } => {
                self.output.pause();
                let _ = ack.send(());
            }
            EngineMessage::PlayResume { ack } => {
                self.output.resume();
                let _ = ack.send(());
            }
            EngineMessage::PlayStop { ack } => {
                self.output.stop();
                let _ = ack.send(());
            }
            EngineMessage::VolumeSet { step, ramp, bumper } => self.output.volume_set(step, ramp, bumper),
            EngineMessage::VolumeConfig {
                max,
                min,
                step_db,
                use_ext_gain,
            } => self.output.volume_config(max, min, step_db, use_ext_gain),
            EngineMessage::Terminate { ack } => {
                // Intercepted by `run`.
                let _ = ack.send(());
            }
        }
    }

    async fn shutdown(&mut self) {
        self.input.idle_stop().await;
        self.output.idle_stop();
        self.sync_ticks();
    }
}

/// Owner of the engine thread.
///
/// Dropping the handle asks the engine to terminate without waiting for it; prefer
/// [`terminate`](Self::terminate), which also hands the processing suite back.
pub(crate) struct EngineHandle {
    mailbox: Mailbox,
    thread: Option<JoinHandle<DspSuite>>,
}

impl EngineHandle {
    pub(crate) fn spawn(
        config: &EngineConfig,
        dsp: DspSuite,
        registry: VoiceSessionRegistry,
    ) -> Result<Self, VoiceAudioError> {
        let (mailbox, rx) = Mailbox::channel(config.resource.mailbox_capacity);
        let engine = Engine::new(config, dsp, registry);
        let thread = std::thread::Builder::new()
            .name("voice-engine".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime.block_on(engine.run(rx)),
                    Err(e) => {
                        tracing::error!(error = %e, "engine runtime could not be built");
                        engine.dsp
                    }
                }
            })
            .map_err(|e| VoiceAudioError::internal(format!("engine thread: {e}")))?;
        Ok(Self {
            mailbox,
            thread: Some(thread),
        })
    }

    pub(crate) fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Stops the engine and waits for its thread.
    pub(crate) async fn terminate(mut self) -> Result<DspSuite, VoiceAudioError> {
        self.mailbox.request(|ack| EngineMessage::Terminate { ack }).await?;
        let thread = self
            .thread
            .take()
            .ok_or_else(|| VoiceAudioError::internal("engine already joined"))?;
        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| VoiceAudioError::internal(format!("engine join: {e}")))?
            .map_err(|_| VoiceAudioError::internal("engine thread panicked"))
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let (ack, _) = oneshot::channel();
            let _ = self.mailbox.try_send(EngineMessage::Terminate { ack });
        }
    }
}

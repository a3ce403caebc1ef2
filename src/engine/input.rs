//! Microphone side of the engine: one frame per tick through pre-processing,
//! end-of-speech, destinations, keyword election and sound intensity.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::{DspConfig, EngineConfig, InputConfig};
use crate::device::InputDevices;
use crate::dsp::{DspSuite, DynamicGain, EosEvent, FocusMode};
use crate::engine::capture::{CaptureSession, InternalCapture};
use crate::engine::keyword::{ElectionParams, KeywordElection, KeywordStep};
use crate::engine::mailbox::{Destination, RecordRequest};
use crate::engine::write_intensity;
use crate::event::{AudioInCallback, AudioInEvent, AudioStats, KeywordCallback, KeywordEvent, StatisticsMask};
use crate::format::{convert, CaptureKind, Container, Encoding, InputFormat, LatencyMode, RecordFrom, RecordUntil};
use crate::frame::MicFrame;
use crate::hal::HalInput;
use crate::registry::{SessionGroup, VoiceSessionRegistry};
use crate::sink::{PipeSink, RecordSink};
use crate::{SinkError, VoiceAudioError};

/// Frames dropped at the start of a raw microphone session while the hardware switches
/// into test mode.
const RAW_MIC_FRAME_SKIP: u32 = 3;

/// Mic tap sessions stream the center microphone of the array.
const MIC_TAP_CHAN: usize = 1;

/// Samples of array audio per sound focus update, in milliseconds.
const SOUND_FOCUS_PERIOD_MS: u32 = 100;

struct Output {
    sink: Box<dyn RecordSink>,
    until: RecordUntil,
    pre_roll: Vec<u8>,
}

/// Why a session ended on the engine's initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Speech(EosEvent),
    EndOfBuffer,
    Error,
}

/// One active record or stream session.
struct RecordSession {
    source: InputDevices,
    format_out: InputFormat,
    outputs: Vec<Option<Output>>,
    until_speech: bool,
    frame_group_qty: u8,
    pending: Vec<u8>,
    pending_frames: u8,
    stats: AudioStats,
    time_minimum_samples: u32,
    keyword_end_samples: u32,
    keyword_flush: bool,
    raw_mic_frame_skip: u32,
    latency: LatencyMode,
    callback: Option<AudioInCallback>,
    done: Option<oneshot::Sender<AudioInEvent>>,
    first_frame: bool,
}

impl RecordSession {
    fn emit(&self, event: AudioInEvent) {
        if let Some(callback) = &self.callback {
            callback(self.source, event);
        }
    }

    fn is_raw(&self) -> bool {
        self.format_out.encoding == Encoding::PcmRaw
    }

    fn is_wide(&self) -> bool {
        !self.is_raw() && self.format_out.sample_size == 4
    }

    fn has_outputs(&self) -> bool {
        self.outputs.iter().any(Option::is_some)
    }

    /// Bytes delivered for this frame, or `None` while raw frames are being skipped.
    ///
    /// 32-bit destinations get the hardware's 32-bit samples when it delivers them and
    /// widened 16-bit samples otherwise, interleaved across `format_out.channel_qty`.
    fn payload(
        &mut self,
        frame: &MicFrame,
        raw: &[u8],
        chan: usize,
        dga: Option<&mut (dyn DynamicGain + 'static)>,
    ) -> Option<Vec<u8>> {
        if self.is_raw() {
            if self.raw_mic_frame_skip > 0 {
                self.raw_mic_frame_skip -= 1;
                return None;
            }
            return Some(raw.to_vec());
        }
        if self.is_wide() {
            let chan_qty = usize::from(self.format_out.channel_qty.max(1));
            if chan_qty > 1 {
                if frame.chans_i32.len() == chan_qty {
                    return Some(raw.to_vec());
                }
                let widened: Vec<Vec<i32>> = frame
                    .chans_i16
                    .iter()
                    .take(chan_qty)
                    .map(|c| convert::widen_i16(c))
                    .collect();
                let refs: Vec<&[i32]> = widened.iter().map(Vec::as_slice).collect();
                return Some(convert::pack_i32(&refs));
            }
            if let Some(samples) = frame.chans_i32.get(chan) {
                return Some(convert::pack_i32(&[samples]));
            }
            let widened = frame.chans_i16.get(chan).map(|c| convert::widen_i16(c)).unwrap_or_default();
            return Some(convert::pack_i32(&[&widened]));
        }
        let mut samples = frame.chans_i16.get(chan).cloned().unwrap_or_default();
        if let Some(dga) = dga {
            dga.apply(&mut samples);
        }
        Some(convert::i16_to_le_bytes(&samples))
    }
}

async fn finish_output(output: &mut Output) {
    if let Err(e) = output.sink.finish().await {
        tracing::warn!(sink = output.sink.name(), error = %e, "destination finish failed");
    }
}

async fn finish_outputs(session: &mut RecordSession) {
    let pending = session
        .outputs
        .iter_mut()
        .filter_map(Option::as_mut)
        .map(finish_output);
    futures::future::join_all(pending).await;
    session.outputs.clear();
}

enum Delivery {
    Written,
    Full,
    Overflow,
    Failed(SinkError),
}

async fn deliver(output: &mut Output, data: &[u8]) -> Delivery {
    match output.sink.write(data).await {
        Ok(n) if n < data.len() => Delivery::Full,
        Ok(_) => Delivery::Written,
        Err(SinkError::WouldBlock) => Delivery::Overflow,
        Err(e) => Delivery::Failed(e),
    }
}

/// Writes the pending frame group to every output of `session`.
async fn flush(
    session: &mut RecordSession,
    capture: &mut Option<CaptureSession>,
    internal: Option<&mut InternalCapture>,
) -> Option<SessionEnd> {
    if session.pending.is_empty() {
        return None;
    }
    let data = std::mem::take(&mut session.pending);
    let frames = std::mem::take(&mut session.pending_frames);
    let keyword_flush = std::mem::take(&mut session.keyword_flush);
    let lead: Vec<u8> = session
        .outputs
        .iter()
        .flatten()
        .next()
        .map(|o| o.pre_roll.clone())
        .unwrap_or_default();

    let callback = session.callback.clone();
    let source = session.source;
    let mut failed = false;
    let mut full = false;

    for (index, slot) in session.outputs.iter_mut().enumerate() {
        let Some(output) = slot.as_mut() else {
            continue;
        };
        let mut result = Delivery::Written;
        if !output.pre_roll.is_empty() {
            let pre_roll = std::mem::take(&mut output.pre_roll);
            result = deliver(output, &pre_roll).await;
        }
        if matches!(result, Delivery::Written) {
            result = deliver(output, &data).await;
        }

        let close = match result {
            Delivery::Written => keyword_flush && output.until == RecordUntil::EndOfKeyword,
            Delivery::Full => {
                tracing::info!(index, sink = output.sink.name(), "destination full");
                full = true;
                true
            }
            Delivery::Overflow => {
                tracing::debug!(index, frames, "destination overflow, frame group dropped");
                session.stats.packets_lost += 1;
                if let Some(callback) = &callback {
                    callback(source, AudioInEvent::Overflow);
                }
                false
            }
            Delivery::Failed(e) => {
                tracing::error!(index, sink = output.sink.name(), error = %e, "destination write failed");
                failed = true;
                true
            }
        };
        if close {
            finish_output(output).await;
            *slot = None;
        }
    }

    if !session.is_raw() && !session.is_wide() {
        let mut samples = convert::le_bytes_to_i16(&lead);
        samples.extend(convert::le_bytes_to_i16(&data));
        if let Some(active) = capture.as_mut() {
            if let Err(e) = active.on_output(&samples) {
                tracing::warn!(error = %e, "capture stopped");
                *capture = None;
            }
        }
        if let Some(internal) = internal {
            if let Err(e) = internal.write(&samples) {
                tracing::warn!(error = %e, "internal capture write failed");
            }
        }
    }

    if failed {
        Some(SessionEnd::Error)
    } else if full && !session.has_outputs() {
        Some(SessionEnd::EndOfBuffer)
    } else {
        None
    }
}

#[derive(Debug, Default)]
struct InputCounters {
    frames: u64,
    read_errors: u64,
    sessions: u64,
    detections: u64,
    ticks_late: u64,
    late_max: Duration,
}

pub(crate) struct InputEngine {
    input_config: InputConfig,
    dsp_config: DspConfig,
    registry: VoiceSessionRegistry,
    hal: Option<Box<dyn HalInput>>,
    hal_name: String,
    devices: InputDevices,
    format_in: InputFormat,
    frame_buf: Vec<u8>,
    frame_index: u64,
    election: KeywordElection,
    sessions: [Option<RecordSession>; SessionGroup::QTY],
    dynamic_gain_set: bool,
    focus_samples: u32,
    intensity: Option<File>,
    capture: Option<CaptureSession>,
    capture_raw_mic: bool,
    internal: InternalCapture,
    counters: InputCounters,
}

impl InputEngine {
    pub(crate) fn new(config: &EngineConfig, registry: VoiceSessionRegistry) -> Self {
        Self {
            input_config: config.input.clone(),
            dsp_config: config.dsp.clone(),
            registry,
            hal: None,
            hal_name: String::new(),
            devices: InputDevices::NONE,
            format_in: InputFormat::default(),
            frame_buf: Vec::new(),
            frame_index: 0,
            election: KeywordElection::new(config.input.pre_detection_ms),
            sessions: [None, None],
            dynamic_gain_set: false,
            focus_samples: 0,
            intensity: None,
            capture: None,
            capture_raw_mic: false,
            internal: InternalCapture::new(config.internal_capture.clone()),
            counters: InputCounters::default(),
        }
    }

    /// True while the microphone is open and frames are being read.
    pub(crate) fn is_open(&self) -> bool {
        self.hal.is_some()
    }

    /// Takes ownership of an opened microphone and starts pre-detection buffering.
    pub(crate) fn idle_start(
        &mut self,
        input: Box<dyn HalInput>,
        devices: InputDevices,
        hal_name: String,
        dsp: &mut DspSuite,
    ) {
        self.format_in = input.format();
        self.frame_buf = vec![0; self.format_in.frame_bytes()];
        self.frame_index = 0;
        self.devices = devices;
        self.hal_name = hal_name;
        self.hal = Some(input);
        self.focus_samples = 0;
        dsp.sdf.set_mode(FocusMode::StrongestSector);
        self.election.session_init(
            usize::from(self.format_in.channel_qty.max(1)),
            dsp.keyword.as_mut(),
            self.input_config.default_sensitivity,
        );
        tracing::info!(devices = ?devices, format = ?self.format_in, "microphone idle");
    }

    /// Ends every session and releases the microphone.
    pub(crate) async fn idle_stop(&mut self) {
        for slot in 0..SessionGroup::QTY {
            if let Some(mut session) = self.sessions[slot].take() {
                finish_outputs(&mut session).await;
                self.complete(slot, session, AudioInEvent::Ok);
            }
        }
        self.close_capture();
        self.election.session_term();
        self.hal = None;
        tracing::info!("microphone released");
    }

    fn chan_sample_qty(&self) -> usize {
        MicFrame::nominal_samples(self.format_in.sample_rate)
    }

    /// Channel delivered to `source`: channel 0 when reserved for ASR, otherwise the
    /// channel elected by the keyword detector.
    fn session_chan(&self, source: InputDevices) -> usize {
        let chan_qty = usize::from(self.format_in.channel_qty.max(1));
        if source == InputDevices::MIC_TAP {
            MIC_TAP_CHAN.min(chan_qty - 1)
        } else if self.dsp_config.input_asr_max_channel_qty == 0 {
            self.election.active_chan()
        } else {
            0
        }
    }

    fn election_params(&self) -> ElectionParams {
        let first_chan = usize::from(self.dsp_config.input_asr_max_channel_qty);
        let kwd = usize::from(self.dsp_config.input_kwd_max_channel_qty.max(1));
        ElectionParams {
            first_chan,
            last_chan: first_chan + kwd - 1,
            trigger_wait_frames: self.input_config.trigger_wait_frames,
            score_epsilon: self.input_config.score_epsilon,
            extended_wake_word_end: self.input_config.extended_wake_word_end,
            eos_enabled: self.dsp_config.eos_enabled,
        }
    }

    pub(crate) async fn record_start(&mut self, request: RecordRequest) {
        let RecordRequest {
            source,
            format_out,
            destination,
            params,
            callback,
            done,
            accepted,
        } = request;

        let Some(hal) = self.hal.as_ref() else {
            let _ = accepted.send(Err(VoiceAudioError::input("microphone is not open")));
            return;
        };
        let slot = SessionGroup::for_source(source).index();
        if self.sessions[slot].is_some() {
            let _ = accepted.send(Err(VoiceAudioError::state("record_start", "session active")));
            return;
        }
        let hal_format = hal.format();

        let windows = match destination {
            Destination::Sink {
                sink,
                from,
                offset,
                until,
            } => vec![(sink, from, offset, until)],
            Destination::Pipes(pipes) => {
                let mut windows = Vec::with_capacity(pipes.len());
                for (index, pipe) in pipes.into_iter().enumerate() {
                    match PipeSink::from_fd(pipe.fd) {
                        Ok(sink) => {
                            let sink: Box<dyn RecordSink> = Box::new(sink.with_name(format!("pipe{index}")));
                            windows.push((sink, pipe.from, pipe.offset, pipe.until));
                        }
                        Err(source) => {
                            let _ = accepted.send(Err(VoiceAudioError::FifoControl { source }));
                            return;
                        }
                    }
                }
                windows
            }
        };

        let chan = self.session_chan(source);
        let chan_samples = self.chan_sample_qty();
        let unbuffered = format_out.encoding == Encoding::PcmRaw || format_out.sample_size == 4;
        let mut stats = AudioStats::default();
        let mut first_from = RecordFrom::Live;
        let mut until_speech = false;
        let mut outputs = Vec::with_capacity(windows.len());

        for (index, (sink, from, offset, until)) in windows.into_iter().enumerate() {
            let qty = if unbuffered {
                0
            } else {
                self.election.pre_roll_qty(from, offset, chan_samples)
            };
            let pre_roll = if qty > 0 {
                convert::i16_to_le_bytes(&self.election.pre_detection_samples(chan, qty, 0))
            } else {
                Vec::new()
            };
            if index == 0 {
                first_from = from;
                until_speech = until == RecordUntil::EndOfSpeech;
                if qty > 0 {
                    stats.packets_processed = 1;
                    stats.samples_processed = qty as u32;
                }
            }
            tracing::debug!(index, ?from, offset, ?until, pre_roll = qty, sink = sink.name(), "destination opened");
            outputs.push(Some(Output { sink, until, pre_roll }));
        }

        let Some(hal) = self.hal.as_mut() else {
            return;
        };
        if first_from == RecordFrom::KeywordBegin {
            let begin = self.election.endpoints().begin.unsigned_abs();
            if !hal.stream_start_set(begin) {
                let _ = accepted.send(Err(VoiceAudioError::input("stream start rejected by hardware")));
                return;
            }
        }
        if format_out.encoding == Encoding::PcmRaw && !hal.test_mode(true) {
            tracing::warn!("hardware refused raw microphone mode");
        }
        if params.latency == LatencyMode::Low && !hal.latency_set(LatencyMode::Low) {
            tracing::warn!("hardware refused low latency mode");
        }
        if source != InputDevices::MIC_TAP {
            self.election.disarm();
        }
        if slot == 0 && self.internal.is_enabled() {
            if let Err(e) = self.internal.begin(params.identifier.as_deref()) {
                tracing::warn!(error = %e, "internal capture not started");
            }
        }

        let frame_group_qty = if params.latency == LatencyMode::Low {
            1
        } else if params.frame_group_qty == 0 {
            self.input_config.frame_group_qty.max(1)
        } else {
            params.frame_group_qty
        };
        let keyword_end_samples = if params.keyword_duration == 0 {
            0
        } else {
            params.keyword_begin + params.keyword_duration
        };
        let samples_per_ms = hal_format.sample_rate / 1000;

        tracing::info!(
            source = ?source,
            format = ?format_out,
            outputs = outputs.len(),
            frame_group_qty,
            sync = done.is_some(),
            "record session started"
        );
        self.counters.sessions += 1;
        self.sessions[slot] = Some(RecordSession {
            source,
            format_out,
            outputs,
            until_speech,
            frame_group_qty,
            pending: Vec::new(),
            pending_frames: 0,
            stats,
            time_minimum_samples: u32::from(params.time_minimum_ms) * samples_per_ms,
            keyword_end_samples,
            keyword_flush: false,
            raw_mic_frame_skip: if format_out.encoding == Encoding::PcmRaw {
                RAW_MIC_FRAME_SKIP
            } else {
                0
            },
            latency: params.latency,
            callback,
            done,
            first_frame: true,
        });
        let _ = accepted.send(Ok(()));
    }

    /// Stops one destination (`index`) or the whole session of `source`.
    pub(crate) async fn record_stop(&mut self, source: InputDevices, index: Option<usize>) {
        let slot = SessionGroup::for_source(source).index();
        if let (Some(index), Some(session)) = (index, self.sessions[slot].as_mut()) {
            if let Some(mut output) = session.outputs.get_mut(index).and_then(Option::take) {
                finish_output(&mut output).await;
                tracing::debug!(index, "destination stopped");
            }
            if session.has_outputs() {
                return;
            }
        }

        if let Some(mut session) = self.sessions[slot].take() {
            let internal = (slot == 0).then_some(&mut self.internal);
            let _ = flush(&mut session, &mut self.capture, internal).await;
            finish_outputs(&mut session).await;
            tracing::info!(stats = ?session.stats, "record session stopped");
            self.complete(slot, session, AudioInEvent::Ok);
        }
        self.registry.unlock(source);
    }

    /// Delivers the terminal event and puts the hardware back in its idle configuration.
    fn complete(&mut self, slot: usize, mut session: RecordSession, event: AudioInEvent) {
        if let Some(done) = session.done.take() {
            let _ = done.send(event);
        } else if event != AudioInEvent::Ok {
            session.emit(event);
        }
        if let Some(hal) = self.hal.as_mut() {
            if session.is_raw() && !self.capture_raw_mic {
                hal.test_mode(false);
            }
            if session.latency == LatencyMode::Low {
                hal.latency_set(LatencyMode::Normal);
            }
        }
        if slot == 0 {
            if let Err(e) = self.internal.end() {
                tracing::warn!(error = %e, "internal capture not closed");
            }
        }
    }

    async fn end_session(&mut self, slot: usize, reason: SessionEnd) {
        let Some(mut session) = self.sessions[slot].take() else {
            return;
        };
        if reason != SessionEnd::Error {
            let internal = (slot == 0).then_some(&mut self.internal);
            let _ = flush(&mut session, &mut self.capture, internal).await;
        }
        finish_outputs(&mut session).await;
        if let Some(hal) = self.hal.as_ref() {
            let hal_stats = hal.stats();
            session.stats.samples_lost += hal_stats.samples_lost;
            session.stats.samples_buffered_max = hal_stats.samples_buffered_max;
        }
        let stats = session.stats;
        let event = match reason {
            SessionEnd::Speech(EosEvent::TimeoutInitial) => AudioInEvent::EosTimeoutInitial(stats),
            SessionEnd::Speech(EosEvent::TimeoutEnd) => AudioInEvent::EosTimeoutEnd(stats),
            SessionEnd::Speech(_) => AudioInEvent::Eos(stats),
            SessionEnd::EndOfBuffer => AudioInEvent::EndOfBuffer,
            SessionEnd::Error => AudioInEvent::Error,
        };
        tracing::info!(?event, "record session ended");
        self.complete(slot, session, event);
    }

    /// Reads and processes one frame. Returns `false` once the microphone failed and
    /// ticking must stop.
    pub(crate) async fn tick(&mut self, dsp: &mut DspSuite) -> bool {
        let Some(hal) = self.hal.as_mut() else {
            return false;
        };
        match hal.read(&mut self.frame_buf) {
            Ok(n) if n == self.frame_buf.len() => {}
            Ok(n) => {
                tracing::error!(read = n, expected = self.frame_buf.len(), "short microphone read");
                self.mic_error().await;
                return false;
            }
            Err(e) => {
                tracing::error!(error = %e, "microphone read failed");
                self.mic_error().await;
                return false;
            }
        }

        let format = self.format_in;
        let mut frame = MicFrame::unpack(
            &self.frame_buf,
            format.sample_size,
            format.channel_qty,
            format.sample_rate,
            self.frame_index,
        );
        self.frame_index += 1;
        self.counters.frames += 1;

        for session in self.sessions.iter_mut().flatten() {
            if session.first_frame {
                session.first_frame = false;
                session.emit(AudioInEvent::FirstFrame);
            }
        }

        let active = self.session_chan(self.devices);
        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.on_frame(&frame, active) {
                tracing::warn!(error = %e, "capture stopped");
                self.capture = None;
            }
        }

        if self.dsp_config.ppr_enabled {
            dsp.ppr.run(&mut frame.chans_f32);
            frame.resync_i16();
        }

        let mut eos_event = EosEvent::None;
        for (chan, samples) in frame.chans_f32.iter().enumerate() {
            let event = dsp.eos.run(chan, samples);
            if chan == active {
                eos_event = event;
            }
        }
        if eos_event != EosEvent::None {
            tracing::debug!(?eos_event, chan = active, "end of speech event");
        }
        self.election.track_wake_word_end(eos_event, frame.samples_per_channel());

        for slot in 0..SessionGroup::QTY {
            if let Some(reason) = self.feed_session(slot, &frame, dsp).await {
                self.end_session(slot, reason).await;
            }
        }

        let params = self.election_params();
        let step = self
            .election
            .process(&frame, dsp.keyword.as_mut(), dsp.eos.as_mut(), eos_event, &params);
        if step == KeywordStep::Commit {
            self.commit_keyword(dsp);
        }

        self.sound_focus(&frame, dsp);
        if self.intensity.is_some() {
            let chan = if self.sessions[SessionGroup::MicTap.index()].is_some() {
                self.session_chan(InputDevices::MIC_TAP)
            } else {
                active
            };
            let level = dsp.eos.signal_level(chan);
            let direction = if self.election.is_armed() || self.sessions.iter().any(Option::is_some) {
                dsp.sdf.direction()
            } else {
                0
            };
            write_intensity(&mut self.intensity, level, direction);
        }

        let speech_ended = matches!(
            eos_event,
            EosEvent::EndOfSpeech | EosEvent::TimeoutInitial | EosEvent::TimeoutEnd
        );
        if speech_ended && self.sessions[0].as_ref().is_some_and(|s| s.until_speech) {
            self.end_session(0, SessionEnd::Speech(eos_event)).await;
        }
        true
    }

    /// Feeds array frames to the sound focus stage and closes an activity period every
    /// [`SOUND_FOCUS_PERIOD_MS`]. Single microphones have no direction.
    fn sound_focus(&mut self, frame: &MicFrame, dsp: &mut DspSuite) {
        if !self.devices.contains(InputDevices::TRI | InputDevices::QUAD) {
            return;
        }
        dsp.sdf.accumulate(&frame.chans_f32);
        self.focus_samples += frame.samples_per_channel() as u32;
        let period = SOUND_FOCUS_PERIOD_MS * self.format_in.sample_rate / 1000;
        if period > 0 && self.focus_samples >= period {
            self.focus_samples -= period;
            dsp.sdf.update();
        }
    }

    async fn feed_session(&mut self, slot: usize, frame: &MicFrame, dsp: &mut DspSuite) -> Option<SessionEnd> {
        let source = self.sessions[slot].as_ref()?.source;
        let chan = self.session_chan(source);
        let apply_dga = self.dynamic_gain_set && self.dsp_config.dga_enabled;

        let Self {
            sessions,
            capture,
            internal,
            frame_buf,
            ..
        } = self;
        let session = sessions[slot].as_mut()?;
        let dga = if apply_dga {
            Some(dsp.dga.as_mut())
        } else {
            None
        };
        let payload = session.payload(frame, frame_buf, chan, dga)?;

        let chan_samples = frame.samples_per_channel() as u32;
        let before = session.stats.samples_processed;
        session.stats.packets_processed += 1;
        session.stats.samples_processed += chan_samples;
        let after = session.stats.samples_processed;

        if session.time_minimum_samples > 0 && before < session.time_minimum_samples && after >= session.time_minimum_samples {
            session.emit(AudioInEvent::StreamTimeMinimum);
        }
        if session.keyword_end_samples > 0 && before < session.keyword_end_samples && after >= session.keyword_end_samples {
            session.emit(AudioInEvent::StreamKeywordInfo {
                byte_qty: session.keyword_end_samples,
            });
            session.keyword_flush = true;
        }

        session.pending.extend_from_slice(&payload);
        session.pending_frames += 1;
        if session.pending_frames >= session.frame_group_qty || session.keyword_flush {
            let internal = (slot == 0).then_some(internal);
            return flush(session, capture, internal).await;
        }
        None
    }

    fn commit_keyword(&mut self, dsp: &mut DspSuite) {
        let chan = self.election.active_chan();
        let Some(hal) = self.hal.as_mut() else {
            return;
        };
        if hal.detection(chan) {
            tracing::info!(chan, "detection ignored by hardware, re-arming");
            self.election.rearm(dsp.keyword.as_mut());
            return;
        }

        let source = self.devices.local();
        if !self.registry.lock(source) {
            return;
        }

        if self.dsp_config.dga_enabled {
            let keyword = self.election.keyword_samples();
            dsp.dga.calculate(&keyword);
            self.dynamic_gain_set = true;
            if let Some(capture) = self.capture.as_ref() {
                if let Err(e) = capture.on_keyword(&keyword) {
                    tracing::warn!(error = %e, "keyword capture failed");
                }
            }
        }

        let result = self
            .election
            .commit(self.chan_sample_qty(), dsp.keyword.name(), &self.hal_name);
        if !self.input_config.extended_wake_word_end {
            dsp.eos.set_speech_begin();
        }
        self.counters.detections += 1;
        tracing::info!(
            chan = result.chan_selected,
            begin = result.endpoints.begin,
            end = result.endpoints.end,
            "keyword detected"
        );

        let callback = self.election.callback().cloned();
        self.election.disarm();
        dsp.sdf.set_mode(FocusMode::StrongestSector);
        if let Some(callback) = callback {
            callback(
                source,
                KeywordEvent::Detected {
                    result,
                    format: self.format_in,
                },
            );
        }
    }

    async fn mic_error(&mut self) {
        self.counters.read_errors += 1;
        let mut reported = false;
        for slot in 0..SessionGroup::QTY {
            if self.sessions[slot].is_some() {
                reported = true;
                self.end_session(slot, SessionEnd::Error).await;
            }
        }
        if !reported && self.election.is_armed() {
            if let Some(callback) = self.election.callback().cloned() {
                callback(self.devices.local(), KeywordEvent::Error);
            }
        }
        self.close_capture();
        self.election.session_term();
        self.hal = None;
    }

    pub(crate) fn detect(&mut self, callback: KeywordCallback, sensitivity: f32, dsp: &mut DspSuite) {
        if !self.election.is_session_active() {
            self.election.session_init(
                usize::from(self.format_in.channel_qty.max(1)),
                dsp.keyword.as_mut(),
                sensitivity,
            );
        }
        if let Some(hal) = self.hal.as_mut() {
            hal.keyword_detector_reset();
        }
        self.dynamic_gain_set = false;
        self.election.arm(callback, sensitivity, dsp.keyword.as_mut());
        dsp.sdf.set_mode(FocusMode::KeywordDetection);
        tracing::info!(sensitivity, "keyword detector armed");
    }

    pub(crate) fn detect_params(&mut self, sensitivity: f32, dsp: &mut DspSuite) {
        if self.election.is_armed() && (self.election.sensitivity() - sensitivity).abs() > f32::EPSILON {
            self.election.set_sensitivity(sensitivity, dsp.keyword.as_mut());
            tracing::debug!(sensitivity, "keyword sensitivity updated");
        }
    }

    pub(crate) fn detect_stop(&mut self, dsp: &mut DspSuite) {
        self.election.disarm();
        dsp.sdf.set_mode(FocusMode::StrongestSector);
        tracing::info!("keyword detector disarmed");
    }

    pub(crate) fn set_intensity_fifo(&mut self, fifo: Option<File>) {
        self.intensity = fifo;
    }

    pub(crate) fn capture_start(
        &mut self,
        kind: CaptureKind,
        container: Container,
        prefix: &Path,
        raw_mic: bool,
    ) -> Result<(), VoiceAudioError> {
        let Some(hal) = self.hal.as_mut() else {
            return Err(VoiceAudioError::capture("microphone is not open"));
        };
        if self.capture.is_some() {
            return Err(VoiceAudioError::capture("capture already active"));
        }
        let chan_qty = usize::from(self.format_in.channel_qty.max(1));
        let session = CaptureSession::start(kind, container, prefix, chan_qty)
            .map_err(|e| VoiceAudioError::capture(e.to_string()))?;
        if raw_mic {
            hal.test_mode(true);
        }
        self.capture_raw_mic = raw_mic;
        self.capture = Some(session);
        Ok(())
    }

    pub(crate) fn capture_stop(&mut self) {
        self.close_capture();
    }

    fn close_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            if let Err(e) = capture.finish() {
                tracing::warn!(error = %e, "capture files not finalized");
            }
            tracing::info!("capture session stopped");
        }
        if std::mem::take(&mut self.capture_raw_mic) {
            if let Some(hal) = self.hal.as_mut() {
                hal.test_mode(false);
            }
        }
    }

    pub(crate) fn note_lateness(&mut self, late: Duration) {
        self.counters.ticks_late += 1;
        self.counters.late_max = self.counters.late_max.max(late);
    }

    pub(crate) fn statistics_clear(&mut self, mask: StatisticsMask) {
        if mask.contains(StatisticsMask::INPUT_GENERAL) {
            self.counters = InputCounters {
                ticks_late: self.counters.ticks_late,
                late_max: self.counters.late_max,
                ..InputCounters::default()
            };
        }
        if mask.contains(StatisticsMask::INPUT_TIMING) {
            self.counters.ticks_late = 0;
            self.counters.late_max = Duration::ZERO;
        }
    }

    pub(crate) fn statistics_print(&self, mask: StatisticsMask) {
        let c = &self.counters;
        if mask.contains(StatisticsMask::INPUT_GENERAL) {
            tracing::info!(
                frames = c.frames,
                read_errors = c.read_errors,
                sessions = c.sessions,
                detections = c.detections,
                "input statistics"
            );
        }
        if mask.contains(StatisticsMask::INPUT_TIMING) {
            tracing::info!(
                ticks_late = c.ticks_late,
                late_max_us = c.late_max.as_micros() as u64,
                "input timing"
            );
        }
    }

    #[cfg(test)]
    fn frames(&self) -> u64 {
        self.counters.frames
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::device::PowerMode;
    use crate::dsp::{EndOfSpeech, KeywordCriterion, KeywordDetector, SoundFocus};
    use crate::engine::mailbox::StreamParams;
    use crate::event::{audio_in_callback, keyword_callback, KeywordChannelResult, KeywordEndpoints};
    use crate::hal::{Hal, InputOpenParams, MockHal};
    use crate::sink::{MemoryBuffer, MemorySink};

    /// Fires on every channel once `fire_at` frames have been seen.
    struct FireAt {
        frames: usize,
        fire_at: usize,
    }

    impl KeywordDetector for FireAt {
        fn name(&self) -> &str {
            "fire-at"
        }

        fn init(&mut self, _chan_qty: usize, _sensitivity: f32) -> KeywordCriterion {
            KeywordCriterion::Score
        }

        fn update(&mut self, _sensitivity: f32) {}

        fn run(&mut self, chan: usize, _samples: &[f32]) -> bool {
            if chan == 0 {
                self.frames += 1;
            }
            self.frames == self.fire_at
        }

        fn result(&self, _chan: usize) -> KeywordChannelResult {
            KeywordChannelResult {
                triggered: true,
                score: 0.9,
                snr: 10.0,
                endpoints: KeywordEndpoints {
                    pre: 0,
                    begin: -3200,
                    end: -320,
                },
            }
        }
    }

    /// Reports end of speech on the given frame.
    struct EosAt {
        frames: usize,
        at: usize,
    }

    impl EndOfSpeech for EosAt {
        fn run(&mut self, _chan: usize, _samples: &[f32]) -> EosEvent {
            self.frames += 1;
            if self.frames == self.at {
                EosEvent::EndOfSpeech
            } else {
                EosEvent::None
            }
        }

        fn signal_level(&self, _chan: usize) -> u8 {
            42
        }

        fn set_speech_begin(&mut self) {}
    }

    fn engine(hal: &mut MockHal, dsp: &mut DspSuite) -> (InputEngine, VoiceSessionRegistry) {
        engine_with(hal, dsp, &EngineConfig::default())
    }

    fn engine_with(
        hal: &mut MockHal,
        dsp: &mut DspSuite,
        config: &EngineConfig,
    ) -> (InputEngine, VoiceSessionRegistry) {
        let registry = VoiceSessionRegistry::new();
        let mut engine = InputEngine::new(config, registry.clone());
        let input = hal
            .input_open(&InputOpenParams {
                devices: InputDevices::SINGLE,
                format: InputFormat::default(),
                power_mode: PowerMode::Full,
                privacy_mode: false,
            })
            .unwrap();
        engine.idle_start(input, InputDevices::SINGLE, "mock".into(), dsp);
        (engine, registry)
    }

    fn quad_engine(hal: &mut MockHal, dsp: &mut DspSuite) -> InputEngine {
        let mut engine = InputEngine::new(&EngineConfig::default(), VoiceSessionRegistry::new());
        let input = hal
            .input_open(&InputOpenParams {
                devices: InputDevices::QUAD,
                format: InputFormat {
                    channel_qty: 4,
                    ..InputFormat::default()
                },
                power_mode: PowerMode::Full,
                privacy_mode: false,
            })
            .unwrap();
        engine.idle_start(input, InputDevices::QUAD, "mock".into(), dsp);
        engine
    }

    /// Points at 90 degrees after its first update and logs what it was given.
    struct FixedFocus {
        log: Arc<Mutex<Vec<String>>>,
        updated: bool,
    }

    impl SoundFocus for FixedFocus {
        fn set_mode(&mut self, mode: FocusMode) {
            self.log.lock().push(format!("{mode:?}"));
        }

        fn accumulate(&mut self, chans: &[Vec<f32>]) {
            self.log.lock().push(format!("frame {}", chans.len()));
        }

        fn update(&mut self) {
            self.updated = true;
            self.log.lock().push("update".into());
        }

        fn direction(&self) -> u16 {
            if self.updated {
                90
            } else {
                0
            }
        }
    }

    struct Started {
        accepted: oneshot::Receiver<Result<(), VoiceAudioError>>,
        done: oneshot::Receiver<AudioInEvent>,
    }

    fn memory_request(
        buffer: MemoryBuffer,
        from: RecordFrom,
        until: RecordUntil,
        params: StreamParams,
        callback: Option<AudioInCallback>,
    ) -> (RecordRequest, Started) {
        let (accepted_tx, accepted) = oneshot::channel();
        let (done_tx, done) = oneshot::channel();
        let sync = callback.is_none();
        let request = RecordRequest {
            source: InputDevices::SINGLE,
            format_out: InputFormat::default(),
            destination: Destination::Sink {
                sink: Box::new(MemorySink::new(buffer)),
                from,
                offset: 0,
                until,
            },
            params,
            callback,
            done: sync.then_some(done_tx),
            accepted: accepted_tx,
        };
        (request, Started { accepted, done })
    }

    #[tokio::test]
    async fn test_live_record_to_memory_and_stop() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let (mut engine, _) = engine(&mut hal, &mut dsp);
        hal.push_samples(&[5i16; 320 * 3]);

        let buffer = MemoryBuffer::with_capacity(64_000);
        let (request, mut started) =
            memory_request(buffer.clone(), RecordFrom::Live, RecordUntil::EndOfStream, StreamParams::default(), None);
        engine.record_start(request).await;
        started.accepted.try_recv().unwrap().unwrap();

        for _ in 0..3 {
            assert!(engine.tick(&mut dsp).await);
        }
        assert_eq!(buffer.len(), 320 * 3 * 2);
        assert!(buffer.samples().iter().all(|&s| s == 5));

        engine.record_stop(InputDevices::SINGLE, None).await;
        assert_eq!(started.done.try_recv().unwrap(), AudioInEvent::Ok);
        assert_eq!(engine.frames(), 3);
    }

    #[tokio::test]
    async fn test_second_session_in_group_is_rejected() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let (mut engine, _) = engine(&mut hal, &mut dsp);

        let (first, mut a) = memory_request(
            MemoryBuffer::with_capacity(640),
            RecordFrom::Live,
            RecordUntil::EndOfStream,
            StreamParams::default(),
            None,
        );
        engine.record_start(first).await;
        a.accepted.try_recv().unwrap().unwrap();

        let (second, mut b) = memory_request(
            MemoryBuffer::with_capacity(640),
            RecordFrom::Live,
            RecordUntil::EndOfStream,
            StreamParams::default(),
            None,
        );
        engine.record_start(second).await;
        let err = b.accepted.try_recv().unwrap().unwrap_err();
        assert_eq!(err.code(), 7);
    }

    #[tokio::test]
    async fn test_full_memory_ends_with_end_of_buffer() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let (mut engine, _) = engine(&mut hal, &mut dsp);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let callback = audio_in_callback(move |_, event| sink_events.lock().push(event));
        let (request, mut started) = memory_request(
            MemoryBuffer::with_capacity(1000),
            RecordFrom::Live,
            RecordUntil::EndOfStream,
            StreamParams::default(),
            Some(callback),
        );
        engine.record_start(request).await;
        started.accepted.try_recv().unwrap().unwrap();

        engine.tick(&mut dsp).await;
        engine.tick(&mut dsp).await;
        assert_eq!(
            *events.lock(),
            vec![AudioInEvent::FirstFrame, AudioInEvent::EndOfBuffer]
        );
        assert!(engine.sessions[0].is_none());
    }

    #[tokio::test]
    async fn test_end_of_speech_ends_session() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default().with_eos(EosAt { frames: 0, at: 4 });
        let (mut engine, _) = engine(&mut hal, &mut dsp);

        let (request, mut started) = memory_request(
            MemoryBuffer::with_capacity(64_000),
            RecordFrom::Live,
            RecordUntil::EndOfSpeech,
            StreamParams::default(),
            None,
        );
        engine.record_start(request).await;
        started.accepted.try_recv().unwrap().unwrap();

        for _ in 0..4 {
            engine.tick(&mut dsp).await;
        }
        match started.done.try_recv().unwrap() {
            AudioInEvent::Eos(stats) => {
                assert_eq!(stats.packets_processed, 4);
                assert_eq!(stats.samples_processed, 4 * 320);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mic_error_reports_error_and_stops_ticks() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let (mut engine, _) = engine(&mut hal, &mut dsp);
        hal.fail_read_after(1);

        let (request, mut started) = memory_request(
            MemoryBuffer::with_capacity(64_000),
            RecordFrom::Live,
            RecordUntil::EndOfStream,
            StreamParams::default(),
            None,
        );
        engine.record_start(request).await;
        started.accepted.try_recv().unwrap().unwrap();

        assert!(engine.tick(&mut dsp).await);
        assert!(!engine.tick(&mut dsp).await);
        assert_eq!(started.done.try_recv().unwrap(), AudioInEvent::Error);
        assert!(!engine.is_open());
    }

    #[tokio::test]
    async fn test_keyword_detection_locks_session_and_reports() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default().with_keyword(FireAt { frames: 0, fire_at: 20 });
        let (mut engine, registry) = engine(&mut hal, &mut dsp);

        let detected = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&detected);
        engine.detect(
            keyword_callback(move |source, event| seen.lock().push((source, event))),
            0.5,
            &mut dsp,
        );
        assert_eq!(hal.keyword_resets(), 1);

        // Single channel: no wait window, commits on the trigger frame.
        for _ in 0..20 {
            engine.tick(&mut dsp).await;
        }
        let detected = detected.lock();
        assert_eq!(detected.len(), 1);
        let (source, event) = &detected[0];
        assert_eq!(*source, InputDevices::SINGLE);
        match event {
            KeywordEvent::Detected { result, .. } => {
                assert_eq!(result.detector_name, "fire-at");
                assert_eq!(result.dsp_name, "mock");
                assert_eq!(result.endpoints.begin, -3200);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(registry.owner(SessionGroup::Default), InputDevices::SINGLE);
        assert!(!engine.election.is_armed());
        assert_eq!(hal.detection_calls(), vec![0]);
    }

    #[tokio::test]
    async fn test_hardware_veto_rearms_detector() {
        let mut hal = MockHal::new();
        hal.ignore_detections(1);
        let mut dsp = DspSuite::default().with_keyword(FireAt { frames: 0, fire_at: 3 });
        let (mut engine, registry) = engine(&mut hal, &mut dsp);

        engine.detect(keyword_callback(|_, _| {}), 0.5, &mut dsp);
        for _ in 0..3 {
            engine.tick(&mut dsp).await;
        }
        assert!(engine.election.is_armed());
        assert!(registry.owner(SessionGroup::Default).is_none());
    }

    #[tokio::test]
    async fn test_record_from_keyword_begin_gets_pre_roll() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default().with_keyword(FireAt { frames: 0, fire_at: 20 });
        let (mut engine, _) = engine(&mut hal, &mut dsp);
        engine.detect(keyword_callback(|_, _| {}), 0.5, &mut dsp);
        for _ in 0..20 {
            engine.tick(&mut dsp).await;
        }

        let buffer = MemoryBuffer::with_capacity(64_000);
        let (request, mut started) = memory_request(
            buffer.clone(),
            RecordFrom::KeywordBegin,
            RecordUntil::EndOfStream,
            StreamParams::default(),
            None,
        );
        engine.record_start(request).await;
        started.accepted.try_recv().unwrap().unwrap();
        assert_eq!(hal.stream_start_calls(), vec![3200]);

        engine.tick(&mut dsp).await;
        // Keyword begin pre-roll plus one live frame.
        assert_eq!(buffer.len(), (3200 + 320) * 2);
    }

    #[tokio::test]
    async fn test_pre_roll_keeps_capture_order_across_ring_wrap() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default().with_keyword(FireAt { frames: 0, fire_at: 20 });
        let mut config = EngineConfig::default();
        // 4000 samples: 20 frames of capture wrap the ring.
        config.input.pre_detection_ms = 250;
        let (mut engine, _) = engine_with(&mut hal, &mut dsp, &config);

        let ramp: Vec<i16> = (0..320 * 21).map(|i| i as i16).collect();
        hal.push_samples(&ramp);
        engine.detect(keyword_callback(|_, _| {}), 0.5, &mut dsp);
        for _ in 0..20 {
            engine.tick(&mut dsp).await;
        }

        let buffer = MemoryBuffer::with_capacity(64_000);
        let (request, mut started) = memory_request(
            buffer.clone(),
            RecordFrom::KeywordBegin,
            RecordUntil::EndOfStream,
            StreamParams::default(),
            None,
        );
        engine.record_start(request).await;
        started.accepted.try_recv().unwrap().unwrap();
        engine.tick(&mut dsp).await;

        // The 3200 samples before detection, oldest first, then the live frame.
        let expected: Vec<i16> = (320 * 20 - 3200..320 * 21).map(|i| i as i16).collect();
        assert_eq!(buffer.samples(), expected);
    }

    #[tokio::test]
    async fn test_stream_time_minimum_fires_once() {
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let (mut engine, _) = engine(&mut hal, &mut dsp);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let params = StreamParams {
            time_minimum_ms: 50,
            ..StreamParams::default()
        };
        let (request, _started) = memory_request(
            MemoryBuffer::with_capacity(64_000),
            RecordFrom::Live,
            RecordUntil::EndOfStream,
            params,
            Some(audio_in_callback(move |_, event| sink_events.lock().push(event))),
        );
        engine.record_start(request).await;
        for _ in 0..6 {
            engine.tick(&mut dsp).await;
        }
        let minimum = events
            .lock()
            .iter()
            .filter(|e| **e == AudioInEvent::StreamTimeMinimum)
            .count();
        assert_eq!(minimum, 1);
    }

    #[tokio::test]
    async fn test_sound_intensity_written_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intensity");
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default().with_eos(EosAt { frames: 0, at: 0 });
        let (mut engine, _) = engine(&mut hal, &mut dsp);

        engine.set_intensity_fifo(Some(File::create(&path).unwrap()));
        engine.tick(&mut dsp).await;
        engine.tick(&mut dsp).await;
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![42, 0, 0, 0, 42, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_sound_focus_direction_written_while_detecting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intensity");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default()
            .with_eos(EosAt { frames: 0, at: 0 })
            .with_sound_focus(FixedFocus {
                log: Arc::clone(&log),
                updated: false,
            });
        let mut engine = quad_engine(&mut hal, &mut dsp);
        engine.set_intensity_fifo(Some(File::create(&path).unwrap()));

        // Idle: the array is tracked but no direction is reported.
        engine.tick(&mut dsp).await;
        engine.detect(keyword_callback(|_, _| {}), 0.5, &mut dsp);
        // 100 ms is five frames.
        for _ in 0..5 {
            engine.tick(&mut dsp).await;
        }

        let bytes = std::fs::read(&path).unwrap();
        let records: Vec<u16> = bytes
            .chunks_exact(4)
            .map(|r| u16::from_ne_bytes([r[2], r[3]]))
            .collect();
        // The fifth frame closes the first period, so it already carries the direction.
        assert_eq!(records, vec![0, 0, 0, 0, 90, 90]);

        let log = log.lock().clone();
        assert_eq!(log.first().map(String::as_str), Some("StrongestSector"));
        assert!(log.contains(&"KeywordDetection".to_string()));
        assert_eq!(log.iter().filter(|l| *l == "frame 4").count(), 6);
        assert_eq!(log.iter().filter(|l| *l == "update").count(), 1);
    }

    #[tokio::test]
    async fn test_capture_requires_open_microphone() {
        let dir = tempfile::tempdir().unwrap();
        let mut hal = MockHal::new();
        let mut dsp = DspSuite::default();
        let (mut engine, _) = engine(&mut hal, &mut dsp);

        let prefix = dir.path().join("cap");
        engine
            .capture_start(CaptureKind::INPUT_MONO, Container::Wav, &prefix, false)
            .unwrap();
        engine.tick(&mut dsp).await;
        engine.capture_stop();
        assert!(dir.path().join("cap_input.wav").exists());

        engine.idle_stop().await;
        let err = engine
            .capture_start(CaptureKind::INPUT_MONO, Container::Wav, &prefix, false)
            .unwrap_err();
        assert_eq!(err.code(), 18);
    }
}

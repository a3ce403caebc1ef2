//! Pre-detection buffering and multi-channel keyword election.
//!
//! Every microphone frame is appended to a per-channel ring buffer that keeps the most
//! recent `pre_detection_ms` of audio. While armed, each keyword channel runs the detector;
//! the first trigger opens a short wait window during which a better-scoring channel may
//! overtake the initial one. Endpoints are reported relative to the frame in which the
//! election commits.

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::dsp::{EndOfSpeech, EosEvent, KeywordCriterion, KeywordDetector};
use crate::event::{KeywordCallback, KeywordChannelResult, KeywordEndpoints, KeywordResult};
use crate::format::{RecordFrom, INPUT_SAMPLE_RATE};
use crate::frame::MicFrame;

/// Samples kept between the pre-roll start and the keyword begin when the buffer allows,
/// covering frames that arrive before the consumer starts streaming.
pub(crate) const PRE_KEYWORD_STREAM_LAG_SAMPLES: i32 = 1600;

/// Channel layout and timing knobs for one election.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ElectionParams {
    /// First channel fed to the detector (channels below are reserved for ASR).
    pub first_chan: usize,
    /// Last channel fed to the detector.
    pub last_chan: usize,
    pub trigger_wait_frames: u32,
    pub score_epsilon: f32,
    pub extended_wake_word_end: bool,
    pub eos_enabled: bool,
}

/// What the caller should do after a frame went through the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeywordStep {
    /// Nothing armed or nothing triggered yet.
    Idle,
    /// Triggered; still waiting for other channels or the end of the wake word.
    Pending,
    /// The active channel won; report it.
    Commit,
}

#[derive(Debug, Default, Clone)]
struct ChannelState {
    triggered: bool,
    post_frame_count: u32,
    result: KeywordChannelResult,
}

pub(crate) struct KeywordElection {
    capacity: usize,
    buffers: Vec<HeapRb<i16>>,
    channels: Vec<ChannelState>,
    session_active: bool,
    armed: bool,
    triggered: bool,
    active_chan: usize,
    chan_selected: Option<usize>,
    criterion: KeywordCriterion,
    endpoints: KeywordEndpoints,
    post_frame_count_callback: u32,
    post_frame_count_trigger: u32,
    callback: Option<KeywordCallback>,
    sensitivity: f32,
    vad_forced: bool,
    end_of_wake_word_samples: u32,
}

impl KeywordElection {
    pub(crate) fn new(pre_detection_ms: u32) -> Self {
        let capacity = (pre_detection_ms * (INPUT_SAMPLE_RATE / 1000)).max(1) as usize;
        Self {
            capacity,
            buffers: Vec::new(),
            channels: Vec::new(),
            session_active: false,
            armed: false,
            triggered: false,
            active_chan: 0,
            chan_selected: None,
            criterion: KeywordCriterion::Score,
            endpoints: KeywordEndpoints::default(),
            post_frame_count_callback: 0,
            post_frame_count_trigger: 0,
            callback: None,
            sensitivity: 0.0,
            vad_forced: false,
            end_of_wake_word_samples: 0,
        }
    }

    /// Allocates buffers for `chan_qty` channels and initialises the detector.
    pub(crate) fn session_init(
        &mut self,
        chan_qty: usize,
        detector: &mut dyn KeywordDetector,
        sensitivity: f32,
    ) {
        self.buffers = (0..chan_qty).map(|_| HeapRb::new(self.capacity)).collect();
        self.channels = vec![ChannelState::default(); chan_qty];
        self.criterion = detector.init(chan_qty, sensitivity);
        self.sensitivity = sensitivity;
        self.session_active = true;
        self.armed = false;
        self.triggered = false;
        self.active_chan = 0;
        self.chan_selected = None;
        self.endpoints = KeywordEndpoints::default();
        self.post_frame_count_callback = 0;
        tracing::debug!(chan_qty, capacity = self.capacity, criterion = ?self.criterion, "keyword session init");
    }

    pub(crate) fn session_term(&mut self) {
        self.session_active = false;
        self.armed = false;
        self.callback = None;
        self.buffers.clear();
        self.channels.clear();
    }

    /// Arms the detector, clearing any previous election.
    pub(crate) fn arm(
        &mut self,
        callback: KeywordCallback,
        sensitivity: f32,
        detector: &mut dyn KeywordDetector,
    ) {
        if (sensitivity - self.sensitivity).abs() > f32::EPSILON {
            detector.update(sensitivity);
            self.sensitivity = sensitivity;
        }
        for chan in &mut self.channels {
            *chan = ChannelState::default();
        }
        self.callback = Some(callback);
        self.triggered = false;
        self.chan_selected = None;
        self.endpoints = KeywordEndpoints::default();
        self.post_frame_count_trigger = 0;
        self.vad_forced = false;
        self.end_of_wake_word_samples = 0;
        self.armed = true;
    }

    /// Re-arms with the current callback and sensitivity (used when the HAL vetoes a detection).
    pub(crate) fn rearm(&mut self, detector: &mut dyn KeywordDetector) {
        if let Some(callback) = self.callback.clone() {
            let sensitivity = self.sensitivity;
            self.arm(callback, sensitivity, detector);
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
        self.callback = None;
        self.vad_forced = false;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub(crate) fn is_session_active(&self) -> bool {
        self.session_active
    }

    pub(crate) fn active_chan(&self) -> usize {
        self.active_chan
    }

    pub(crate) fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    pub(crate) fn set_sensitivity(&mut self, sensitivity: f32, detector: &mut dyn KeywordDetector) {
        detector.update(sensitivity);
        self.sensitivity = sensitivity;
    }

    pub(crate) fn callback(&self) -> Option<&KeywordCallback> {
        self.callback.as_ref()
    }

    pub(crate) fn endpoints(&self) -> KeywordEndpoints {
        self.endpoints
    }

    pub(crate) fn vad_forced(&self) -> bool {
        self.vad_forced
    }

    /// Samples currently buffered for `chan`.
    pub(crate) fn pd_avail(&self, chan: usize) -> usize {
        self.buffers.get(chan).map_or(0, |b| b.occupied_len())
    }

    /// `qty` buffered samples of `chan`, ending `offset_from_end` samples before the newest.
    ///
    /// The result is in capture order even when the span wraps around the ring.
    pub(crate) fn pre_detection_samples(&self, chan: usize, qty: usize, offset_from_end: usize) -> Vec<i16> {
        let Some(buffer) = self.buffers.get(chan) else {
            return Vec::new();
        };
        let avail = buffer.occupied_len();
        let end = avail.saturating_sub(offset_from_end);
        let start = end.saturating_sub(qty);
        buffer.iter().skip(start).take(end - start).copied().collect()
    }

    /// The detected keyword itself (begin to end) on the active channel.
    pub(crate) fn keyword_samples(&self) -> Vec<i16> {
        let begin = self.endpoints.begin.unsigned_abs() as usize;
        let end = self.endpoints.end.unsigned_abs() as usize;
        self.pre_detection_samples(self.active_chan, begin.saturating_sub(end), end)
    }

    /// Pre-roll length for a session starting `from` with `offset`, per the active channel.
    pub(crate) fn pre_roll_qty(&mut self, from: RecordFrom, offset: i32, chan_sample_qty: usize) -> usize {
        let avail = self.pd_avail(self.active_chan) as i64;
        let offset = i64::from(offset);
        let mut qty = match from {
            RecordFrom::Beginning => avail - offset,
            RecordFrom::Live => 0,
            RecordFrom::KeywordBegin => -i64::from(self.endpoints.begin) - offset,
            RecordFrom::KeywordEnd => {
                if !self.triggered {
                    self.post_frame_count_callback = 0;
                }
                -offset
            }
        };
        if from != RecordFrom::Live {
            qty += i64::from(self.post_frame_count_callback) * chan_sample_qty as i64;
        }
        if qty > avail {
            tracing::warn!(requested = qty, avail, "pre-detection request out of range");
        }
        qty.clamp(0, avail) as usize
    }

    /// Follows the end-of-speech detector while it looks for the end of the wake word.
    pub(crate) fn track_wake_word_end(&mut self, event: EosEvent, chan_sample_qty: usize) {
        if event == EosEvent::EndOfWakeword {
            self.vad_forced = false;
        } else if self.vad_forced {
            self.end_of_wake_word_samples += chan_sample_qty as u32;
        }
    }

    /// Buffers one frame and advances the election.
    pub(crate) fn process(
        &mut self,
        frame: &MicFrame,
        detector: &mut dyn KeywordDetector,
        eos: &mut dyn EndOfSpeech,
        eos_event: EosEvent,
        params: &ElectionParams,
    ) -> KeywordStep {
        if !self.session_active {
            return KeywordStep::Idle;
        }

        let mut all_triggered = true;
        let chan_qty = frame.channel_qty().min(self.buffers.len());
        for chan in 0..chan_qty {
            if chan > params.last_chan {
                tracing::trace!(chan, "no keyword detector on channel");
                break;
            }
            self.buffers[chan].push_slice_overwrite(&frame.chans_i16[chan]);
            if chan < params.first_chan {
                continue;
            }

            let detected = detector.run(chan, &frame.chans_f32[chan]);
            if !self.armed {
                continue;
            }

            if self.channels[chan].triggered {
                if !self.vad_forced {
                    self.channels[chan].post_frame_count += 1;
                }
            } else if detected {
                self.on_detection(chan, detector.result(chan), params);
            } else {
                all_triggered = false;
            }
        }

        self.post_frame_count_callback += 1;

        if !self.armed || !self.triggered {
            return KeywordStep::Idle;
        }

        self.post_frame_count_trigger += 1;
        if !all_triggered && self.post_frame_count_trigger <= params.trigger_wait_frames {
            return KeywordStep::Pending;
        }

        if params.extended_wake_word_end {
            if eos_event == EosEvent::EndOfWakeword {
                self.endpoints.begin -= self.end_of_wake_word_samples as i32;
            } else if self.vad_forced {
                self.post_frame_count_trigger -= 1;
                return KeywordStep::Pending;
            } else {
                eos.set_speech_begin();
                if params.eos_enabled {
                    self.vad_forced = true;
                    self.post_frame_count_trigger -= 1;
                    return KeywordStep::Pending;
                }
            }
        }
        KeywordStep::Commit
    }

    fn on_detection(&mut self, chan: usize, result: KeywordChannelResult, params: &ElectionParams) {
        tracing::debug!(chan, score = result.score, snr = result.snr, "keyword detected on channel");
        self.triggered = true;

        let value = |r: &KeywordChannelResult| match self.criterion {
            KeywordCriterion::Score => r.score,
            KeywordCriterion::Snr => r.snr,
        };
        let wins = match self.chan_selected {
            None => true,
            Some(selected) => {
                let current = value(&self.channels[selected].result);
                let candidate = value(&result);
                candidate > current || (candidate - current).abs() < params.score_epsilon
            }
        };

        if wins {
            self.chan_selected = Some(chan);
            self.active_chan = chan;

            let pd_qty = self.pd_avail(chan) as i32;
            if pd_qty + result.endpoints.begin < 0 {
                tracing::error!(pd_qty, begin = result.endpoints.begin, "keyword endpoint out of range");
            } else {
                self.endpoints = result.endpoints;
                self.endpoints.pre = if pd_qty + result.endpoints.begin < PRE_KEYWORD_STREAM_LAG_SAMPLES {
                    -pd_qty
                } else {
                    -(pd_qty - PRE_KEYWORD_STREAM_LAG_SAMPLES)
                };
            }
        }

        let state = &mut self.channels[chan];
        state.result = KeywordChannelResult {
            triggered: true,
            ..result
        };
        state.triggered = true;
        state.post_frame_count = 0;
    }

    /// Finalises the election for reporting: shifts endpoints by the frames seen since the
    /// winning channel triggered and restarts the callback frame counter.
    pub(crate) fn commit(&mut self, chan_sample_qty: usize, detector_name: &str, dsp_name: &str) -> KeywordResult {
        let chan = self.active_chan;
        if let Some(state) = self.channels.get_mut(chan) {
            let adjustment = (state.post_frame_count as usize * chan_sample_qty) as i32;
            if adjustment != 0 {
                self.endpoints.pre -= adjustment;
                self.endpoints.begin -= adjustment;
                self.endpoints.end -= adjustment;
                state.post_frame_count = 0;
            }
        }
        self.post_frame_count_callback = 0;

        KeywordResult {
            chan_selected: chan,
            endpoints: self.endpoints,
            channels: self.channels.iter().map(|c| c.result).collect(),
            detector_name: detector_name.to_string(),
            dsp_name: dsp_name.to_string(),
        }
    }
}

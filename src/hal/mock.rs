//! Scripted hardware for testing without audio devices.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Hal, HalInput, HalInputStats, HalOutput, InputOpenParams, OutputOpenParams};
use crate::device::{
    HalCapabilities, InputCaps, InputDevices, OutputCaps, OutputDevices, PowerMode,
};
use crate::format::{InputFormat, INPUT_MAX_CHANNEL_QTY, INPUT_SAMPLE_RATE};

/// In-memory hardware that plays back scripted microphone audio and records speaker
/// writes.
///
/// Clones share state, so a test keeps one handle to script audio and inspect results
/// while the engine drives the other. When the scripted audio runs out the microphone
/// delivers silence, like an idle room.
///
/// # Example
///
/// ```
/// use voice_engine::hal::MockHal;
///
/// let hal = MockHal::new();
///
/// // 100 ms of silence followed by 100 ms of a 440 Hz tone on every channel
/// hal.push_silence(100);
/// hal.push_sine(440.0, 100);
/// assert_eq!(hal.mic_pending(), 3200);
/// ```
#[derive(Clone, Default)]
pub struct MockHal {
    state: Arc<Mutex<MockState>>,
}

struct MockState {
    capabilities: HalCapabilities,
    input_devices: InputDevices,
    output_devices: OutputDevices,
    mic: Vec<VecDeque<i16>>,
    frames_read: u64,
    fail_read_after: Option<u64>,
    fail_input_open: bool,
    fail_output_open: bool,
    input_open: bool,
    output_open: bool,
    privacy: bool,
    power: PowerMode,
    speaker: Vec<i16>,
    volumes: Vec<(i8, i8)>,
    scales: Vec<(f32, f32)>,
    detections: Vec<usize>,
    ignore_detections: u32,
    stream_starts: Vec<u32>,
    keyword_resets: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            capabilities: HalCapabilities {
                input_qty: 1,
                output_qty: 1,
                input_caps: [InputCaps::LOCAL.0, 0, 0],
                output_caps: [OutputCaps::DIRECT_PCM.0, 0, 0],
            },
            input_devices: InputDevices::SINGLE | InputDevices::TRI | InputDevices::QUAD,
            output_devices: OutputDevices::NORMAL,
            mic: vec![VecDeque::new(); usize::from(INPUT_MAX_CHANNEL_QTY)],
            frames_read: 0,
            fail_read_after: None,
            fail_input_open: false,
            fail_output_open: false,
            input_open: false,
            output_open: false,
            privacy: false,
            power: PowerMode::Full,
            speaker: Vec::new(),
            volumes: Vec::new(),
            scales: Vec::new(),
            detections: Vec::new(),
            ignore_detections: 0,
            stream_starts: Vec::new(),
            keyword_resets: 0,
        }
    }
}

fn samples_for_duration(duration_ms: u64) -> usize {
    (u64::from(INPUT_SAMPLE_RATE) * duration_ms / 1000) as usize
}

impl MockHal {
    /// Creates mock hardware with one local microphone and one PCM speaker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the capability table.
    #[must_use]
    pub fn with_capabilities(self, capabilities: HalCapabilities) -> Self {
        self.state.lock().capabilities = capabilities;
        self
    }

    /// Replaces the reported device masks.
    #[must_use]
    pub fn with_devices(self, input: InputDevices, output: OutputDevices) -> Self {
        {
            let mut state = self.state.lock();
            state.input_devices = input;
            state.output_devices = output;
        }
        self
    }

    /// Queues silence on every channel.
    pub fn push_silence(&self, duration_ms: u64) {
        let samples = vec![0i16; samples_for_duration(duration_ms)];
        self.push_samples(&samples);
    }

    /// Queues a sine tone on every channel.
    pub fn push_sine(&self, frequency: f64, duration_ms: u64) {
        let sample_rate = f64::from(INPUT_SAMPLE_RATE);
        let samples: Vec<i16> = (0..samples_for_duration(duration_ms))
            .map(|i| {
                let t = i as f64 / sample_rate;
                ((2.0 * std::f64::consts::PI * frequency * t).sin() * 32767.0) as i16
            })
            .collect();
        self.push_samples(&samples);
    }

    /// Queues deterministic white noise on every channel.
    pub fn push_noise(&self, duration_ms: u64, amplitude: f64) {
        let amplitude = (amplitude * 32767.0) as i16;
        let mut seed: u32 = 12345;
        let samples: Vec<i16> = (0..samples_for_duration(duration_ms))
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
                let random = ((seed >> 16) as i32 - 32768) as i16;
                (i32::from(random) * i32::from(amplitude) / 32767) as i16
            })
            .collect();
        self.push_samples(&samples);
    }

    /// Queues the same samples on every channel.
    pub fn push_samples(&self, samples: &[i16]) {
        let mut state = self.state.lock();
        for chan in &mut state.mic {
            chan.extend(samples.iter().copied());
        }
    }

    /// Queues samples on one channel only; other channels get silence of equal length.
    pub fn push_channel_samples(&self, chan: usize, samples: &[i16]) {
        let mut state = self.state.lock();
        for (index, queue) in state.mic.iter_mut().enumerate() {
            if index == chan {
                queue.extend(samples.iter().copied());
            } else {
                queue.extend(std::iter::repeat(0).take(samples.len()));
            }
        }
    }

    /// Samples per channel not yet read by the engine.
    pub fn mic_pending(&self) -> usize {
        self.state.lock().mic.first().map_or(0, VecDeque::len)
    }

    /// Frames read since creation.
    pub fn frames_read(&self) -> u64 {
        self.state.lock().frames_read
    }

    /// Makes reads return a short frame after `frames` more successful reads.
    pub fn fail_read_after(&self, frames: u64) {
        self.state.lock().fail_read_after = Some(frames);
    }

    /// Makes the next microphone opens fail.
    pub fn fail_input_open(&self, fail: bool) {
        self.state.lock().fail_input_open = fail;
    }

    /// Makes the next speaker opens fail.
    pub fn fail_output_open(&self, fail: bool) {
        self.state.lock().fail_output_open = fail;
    }

    /// Makes the next `count` keyword detections be ignored by the hardware.
    pub fn ignore_detections(&self, count: u32) {
        self.state.lock().ignore_detections = count;
    }

    /// Everything written to the speaker so far.
    pub fn speaker_samples(&self) -> Vec<i16> {
        self.state.lock().speaker.clone()
    }

    /// Hardware volume steps applied so far.
    pub fn volume_calls(&self) -> Vec<(i8, i8)> {
        self.state.lock().volumes.clone()
    }

    /// Hardware gains applied so far.
    pub fn volume_scales(&self) -> Vec<(f32, f32)> {
        self.state.lock().scales.clone()
    }

    /// Channels reported to the hardware as keyword winners.
    pub fn detection_calls(&self) -> Vec<usize> {
        self.state.lock().detections.clone()
    }

    /// Hardware stream start positions requested so far.
    pub fn stream_start_calls(&self) -> Vec<u32> {
        self.state.lock().stream_starts.clone()
    }

    /// Number of hardware keyword detector resets.
    pub fn keyword_resets(&self) -> u32 {
        self.state.lock().keyword_resets
    }

    /// Current power mode.
    pub fn power(&self) -> PowerMode {
        self.state.lock().power
    }

    /// Whether the microphone and speaker are currently open.
    pub fn is_open(&self) -> (bool, bool) {
        let state = self.state.lock();
        (state.input_open, state.output_open)
    }
}

impl Hal for MockHal {
    fn name(&self) -> &str {
        "mock"
    }

    fn capabilities(&self) -> HalCapabilities {
        self.state.lock().capabilities
    }

    fn available_devices(&self) -> (InputDevices, OutputDevices) {
        let state = self.state.lock();
        (state.input_devices, state.output_devices)
    }

    fn input_open(&mut self, params: &InputOpenParams) -> Option<Box<dyn HalInput>> {
        let mut state = self.state.lock();
        if state.fail_input_open {
            return None;
        }
        state.input_open = true;
        state.privacy = params.privacy_mode;
        state.power = params.power_mode;
        Some(Box::new(MockInput {
            state: Arc::clone(&self.state),
            format: params.format,
        }))
    }

    fn output_open(&mut self, _params: &OutputOpenParams) -> Option<Box<dyn HalOutput>> {
        let mut state = self.state.lock();
        if state.fail_output_open {
            return None;
        }
        state.output_open = true;
        Some(Box::new(MockOutput {
            state: Arc::clone(&self.state),
        }))
    }

    fn power_mode(&mut self, mode: PowerMode) -> bool {
        self.state.lock().power = mode;
        true
    }

    fn privacy_mode(&mut self, enable: bool) -> bool {
        self.state.lock().privacy = enable;
        true
    }

    fn privacy_mode_get(&self) -> Option<bool> {
        Some(self.state.lock().privacy)
    }
}

struct MockInput {
    state: Arc<Mutex<MockState>>,
    format: InputFormat,
}

impl HalInput for MockInput {
    fn format(&self) -> InputFormat {
        self.format
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();

        if let Some(remaining) = state.fail_read_after {
            if remaining == 0 {
                return Ok(buf.len() / 2);
            }
            state.fail_read_after = Some(remaining - 1);
        }

        let size = usize::from(self.format.sample_size);
        let chans = usize::from(self.format.channel_qty.max(1));
        let privacy = state.privacy;

        for (index, out) in buf.chunks_exact_mut(size).enumerate() {
            let queued = state.mic[index % chans].pop_front().unwrap_or(0);
            let sample = if privacy { 0 } else { queued };
            if size == 4 {
                out.copy_from_slice(&(i32::from(sample) << 16).to_le_bytes());
            } else {
                out.copy_from_slice(&sample.to_le_bytes());
            }
        }
        // Channels beyond the opened quantity stay aligned with the read ones.
        let per_chan = buf.len() / size / chans;
        for queue in state.mic.iter_mut().skip(chans) {
            let drain = per_chan.min(queue.len());
            queue.drain(..drain);
        }
        state.frames_read += 1;
        Ok(buf.len())
    }

    fn detection(&mut self, chan: usize) -> bool {
        let mut state = self.state.lock();
        state.detections.push(chan);
        if state.ignore_detections > 0 {
            state.ignore_detections -= 1;
            return true;
        }
        false
    }

    fn stream_start_set(&mut self, begin: u32) -> bool {
        self.state.lock().stream_starts.push(begin);
        true
    }

    fn keyword_detector_reset(&mut self) {
        self.state.lock().keyword_resets += 1;
    }

    fn stats(&self) -> HalInputStats {
        HalInputStats::default()
    }
}

impl Drop for MockInput {
    fn drop(&mut self) {
        self.state.lock().input_open = false;
    }
}

struct MockOutput {
    state: Arc<Mutex<MockState>>,
}

impl HalOutput for MockOutput {
    fn write(&mut self, samples: &[i16]) -> io::Result<usize> {
        self.state.lock().speaker.extend_from_slice(samples);
        Ok(samples.len())
    }

    fn volume_set(&mut self, left: i8, right: i8) -> bool {
        self.state.lock().volumes.push((left, right));
        true
    }

    fn volume_scale(&mut self, left: f32, right: f32) {
        self.state.lock().scales.push((left, right));
    }
}

impl Drop for MockOutput {
    fn drop(&mut self) {
        self.state.lock().output_open = false;
    }
}

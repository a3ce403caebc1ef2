//! Unpacked microphone frame.

use std::time::Duration;

use crate::format::{convert, FRAME_PERIOD_MS};

/// One frame period of microphone audio, split per channel.
///
/// The engine reads one interleaved hardware frame per tick and unpacks it into 16-bit
/// and float representations; float is the working precision for signal processing.
/// 32-bit input keeps its raw samples for raw-PCM destinations.
///
/// ```
/// use voice_engine::MicFrame;
///
/// let frame = MicFrame::from_channels(vec![vec![0i16; 320]], 16000);
/// assert_eq!(frame.duration().as_millis(), 20);
/// ```
#[derive(Debug, Clone)]
pub struct MicFrame {
    /// Per-channel 16-bit samples.
    pub chans_i16: Vec<Vec<i16>>,
    /// Per-channel float samples in [-1.0, 1.0].
    pub chans_f32: Vec<Vec<f32>>,
    /// Per-channel 32-bit samples (empty for 16-bit input).
    pub chans_i32: Vec<Vec<i32>>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Sequence number of this frame since the microphone opened.
    pub index: u64,
}

impl MicFrame {
    /// Unpacks an interleaved little-endian hardware frame.
    pub fn unpack(data: &[u8], sample_size: u8, channel_qty: u8, sample_rate: u32, index: u64) -> Self {
        let (chans_i16, chans_f32, chans_i32) =
            convert::unpack_interleaved(data, sample_size, channel_qty);
        Self {
            chans_i16,
            chans_f32,
            chans_i32,
            sample_rate,
            index,
        }
    }

    /// Builds a frame from 16-bit channel buffers.
    pub fn from_channels(chans_i16: Vec<Vec<i16>>, sample_rate: u32) -> Self {
        let chans_f32 = chans_i16
            .iter()
            .map(|c| c.iter().map(|&s| convert::i16_to_f32(s)).collect())
            .collect();
        Self {
            chans_i16,
            chans_f32,
            chans_i32: Vec::new(),
            sample_rate,
            index: 0,
        }
    }

    /// Number of channels.
    pub fn channel_qty(&self) -> usize {
        self.chans_i16.len()
    }

    /// Samples per channel.
    pub fn samples_per_channel(&self) -> usize {
        self.chans_i16.first().map_or(0, Vec::len)
    }

    /// Returns the duration of this frame.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples_per_channel() as f64 / f64::from(self.sample_rate))
    }

    /// Samples per channel in one nominal frame period.
    pub fn nominal_samples(sample_rate: u32) -> usize {
        (FRAME_PERIOD_MS * sample_rate / 1000) as usize
    }

    /// Rebuilds the 16-bit buffers from the float buffers after in-place processing.
    pub fn resync_i16(&mut self) {
        for (ints, floats) in self.chans_i16.iter_mut().zip(&self.chans_f32) {
            ints.clear();
            ints.extend(floats.iter().map(|&s| convert::f32_to_i16(s)));
        }
    }

    /// Returns `true` if this frame contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples_per_channel() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_mono_16khz() {
        let frame = MicFrame::from_channels(vec![vec![0i16; 320]], 16000);
        assert_eq!(frame.duration(), Duration::from_millis(20));
        assert_eq!(MicFrame::nominal_samples(16000), 320);
    }

    #[test]
    fn test_unpack_quad() {
        let chans: Vec<Vec<i16>> = (0..4).map(|c| vec![c as i16; 320]).collect();
        let refs: Vec<&[i16]> = chans.iter().map(Vec::as_slice).collect();
        let data = convert::pack_i16(&refs);
        let frame = MicFrame::unpack(&data, 2, 4, 16000, 7);
        assert_eq!(frame.channel_qty(), 4);
        assert_eq!(frame.samples_per_channel(), 320);
        assert_eq!(frame.chans_i16[3][0], 3);
        assert_eq!(frame.index, 7);
    }

    #[test]
    fn test_resync_after_float_processing() {
        let mut frame = MicFrame::from_channels(vec![vec![16384i16; 4]], 16000);
        for s in &mut frame.chans_f32[0] {
            *s *= 0.5;
        }
        frame.resync_i16();
        assert!((frame.chans_i16[0][0] - 8191).abs() <= 1);
    }

    #[test]
    fn test_empty_frame() {
        let frame = MicFrame::from_channels(vec![], 16000);
        assert!(frame.is_empty());
        assert_eq!(frame.duration(), Duration::ZERO);
    }
}

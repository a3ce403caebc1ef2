//! Audio format descriptors and conversion utilities.
//!
//! - Container, encoding and format descriptors for record and playback requests
//! - Record `from`/`until` policies for keyword-anchored sessions
//! - WAV header generation, parsing and retroactive patching ([`wav`])
//! - Sample conversion and frame (un)packing ([`convert`])

pub mod convert;
pub mod wav;

pub use convert::{f32_to_i16, i16_to_f32};

/// Frame period of both pipelines, in milliseconds.
pub const FRAME_PERIOD_MS: u32 = 20;

/// Input sample rate (the microphone pipeline runs at 16 kHz only).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Maximum local microphone channels.
pub const INPUT_MAX_CHANNEL_QTY: u8 = 4;

/// Maximum echo canceller reference channels.
pub const INPUT_MAX_CHANNEL_QTY_EC_REF: u8 = 6;

/// Output sample rate bounds.
pub const OUTPUT_SAMPLE_RATE_RANGE: std::ops::RangeInclusive<u32> = 16_000..=48_000;

/// Audio container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Container {
    /// Raw samples without a header.
    #[default]
    None,
    /// RIFF/WAVE.
    Wav,
    /// MP3 (not produced by the engine).
    Mp3,
}

/// Audio encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// 16-bit little-endian PCM.
    #[default]
    Pcm,
    /// Raw unprocessed 32-bit microphone PCM.
    PcmRaw,
    /// MP3.
    Mp3,
    /// ADPCM with XVP framing.
    AdpcmXvp,
    /// ADPCM with SKY framing.
    AdpcmSky,
    /// Standard ADPCM.
    Adpcm,
    /// Opus with XVP framing.
    OpusXvp,
    /// Standard Opus.
    Opus,
}

/// Format of microphone data, as opened or as delivered to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    /// Container of the destination.
    pub container: Container,
    /// Encoding of the samples.
    pub encoding: Encoding,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bytes per sample.
    pub sample_size: u8,
    /// Interleaved channel quantity.
    pub channel_qty: u8,
}

impl Default for InputFormat {
    fn default() -> Self {
        Self {
            container: Container::None,
            encoding: Encoding::Pcm,
            sample_rate: INPUT_SAMPLE_RATE,
            sample_size: 2,
            channel_qty: 1,
        }
    }
}

impl InputFormat {
    /// Bytes of one frame period in this format.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        (FRAME_PERIOD_MS * self.sample_rate / 1000) as usize
            * usize::from(self.channel_qty)
            * usize::from(self.sample_size)
    }
}

/// Format of speaker data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    /// Container of the source.
    pub container: Container,
    /// Encoding of the samples.
    pub encoding: Encoding,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bytes per sample.
    pub sample_size: u8,
    /// Interleaved channel quantity.
    pub channel_qty: u8,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            container: Container::None,
            encoding: Encoding::Pcm,
            sample_rate: INPUT_SAMPLE_RATE,
            sample_size: 2,
            channel_qty: 1,
        }
    }
}

impl OutputFormat {
    /// True when the format is playable by the speaker pipeline.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.encoding == Encoding::Pcm
            && OUTPUT_SAMPLE_RATE_RANGE.contains(&self.sample_rate)
            && self.sample_size == 2
            && (1..=2).contains(&self.channel_qty)
    }

    /// Samples (all channels) in one frame period.
    #[must_use]
    pub fn frame_sample_qty(&self) -> usize {
        (FRAME_PERIOD_MS * self.sample_rate / 1000) as usize * usize::from(self.channel_qty)
    }
}

/// Where a record/stream session starts relative to the audio history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFrom {
    /// From the beginning of buffered audio (offset is samples skipped, must be >= 0).
    #[default]
    Beginning,
    /// From the detected keyword's begin point (offset shifts it; negative reaches earlier).
    KeywordBegin,
    /// From the detected keyword's end point.
    KeywordEnd,
    /// Live audio only.
    Live,
}

/// When a record/stream session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordUntil {
    /// Until stopped, end of stream, or error.
    #[default]
    EndOfStream,
    /// Until end of speech is detected.
    EndOfSpeech,
    /// Until the end of the keyword.
    EndOfKeyword,
}

/// Diagnostic capture selection bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureKind(pub u8);

impl CaptureKind {
    /// Mono microphone input.
    pub const INPUT_MONO: Self = Self(0x00);
    /// All microphone inputs.
    pub const INPUT_ALL: Self = Self(0x01);
    /// Direction of arrival.
    pub const DOA: Self = Self(0x02);
    /// Keyword detector input.
    pub const KWD: Self = Self(0x04);
    /// End-of-speech detector input.
    pub const EOS: Self = Self(0x08);
    /// Dynamic gain input.
    pub const DGA: Self = Self(0x10);
    /// Output to destination.
    pub const OUTPUT: Self = Self(0x20);

    /// True when the bits stay within the known selections.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 < (Self::OUTPUT.0 << 1)
    }

    /// True when any bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Stream latency mode requested by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyMode {
    /// Regular latency.
    #[default]
    Normal,
    /// Low latency (disables frame grouping).
    Low,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_frame_bytes() {
        let format = InputFormat::default();
        assert_eq!(format.frame_bytes(), 640);

        let quad_32 = InputFormat {
            sample_size: 4,
            channel_qty: 4,
            ..InputFormat::default()
        };
        assert_eq!(quad_32.frame_bytes(), 320 * 4 * 4);
    }

    #[test]
    fn test_output_format_support() {
        let stereo_48k = OutputFormat {
            sample_rate: 48_000,
            channel_qty: 2,
            ..OutputFormat::default()
        };
        assert!(stereo_48k.is_supported());
        assert_eq!(stereo_48k.frame_sample_qty(), 1920);

        let three_channels = OutputFormat {
            channel_qty: 3,
            ..OutputFormat::default()
        };
        assert!(!three_channels.is_supported());
    }

    #[test]
    fn test_capture_kind_validity() {
        assert!(CaptureKind(CaptureKind::KWD.0 | CaptureKind::OUTPUT.0).is_valid());
        assert!(!CaptureKind(0x40).is_valid());
    }
}

//! Engine configuration.
//!
//! Every section has working defaults, so an empty TOML document is a valid configuration.
//!
//! ```
//! use voice_engine::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     [input]
//!     pre_detection_ms = 2000
//!
//!     [output]
//!     volume_step_db = 1.5
//! "#).unwrap();
//! assert_eq!(config.input.pre_detection_ms, 2000);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::VoiceAudioError;

/// Longest pre-detection history the keyword buffers may hold.
pub const PRE_DETECTION_DURATION_MAX_MS: u32 = 5000;

/// Largest accepted stream-time-minimum threshold.
pub const STREAM_TIME_MINIMUM_MAX_MS: u16 = 500;

/// Frame group quantity bounds.
pub const FRAME_GROUP_QTY_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Microphone pipeline settings.
    pub input: InputConfig,
    /// Signal processing feature matrix.
    pub dsp: DspConfig,
    /// Speaker pipeline settings.
    pub output: OutputConfig,
    /// Resource broker settings.
    pub resource: ResourceConfig,
    /// Rolling internal capture.
    pub internal_capture: InternalCaptureConfig,
}

/// Microphone pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Audio retained per channel ahead of a keyword detection.
    pub pre_detection_ms: u32,
    /// Frames accumulated before a file or memory destination is written.
    pub frame_group_qty: u8,
    /// Keyword sensitivity used until `detect_params` changes it.
    pub default_sensitivity: f32,
    /// Frames to wait after the first channel triggers for better-scoring channels.
    pub trigger_wait_frames: u32,
    /// Scores within this distance of the selected channel count as a tie.
    pub score_epsilon: f32,
    /// Defer the keyword callback until end-of-speech confirms the end of the wake word.
    pub extended_wake_word_end: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            pre_detection_ms: PRE_DETECTION_DURATION_MAX_MS,
            frame_group_qty: 1,
            default_sensitivity: 0.3,
            trigger_wait_frames: 5,
            score_epsilon: 0.0001,
            extended_wake_word_end: false,
        }
    }
}

/// Which pluggable signal processors are active, and how channels are reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DspConfig {
    /// Preprocessing (echo/noise reduction).
    pub ppr_enabled: bool,
    /// Dynamic gain adjustment.
    pub dga_enabled: bool,
    /// End-of-speech detection.
    pub eos_enabled: bool,
    /// Channels reserved for ASR delivery (0 or 1).
    pub input_asr_max_channel_qty: u8,
    /// Channels fed to the keyword detector (1..=4).
    pub input_kwd_max_channel_qty: u8,
}

impl Default for DspConfig {
    fn default() -> Self {
        Self {
            ppr_enabled: false,
            dga_enabled: false,
            eos_enabled: true,
            input_asr_max_channel_qty: 0,
            input_kwd_max_channel_qty: 1,
        }
    }
}

/// Speaker pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Highest volume step.
    pub volume_max: i8,
    /// Lowest volume step.
    pub volume_min: i8,
    /// Gain per volume step.
    pub volume_step_db: f32,
    /// Apply gain through the external volume controller instead of sample scaling.
    pub use_ext_gain: bool,
    /// Ramp between volume steps one step per frame.
    pub ramp_enabled: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            volume_max: 3,
            volume_min: -12,
            volume_step_db: 2.0,
            use_ext_gain: false,
            ramp_enabled: false,
        }
    }
}

/// Resource broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Directory holding the per-user notification fifos.
    pub fifo_dir: PathBuf,
    /// Seconds between periodic scrub-and-allocate passes.
    pub update_interval_secs: u64,
    /// Capacity of the engine and broker mailboxes.
    pub mailbox_capacity: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            fifo_dir: PathBuf::from("/tmp"),
            update_interval_secs: 5,
            mailbox_capacity: 10,
        }
    }
}

/// Rolling capture of microphone sessions to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalCaptureConfig {
    /// Capture every record/stream session.
    pub enable: bool,
    /// Directory for capture files.
    pub dir_path: PathBuf,
    /// Number of files kept before the oldest is deleted.
    pub file_qty_max: u32,
    /// Maximum bytes per capture file.
    pub file_size_max: u32,
}

impl Default for InternalCaptureConfig {
    fn default() -> Self {
        Self {
            enable: false,
            dir_path: PathBuf::from("/tmp"),
            file_qty_max: 5,
            file_size_max: 5 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self, VoiceAudioError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| VoiceAudioError::params(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VoiceAudioError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| VoiceAudioError::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges that the engine relies on.
    pub fn validate(&self) -> Result<(), VoiceAudioError> {
        if self.input.pre_detection_ms > PRE_DETECTION_DURATION_MAX_MS {
            return Err(VoiceAudioError::params("pre_detection_ms above 5000"));
        }
        if !FRAME_GROUP_QTY_RANGE.contains(&self.input.frame_group_qty) {
            return Err(VoiceAudioError::params("frame_group_qty outside 1..=10"));
        }
        if !(0.0..=1.0).contains(&self.input.default_sensitivity) {
            return Err(VoiceAudioError::params("default_sensitivity outside 0..=1"));
        }
        if self.dsp.input_asr_max_channel_qty > 1 {
            return Err(VoiceAudioError::params("input_asr_max_channel_qty above 1"));
        }
        if self.dsp.input_kwd_max_channel_qty == 0
            || self.dsp.input_kwd_max_channel_qty + self.dsp.input_asr_max_channel_qty
                > crate::format::INPUT_MAX_CHANNEL_QTY
        {
            return Err(VoiceAudioError::params("asr + keyword channels exceed 4"));
        }
        if self.output.volume_min > self.output.volume_max {
            return Err(VoiceAudioError::params("volume_min above volume_max"));
        }
        if self.output.volume_step_db <= 0.0 {
            return Err(VoiceAudioError::params("volume_step_db must be positive"));
        }
        if self.resource.mailbox_capacity == 0 || self.resource.update_interval_secs == 0 {
            return Err(VoiceAudioError::params("resource intervals must be non-zero"));
        }
        Ok(())
    }
}

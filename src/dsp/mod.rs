//! Pluggable signal processing.
//!
//! The engine drives six algorithm slots: keyword detection, end-of-speech detection,
//! preprocessing, dynamic gain, sound focus and speaker volume. Each slot is a trait
//! object; a feature that is switched off in [`DspConfig`] is replaced by the no-op
//! implementation of the same trait, so the engine never branches on whether a feature
//! exists.

use crate::config::DspConfig;
use crate::event::KeywordChannelResult;
use crate::format::convert;

/// Which per-channel value decides keyword election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeywordCriterion {
    /// Highest detector score wins.
    #[default]
    Score,
    /// Highest signal to noise ratio wins.
    Snr,
}

/// Outcome of one end-of-speech step on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EosEvent {
    /// Nothing changed.
    #[default]
    None,
    /// Speech started.
    StartOfSpeech,
    /// Speech ended.
    EndOfSpeech,
    /// No speech started within the initial timeout.
    TimeoutInitial,
    /// Speech did not end within the timeout.
    TimeoutEnd,
    /// The wake word itself ended.
    EndOfWakeword,
}

/// A multi-channel wake-word detector.
///
/// Endpoints in [`KeywordChannelResult`] are negative sample offsets relative to the end of
/// the frame in which the detection was reported.
pub trait KeywordDetector: Send {
    /// Detector name reported with results.
    fn name(&self) -> &str;

    /// Prepares `chan_qty` channels; returns the criterion used for election.
    fn init(&mut self, chan_qty: usize, sensitivity: f32) -> KeywordCriterion;

    /// Applies a new sensitivity.
    fn update(&mut self, sensitivity: f32);

    /// Processes one frame of one channel; returns `true` on detection.
    fn run(&mut self, chan: usize, samples: &[f32]) -> bool;

    /// Details of the last detection on `chan`.
    fn result(&self, chan: usize) -> KeywordChannelResult;

    /// Lowest and highest accepted sensitivity.
    fn sensitivity_limits(&self) -> (f32, f32) {
        (0.0, 1.0)
    }
}

/// Per-channel end-of-speech detector.
pub trait EndOfSpeech: Send {
    /// Processes one frame of one channel.
    fn run(&mut self, chan: usize, samples: &[f32]) -> EosEvent;

    /// Current signal level of `chan`, scaled to 0..=255.
    fn signal_level(&self, chan: usize) -> u8;

    /// Marks that speech began (the keyword was detected).
    fn set_speech_begin(&mut self);
}

/// Echo and noise reduction applied to every microphone frame.
pub trait Preprocessor: Send {
    /// Processes all channels in place.
    fn run(&mut self, chans: &mut [Vec<f32>]);
}

/// Gain normalisation derived from the keyword's loudness.
pub trait DynamicGain: Send {
    /// Measures the keyword chunk.
    fn calculate(&mut self, keyword: &[i16]);

    /// Applies the computed gain to delivered samples.
    fn apply(&mut self, samples: &mut [i16]);
}

/// What a sound focus stage steers towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusMode {
    /// Follow the loudest sector.
    #[default]
    StrongestSector,
    /// Follow the talker while a keyword detector is armed.
    KeywordDetection,
}

/// Direction-of-arrival tracking for microphone arrays.
///
/// The engine feeds every array frame to [`accumulate`](Self::accumulate) and calls
/// [`update`](Self::update) once per activity period.
pub trait SoundFocus: Send {
    /// Switches the steering mode.
    fn set_mode(&mut self, mode: FocusMode);

    /// Adds one frame of every channel to the current activity period.
    fn accumulate(&mut self, chans: &[Vec<f32>]);

    /// Closes the activity period and recomputes the direction.
    fn update(&mut self);

    /// Direction of the focused signal in degrees.
    fn direction(&self) -> u16;
}

/// Speaker gain stage.
pub trait VolumeControl: Send {
    /// Sets the gain in dB.
    fn set_gain(&mut self, db: f32);

    /// Applies the gain to outgoing samples.
    fn apply(&mut self, samples: &mut [i16]);
}

/// Keyword detector that never fires.
#[derive(Debug, Default)]
pub struct NoKeywordDetector;

impl KeywordDetector for NoKeywordDetector {
    fn name(&self) -> &str {
        "none"
    }

    fn init(&mut self, _chan_qty: usize, _sensitivity: f32) -> KeywordCriterion {
        KeywordCriterion::Score
    }

    fn update(&mut self, _sensitivity: f32) {}

    fn run(&mut self, _chan: usize, _samples: &[f32]) -> bool {
        false
    }

    fn result(&self, _chan: usize) -> KeywordChannelResult {
        KeywordChannelResult::default()
    }
}

/// End-of-speech slot that reports no events and tracks peak level only.
#[derive(Debug, Default)]
pub struct PeakLevelEos {
    levels: [u8; 4],
}

impl EndOfSpeech for PeakLevelEos {
    fn run(&mut self, chan: usize, samples: &[f32]) -> EosEvent {
        if let Some(level) = self.levels.get_mut(chan) {
            let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
            *level = (peak.min(1.0) * 255.0) as u8;
        }
        EosEvent::None
    }

    fn signal_level(&self, chan: usize) -> u8 {
        self.levels.get(chan).copied().unwrap_or(0)
    }

    fn set_speech_begin(&mut self) {}
}

/// Preprocessor that leaves audio untouched.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Preprocessor for Passthrough {
    fn run(&mut self, _chans: &mut [Vec<f32>]) {}
}

/// Dynamic gain that keeps unity gain.
#[derive(Debug, Default)]
pub struct UnityGain;

impl DynamicGain for UnityGain {
    fn calculate(&mut self, _keyword: &[i16]) {}

    fn apply(&mut self, _samples: &mut [i16]) {}
}

/// Sound focus for single microphones: always reports direction 0.
#[derive(Debug, Default)]
pub struct NoSoundFocus;

impl SoundFocus for NoSoundFocus {
    fn set_mode(&mut self, _mode: FocusMode) {}

    fn accumulate(&mut self, _chans: &[Vec<f32>]) {}

    fn update(&mut self) {}

    fn direction(&self) -> u16 {
        0
    }
}

/// Volume control that scales samples by a dB gain.
#[derive(Debug, Default)]
pub struct DbVolumeControl {
    gain_db: f32,
}

impl VolumeControl for DbVolumeControl {
    fn set_gain(&mut self, db: f32) {
        self.gain_db = db;
    }

    fn apply(&mut self, samples: &mut [i16]) {
        convert::apply_gain_db(samples, self.gain_db);
    }
}

/// The set of algorithms an engine runs.
///
/// ```
/// use voice_engine::dsp::DspSuite;
/// use voice_engine::DspConfig;
///
/// let suite = DspSuite::default().configured(&DspConfig::default());
/// assert_eq!(suite.keyword.name(), "none");
/// ```
pub struct DspSuite {
    /// Wake-word detector.
    pub keyword: Box<dyn KeywordDetector>,
    /// End-of-speech detector.
    pub eos: Box<dyn EndOfSpeech>,
    /// Preprocessor.
    pub ppr: Box<dyn Preprocessor>,
    /// Dynamic gain.
    pub dga: Box<dyn DynamicGain>,
    /// Direction of arrival.
    pub sdf: Box<dyn SoundFocus>,
    /// Speaker volume.
    pub volume: Box<dyn VolumeControl>,
}

impl Default for DspSuite {
    fn default() -> Self {
        Self {
            keyword: Box::new(NoKeywordDetector),
            eos: Box::new(PeakLevelEos::default()),
            ppr: Box::new(Passthrough),
            dga: Box::new(UnityGain),
            sdf: Box::new(NoSoundFocus),
            volume: Box::new(DbVolumeControl::default()),
        }
    }
}

impl DspSuite {
    /// Replaces the keyword detector.
    #[must_use]
    pub fn with_keyword(mut self, detector: impl KeywordDetector + 'static) -> Self {
        self.keyword = Box::new(detector);
        self
    }

    /// Replaces the end-of-speech detector.
    #[must_use]
    pub fn with_eos(mut self, eos: impl EndOfSpeech + 'static) -> Self {
        self.eos = Box::new(eos);
        self
    }

    /// Replaces the preprocessor.
    #[must_use]
    pub fn with_preprocessor(mut self, ppr: impl Preprocessor + 'static) -> Self {
        self.ppr = Box::new(ppr);
        self
    }

    /// Replaces the dynamic gain stage.
    #[must_use]
    pub fn with_dynamic_gain(mut self, dga: impl DynamicGain + 'static) -> Self {
        self.dga = Box::new(dga);
        self
    }

    /// Replaces the sound focus stage.
    #[must_use]
    pub fn with_sound_focus(mut self, sdf: impl SoundFocus + 'static) -> Self {
        self.sdf = Box::new(sdf);
        self
    }

    /// Replaces the speaker volume stage.
    #[must_use]
    pub fn with_volume(mut self, volume: impl VolumeControl + 'static) -> Self {
        self.volume = Box::new(volume);
        self
    }

    /// Swaps every slot disabled in `config` for its no-op implementation.
    #[must_use]
    pub fn configured(mut self, config: &DspConfig) -> Self {
        if !config.eos_enabled {
            self.eos = Box::new(PeakLevelEos::default());
        }
        if !config.ppr_enabled {
            self.ppr = Box::new(Passthrough);
        }
        if !config.dga_enabled {
            self.dga = Box::new(UnityGain);
        }
        self
    }
}

impl std::fmt::Debug for DspSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DspSuite")
            .field("keyword", &self.keyword.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedEos;

    impl EndOfSpeech for ScriptedEos {
        fn run(&mut self, _chan: usize, _samples: &[f32]) -> EosEvent {
            EosEvent::EndOfSpeech
        }

        fn signal_level(&self, _chan: usize) -> u8 {
            9
        }

        fn set_speech_begin(&mut self) {}
    }

    #[test]
    fn test_peak_level_eos() {
        let mut eos = PeakLevelEos::default();
        assert_eq!(eos.run(1, &[0.0, -0.5, 0.25]), EosEvent::None);
        assert_eq!(eos.signal_level(1), 127);
        assert_eq!(eos.signal_level(0), 0);
        assert_eq!(eos.signal_level(9), 0);
    }

    #[test]
    fn test_no_keyword_detector_never_fires() {
        let mut detector = NoKeywordDetector;
        assert_eq!(detector.init(4, 0.5), KeywordCriterion::Score);
        assert!(!detector.run(0, &[1.0; 320]));
        assert_eq!(detector.sensitivity_limits(), (0.0, 1.0));
    }

    #[test]
    fn test_no_sound_focus_points_ahead() {
        let mut sdf = NoSoundFocus;
        sdf.set_mode(FocusMode::KeywordDetection);
        sdf.accumulate(&[vec![0.5; 320], vec![-0.5; 320]]);
        sdf.update();
        assert_eq!(sdf.direction(), 0);
    }

    #[test]
    fn test_db_volume_control() {
        let mut volume = DbVolumeControl::default();
        let mut samples = vec![1000i16];
        volume.apply(&mut samples);
        assert_eq!(samples[0], 1000);
        volume.set_gain(-6.0);
        volume.apply(&mut samples);
        assert!((samples[0] - 501).abs() <= 1);
    }

    #[test]
    fn test_configured_disables_eos() {
        let config = DspConfig {
            eos_enabled: false,
            ..DspConfig::default()
        };
        let mut suite = DspSuite::default().with_eos(ScriptedEos).configured(&config);
        assert_eq!(suite.eos.run(0, &[0.0]), EosEvent::None);

        let mut enabled = DspSuite::default().with_eos(ScriptedEos).configured(&DspConfig::default());
        assert_eq!(enabled.eos.run(0, &[0.0]), EosEvent::EndOfSpeech);
        assert_eq!(enabled.eos.signal_level(0), 9);
    }
}

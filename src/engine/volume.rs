//! Speaker volume steps, ramping and gain.

use crate::config::OutputConfig;
use crate::dsp::VolumeControl;
use crate::format::convert;
use crate::hal::HalOutput;

/// Nominal volume step (0 dB).
pub(crate) const VOLUME_NOMINAL: i8 = 0;

/// Clamps `step` into `min..=max`; the flag reports whether clamping happened.
pub(crate) fn clamp_step(step: i8, min: i8, max: i8) -> (i8, bool) {
    if step > max {
        (max, true)
    } else if step < min {
        (min, true)
    } else {
        (step, false)
    }
}

/// Engine-side volume state for the open speaker.
///
/// The client stores the requested step; the engine walks the applied step towards it,
/// one step per frame when ramping, and converts the applied step to a dB gain.
#[derive(Debug, Clone)]
pub(crate) struct VolumeState {
    target: i8,
    current: i8,
    ramp: bool,
    bumper: bool,
    min: i8,
    max: i8,
    step_db: f32,
    use_ext_gain: bool,
}

impl VolumeState {
    pub(crate) fn new(config: &OutputConfig) -> Self {
        Self {
            target: VOLUME_NOMINAL,
            current: VOLUME_NOMINAL,
            ramp: config.ramp_enabled,
            bumper: false,
            min: config.volume_min,
            max: config.volume_max,
            step_db: config.volume_step_db,
            use_ext_gain: config.use_ext_gain,
        }
    }

    /// Sets a new target step (already clamped by the caller).
    pub(crate) fn set(&mut self, step: i8, ramp: bool, bumper: bool) {
        self.target = step;
        self.ramp = ramp;
        self.bumper |= bumper;
        tracing::debug!(target = step, current = self.current, ramp, "volume set");
    }

    /// Replaces the step range and size; the target is pulled into the new range.
    pub(crate) fn configure(&mut self, max: i8, min: i8, step_db: f32, use_ext_gain: bool) {
        self.max = max;
        self.min = min;
        self.step_db = step_db;
        self.use_ext_gain = use_ext_gain;
        self.target = clamp_step(self.target, min, max).0;
    }

    /// Step currently applied to samples.
    pub(crate) fn current(&self) -> i8 {
        self.current
    }

    pub(crate) fn gain_db(&self) -> f32 {
        f32::from(self.current) * self.step_db
    }

    /// Advances the applied step for one frame and applies the gain.
    pub(crate) fn apply(
        &mut self,
        samples: &mut [i16],
        control: &mut dyn VolumeControl,
        hal: &mut dyn HalOutput,
        hal_volume_control: bool,
    ) {
        if self.current != self.target {
            if self.ramp {
                if self.current < self.target {
                    self.current = (self.current + 1).min(self.max);
                } else {
                    self.current = (self.current - 1).max(self.min);
                }
            } else {
                self.current = self.target;
            }
            control.set_gain(self.gain_db());
            tracing::trace!(current = self.current, target = self.target, "volume step applied");
        } else if self.bumper {
            tracing::info!(current = self.current, "volume bumper");
            self.bumper = false;
        }

        let external = hal_volume_control && self.use_ext_gain;
        if !external {
            control.apply(samples);
        }
        if hal_volume_control {
            let scale = if external {
                convert::db_to_linear(self.gain_db())
            } else {
                1.0
            };
            hal.volume_scale(scale, scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::DbVolumeControl;
    use crate::hal::{Hal, MockHal, OutputOpenParams};
    use crate::device::{OutputDevices, ResourceId};
    use crate::format::OutputFormat;

    fn speaker(hal: &mut MockHal) -> Box<dyn HalOutput> {
        hal.output_open(&OutputOpenParams {
            device: OutputDevices::NORMAL,
            resource: ResourceId::new(0).unwrap(),
            user_id: 0,
            format: OutputFormat::default(),
        })
        .unwrap()
    }

    #[test]
    fn test_clamp_step_sets_bumper() {
        assert_eq!(clamp_step(5, -12, 3), (3, true));
        assert_eq!(clamp_step(-20, -12, 3), (-12, true));
        assert_eq!(clamp_step(-2, -12, 3), (-2, false));
    }

    #[test]
    fn test_immediate_volume_change() {
        let mut hal = MockHal::new();
        let mut out = speaker(&mut hal);
        let mut control = DbVolumeControl::default();
        let mut state = VolumeState::new(&OutputConfig::default());

        state.set(-3, false, false);
        let mut samples = vec![10_000i16; 4];
        state.apply(&mut samples, &mut control, out.as_mut(), false);
        assert_eq!(state.current(), -3);
        // -6 dB halves the amplitude.
        assert!((i32::from(samples[0]) - 5011).abs() <= 2);
    }

    #[test]
    fn test_ramp_moves_one_step_per_frame() {
        let mut hal = MockHal::new();
        let mut out = speaker(&mut hal);
        let mut control = DbVolumeControl::default();
        let mut state = VolumeState::new(&OutputConfig::default());

        state.set(3, true, false);
        let mut steps = Vec::new();
        for _ in 0..5 {
            state.apply(&mut [0i16; 4], &mut control, out.as_mut(), false);
            steps.push(state.current());
        }
        assert_eq!(steps, vec![1, 2, 3, 3, 3]);
    }

    #[test]
    fn test_external_gain_goes_to_hal() {
        let mut hal = MockHal::new();
        let mut out = speaker(&mut hal);
        let mut control = DbVolumeControl::default();
        let config = OutputConfig {
            use_ext_gain: true,
            ..OutputConfig::default()
        };
        let mut state = VolumeState::new(&config);

        state.set(-3, false, false);
        let mut samples = vec![10_000i16; 4];
        state.apply(&mut samples, &mut control, out.as_mut(), true);
        assert_eq!(samples[0], 10_000);

        let scales = hal.volume_scales();
        let (left, right) = scales[scales.len() - 1];
        assert!((left - 0.501).abs() < 0.01);
        assert_eq!(left, right);
    }

    #[test]
    fn test_configure_clamps_target() {
        let mut state = VolumeState::new(&OutputConfig::default());
        state.set(-10, false, false);
        state.configure(6, -6, 1.0, false);
        assert_eq!(state.target, -6);
    }
}

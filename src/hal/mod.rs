//! Hardware abstraction boundary.
//!
//! The engine never touches audio hardware directly. A [`Hal`] reports device
//! capabilities and opens one [`HalInput`] (microphone) and one [`HalOutput`] (speaker)
//! per object; the opened halves are moved onto the engine thread and driven from there,
//! one frame per tick.
//!
//! - [`MockHal`]: scripted in-memory hardware for tests and CI
//! - `HostHal`: CPAL-backed host audio (feature `host-audio`)

mod mock;

#[cfg(feature = "host-audio")]
mod host;

pub use mock::MockHal;

#[cfg(feature = "host-audio")]
pub use host::HostHal;

use std::io;

use crate::device::{HalCapabilities, InputDevices, OutputDevices, PowerMode, ResourceId};
use crate::format::{InputFormat, LatencyMode, OutputFormat};

/// Parameters for opening the microphone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputOpenParams {
    /// Devices requested by the client.
    pub devices: InputDevices,
    /// Hardware-native format to deliver (16 kHz, 2 or 4 byte samples).
    pub format: InputFormat,
    /// Power mode at open time.
    pub power_mode: PowerMode,
    /// Deliver silence instead of microphone audio.
    pub privacy_mode: bool,
}

/// Parameters for opening the speaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputOpenParams {
    /// Device requested by the client.
    pub device: OutputDevices,
    /// Granted speaker resource.
    pub resource: ResourceId,
    /// Shared-region user id of the opening object.
    pub user_id: u8,
    /// Format of the samples the engine will write.
    pub format: OutputFormat,
}

/// Counters the microphone driver keeps about its own buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HalInputStats {
    /// High-water mark of samples queued inside the driver.
    pub samples_buffered_max: u32,
    /// Samples the driver dropped.
    pub samples_lost: u32,
}

/// A hardware backend.
///
/// Implementations are owned by the client object and accessed from client threads only;
/// the opened [`HalInput`]/[`HalOutput`] halves move to the engine thread.
pub trait Hal: Send {
    /// Human-readable backend name, reported with keyword results.
    fn name(&self) -> &str;

    /// Current capability table.
    ///
    /// May change after a device open (for example when a DSP image is reloaded), so
    /// callers query it again rather than caching it forever.
    fn capabilities(&self) -> HalCapabilities;

    /// Input and output devices physically present.
    fn available_devices(&self) -> (InputDevices, OutputDevices);

    /// Opens the microphone. `None` means the device could not be opened.
    fn input_open(&mut self, params: &InputOpenParams) -> Option<Box<dyn HalInput>>;

    /// Opens the speaker. `None` means the device could not be opened.
    fn output_open(&mut self, params: &OutputOpenParams) -> Option<Box<dyn HalOutput>>;

    /// Changes the power mode. Returns `false` if the hardware refused.
    fn power_mode(&mut self, mode: PowerMode) -> bool;

    /// Enables or disables microphone privacy. Returns `false` if the hardware refused.
    fn privacy_mode(&mut self, enable: bool) -> bool;

    /// Reads the privacy state back from the hardware.
    fn privacy_mode_get(&self) -> Option<bool>;
}

/// An opened microphone.
pub trait HalInput: Send {
    /// Format of the frames returned by [`read`](Self::read).
    fn format(&self) -> InputFormat;

    /// Reads exactly one frame into `buf`; returns the number of bytes read.
    ///
    /// Anything short of `buf.len()` is a device error.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Tells the hardware which channel won keyword election.
    ///
    /// Returns `true` when the hardware wants the detection ignored.
    fn detection(&mut self, _chan: usize) -> bool {
        false
    }

    /// Sets where the hardware-side stream starts, in samples before the detection.
    fn stream_start_set(&mut self, _begin: u32) -> bool {
        true
    }

    /// Resets any keyword detector running inside the hardware.
    fn keyword_detector_reset(&mut self) {}

    /// Switches raw microphone test mode (unprocessed 32-bit frames).
    fn test_mode(&mut self, _enable: bool) -> bool {
        true
    }

    /// Applies a stream latency mode.
    fn latency_set(&mut self, _mode: LatencyMode) -> bool {
        true
    }

    /// Driver buffering counters.
    fn stats(&self) -> HalInputStats {
        HalInputStats::default()
    }
}

/// An opened speaker.
pub trait HalOutput: Send {
    /// Writes interleaved samples; returns the number of samples accepted.
    fn write(&mut self, samples: &[i16]) -> io::Result<usize>;

    /// Applies a volume step in hardware. Returns `false` if the hardware refused.
    fn volume_set(&mut self, _left: i8, _right: i8) -> bool {
        true
    }

    /// Applies a linear gain in hardware (used when the HAL controls volume).
    fn volume_scale(&mut self, _left: f32, _right: f32) {}

    /// Output latency in microseconds.
    fn latency_us(&self) -> u32 {
        0
    }
}

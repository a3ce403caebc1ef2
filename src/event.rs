//! Session events and callback types.
//!
//! Once a request has been accepted by the engine, everything that happens to it is
//! reported here: progress (first frame, stream-time threshold), terminal conditions
//! (end of speech, end of buffer, errors) and resource grants/revocations.

use std::sync::Arc;

use crate::device::InputDevices;
use crate::format::InputFormat;

/// Events delivered to an audio-in (record/stream) callback.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioInEvent {
    /// An asynchronous operation completed (stop, capture start).
    Ok,
    /// End of speech ended the session.
    Eos(AudioStats),
    /// No speech was detected within the initial timeout.
    EosTimeoutInitial(AudioStats),
    /// Speech did not end within the timeout.
    EosTimeoutEnd(AudioStats),
    /// The first frame reached the destination.
    FirstFrame,
    /// A memory destination is full.
    EndOfBuffer,
    /// A non-blocking pipe could not accept a frame; the frame was not delivered.
    Overflow,
    /// The configured minimum stream time has been delivered.
    StreamTimeMinimum,
    /// The keyword end has been delivered.
    StreamKeywordInfo {
        /// Position of the keyword end in the stream, as configured with
        /// `stream_keyword_info` (begin + duration).
        byte_qty: u32,
    },
    /// The session ended with an error.
    Error,
}

impl AudioInEvent {
    /// True for events that end the session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Eos(_)
                | Self::EosTimeoutInitial(_)
                | Self::EosTimeoutEnd(_)
                | Self::EndOfBuffer
                | Self::Error
        )
    }
}

/// Events delivered to an audio-out (playback) callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOutEvent {
    /// An asynchronous operation completed (pause, resume, stop).
    Ok,
    /// The first frame has been played.
    FirstFrame,
    /// The source is exhausted.
    Eof,
    /// A pipe source had no data; silence was played.
    Underflow,
    /// Playback failed.
    Error,
}

/// Events delivered to a keyword callback.
#[derive(Debug, Clone, PartialEq)]
pub enum KeywordEvent {
    /// The keyword was detected.
    Detected {
        /// Election result.
        result: KeywordResult,
        /// Format of the microphone audio the endpoints refer to.
        format: InputFormat,
    },
    /// The detector lost its input.
    ErrorFd,
    /// Generic detection error.
    Error,
}

/// Events delivered to a resource callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    /// Resources were granted; the object may now be opened.
    Granted,
    /// Resources were revoked; the object must stop, close and release.
    Revoked,
}

/// Sample offsets describing a detected keyword.
///
/// Offsets are negative sample counts relative to the frame in which the detection was
/// reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeywordEndpoints {
    /// Start of the pre-roll window.
    pub pre: i32,
    /// Keyword begin.
    pub begin: i32,
    /// Keyword end.
    pub end: i32,
}

/// Per-channel detector output.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KeywordChannelResult {
    /// Whether this channel triggered.
    pub triggered: bool,
    /// Detector score.
    pub score: f32,
    /// Signal to noise ratio.
    pub snr: f32,
    /// Endpoints of this channel's own trigger.
    pub endpoints: KeywordEndpoints,
}

/// Outcome of multi-channel keyword election.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeywordResult {
    /// Index of the winning channel.
    pub chan_selected: usize,
    /// Endpoints of the winner, adjusted for frames elapsed since its trigger.
    pub endpoints: KeywordEndpoints,
    /// Per-channel detail.
    pub channels: Vec<KeywordChannelResult>,
    /// Name of the detector.
    pub detector_name: String,
    /// Name of the DSP (or HAL) that ran it.
    pub dsp_name: String,
}

/// Counters reported with terminal EOS events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioStats {
    /// Frames delivered.
    pub packets_processed: u32,
    /// Frames that could not be delivered.
    pub packets_lost: u32,
    /// Samples delivered.
    pub samples_processed: u32,
    /// Samples lost.
    pub samples_lost: u32,
    /// Decoder failures (always zero for PCM).
    pub decoder_failures: u32,
    /// High-water mark of samples buffered by the HAL.
    pub samples_buffered_max: u32,
}

/// Selects which engine counters `statistics_clear`/`statistics_print` act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsMask(pub u32);

impl StatisticsMask {
    /// Microphone frame counters.
    pub const INPUT_GENERAL: Self = Self(0x0000_0001);
    /// Microphone tick timing.
    pub const INPUT_TIMING: Self = Self(0x0000_0002);
    /// Speaker frame counters.
    pub const OUTPUT_GENERAL: Self = Self(0x0001_0000);
    /// Speaker tick timing.
    pub const OUTPUT_TIMING: Self = Self(0x0002_0000);
    /// Every microphone counter.
    pub const INPUT_ALL: Self = Self(Self::INPUT_GENERAL.0 | Self::INPUT_TIMING.0);
    /// Every speaker counter.
    pub const OUTPUT_ALL: Self = Self(Self::OUTPUT_GENERAL.0 | Self::OUTPUT_TIMING.0);
    /// Everything.
    pub const ALL: Self = Self(Self::INPUT_ALL.0 | Self::OUTPUT_ALL.0);

    /// True when any bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Callback for audio-in events.
pub type AudioInCallback = Arc<dyn Fn(InputDevices, AudioInEvent) + Send + Sync>;

/// Callback for audio-out events.
pub type AudioOutCallback = Arc<dyn Fn(AudioOutEvent) + Send + Sync>;

/// Callback for keyword events.
pub type KeywordCallback = Arc<dyn Fn(InputDevices, KeywordEvent) + Send + Sync>;

/// Callback for resource events.
pub type ResourceCallback = Arc<dyn Fn(ResourceEvent) + Send + Sync>;

/// Receives microphone frames for `stream_to_user`, as little-endian bytes in the
/// delivered format.
pub type AudioInDataCallback = Box<dyn FnMut(InputDevices, &[u8]) + Send>;

/// Fills speaker frames for `play_from_user`; returns the number of samples written
/// (0 signals end of stream).
pub type AudioOutDataCallback = Box<dyn FnMut(&mut [i16]) -> usize + Send>;

/// Creates an [`AudioInCallback`] from a closure.
pub fn audio_in_callback<F>(f: F) -> AudioInCallback
where
    F: Fn(InputDevices, AudioInEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Creates an [`AudioOutCallback`] from a closure.
pub fn audio_out_callback<F>(f: F) -> AudioOutCallback
where
    F: Fn(AudioOutEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Creates a [`KeywordCallback`] from a closure.
pub fn keyword_callback<F>(f: F) -> KeywordCallback
where
    F: Fn(InputDevices, KeywordEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Creates a [`ResourceCallback`] from a closure.
pub fn resource_callback<F>(f: F) -> ResourceCallback
where
    F: Fn(ResourceEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_terminal_events() {
        assert!(AudioInEvent::Eos(AudioStats::default()).is_terminal());
        assert!(AudioInEvent::EndOfBuffer.is_terminal());
        assert!(!AudioInEvent::FirstFrame.is_terminal());
        assert!(!AudioInEvent::Overflow.is_terminal());
    }

    #[test]
    fn test_statistics_mask() {
        assert!(StatisticsMask::ALL.contains(StatisticsMask::OUTPUT_TIMING));
        assert!(!StatisticsMask::INPUT_ALL.contains(StatisticsMask::OUTPUT_GENERAL));
    }

    #[test]
    fn test_keyword_event_debug() {
        let event = KeywordEvent::Detected {
            result: KeywordResult {
                chan_selected: 2,
                ..KeywordResult::default()
            },
            format: InputFormat::default(),
        };
        let debug = format!("{event:?}");
        assert!(debug.contains("Detected"));
        assert!(debug.contains("chan_selected: 2"));
    }

    #[test]
    fn test_callback_helper() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = resource_callback(move |event| {
            assert_eq!(event, ResourceEvent::Granted);
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(ResourceEvent::Granted);
        assert!(called.load(Ordering::SeqCst));
    }
}

//! # voice-engine
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Frame-driven voice audio engine with keyword detection and a cross-process resource
//! broker.
//!
//! A [`VoiceAudio`] object asks the broker for microphone and speaker resources, opens
//! them through a [`Hal`] and then records, streams and plays audio. All audio work
//! happens on a dedicated engine thread paced by a 20 ms frame timer; the object talks
//! to it through a mailbox and never touches samples itself.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use voice_engine::{
//!     resource_callback, InputDevices, MemoryBuffer, OutputDevices, PowerMode, RecordWindow,
//!     ResourceEvent, ResourcePriority, VoiceAudio,
//! };
//!
//! let mut audio = VoiceAudio::builder().build()?;
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! audio
//!     .resource_request(
//!         InputDevices::SINGLE,
//!         OutputDevices::NORMAL,
//!         ResourcePriority::Medium,
//!         resource_callback(move |event| {
//!             let _ = tx.send(event);
//!         }),
//!     )
//!     .await?;
//! assert_eq!(rx.recv().await, Some(ResourceEvent::Granted));
//!
//! audio
//!     .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NORMAL, None)
//!     .await?;
//! let buffer = MemoryBuffer::with_capacity(32_000);
//! audio
//!     .record_to_memory(InputDevices::SINGLE, buffer.clone(), RecordWindow::default(), None)
//!     .await?;
//! audio.resource_release().await?;
//! ```
//!
//! ## Architecture
//!
//! - **Client object**: validates calls, tracks session state, owns the resource grant
//! - **Engine thread**: frame timers, keyword election, pre-detection buffering, sinks
//! - **Broker thread**: arbitrates resources between objects through a shared region
//!   and notifies owners over named fifos
//!
//! The session registry keeps one input session per group across every object in the
//! process.

// unsafe_code lint is configured in Cargo.toml as "deny"; fd handling opts in locally
#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod broker;
mod client;
mod config;
mod device;
pub mod dsp;
mod engine;
mod error;
mod event;
pub mod format;
mod frame;
pub mod hal;
mod registry;
mod sink;

pub use broker::{Liveness, ProcessLiveness, ResourceGrant, SharedRegion, GLOBAL_REGION_NAME};
pub use client::{InputState, OutputState, PipeDestination, RecordWindow, VoiceAudio, VoiceAudioBuilder};
pub use config::{
    DspConfig, EngineConfig, InputConfig, InternalCaptureConfig, OutputConfig, ResourceConfig,
    FRAME_GROUP_QTY_RANGE, PRE_DETECTION_DURATION_MAX_MS, STREAM_TIME_MINIMUM_MAX_MS,
};
pub use device::{
    HalCapabilities, InputCaps, InputDevices, OutputCaps, OutputDevices, PowerMode, ResourceId,
    ResourcePriority, RESOURCE_ID_QTY,
};
pub use engine::capture::internal_capture_delete_files;
pub use error::{SinkError, VoiceAudioError};
pub use event::{
    audio_in_callback, audio_out_callback, keyword_callback, resource_callback, AudioInCallback,
    AudioInDataCallback, AudioInEvent, AudioOutCallback, AudioOutDataCallback, AudioOutEvent,
    AudioStats, KeywordCallback, KeywordChannelResult, KeywordEndpoints, KeywordEvent,
    KeywordResult, ResourceCallback, ResourceEvent, StatisticsMask,
};
pub use format::{CaptureKind, Container, Encoding, InputFormat, OutputFormat, RecordFrom, RecordUntil};
pub use frame::MicFrame;
pub use hal::{Hal, MockHal};
pub use registry::{SessionGroup, VoiceSessionRegistry};
pub use sink::{FileSink, MemoryBuffer, MemorySink, PipeSink, RecordSink, UserSink};

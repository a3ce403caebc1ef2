//! Integration tests for voice-engine.
//!
//! Everything runs against [`MockHal`]; no audio hardware is needed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use voice_engine::dsp::{DspSuite, KeywordCriterion, KeywordDetector};
use voice_engine::format::wav;
use voice_engine::{
    audio_in_callback, audio_out_callback, internal_capture_delete_files, keyword_callback,
    resource_callback, AudioInEvent, AudioOutEvent, Container, EngineConfig, InputDevices,
    InputState, KeywordChannelResult, KeywordEndpoints, KeywordEvent, MemoryBuffer, MockHal,
    OutputDevices, OutputFormat, OutputState, PowerMode, RecordWindow,
    ResourceCallback, ResourceEvent, ResourcePriority, SessionGroup, SharedRegion, VoiceAudio,
    VoiceAudioError, VoiceSessionRegistry,
};

struct Client {
    audio: VoiceAudio,
    events: mpsc::UnboundedReceiver<ResourceEvent>,
    callback: ResourceCallback,
}

fn client(hal: &MockHal, shared: &SharedRegion, registry: &VoiceSessionRegistry, dir: &std::path::Path) -> Client {
    let mut config = EngineConfig::default();
    config.resource.fifo_dir = dir.to_path_buf();
    let audio = VoiceAudio::builder()
        .hal(hal.clone())
        .config(config)
        .shared_region(shared.clone())
        .registry(registry.clone())
        .build()
        .unwrap();
    let (tx, events) = mpsc::unbounded_channel();
    let callback = resource_callback(move |event| {
        let _ = tx.send(event);
    });
    Client {
        audio,
        events,
        callback,
    }
}

async fn next_event(client: &mut Client) -> ResourceEvent {
    tokio::time::timeout(Duration::from_secs(5), client.events.recv())
        .await
        .expect("no resource event")
        .expect("callback dropped")
}

#[tokio::test]
async fn test_record_and_play_after_grant() {
    let dir = tempfile::tempdir().unwrap();
    let hal = MockHal::new();
    let mut c = client(&hal, &SharedRegion::new().unwrap(), &VoiceSessionRegistry::new(), dir.path());

    let early = c
        .audio
        .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NORMAL, None)
        .await;
    assert!(matches!(early, Err(VoiceAudioError::Resource)));

    c.audio
        .resource_request(InputDevices::SINGLE, OutputDevices::NORMAL, ResourcePriority::Medium, c.callback.clone())
        .await
        .unwrap();
    assert_eq!(next_event(&mut c).await, ResourceEvent::Granted);
    c.audio
        .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NORMAL, None)
        .await
        .unwrap();

    // 200 ms of tone, recorded until the buffer is full.
    hal.push_sine(440.0, 200);
    let buffer = MemoryBuffer::with_capacity(16_000 * 2 / 5);
    let event = c
        .audio
        .record_to_memory(InputDevices::SINGLE, buffer.clone(), RecordWindow::live(), None)
        .await
        .unwrap();
    assert_eq!(event, Some(AudioInEvent::EndOfBuffer));
    assert_eq!(buffer.len(), buffer.capacity());
    assert!(buffer.samples().iter().any(|&s| s != 0));

    // Play the recording back.
    let event = c
        .audio
        .play_from_memory(OutputFormat::default(), buffer.to_vec(), None)
        .await
        .unwrap();
    assert_eq!(event, Some(AudioOutEvent::Eof));
    assert_eq!(hal.speaker_samples().len(), buffer.len() / 2);
    assert_eq!(c.audio.play_state(), OutputState::Idling);

    c.audio.resource_release().await.unwrap();
    assert!(!c.audio.is_open());
    assert_eq!(hal.is_open(), (false, false));
}

#[tokio::test]
async fn test_higher_priority_revokes_holder() {
    let dir = tempfile::tempdir().unwrap();
    let hal = MockHal::new();
    let shared = SharedRegion::new().unwrap();
    let registry = VoiceSessionRegistry::new();
    let mut low = client(&hal, &shared, &registry, dir.path());
    let mut high = client(&hal, &shared, &registry, dir.path());

    low.audio
        .resource_request(InputDevices::SINGLE, OutputDevices::NORMAL, ResourcePriority::Low, low.callback.clone())
        .await
        .unwrap();
    assert_eq!(next_event(&mut low).await, ResourceEvent::Granted);
    low.audio
        .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NORMAL, None)
        .await
        .unwrap();
    let buffer = MemoryBuffer::with_capacity(16_000 * 2 * 10);
    low.audio
        .record_to_memory(InputDevices::SINGLE, buffer, RecordWindow::live(), Some(audio_in_callback(|_, _| {})))
        .await
        .unwrap();
    assert_eq!(low.audio.record_state(InputDevices::SINGLE), InputState::Recording);

    high.audio
        .resource_request(InputDevices::SINGLE, OutputDevices::NONE, ResourcePriority::High, high.callback.clone())
        .await
        .unwrap();
    assert_eq!(next_event(&mut low).await, ResourceEvent::Revoked);
    assert!(high.audio.grant().is_none());

    // Releasing closes the open session and hands the microphone over.
    low.audio.resource_release().await.unwrap();
    assert_eq!(low.audio.record_state(InputDevices::SINGLE), InputState::Created);
    assert_eq!(next_event(&mut high).await, ResourceEvent::Granted);

    high.audio
        .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NONE, None)
        .await
        .unwrap();
    let path = dir.path().join("handover.wav");
    high.audio
        .record_to_file(InputDevices::SINGLE, Container::Wav, &path, RecordWindow::live(), Some(audio_in_callback(|_, _| {})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    high.audio.record_stop(InputDevices::SINGLE).await.unwrap();

    let speaker = high.audio.play_from_memory(OutputFormat::default(), vec![0; 640], None).await;
    assert!(matches!(speaker, Err(VoiceAudioError::Output { .. })));
    high.audio.resource_release().await.unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], b"RIFF");
    assert!(bytes.len() > wav::WAV_HEADER_SIZE);
    assert_eq!(shared.user_count(), 0);
}

/// Fires once, after a fixed number of frames on channel 0.
struct FireAfter {
    frames: usize,
    at: usize,
}

impl KeywordDetector for FireAfter {
    fn name(&self) -> &str {
        "fire-after"
    }

    fn init(&mut self, _chan_qty: usize, _sensitivity: f32) -> KeywordCriterion {
        KeywordCriterion::Score
    }

    fn update(&mut self, _sensitivity: f32) {}

    fn run(&mut self, chan: usize, _samples: &[f32]) -> bool {
        if chan == 0 {
            self.frames += 1;
        }
        self.frames == self.at
    }

    fn result(&self, _chan: usize) -> KeywordChannelResult {
        KeywordChannelResult {
            triggered: true,
            score: 0.8,
            snr: 12.0,
            endpoints: KeywordEndpoints {
                pre: 0,
                begin: -6400,
                end: -640,
            },
        }
    }
}

#[tokio::test]
async fn test_keyword_detection_holds_session_group() {
    let dir = tempfile::tempdir().unwrap();
    let registry = VoiceSessionRegistry::new();
    let mut config = EngineConfig::default();
    config.resource.fifo_dir = dir.path().to_path_buf();
    let audio = VoiceAudio::builder()
        .hal(MockHal::new())
        .config(config)
        .dsp(DspSuite::default().with_keyword(FireAfter { frames: 0, at: 10 }))
        .shared_region(SharedRegion::new().unwrap())
        .registry(registry.clone())
        .build()
        .unwrap();
    let (tx, events) = mpsc::unbounded_channel();
    let mut c = Client {
        audio,
        events,
        callback: resource_callback(move |event| {
            let _ = tx.send(event);
        }),
    };
    c.audio
        .resource_request(InputDevices::SINGLE, OutputDevices::NONE, ResourcePriority::Medium, c.callback.clone())
        .await
        .unwrap();
    assert_eq!(next_event(&mut c).await, ResourceEvent::Granted);
    c.audio
        .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NONE, None)
        .await
        .unwrap();

    let (kwd_tx, mut detections) = mpsc::unbounded_channel();
    c.audio
        .detect_keyword(keyword_callback(move |source, event| {
            let _ = kwd_tx.send((source, event));
        }))
        .await
        .unwrap();
    assert_eq!(c.audio.record_state(InputDevices::SINGLE), InputState::Detecting);
    assert!(registry.owner(SessionGroup::Default).is_none());

    let (source, event) = tokio::time::timeout(Duration::from_secs(5), detections.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(source, InputDevices::SINGLE);
    match event {
        KeywordEvent::Detected { result, .. } => assert_eq!(result.detector_name, "fire-after"),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(registry.owner(SessionGroup::Default), InputDevices::SINGLE);

    // The group stays claimed until the follow-up session ends.
    c.audio.detect_stop().await.unwrap();
    assert_eq!(c.audio.record_state(InputDevices::SINGLE), InputState::Idling);
    assert_eq!(registry.owner(SessionGroup::Default), InputDevices::SINGLE);
    c.audio
        .record_to_memory(
            InputDevices::SINGLE,
            MemoryBuffer::with_capacity(16_000 * 2 * 10),
            RecordWindow::live(),
            Some(audio_in_callback(|_, _| {})),
        )
        .await
        .unwrap();
    c.audio.record_stop(InputDevices::SINGLE).await.unwrap();
    assert!(registry.owner(SessionGroup::Default).is_none());

    c.audio.resource_release().await.unwrap();
}

#[tokio::test]
async fn test_async_playback_reports_events() {
    let dir = tempfile::tempdir().unwrap();
    let hal = MockHal::new();
    let mut c = client(&hal, &SharedRegion::new().unwrap(), &VoiceSessionRegistry::new(), dir.path());
    c.audio
        .resource_request(InputDevices::NONE, OutputDevices::NORMAL, ResourcePriority::Medium, c.callback.clone())
        .await
        .unwrap();
    assert_eq!(next_event(&mut c).await, ResourceEvent::Granted);
    c.audio
        .open(PowerMode::Full, false, InputDevices::NONE, OutputDevices::NORMAL, None)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = audio_out_callback(move |event| {
        let _ = tx.send(event);
    });
    let mut image = wav::header(1, 16_000, 2, 3200).to_vec();
    image.extend(std::iter::repeat([0x10, 0x00]).take(1600).flatten());
    let path = dir.path().join("prompt.wav");
    std::fs::write(&path, image).unwrap();

    let event = c.audio.play_from_file(&path, Some(callback)).await.unwrap();
    assert_eq!(event, None);
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        seen.push(event);
        if event == AudioOutEvent::Eof {
            break;
        }
    }
    assert_eq!(seen.first(), Some(&AudioOutEvent::FirstFrame));
    assert_eq!(seen.last(), Some(&AudioOutEvent::Eof));

    // The session ended on its own; stopping settles the state.
    c.audio.play_stop().await.unwrap();
    assert_eq!(c.audio.play_state(), OutputState::Idling);
    c.audio.resource_release().await.unwrap();
}

#[tokio::test]
async fn test_engine_thread_poll_runs_on_engine() {
    let dir = tempfile::tempdir().unwrap();
    let hal = MockHal::new();
    let mut c = client(&hal, &SharedRegion::new().unwrap(), &VoiceSessionRegistry::new(), dir.path());
    c.audio
        .resource_request(InputDevices::SINGLE, OutputDevices::NONE, ResourcePriority::Medium, c.callback.clone())
        .await
        .unwrap();
    assert_eq!(next_event(&mut c).await, ResourceEvent::Granted);
    c.audio
        .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NONE, None)
        .await
        .unwrap();

    let name = Arc::new(Mutex::new(None));
    let slot = name.clone();
    c.audio
        .thread_poll(move || {
            *slot.lock() = std::thread::current().name().map(str::to_string);
        })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while name.lock().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(name.lock().as_deref(), Some("voice-engine"));
    c.audio.resource_release().await.unwrap();
}

#[test]
fn test_config_from_toml() {
    let config = EngineConfig::from_toml_str(
        r#"
        [input]
        pre_detection_ms = 1500

        [output]
        volume_max = 6
        ramp_enabled = true
        "#,
    )
    .unwrap();
    assert_eq!(config.input.pre_detection_ms, 1500);
    assert_eq!(config.output.volume_max, 6);
    assert!(config.output.ramp_enabled);

    let too_long = EngineConfig::from_toml_str("[input]\npre_detection_ms = 60000\n");
    assert!(matches!(too_long, Err(VoiceAudioError::Params { .. })));
}

#[test]
fn test_internal_capture_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("voice_capture_00000.wav"), b"x").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
    let removed = internal_capture_delete_files(dir.path()).unwrap();
    assert_eq!(removed, 1);
    assert!(dir.path().join("notes.txt").exists());
}

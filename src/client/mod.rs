//! The client-facing voice audio object.
//!
//! A [`VoiceAudio`] moves through a fixed lifecycle:
//!
//! 1. [`VoiceAudio::builder`] creates the object around a [`Hal`].
//! 2. [`resource_request`](VoiceAudio::resource_request) attaches a user id in the shared
//!    region and launches the resource broker; the callback reports grants and revokes.
//! 3. [`open`](VoiceAudio::open) opens the microphone and launches the engine thread. The
//!    speaker is opened for each playback.
//! 4. Record, stream, detect and play calls marshal one message each into the engine.
//! 5. [`close`](VoiceAudio::close) stops everything and joins the engine;
//!    [`resource_release`](VoiceAudio::resource_release) returns the granted resources.
//!
//! Calls that take an optional completion callback are synchronous when it is `None`: they
//! return once the session has ended and hand back its terminal event. With a callback
//! they return as soon as the engine has accepted the session.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{BrokerHandle, BrokerParams, GrantSlot, Liveness, ProcessLiveness, ResourceGrant, SharedRegion};
use crate::config::EngineConfig;
use crate::device::{InputCaps, InputDevices, OutputDevices, PowerMode, ResourcePriority};
use crate::dsp::DspSuite;
use crate::engine::mailbox::{EngineMessage, IntensityTarget, Mailbox};
use crate::engine::EngineHandle;
use crate::error::VoiceAudioError;
use crate::event::{ResourceCallback, StatisticsMask};
use crate::format::{Container, Encoding, InputFormat};
use crate::hal::{Hal, InputOpenParams};
use crate::registry::VoiceSessionRegistry;

mod input;
mod output;

pub use input::{InputState, PipeDestination, RecordWindow};
pub use output::OutputState;

use input::InputSide;
use output::OutputSide;

/// Sample rates accepted by [`VoiceAudio::open`].
const OPEN_SAMPLE_RATES: [u32; 4] = [16_000, 22_050, 44_100, 48_000];

const INTENSITY_NAME_LEN: std::ops::RangeInclusive<usize> = 2..=63;

/// Builder for [`VoiceAudio`].
#[derive(Default)]
pub struct VoiceAudioBuilder {
    hal: Option<Box<dyn Hal>>,
    config: Option<EngineConfig>,
    dsp: Option<DspSuite>,
    registry: Option<VoiceSessionRegistry>,
    shared: Option<SharedRegion>,
    probe: Option<Arc<dyn Liveness>>,
}

impl VoiceAudioBuilder {
    /// Hardware to drive. Without it the host backend is used when the `host-audio`
    /// feature is enabled.
    #[must_use]
    pub fn hal(mut self, hal: impl Hal + 'static) -> Self {
        self.hal = Some(Box::new(hal));
        self
    }

    /// Engine configuration; defaults to [`EngineConfig::default`].
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Keyword, end of speech, preprocessing, gain and volume algorithms.
    #[must_use]
    pub fn dsp(mut self, dsp: DspSuite) -> Self {
        self.dsp = Some(dsp);
        self
    }

    /// Voice session registry; defaults to [`VoiceSessionRegistry::global`].
    #[must_use]
    pub fn registry(mut self, registry: VoiceSessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resource region; defaults to [`SharedRegion::global`].
    #[must_use]
    pub fn shared_region(mut self, shared: SharedRegion) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Liveness probe used to reclaim resources of dead processes.
    #[must_use]
    pub fn liveness(mut self, probe: impl Liveness + 'static) -> Self {
        self.probe = Some(Arc::new(probe));
        self
    }

    /// Creates the object.
    ///
    /// # Errors
    ///
    /// `Params` for an invalid configuration, `Object` when no hardware was given and no
    /// host backend is compiled in, `Internal` when the global shared region cannot be
    /// mapped.
    pub fn build(self) -> Result<VoiceAudio, VoiceAudioError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let hal = match self.hal {
            Some(hal) => hal,
            None => default_hal()?,
        };
        let shared = match self.shared {
            Some(shared) => shared,
            None => SharedRegion::global()
                .map_err(|e| VoiceAudioError::internal(format!("shared region: {e}")))?,
        };
        let dsp = self.dsp.unwrap_or_default().configured(&config.dsp);
        tracing::info!(hal = hal.name(), "voice audio object created");
        Ok(VoiceAudio {
            hal,
            dsp: Some(dsp),
            registry: self.registry.unwrap_or_else(VoiceSessionRegistry::global),
            shared,
            probe: self.probe.unwrap_or_else(|| Arc::new(ProcessLiveness)),
            pid: std::process::id(),
            user_id: None,
            broker: None,
            grant: GrantSlot::default(),
            engine: None,
            power_mode: PowerMode::Full,
            input: InputSide::new(&config),
            output: OutputSide::new(&config.output),
            config,
        })
    }
}

#[cfg(feature = "host-audio")]
fn default_hal() -> Result<Box<dyn Hal>, VoiceAudioError> {
    Ok(Box::new(crate::hal::HostHal::new()))
}

#[cfg(not(feature = "host-audio"))]
fn default_hal() -> Result<Box<dyn Hal>, VoiceAudioError> {
    Err(VoiceAudioError::Object)
}

/// A voice audio object: one microphone/speaker pairing with its engine and broker.
pub struct VoiceAudio {
    hal: Box<dyn Hal>,
    config: EngineConfig,
    dsp: Option<DspSuite>,
    registry: VoiceSessionRegistry,
    shared: SharedRegion,
    probe: Arc<dyn Liveness>,
    pub(crate) pid: u32,
    user_id: Option<u8>,
    broker: Option<BrokerHandle>,
    grant: GrantSlot,
    engine: Option<EngineHandle>,
    power_mode: PowerMode,
    input: InputSide,
    output: OutputSide,
}

impl std::fmt::Debug for VoiceAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceAudio")
            .field("hal", &self.hal.name())
            .field("user_id", &self.user_id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl VoiceAudio {
    /// Starts building an object.
    pub fn builder() -> VoiceAudioBuilder {
        VoiceAudioBuilder::default()
    }

    /// True between a successful [`open`](Self::open) and [`close`](Self::close).
    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    /// User id attached in the shared region, once resources were requested.
    pub fn user_id(&self) -> Option<u8> {
        self.user_id
    }

    /// Resources currently granted to this object.
    pub fn grant(&self) -> Option<ResourceGrant> {
        *self.grant.lock()
    }

    /// Input and output devices the hardware reports.
    pub fn available_devices(&self) -> (InputDevices, OutputDevices) {
        self.hal.available_devices()
    }

    fn mailbox(&self, operation: &'static str) -> Result<&Mailbox, VoiceAudioError> {
        match &self.engine {
            Some(engine) => Ok(engine.mailbox()),
            None => {
                tracing::error!(operation, "object is not open");
                Err(VoiceAudioError::Open)
            }
        }
    }

    /// Asks the broker for microphone and/or speaker resources.
    ///
    /// The callback receives [`ResourceEvent::Granted`](crate::ResourceEvent::Granted) once
    /// the resources are held (the grant is visible through [`grant`](Self::grant) by then)
    /// and `Revoked` when a higher priority object takes them; the object must then be
    /// closed and the resources released.
    ///
    /// # Errors
    ///
    /// `Params` for invalid devices, `Open` when the object is already open, `Internal`
    /// when no user id is free or the broker cannot start.
    pub async fn resource_request(
        &mut self,
        input: InputDevices,
        output: OutputDevices,
        priority: ResourcePriority,
        callback: ResourceCallback,
    ) -> Result<(), VoiceAudioError> {
        if !input.is_valid() || !output.is_valid() {
            return Err(VoiceAudioError::params("invalid device"));
        }
        if input.is_none() && output.is_none() {
            return Err(VoiceAudioError::params("no device requested"));
        }
        if self.is_open() {
            return Err(VoiceAudioError::Open);
        }
        if self.broker.is_none() {
            self.broker_start()?;
        }
        let broker = self
            .broker
            .as_ref()
            .ok_or_else(|| VoiceAudioError::internal("broker not running"))?;
        tracing::info!(input = input.0, output = output.0, ?priority, "resource request");
        broker.request(priority, input, output, callback).await
    }

    fn broker_start(&mut self) -> Result<(), VoiceAudioError> {
        let user_id = match self.user_id {
            Some(user_id) => user_id,
            None => {
                let user_id = self
                    .shared
                    .attach(self.pid, self.hal.capabilities(), self.probe.as_ref())
                    .ok_or_else(|| VoiceAudioError::internal("no user id available"))?;
                self.user_id = Some(user_id);
                user_id
            }
        };
        let params = BrokerParams {
            pid: self.pid,
            user_id,
            fifo_dir: self.config.resource.fifo_dir.clone(),
            update_interval: Duration::from_secs(self.config.resource.update_interval_secs),
        };
        match BrokerHandle::spawn(params, self.shared.clone(), self.probe.clone(), self.grant.clone()) {
            Ok(broker) => {
                self.broker = Some(broker);
                Ok(())
            }
            Err(e) => {
                self.shared.detach(user_id);
                self.user_id = None;
                Err(e)
            }
        }
    }

    /// Closes the object if needed, returns every granted resource and stops the broker.
    ///
    /// # Errors
    ///
    /// `Internal` when the engine or broker thread cannot be joined.
    pub async fn resource_release(&mut self) -> Result<(), VoiceAudioError> {
        self.close().await?;
        if let Some(broker) = self.broker.take() {
            let released = broker.release().await;
            broker.terminate().await?;
            released?;
        }
        if let Some(user_id) = self.user_id.take() {
            self.shared.detach(user_id);
        }
        *self.grant.lock() = None;
        tracing::info!("resources released");
        Ok(())
    }

    /// Opens the object for the given devices.
    ///
    /// `format` describes what the microphone is opened with (defaults to 16 kHz, 16-bit
    /// mono); the channel quantity actually opened follows the local device.
    ///
    /// # Errors
    ///
    /// * `Open` when already open.
    /// * `Params` for invalid devices or an unsupported format.
    /// * `Resource` when a local microphone or a speaker is asked for without a grant.
    /// * `MicOpen` when the hardware refuses the microphone.
    pub async fn open(
        &mut self,
        power_mode: PowerMode,
        privacy_mode: bool,
        input: InputDevices,
        output: OutputDevices,
        format: Option<InputFormat>,
    ) -> Result<(), VoiceAudioError> {
        if self.is_open() {
            return Err(VoiceAudioError::Open);
        }
        if !input.is_valid() || !output.is_valid() {
            return Err(VoiceAudioError::params("invalid device"));
        }
        if input.is_none() && output.is_none() {
            return Err(VoiceAudioError::params("no device to open"));
        }
        let grant = self.grant().unwrap_or_default();
        if !output.is_none() && grant.playback.is_none() {
            tracing::error!(output = output.0, "speaker resource not granted");
            return Err(VoiceAudioError::Resource);
        }
        if !input.local().is_none() && grant.record.is_none() {
            tracing::error!(input = input.0, "microphone resource not granted");
            return Err(VoiceAudioError::Resource);
        }
        let format = format.unwrap_or_default();
        check_open_format(&format)?;

        let mut mic_format = format;
        let mut mic = None;
        if !input.local().is_none() {
            let params = InputOpenParams {
                devices: input,
                format: InputFormat {
                    container: Container::None,
                    encoding: Encoding::Pcm,
                    sample_rate: format.sample_rate,
                    sample_size: if grant.record_caps.contains(InputCaps::LOCAL_32_BIT) { 4 } else { 2 },
                    channel_qty: mic_channel_qty(input),
                },
                power_mode,
                privacy_mode,
            };
            let opened = self.hal.input_open(&params).ok_or(VoiceAudioError::MicOpen)?;
            mic_format = opened.format();
            mic = Some(opened);
        }
        // The firmware may change what it reports once a device is open.
        self.shared.refresh_capabilities(self.hal.capabilities());

        let dsp = self
            .dsp
            .take()
            .ok_or_else(|| VoiceAudioError::internal("processing suite unavailable"))?;
        let engine = EngineHandle::spawn(&self.config, dsp, self.registry.clone())?;
        let mailbox = engine.mailbox().clone();
        if let Some(mic) = mic {
            let hal_name = self.hal.name().to_string();
            mailbox
                .request(|ack| EngineMessage::RecordIdleStart {
                    input: mic,
                    devices: input,
                    hal_name,
                    ack,
                })
                .await?;
        }
        let volume = self.output.volume;
        mailbox
            .send(EngineMessage::VolumeConfig {
                max: volume.max,
                min: volume.min,
                step_db: volume.step_db,
                use_ext_gain: volume.use_ext_gain,
            })
            .await?;
        mailbox
            .send(EngineMessage::VolumeSet {
                step: volume.step,
                ramp: false,
                bumper: false,
            })
            .await?;

        self.engine = Some(engine);
        self.power_mode = power_mode;
        self.input.opened(input, mic_format);
        self.output.opened(output);
        if let Some(name) = self.input.intensity_name.clone() {
            self.intensity_send(IntensityTarget::Input, Some(&name)).await?;
        }
        if let Some(name) = self.output.intensity_name.clone() {
            self.intensity_send(IntensityTarget::Output, Some(&name)).await?;
        }
        tracing::info!(
            input = input.0,
            output = output.0,
            sample_rate = mic_format.sample_rate,
            channels = mic_format.channel_qty,
            ?power_mode,
            privacy_mode,
            "voice audio opened"
        );
        Ok(())
    }

    /// Stops every session, closes the devices and joins the engine.
    ///
    /// Closing an object that is not open does nothing.
    ///
    /// # Errors
    ///
    /// `Internal` when the engine thread cannot be joined.
    pub async fn close(&mut self) -> Result<(), VoiceAudioError> {
        let Some(engine) = self.engine.take() else {
            return Ok(());
        };
        let mailbox = engine.mailbox().clone();
        self.input_shutdown(&mailbox).await;
        self.output_shutdown(&mailbox).await;
        let dsp = engine.terminate().await?;
        self.dsp = Some(dsp);
        tracing::info!("voice audio closed");
        Ok(())
    }

    /// Changes the hardware power mode.
    ///
    /// # Errors
    ///
    /// `Internal` when the hardware refuses the mode.
    pub fn power_mode_update(&mut self, power_mode: PowerMode) -> Result<(), VoiceAudioError> {
        if power_mode == self.power_mode {
            return Ok(());
        }
        if !self.hal.power_mode(power_mode) {
            return Err(VoiceAudioError::internal(format!("power mode {power_mode:?} refused")));
        }
        tracing::info!(from = ?self.power_mode, to = ?power_mode, "power mode");
        self.power_mode = power_mode;
        Ok(())
    }

    /// Mutes or unmutes the local microphone at the hardware.
    ///
    /// # Errors
    ///
    /// `Params` for a non-local input, `Internal` when the hardware refuses.
    pub fn privacy_mode_update(&mut self, input: InputDevices, enable: bool) -> Result<(), VoiceAudioError> {
        if input.local().is_none() {
            return Err(VoiceAudioError::params("privacy mode applies to local input only"));
        }
        if !self.hal.privacy_mode(enable) {
            return Err(VoiceAudioError::internal("privacy mode refused"));
        }
        tracing::info!(enable, "privacy mode");
        Ok(())
    }

    /// Current privacy mode of the local microphone.
    ///
    /// # Errors
    ///
    /// `Params` for a non-local input, `Internal` when the hardware cannot tell.
    pub fn privacy_mode_get(&self, input: InputDevices) -> Result<bool, VoiceAudioError> {
        if input.local().is_none() {
            return Err(VoiceAudioError::params("privacy mode applies to local input only"));
        }
        self.hal
            .privacy_mode_get()
            .ok_or_else(|| VoiceAudioError::internal("privacy mode unknown"))
    }

    /// Resets the statistics selected by `mask`.
    ///
    /// # Errors
    ///
    /// `Open` when the object is not open.
    pub async fn statistics_clear(&self, mask: StatisticsMask) -> Result<(), VoiceAudioError> {
        self.mailbox("statistics_clear")?
            .send(EngineMessage::StatisticsClear { mask })
            .await
    }

    /// Logs the statistics selected by `mask`.
    ///
    /// # Errors
    ///
    /// `Open` when the object is not open.
    pub async fn statistics_print(&self, mask: StatisticsMask) -> Result<(), VoiceAudioError> {
        self.mailbox("statistics_print")?
            .send(EngineMessage::StatisticsPrint { mask })
            .await
    }

    /// Runs `callback` on the engine thread once every message queued before it is handled.
    ///
    /// # Errors
    ///
    /// `Open` when the object is not open.
    pub async fn thread_poll(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), VoiceAudioError> {
        self.mailbox("thread_poll")?
            .send(EngineMessage::ThreadPoll {
                callback: Box::new(callback),
            })
            .await
    }

    async fn intensity_send(&self, target: IntensityTarget, name: Option<&str>) -> Result<(), VoiceAudioError> {
        let fifo = name.and_then(intensity_fifo_open);
        self.mailbox("sound_intensity")?
            .send(EngineMessage::SoundIntensity { target, fifo })
            .await
    }
}

impl Drop for VoiceAudio {
    fn drop(&mut self) {
        if self.engine.is_some() || self.broker.is_some() {
            tracing::warn!("voice audio dropped without resource_release");
        }
        // Engine and broker handles ask their threads to stop on drop.
        self.engine = None;
        self.broker = None;
        if let Some(user_id) = self.user_id.take() {
            self.shared.detach(user_id);
        }
    }
}

fn check_open_format(format: &InputFormat) -> Result<(), VoiceAudioError> {
    if !OPEN_SAMPLE_RATES.contains(&format.sample_rate) {
        return Err(VoiceAudioError::params(format!("sample rate {}", format.sample_rate)));
    }
    if format.sample_size != 2 {
        return Err(VoiceAudioError::params(format!("sample size {}", format.sample_size)));
    }
    if !(1..=4).contains(&format.channel_qty) {
        return Err(VoiceAudioError::params(format!("channel quantity {}", format.channel_qty)));
    }
    Ok(())
}

/// Channels the microphone is opened with for a local device selection.
fn mic_channel_qty(input: InputDevices) -> u8 {
    if input.contains(InputDevices::QUAD) {
        4
    } else if input.contains(InputDevices::TRI) {
        3
    } else {
        1
    }
}

fn check_intensity_name(name: Option<&str>) -> Result<(), VoiceAudioError> {
    match name {
        Some(name) if !INTENSITY_NAME_LEN.contains(&name.len()) => {
            Err(VoiceAudioError::params(format!("fifo name length {}", name.len())))
        }
        _ => Ok(()),
    }
}

fn intensity_fifo_open(name: &str) -> Option<File> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(name)
    {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::error!(name, error = %e, "unable to open sound intensity fifo");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::liveness::tests::FakeLiveness;
    use crate::event::{resource_callback, ResourceEvent};
    use crate::hal::MockHal;

    pub(crate) struct Fixture {
        pub(crate) audio: VoiceAudio,
        pub(crate) hal: MockHal,
        pub(crate) events: mpsc::UnboundedReceiver<ResourceEvent>,
        pub(crate) callback: ResourceCallback,
        pub(crate) _dir: tempfile::TempDir,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let hal = MockHal::new();
        let mut config = EngineConfig::default();
        config.resource.fifo_dir = dir.path().to_path_buf();
        let mut audio = VoiceAudio::builder()
            .hal(hal.clone())
            .config(config)
            .registry(VoiceSessionRegistry::new())
            .shared_region(SharedRegion::new().unwrap())
            .liveness(FakeLiveness::alive(&[4242]))
            .build()
            .unwrap();
        audio.pid = 4242;
        let (tx, events) = mpsc::unbounded_channel();
        let callback = resource_callback(move |event| {
            let _ = tx.send(event);
        });
        Fixture {
            audio,
            hal,
            events,
            callback,
            _dir: dir,
        }
    }

    /// Requests both resources, waits for the grant and opens the object.
    pub(crate) async fn opened(input: InputDevices) -> Fixture {
        let mut fx = fixture();
        fx.audio
            .resource_request(input, OutputDevices::NORMAL, ResourcePriority::Medium, fx.callback.clone())
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), fx.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ResourceEvent::Granted);
        fx.audio
            .open(PowerMode::Full, false, input, OutputDevices::NORMAL, None)
            .await
            .unwrap();
        fx
    }

    #[test]
    fn test_build_without_hal() {
        #[cfg(not(feature = "host-audio"))]
        assert!(matches!(VoiceAudio::builder().build(), Err(VoiceAudioError::Object)));
    }

    #[test]
    fn test_open_format_checks() {
        assert!(check_open_format(&InputFormat::default()).is_ok());
        let mut format = InputFormat::default();
        format.sample_rate = 8000;
        assert!(matches!(check_open_format(&format), Err(VoiceAudioError::Params { .. })));
        format.sample_rate = 48_000;
        format.channel_qty = 5;
        assert!(matches!(check_open_format(&format), Err(VoiceAudioError::Params { .. })));
    }

    #[test]
    fn test_mic_channel_qty() {
        assert_eq!(mic_channel_qty(InputDevices::SINGLE), 1);
        assert_eq!(mic_channel_qty(InputDevices::TRI), 3);
        assert_eq!(mic_channel_qty(InputDevices::QUAD | InputDevices::EC_REF_MONO), 4);
    }

    #[test]
    fn test_intensity_name_length() {
        assert!(check_intensity_name(None).is_ok());
        assert!(check_intensity_name(Some("/tmp/level")).is_ok());
        assert!(check_intensity_name(Some("a")).is_err());
        assert!(check_intensity_name(Some(&"x".repeat(64))).is_err());
    }

    #[tokio::test]
    async fn test_open_requires_grant() {
        let mut fx = fixture();
        let result = fx
            .audio
            .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NONE, None)
            .await;
        assert!(matches!(result, Err(VoiceAudioError::Resource)));
        assert!(!fx.audio.is_open());
    }

    #[tokio::test]
    async fn test_resource_request_validation() {
        let mut fx = fixture();
        let result = fx
            .audio
            .resource_request(InputDevices::NONE, OutputDevices::NONE, ResourcePriority::Low, fx.callback.clone())
            .await;
        assert!(matches!(result, Err(VoiceAudioError::Params { .. })));
        let result = fx
            .audio
            .resource_request(InputDevices::INVALID, OutputDevices::NORMAL, ResourcePriority::Low, fx.callback.clone())
            .await;
        assert!(matches!(result, Err(VoiceAudioError::Params { .. })));
        assert_eq!(fx.audio.user_id(), None);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut fx = opened(InputDevices::SINGLE).await;
        assert!(fx.audio.is_open());
        assert_eq!(fx.audio.user_id(), Some(0));
        assert_eq!(fx.hal.is_open(), (true, false));

        let again = fx
            .audio
            .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NORMAL, None)
            .await;
        assert!(matches!(again, Err(VoiceAudioError::Open)));

        fx.audio.close().await.unwrap();
        assert!(!fx.audio.is_open());
        assert_eq!(fx.hal.is_open(), (false, false));

        // The processing suite comes back, so the object opens again.
        fx.audio
            .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NORMAL, None)
            .await
            .unwrap();
        fx.audio.resource_release().await.unwrap();
        assert!(!fx.audio.is_open());
        assert_eq!(fx.audio.grant(), None);
        assert_eq!(fx.audio.user_id(), None);
    }

    #[tokio::test]
    async fn test_mic_open_failure() {
        let mut fx = fixture();
        fx.audio
            .resource_request(InputDevices::SINGLE, OutputDevices::NONE, ResourcePriority::Low, fx.callback.clone())
            .await
            .unwrap();
        fx.events.recv().await.unwrap();
        fx.hal.fail_input_open(true);
        let result = fx
            .audio
            .open(PowerMode::Full, false, InputDevices::SINGLE, OutputDevices::NONE, None)
            .await;
        assert!(matches!(result, Err(VoiceAudioError::MicOpen)));
        fx.audio.resource_release().await.unwrap();
    }

    #[tokio::test]
    async fn test_power_and_privacy() {
        let mut fx = fixture();
        fx.audio.power_mode_update(PowerMode::Low).unwrap();
        assert_eq!(fx.hal.power(), PowerMode::Low);
        assert!(fx.audio.privacy_mode_update(InputDevices::PTT, true).is_err());
        fx.audio.privacy_mode_update(InputDevices::SINGLE, true).unwrap();
        assert_eq!(fx.audio.privacy_mode_get(InputDevices::SINGLE).unwrap(), true);
    }

    #[tokio::test]
    async fn test_thread_poll_requires_open() {
        let fx = fixture();
        assert!(matches!(
            fx.audio.thread_poll(|| {}).await,
            Err(VoiceAudioError::Open)
        ));

        let mut fx = opened(InputDevices::SINGLE).await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        fx.audio
            .thread_poll(move || {
                let _ = tx.send(());
            })
            .await
            .unwrap();
        rx.await.unwrap();
        fx.audio.statistics_print(StatisticsMask::ALL).await.unwrap();
        fx.audio.resource_release().await.unwrap();
    }
}

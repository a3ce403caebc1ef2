//! CPAL host audio backend.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::{Hal, HalInput, HalInputStats, HalOutput, InputOpenParams, OutputOpenParams};
use crate::device::{
    HalCapabilities, InputCaps, InputDevices, OutputCaps, OutputDevices, PowerMode,
};
use crate::format::{convert, InputFormat};

/// Seconds of audio buffered between the CPAL callbacks and the engine.
const BUFFER_SECS: usize = 2;

/// Host microphone and speaker through CPAL.
///
/// CPAL streams are not `Send` on every platform, so each opened stream lives on its own
/// small thread and is exchanged with the engine through a lock-free ring buffer. Reads
/// that find less than a frame buffered are padded with silence.
pub struct HostHal {
    host: cpal::Host,
    input_name: Option<String>,
    privacy: Arc<AtomicBool>,
}

impl HostHal {
    /// Uses the default host and default devices.
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            input_name: None,
            privacy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Selects a microphone by name instead of the default one.
    #[must_use]
    pub fn with_input_device(mut self, name: impl Into<String>) -> Self {
        self.input_name = Some(name.into());
        self
    }

    fn input_device(&self) -> Option<Device> {
        match &self.input_name {
            None => self.host.default_input_device(),
            Some(name) => self
                .host
                .input_devices()
                .ok()?
                .find(|d| d.name().is_ok_and(|n| &n == name)),
        }
    }
}

impl Default for HostHal {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a CPAL stream alive on a parked thread until the returned sender is dropped.
fn run_stream<F>(build: F) -> Option<mpsc::Sender<()>>
where
    F: FnOnce() -> Result<Stream, String> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel::<bool>(1);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let spawned = thread::Builder::new()
        .name("voice-host-stream".into())
        .spawn(move || {
            let stream = match build().and_then(|s| s.play().map(|()| s).map_err(|e| e.to_string())) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "host stream failed to start");
                    let _ = ready_tx.send(false);
                    return;
                }
            };
            let _ = ready_tx.send(true);
            // Returns once the owning half is dropped.
            let _ = stop_rx.recv();
            drop(stream);
        });

    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to spawn host stream thread");
        return None;
    }
    match ready_rx.recv() {
        Ok(true) => Some(stop_tx),
        _ => None,
    }
}

impl Hal for HostHal {
    fn name(&self) -> &str {
        "cpal"
    }

    fn capabilities(&self) -> HalCapabilities {
        HalCapabilities {
            input_qty: 1,
            output_qty: 1,
            input_caps: [InputCaps::LOCAL.0, 0, 0],
            output_caps: [OutputCaps::DIRECT_PCM.0, 0, 0],
        }
    }

    fn available_devices(&self) -> (InputDevices, OutputDevices) {
        let input = if self.input_device().is_some() {
            InputDevices::SINGLE
        } else {
            InputDevices::NONE
        };
        let output = if self.host.default_output_device().is_some() {
            OutputDevices::NORMAL
        } else {
            OutputDevices::NONE
        };
        (input, output)
    }

    fn input_open(&mut self, params: &InputOpenParams) -> Option<Box<dyn HalInput>> {
        let device = self.input_device()?;
        let sample_format = device.default_input_config().ok()?.sample_format();
        let config = StreamConfig {
            channels: u16::from(params.format.channel_qty),
            sample_rate: SampleRate(params.format.sample_rate),
            buffer_size: BufferSize::Default,
        };
        let capacity = params.format.sample_rate as usize
            * usize::from(params.format.channel_qty)
            * BUFFER_SECS;
        let (producer, consumer) = HeapRb::<i16>::new(capacity).split();
        let lost = Arc::new(AtomicU32::new(0));
        let lost_cb = Arc::clone(&lost);

        let stop = run_stream(move || build_input_stream(&device, &config, sample_format, producer, lost_cb))?;
        self.privacy.store(params.privacy_mode, Ordering::Relaxed);

        tracing::info!(format = ?params.format, "host microphone opened");
        Some(Box::new(HostInput {
            _stop: stop,
            consumer,
            format: params.format,
            privacy: Arc::clone(&self.privacy),
            lost,
            buffered_max: 0,
        }))
    }

    fn output_open(&mut self, params: &OutputOpenParams) -> Option<Box<dyn HalOutput>> {
        let device = self.host.default_output_device()?;
        let config = StreamConfig {
            channels: u16::from(params.format.channel_qty),
            sample_rate: SampleRate(params.format.sample_rate),
            buffer_size: BufferSize::Default,
        };
        let capacity = params.format.sample_rate as usize
            * usize::from(params.format.channel_qty)
            * BUFFER_SECS;
        let (producer, consumer) = HeapRb::<i16>::new(capacity).split();

        let stop = run_stream(move || build_output_stream(&device, &config, consumer))?;

        tracing::info!(format = ?params.format, "host speaker opened");
        Some(Box::new(HostOutput {
            _stop: stop,
            producer,
        }))
    }

    fn power_mode(&mut self, mode: PowerMode) -> bool {
        tracing::debug!(?mode, "host backend ignores power mode");
        true
    }

    fn privacy_mode(&mut self, enable: bool) -> bool {
        self.privacy.store(enable, Ordering::Relaxed);
        true
    }

    fn privacy_mode_get(&self) -> Option<bool> {
        Some(self.privacy.load(Ordering::Relaxed))
    }
}

fn build_input_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    mut producer: HeapProd<i16>,
    lost: Arc<AtomicU32>,
) -> Result<Stream, String> {
    let on_error = |err: cpal::StreamError| tracing::error!("host microphone error: {}", err);
    match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let pushed = producer.push_slice(data);
                if pushed < data.len() {
                    lost.fetch_add((data.len() - pushed) as u32, Ordering::Relaxed);
                }
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    if producer.try_push(convert::f32_to_i16(sample)).is_err() {
                        lost.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
            on_error,
            None,
        ),
        other => return Err(format!("unsupported sample format {other:?}")),
    }
    .map_err(|e| e.to_string())
}

fn build_output_stream(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<i16>,
) -> Result<Stream, String> {
    device
        .build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let filled = consumer.pop_slice(data);
                data[filled..].fill(0);
            },
            |err: cpal::StreamError| tracing::error!("host speaker error: {}", err),
            None,
        )
        .map_err(|e| e.to_string())
}

struct HostInput {
    _stop: mpsc::Sender<()>,
    consumer: HeapCons<i16>,
    format: InputFormat,
    privacy: Arc<AtomicBool>,
    lost: Arc<AtomicU32>,
    buffered_max: u32,
}

impl HalInput for HostInput {
    fn format(&self) -> InputFormat {
        self.format
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = usize::from(self.format.sample_size);
        let mut samples = vec![0i16; buf.len() / size];
        self.buffered_max = self.buffered_max.max(self.consumer.occupied_len() as u32);
        self.consumer.pop_slice(&mut samples);
        if self.privacy.load(Ordering::Relaxed) {
            samples.fill(0);
        }

        for (out, sample) in buf.chunks_exact_mut(size).zip(samples) {
            if size == 4 {
                out.copy_from_slice(&(i32::from(sample) << 16).to_le_bytes());
            } else {
                out.copy_from_slice(&sample.to_le_bytes());
            }
        }
        Ok(buf.len())
    }

    fn stats(&self) -> HalInputStats {
        HalInputStats {
            samples_buffered_max: self.buffered_max,
            samples_lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

struct HostOutput {
    _stop: mpsc::Sender<()>,
    producer: HeapProd<i16>,
}

impl HalOutput for HostOutput {
    fn write(&mut self, samples: &[i16]) -> io::Result<usize> {
        Ok(self.producer.push_slice(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_capabilities() {
        let hal = HostHal::new();
        let caps = hal.capabilities();
        assert_eq!(caps.input_qty, 1);
        assert_eq!(caps.output_qty, 1);
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_default_microphone() {
        let mut hal = HostHal::new();
        let input = hal.input_open(&InputOpenParams {
            devices: InputDevices::SINGLE,
            format: InputFormat::default(),
            power_mode: PowerMode::Full,
            privacy_mode: false,
        });
        assert!(input.is_some());
    }
}

//! Microphone capture: mono audio at a fixed rate, cut into fixed time slices.

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, SampleFormat, SizedSample, Stream as CpalStream,
};
use dasp_sample::Sample;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::codec;

/// Input chunk fed to the capture resampler when the hardware rate differs.
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("No input device found")]
    NoDevice,
    #[error("Input device error: {0}")]
    Device(String),
    #[error("Input stream error: {0}")]
    Stream(String),
    #[error("Capture configuration error: {0}")]
    Config(String),
    #[error("Capture already running")]
    AlreadyRunning,
}

/// How a frame of samples is packaged before it is base64-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FrameContainer {
    /// Each frame is a self-contained 16-bit mono WAV file.
    #[default]
    Wav,
    Linear16,
    Mulaw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Length of one frame in milliseconds.
    pub frame_ms: u32,
    /// Input device name (None = default device)
    pub device_name: Option<String>,
    pub container: FrameContainer,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            frame_ms: 500,
            device_name: None,
            container: FrameContainer::Wav,
        }
    }
}

impl CaptureConfig {
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms as u64 / 1000) as usize
    }
}

pub type FrameCallback = Box<dyn FnMut(Vec<u8>) + Send + 'static>;

/// A microphone that delivers complete frames through a callback.
///
/// `start` returns only once the device is open (or failed to open). `stop`
/// must release the device before returning and may be called any number of
/// times. Both may block, so async callers run them on the blocking pool.
pub trait AudioCapture: Send {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Collects samples at the capture rate and emits one encoded frame per
/// completed time slice, in order.
pub struct FrameAssembler {
    samples_per_frame: usize,
    sample_rate: u32,
    container: FrameContainer,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(config: &CaptureConfig) -> Self {
        let samples_per_frame = config.samples_per_frame().max(1);
        Self {
            samples_per_frame,
            sample_rate: config.sample_rate,
            container: config.container,
            pending: Vec::with_capacity(samples_per_frame * 2),
        }
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.samples_per_frame {
            let frame: Vec<i16> = self.pending.drain(..self.samples_per_frame).collect();
            match self.package(&frame) {
                Ok(bytes) => frames.push(bytes),
                Err(e) => log::error!("Capture: failed to package frame: {}", e),
            }
        }
        frames
    }

    /// Samples received but not yet part of a complete frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    fn package(&self, samples: &[i16]) -> Result<Vec<u8>, codec::CodecError> {
        match self.container {
            FrameContainer::Wav => codec::wav_from_samples(samples, self.sample_rate),
            FrameContainer::Linear16 => Ok(codec::linear16_to_bytes(samples)),
            FrameContainer::Mulaw => Ok(codec::encode_mulaw(samples)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channel_count: u16,
}

/// List the input devices of the default host.
pub fn list_input_devices() -> Result<Vec<InputDeviceInfo>, CaptureError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut infos = Vec::new();
    for device in devices {
        let name = match device.name() {
            Ok(name) => name,
            Err(e) => {
                log::debug!("Capture: skipping unnamed device: {}", e);
                continue;
            }
        };
        let channel_count = match device.default_input_config() {
            Ok(config) => config.channels(),
            Err(e) => {
                log::debug!("Capture: skipping {}: {}", name, e);
                continue;
            }
        };
        infos.push(InputDeviceInfo {
            is_default: default_name.as_ref() == Some(&name),
            name,
            channel_count,
        });
    }
    Ok(infos)
}

/// cpal-backed capture. The stream lives on a dedicated thread, which owns the
/// device until it is told to stop.
pub struct CpalCapture {
    config: CaptureConfig,
    stop_sender: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CpalCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop_sender: None,
            handle: None,
        }
    }

    fn run_capture_thread(
        config: CaptureConfig,
        on_frame: FrameCallback,
        ready: Sender<Result<(), CaptureError>>,
        stop_receiver: Receiver<()>,
    ) {
        let stream = match Self::open_stream(&config, on_frame) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        // Blocks until stop() or until the owner is dropped.
        let _ = stop_receiver.recv();
        drop(stream);
        log::info!("Capture: input stream closed");
    }

    fn open_stream(
        config: &CaptureConfig,
        on_frame: FrameCallback,
    ) -> Result<CpalStream, CaptureError> {
        let host = cpal::default_host();
        log::info!("Capture: initializing with host {:?}", host.id());

        let device = match &config.device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| CaptureError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| CaptureError::Device(format!("Device not found: {}", name)))?,
            None => host.default_input_device().ok_or(CaptureError::NoDevice)?,
        };
        log::info!("Capture: using input device {:?}", device.name());

        let supported = match Self::select_input_config(&device, config.sample_rate) {
            Ok(supported) => supported,
            Err(err) => {
                log::warn!(
                    "Capture: no preferred input config ({}), falling back to default",
                    err
                );
                device
                    .default_input_config()
                    .map_err(|e| CaptureError::Config(e.to_string()))?
            }
        };

        let stream_config = supported.config();
        let hardware_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        log::info!(
            "Capture: hardware {}Hz, {} channels, {:?} -> {}Hz mono, {} ms frames",
            hardware_rate,
            channels,
            supported.sample_format(),
            config.sample_rate,
            config.frame_ms
        );

        let resampler = if hardware_rate != config.sample_rate {
            let params = SincInterpolationParameters {
                sinc_len: 64,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = config.sample_rate as f64 / hardware_rate as f64;
            Some(
                SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
                    .map_err(|e| CaptureError::Config(e.to_string()))?,
            )
        } else {
            None
        };

        let assembler = FrameAssembler::new(config);
        let stream = match supported.sample_format() {
            SampleFormat::I16 => Self::build_stream::<i16>(
                &device,
                &stream_config,
                channels,
                resampler,
                assembler,
                on_frame,
            )?,
            SampleFormat::U16 => Self::build_stream::<u16>(
                &device,
                &stream_config,
                channels,
                resampler,
                assembler,
                on_frame,
            )?,
            SampleFormat::F32 => Self::build_stream::<f32>(
                &device,
                &stream_config,
                channels,
                resampler,
                assembler,
                on_frame,
            )?,
            other => {
                return Err(CaptureError::Config(format!(
                    "Unsupported sample format {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        Ok(stream)
    }

    /// Prefer integer formats and a rate as close to the target as the device allows.
    fn select_input_config(
        device: &Device,
        target_rate: u32,
    ) -> Result<cpal::SupportedStreamConfig, CaptureError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| CaptureError::Config(e.to_string()))?;

        let mut best: Option<(u8, u32, cpal::SupportedStreamConfig)> = None;
        for range in configs {
            let format_rank = match range.sample_format() {
                SampleFormat::I16 => 0,
                SampleFormat::F32 => 1,
                SampleFormat::U16 => 2,
                _ => continue,
            };
            let rate = target_rate.clamp(range.min_sample_rate().0, range.max_sample_rate().0);
            let rate_diff = rate.abs_diff(target_rate);

            let better = match &best {
                None => true,
                Some((rank, diff, _)) => {
                    rate_diff < *diff || (rate_diff == *diff && format_rank < *rank)
                }
            };
            if better {
                best = Some((
                    format_rank,
                    rate_diff,
                    range.with_sample_rate(cpal::SampleRate(rate)),
                ));
            }
        }

        best.map(|(_, _, config)| config)
            .ok_or_else(|| CaptureError::Config("No supported input configs found".into()))
    }

    fn build_stream<T>(
        device: &Device,
        config: &cpal::StreamConfig,
        channels: usize,
        mut resampler: Option<SincFixedIn<f32>>,
        mut assembler: FrameAssembler,
        mut on_frame: FrameCallback,
    ) -> Result<CpalStream, CaptureError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let mut pending: Vec<f32> = Vec::new();

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    // First channel only.
                    pending.extend(
                        data.chunks(channels)
                            .filter_map(|frame| frame.first())
                            .map(|s| f32::from_sample(*s)),
                    );

                    let samples: Vec<i16> = match resampler.as_mut() {
                        None => pending.drain(..).map(|s| s.to_sample::<i16>()).collect(),
                        Some(resampler) => {
                            let mut out = Vec::new();
                            while pending.len() >= RESAMPLE_CHUNK {
                                let chunk: Vec<f32> = pending.drain(..RESAMPLE_CHUNK).collect();
                                match resampler.process(&[chunk], None) {
                                    Ok(output) => out.extend(
                                        output[0].iter().map(|s| s.to_sample::<i16>()),
                                    ),
                                    Err(e) => log::error!("Capture: resampling error: {}", e),
                                }
                            }
                            out
                        }
                    };

                    for frame in assembler.push(&samples) {
                        on_frame(frame);
                    }
                },
                |err| log::error!("Capture: stream error: {}", err),
                None,
            )
            .map_err(|e| CaptureError::Stream(e.to_string()))
    }
}

impl AudioCapture for CpalCapture {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError> {
        if self.is_running() {
            return Err(CaptureError::AlreadyRunning);
        }

        let (ready_sender, ready_receiver) = channel();
        let (stop_sender, stop_receiver) = channel();
        let config = self.config.clone();
        let handle = thread::spawn(move || {
            Self::run_capture_thread(config, on_frame, ready_sender, stop_receiver)
        });

        let init = ready_receiver
            .recv()
            .unwrap_or_else(|_| Err(CaptureError::Stream("capture thread exited".into())));
        match init {
            Ok(()) => {
                self.stop_sender = Some(stop_sender);
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                if handle.join().is_err() {
                    log::error!("Capture: capture thread panicked");
                }
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_sender) = self.stop_sender.take() {
            let _ = stop_sender.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Capture: capture thread panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::lock;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("Failed to write audio data: {0}")]
    WriteError(String),

    #[error("Failed to stop audio playback: {0}")]
    StopError(String),

    #[error("Audio device error: {0}")]
    DeviceError(String),
}

/// Core trait for audio output handling
#[async_trait::async_trait]
pub trait AudioSink: Send + Sync {
    /// Play mono 16-bit samples and return once they have been rendered.
    async fn play(&self, samples: &[i16], sample_rate: u32) -> Result<(), AudioError>;

    /// Halt playback immediately, drop anything buffered and release the device.
    async fn stop(&self) -> Result<(), AudioError>;
}

/// How often `play` checks whether the device has drained its buffer.
const DRAIN_POLL: Duration = Duration::from_millis(10);
/// Slack on top of the audio duration before a drain is considered stalled.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

enum AudioCommand {
    Stop,
}

/// Samples shared between `play` and the device callback.
struct SharedBuffer {
    samples: Mutex<VecDeque<f32>>,
    buffered: AtomicUsize,
    input_rate: AtomicU32,
}

impl SharedBuffer {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            buffered: AtomicUsize::new(0),
            input_rate: AtomicU32::new(24_000),
        }
    }

    fn clear(&self) {
        lock(&self.samples).clear();
        self.buffered.store(0, Ordering::Release);
    }
}

struct OutputStream {
    command_sender: Sender<AudioCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OutputStream {
    fn open(buffer: Arc<SharedBuffer>) -> Result<Self, AudioError> {
        let (command_sender, command_receiver) = channel();
        let (ready_sender, ready_receiver) = channel();

        let thread = thread::spawn(move || {
            let stream = match Self::build(buffer) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_sender.send(Err(e));
                    return;
                }
            };
            let _ = ready_sender.send(Ok(()));

            while let Ok(command) = command_receiver.recv() {
                match command {
                    AudioCommand::Stop => {
                        log::debug!("AudioSink: Received stop command");
                        break;
                    }
                }
            }
            drop(stream);
            log::debug!("AudioSink: Audio thread exiting");
        });

        match ready_receiver.recv() {
            Ok(Ok(())) => Ok(Self {
                command_sender,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::DeviceError("audio thread exited".to_string()))
            }
        }
    }

    fn build(buffer: Arc<SharedBuffer>) -> Result<cpal::Stream, AudioError> {
        let host = cpal::default_host();
        log::debug!("AudioSink: Using audio host: {:?}", host.id());

        let device = host.default_output_device().ok_or_else(|| {
            log::error!("AudioSink: No output device found!");
            AudioError::DeviceError("No output device found".to_string())
        })?;
        log::debug!("AudioSink: Using output device: {:?}", device.name());

        let supported_config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;
        log::debug!("AudioSink: Using output config: {:?}", supported_config);

        let output_rate = supported_config.sample_rate().0 as f64;
        let output_channels = supported_config.channels() as usize;

        // Read position into the buffer, in input samples.
        let mut position = 0.0f64;
        let stream = device
            .build_output_stream(
                &supported_config.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = lock(&buffer.samples);
                    let step = buffer.input_rate.load(Ordering::Acquire) as f64 / output_rate;

                    for frame in data.chunks_mut(output_channels) {
                        let index = position as usize;
                        // Linear interpolation between neighbouring input samples.
                        let sample = match queue.get(index) {
                            Some(&current) => {
                                let next = queue.get(index + 1).copied().unwrap_or(current);
                                let fract = (position - index as f64) as f32;
                                position += step;
                                current + (next - current) * fract
                            }
                            None => 0.0,
                        };
                        for channel in frame.iter_mut() {
                            *channel = sample;
                        }
                    }

                    let consumed = (position as usize).min(queue.len());
                    queue.drain(..consumed);
                    position -= consumed as f64;
                    if queue.is_empty() {
                        position = 0.0;
                    }
                    buffer.buffered.store(queue.len(), Ordering::Release);
                },
                move |err| {
                    log::error!("AudioSink: Stream error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;
        log::debug!("AudioSink: Audio stream started successfully");
        Ok(stream)
    }

    fn close(mut self) -> Result<(), AudioError> {
        let sent = self.command_sender.send(AudioCommand::Stop);
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                log::error!("AudioSink: Failed to join audio thread: {:?}", e);
            }
        }
        sent.map_err(|e| AudioError::StopError(e.to_string()))
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        // The audio thread exits on its own once it sees the command.
        if self.thread.take().is_some() {
            let _ = self.command_sender.send(AudioCommand::Stop);
        }
    }
}

/// Default output device via cpal. The device is opened on the first `play`
/// and released again by `stop`.
pub struct CpalSink {
    buffer: Arc<SharedBuffer>,
    stream: Mutex<Option<OutputStream>>,
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(SharedBuffer::new()),
            stream: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.stream).is_some()
    }

    /// Samples still waiting to be rendered.
    pub fn buffered_samples(&self) -> usize {
        self.buffer.buffered.load(Ordering::Acquire)
    }

    async fn ensure_open(&self) -> Result<(), AudioError> {
        if self.is_open() {
            return Ok(());
        }
        log::debug!("AudioSink: Opening output stream");
        let buffer = Arc::clone(&self.buffer);
        let opened = tokio::task::spawn_blocking(move || OutputStream::open(buffer))
            .await
            .map_err(|e| AudioError::DeviceError(e.to_string()))??;

        let mut stream = lock(&self.stream);
        if stream.is_none() {
            *stream = Some(opened);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, samples: &[i16], sample_rate: u32) -> Result<(), AudioError> {
        if samples.is_empty() {
            return Ok(());
        }
        if sample_rate == 0 {
            return Err(AudioError::WriteError("sample rate must be positive".into()));
        }
        self.ensure_open().await?;

        self.buffer.input_rate.store(sample_rate, Ordering::Release);
        {
            let mut queue = lock(&self.buffer.samples);
            queue.extend(samples.iter().map(|&s| s as f32 / 32768.0));
            self.buffer.buffered.store(queue.len(), Ordering::Release);
        }
        log::debug!(
            "AudioSink: Queued {} samples at {}Hz",
            samples.len(),
            sample_rate
        );

        let duration = Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64);
        let deadline = tokio::time::Instant::now() + duration + DRAIN_GRACE;
        while self.buffered_samples() > 0 {
            if !self.is_open() {
                // stop() released the device mid-frame.
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AudioError::WriteError("output device stalled".into()));
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), AudioError> {
        log::debug!("AudioSink: Stopping sink");
        self.buffer.clear();
        let stream = lock(&self.stream).take();
        match stream {
            Some(stream) => tokio::task::spawn_blocking(move || stream.close())
                .await
                .map_err(|e| AudioError::StopError(e.to_string()))?,
            None => Ok(()),
        }
    }
}

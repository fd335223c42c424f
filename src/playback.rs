//! Ordered playback of received audio frames.
//!
//! Frames are appended by the session as they arrive and drained by a single
//! consumer task, which decodes, resamples and plays one frame to completion
//! before taking the next.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio_sink::AudioSink;
use crate::codec;
use crate::error::ClientError;
use crate::lock;
use crate::protocol::AudioFormat;
use crate::resample::PcmTranscoder;

struct QueueState {
    frames: VecDeque<String>,
    source_format: AudioFormat,
    /// Cancelled by `clear()` to interrupt the frame being played.
    interrupt: CancellationToken,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    sink: Arc<dyn AudioSink>,
    transcoder: Arc<dyn PcmTranscoder>,
    output_rate: u32,
    errors: mpsc::UnboundedSender<ClientError>,
}

pub struct PlaybackQueue {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackQueue {
    /// Create the queue and spawn its consumer on the current tokio runtime.
    ///
    /// Per-frame decode and playback failures are reported on the returned
    /// receiver; they never stop the consumer.
    pub fn new(
        sink: Arc<dyn AudioSink>,
        transcoder: Arc<dyn PcmTranscoder>,
        output_rate: u32,
    ) -> (Self, mpsc::UnboundedReceiver<ClientError>) {
        let (errors, error_receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                source_format: AudioFormat::NARROWBAND_MULAW,
                interrupt: CancellationToken::new(),
                closed: false,
            }),
            wake: Notify::new(),
            sink,
            transcoder,
            output_rate,
            errors,
        });

        let consumer = tokio::spawn(Self::consume(Arc::clone(&shared)));
        (
            Self {
                shared,
                consumer: Mutex::new(Some(consumer)),
            },
            error_receiver,
        )
    }

    /// Append a base64 frame. Never blocks.
    pub fn enqueue(&self, frame: String) {
        {
            let mut state = lock(&self.shared.state);
            if state.closed {
                log::debug!("Playback: queue closed, dropping frame");
                return;
            }
            state.frames.push_back(frame);
        }
        self.shared.wake.notify_one();
    }

    pub fn set_source_format(&self, format: AudioFormat) {
        log::info!(
            "Playback: source format {} @ {}Hz -> {}Hz",
            format.encoding,
            format.sample_rate,
            self.shared.output_rate
        );
        lock(&self.shared.state).source_format = format;
    }

    pub fn source_format(&self) -> AudioFormat {
        lock(&self.shared.state).source_format
    }

    /// Drop all pending frames and cut off the frame currently playing.
    pub fn clear(&self) {
        let mut state = lock(&self.shared.state);
        let dropped = state.frames.len();
        state.frames.clear();
        state.interrupt.cancel();
        state.interrupt = CancellationToken::new();
        if dropped > 0 {
            log::debug!("Playback: cleared {} pending frames", dropped);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the queue, stop the consumer and release the output device.
    pub async fn shutdown(&self) {
        {
            let mut state = lock(&self.shared.state);
            state.closed = true;
        }
        self.clear();
        self.shared.wake.notify_one();

        let consumer = lock(&self.consumer).take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                log::error!("Playback: consumer task failed: {}", e);
            }
        }
        if let Err(e) = self.shared.sink.stop().await {
            log::warn!("Playback: failed to release output device: {}", e);
        }
    }

    async fn consume(shared: Arc<Shared>) {
        loop {
            let next = {
                let mut state = lock(&shared.state);
                if state.closed {
                    break;
                }
                state
                    .frames
                    .pop_front()
                    .map(|frame| (frame, state.source_format, state.interrupt.clone()))
            };

            let Some((frame, format, interrupt)) = next else {
                shared.wake.notified().await;
                continue;
            };

            let pcm = match shared.render(&frame, format) {
                Ok(pcm) => pcm,
                Err(e) => {
                    log::warn!("Playback: skipping undecodable frame: {}", e);
                    let _ = shared.errors.send(e);
                    continue;
                }
            };

            tokio::select! {
                result = shared.sink.play(&pcm, shared.output_rate) => {
                    if let Err(e) = result {
                        log::warn!("Playback: frame playback failed: {}", e);
                        let _ = shared.errors.send(e.into());
                    }
                }
                _ = interrupt.cancelled() => {
                    log::debug!("Playback: frame interrupted");
                    if let Err(e) = shared.sink.stop().await {
                        log::warn!("Playback: failed to halt output: {}", e);
                    }
                }
            }
        }
        log::debug!("Playback: consumer stopped");
    }
}

impl Shared {
    fn render(&self, frame: &str, format: AudioFormat) -> Result<Vec<i16>, ClientError> {
        let bytes = codec::decode_frame(frame)?;
        let pcm = self.transcoder.decode_to_linear_pcm(&bytes, format)?;
        Ok(self
            .transcoder
            .resample(&pcm, format.sample_rate, self.output_rate)?)
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        if let Some(consumer) = lock(&self.consumer).take() {
            consumer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_sink::AudioError;
    use crate::codec::CodecError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Decodes each byte to one sample and never resamples.
    struct ByteTranscoder;

    impl PcmTranscoder for ByteTranscoder {
        fn decode_to_linear_pcm(
            &self,
            frame: &[u8],
            _source: AudioFormat,
        ) -> Result<Vec<i16>, CodecError> {
            if frame.first() == Some(&0xFF) {
                return Err(CodecError::Wav("poisoned frame".into()));
            }
            Ok(frame.iter().map(|&b| b as i16).collect())
        }

        fn resample(&self, pcm: &[i16], _from: u32, _to: u32) -> Result<Vec<i16>, CodecError> {
            Ok(pcm.to_vec())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<(Vec<i16>, Instant, Instant)>>,
        active: AtomicUsize,
        overlapped: AtomicBool,
        stops: AtomicUsize,
        delay: Duration,
    }

    impl RecordingSink {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn played(&self) -> Vec<Vec<i16>> {
            lock(&self.played).iter().map(|(pcm, _, _)| pcm.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, samples: &[i16], _sample_rate: u32) -> Result<(), AudioError> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let started = Instant::now();
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            lock(&self.played).push((samples.to_vec(), started, Instant::now()));
            Ok(())
        }

        async fn stop(&self) -> Result<(), AudioError> {
            self.active.store(0, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_frames_play_in_order_without_overlap() {
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_millis(30)));
        let (queue, _errors) =
            PlaybackQueue::new(sink.clone(), Arc::new(ByteTranscoder), 24_000);

        // Arrive faster than they play.
        for frame in ["AAA", "BBB", "CCC"] {
            queue.enqueue(frame.to_string());
        }

        wait_for(|| lock(&sink.played).len() == 3).await;
        let played = sink.played();
        assert_eq!(played[0], vec![0, 0]);
        assert_eq!(played[1], vec![4, 16]);
        assert_eq!(played[2], vec![8, 32]);
        assert!(!sink.overlapped.load(Ordering::SeqCst));

        let spans = lock(&sink.played).clone();
        for pair in spans.windows(2) {
            assert!(pair[1].1 >= pair[0].2, "playback overlapped");
        }
    }

    #[tokio::test]
    async fn test_bad_frame_is_reported_and_skipped() {
        let sink = Arc::new(RecordingSink::default());
        let (queue, mut errors) =
            PlaybackQueue::new(sink.clone(), Arc::new(ByteTranscoder), 24_000);

        queue.enqueue("AQID".to_string());
        queue.enqueue("not base64!".to_string());
        queue.enqueue("/w==".to_string()); // 0xFF, rejected by the transcoder
        queue.enqueue("BAUG".to_string());

        wait_for(|| lock(&sink.played).len() == 2).await;
        assert_eq!(sink.played(), vec![vec![1, 2, 3], vec![4, 5, 6]]);

        assert!(matches!(errors.recv().await, Some(ClientError::Decode(_))));
        assert!(matches!(errors.recv().await, Some(ClientError::Decode(_))));
    }

    #[tokio::test]
    async fn test_clear_interrupts_current_frame() {
        let sink = Arc::new(RecordingSink::with_delay(Duration::from_secs(30)));
        let (queue, _errors) =
            PlaybackQueue::new(sink.clone(), Arc::new(ByteTranscoder), 24_000);

        let started = Instant::now();
        for frame in ["AAA", "BBB", "CCC"] {
            queue.enqueue(frame.to_string());
        }
        wait_for(|| sink.active.load(Ordering::SeqCst) == 1).await;

        queue.clear();
        assert!(queue.is_empty());
        wait_for(|| sink.stops.load(Ordering::SeqCst) == 1).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        // Nothing ran to completion.
        assert!(sink.played().is_empty());
    }

    #[tokio::test]
    async fn test_queue_keeps_working_after_clear() {
        let sink = Arc::new(RecordingSink::default());
        let (queue, _errors) =
            PlaybackQueue::new(sink.clone(), Arc::new(ByteTranscoder), 24_000);

        queue.clear();
        queue.enqueue("AQID".to_string());
        wait_for(|| lock(&sink.played).len() == 1).await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_sink_and_rejects_frames() {
        let sink = Arc::new(RecordingSink::default());
        let (queue, _errors) =
            PlaybackQueue::new(sink.clone(), Arc::new(ByteTranscoder), 24_000);

        queue.shutdown().await;
        assert!(sink.stops.load(Ordering::SeqCst) >= 1);

        queue.enqueue("AQID".to_string());
        assert!(queue.is_empty());
        // Second shutdown is harmless.
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_source_format_defaults_to_narrowband_mulaw() {
        let sink = Arc::new(RecordingSink::default());
        let (queue, _errors) =
            PlaybackQueue::new(sink, Arc::new(ByteTranscoder), 24_000);
        assert_eq!(queue.source_format(), AudioFormat::NARROWBAND_MULAW);
    }
}

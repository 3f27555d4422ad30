//! Local sequential playback queue and speaker output
//!
//! The queue is the fallback sink for synthesized audio when no avatar bridge
//! is ready. Chunks are played in enqueue order; cancellation clears the queue
//! and aborts the chunk currently playing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sequential queue of f32 PCM chunks awaiting local playback
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue {
    chunks: Arc<Mutex<VecDeque<Vec<f32>>>>,
    /// Bumped on every cancel; an in-flight chunk drains only while its
    /// snapshot matches
    generation: Arc<AtomicU64>,
    /// Set on shutdown; the drain worker exits once closed
    closed: Arc<AtomicBool>,
}

impl PlaybackQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk to the back of the queue
    pub fn enqueue(&self, samples: Vec<f32>) {
        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.push_back(samples);
        }
    }

    /// Pop the next chunk together with the generation it belongs to
    #[must_use]
    pub fn pop(&self) -> Option<(Vec<f32>, u64)> {
        let generation = self.generation.load(Ordering::Acquire);
        self.chunks
            .lock()
            .ok()
            .and_then(|mut chunks| chunks.pop_front())
            .map(|chunk| (chunk, generation))
    }

    /// Drop all queued chunks and invalidate the chunk currently playing
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut chunks) = self.chunks.lock() {
            chunks.clear();
        }
    }

    /// Whether a previously popped chunk is still current
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Number of queued chunks
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the queue closed so the drain worker exits
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the queue has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether this handle is the last one left
    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.chunks) == 1
    }
}

/// Plays f32 PCM to the default output device
pub struct SpeakerOutput {
    #[allow(dead_code)]
    device: Device,
    config: StreamConfig,
    sample_rate: u32,
}

impl SpeakerOutput {
    /// Create a new speaker output at the given sample rate
    ///
    /// # Errors
    ///
    /// Returns error if no suitable output device configuration exists
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(sample_rate)
                        && c.max_sample_rate() >= SampleRate(sample_rate)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "speaker output initialized"
        );

        Ok(Self {
            device,
            config,
            sample_rate,
        })
    }

    /// Play one chunk, returning early when the queue cancels its generation
    ///
    /// # Errors
    ///
    /// Returns error if the output stream cannot be built or started
    pub fn play_chunk(&self, samples: &[f32], queue: &PlaybackQueue, generation: u64) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".to_string()))?;

        let config = self.config.clone();
        let channels = usize::from(config.channels);

        let buffer = Arc::new(samples.to_vec());
        let position = Arc::new(Mutex::new(0usize));
        let finished = Arc::new(Mutex::new(false));

        let buffer_cb = Arc::clone(&buffer);
        let position_cb = Arc::clone(&position);
        let finished_cb = Arc::clone(&finished);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position_cb.lock().unwrap();
                    for frame in data.chunks_mut(channels) {
                        let sample = if *pos < buffer_cb.len() {
                            buffer_cb[*pos]
                        } else {
                            *finished_cb.lock().unwrap() = true;
                            0.0
                        };
                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                        if *pos < buffer_cb.len() {
                            *pos += 1;
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (samples.len() as u64 * 1000) / u64::from(self.sample_rate);
        let start = std::time::Instant::now();
        let timeout = std::time::Duration::from_millis(duration_ms + 500);

        while !*finished.lock().unwrap() {
            if start.elapsed() > timeout {
                break;
            }
            if !queue.is_current(generation) {
                tracing::debug!("playback chunk cancelled mid-stream");
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        drop(stream);
        Ok(())
    }
}

/// Spawn a blocking drain worker that plays queued chunks sequentially
///
/// Runs until the queue closes, its handle is the only one left, or the
/// device fails.
#[must_use]
pub fn spawn_drain(queue: PlaybackQueue, sample_rate: u32) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let output = match SpeakerOutput::new(sample_rate) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(error = %e, "speaker unavailable, local playback disabled");
                return;
            }
        };

        loop {
            if queue.is_closed() || queue.is_orphaned() {
                tracing::debug!("playback queue gone, drain worker exiting");
                return;
            }
            match queue.pop() {
                Some((chunk, generation)) => {
                    if let Err(e) = output.play_chunk(&chunk, &queue, generation) {
                        tracing::error!(error = %e, "local playback failed");
                        return;
                    }
                }
                None => std::thread::sleep(std::time::Duration::from_millis(20)),
            }
        }
    })
}

//! Microphone capture and fixed-cadence uplink batching
//!
//! All capture state (device stream, sample buffer, ticker) lives on one
//! per-session [`CaptureUplink`], constructed on start and fully released on
//! stop — nothing survives across sessions. On every tick the accumulated
//! buffer is sent as one batch and cleared, independent of whether the
//! previous send succeeded, which bounds memory and guarantees forward
//! progress. A closed transport stops capture from the ticker itself: the
//! shared active flag goes false, the device callback stops accumulating,
//! and the buffer is drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::format;
use crate::protocol::ClientPacket;
use crate::{Error, Result};

/// Captures audio from the default input device into a shared buffer
pub struct MicrophoneSource {
    #[allow(dead_code)]
    device: Device,
    config: StreamConfig,
    buffer: Arc<Mutex<Vec<f32>>>,
    gate: Option<Arc<AtomicBool>>,
    stream: Option<Stream>,
}

impl MicrophoneSource {
    /// Open the default input device at the given sample rate, accumulating
    /// into `buffer`
    ///
    /// # Errors
    ///
    /// Returns error if no suitable input device configuration exists
    pub fn new(sample_rate: u32, buffer: Arc<Mutex<Vec<f32>>>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "microphone source initialized"
        );

        Ok(Self {
            device,
            config,
            buffer,
            gate: None,
            stream: None,
        })
    }

    /// Stop accumulating samples whenever `gate` reads false
    ///
    /// Must be set before [`start`](Self::start); the gate is read inside the
    /// device callback.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<AtomicBool>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Start sampling into the shared buffer
    ///
    /// # Errors
    ///
    /// Returns error if the input stream cannot be built or started
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let gate = self.gate.clone();
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device".to_string()))?;

        let stream = device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if gate.as_ref().is_some_and(|g| !g.load(Ordering::Relaxed)) {
                        return;
                    }
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "microphone capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("microphone capture started");
        Ok(())
    }

    /// Release the device stream
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("microphone capture stopped");
        }
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-session capture object: microphone source, batch buffer, and the
/// fixed-cadence uplink ticker
pub struct CaptureUplink {
    buffer: Arc<Mutex<Vec<f32>>>,
    uplink: mpsc::Sender<ClientPacket>,
    interval: Duration,
    sample_rate: u32,
    use_device: bool,
    mic: Option<MicrophoneSource>,
    ticker: Option<JoinHandle<()>>,
    /// Shared with the ticker and the device callback so a transport close
    /// reaches the stopped state without waiting for the owner
    active: Arc<AtomicBool>,
}

impl CaptureUplink {
    /// Create an inactive capture uplink over a transport sender
    #[must_use]
    pub fn new(uplink: mpsc::Sender<ClientPacket>, interval: Duration, sample_rate: u32) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            uplink,
            interval,
            sample_rate,
            use_device: true,
            mic: None,
            ticker: None,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run without acquiring a microphone device (headless hosts; the buffer
    /// is fed externally)
    #[must_use]
    pub fn without_device(mut self) -> Self {
        self.use_device = false;
        self
    }

    /// The shared sample buffer the ticker drains
    #[must_use]
    pub fn buffer(&self) -> Arc<Mutex<Vec<f32>>> {
        Arc::clone(&self.buffer)
    }

    /// Whether capture is currently active
    ///
    /// Goes false on [`stop`](Self::stop) and when the ticker observes a
    /// closed transport.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether the uplink ticker task has exited
    #[must_use]
    pub fn ticker_finished(&self) -> bool {
        self.ticker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Start capturing: acquire the device (unless headless) and begin the
    /// batch ticker
    ///
    /// Starting while already active is a guarded no-op — never a stacked
    /// timer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` when the uplink is not open, or
    /// `Error::Audio` when the device cannot be acquired
    pub fn start(&mut self) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            tracing::debug!("capture already active, ignoring start");
            return Ok(());
        }
        if self.uplink.is_closed() {
            return Err(Error::Transport(
                "capture requires an open uplink transport".to_string(),
            ));
        }

        // Open the gate before the device callback can fire
        self.active.store(true, Ordering::Release);
        if self.use_device {
            let started = MicrophoneSource::new(self.sample_rate, Arc::clone(&self.buffer))
                .map(|mic| mic.with_gate(Arc::clone(&self.active)))
                .and_then(|mut mic| {
                    mic.start()?;
                    Ok(mic)
                });
            match started {
                Ok(mic) => self.mic = Some(mic),
                Err(e) => {
                    self.active.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }

        let buffer = Arc::clone(&self.buffer);
        let uplink = self.uplink.clone();
        let interval = self.interval;
        let active = Arc::clone(&self.active);
        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so the first batch
            // covers a full window
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let samples = buffer
                    .lock()
                    .map(|mut buf| std::mem::take(&mut *buf))
                    .unwrap_or_default();
                let transport_gone = if uplink.is_closed() {
                    true
                } else if samples.is_empty() {
                    continue;
                } else {
                    let packet = ClientPacket::Audio {
                        chunks: vec![format::encode_payload(&samples)],
                    };
                    uplink.send(packet).await.is_err()
                };
                if transport_gone {
                    // Reach the stopped state ourselves: shut the source
                    // gate and drain what the callback already accumulated
                    active.store(false, Ordering::Release);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.clear();
                    }
                    tracing::debug!("uplink closed, capture stopped");
                    break;
                }
            }
        }));

        tracing::debug!(interval = ?self.interval, "capture started");
        Ok(())
    }

    /// Stop capturing: cancel the ticker, release the device, and notify the
    /// gateway when the transport is still open
    ///
    /// Safe to call multiple times and safe to call when never started.
    pub fn stop(&mut self) {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        if let Some(mut mic) = self.mic.take() {
            mic.stop();
        }
        if was_active && !self.uplink.is_closed() {
            match self.uplink.try_send(ClientPacket::AudioSessionEnd) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(packet)) => {
                    // End-of-session is unconditional while the transport is
                    // open; queue it behind whatever filled the channel
                    let uplink = self.uplink.clone();
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            let _ = uplink.send(packet).await;
                        });
                    } else {
                        tracing::warn!("audio session end dropped, no runtime to flush it");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("transport closed before audio session end");
                }
            }
        }
        if was_active {
            tracing::debug!("capture stopped");
        }
    }
}

impl Drop for CaptureUplink {
    fn drop(&mut self) {
        self.stop();
    }
}

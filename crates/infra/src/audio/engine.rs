//! Real-time output stream for one session
//!
//! `cpal::Stream` cannot leave the thread that built it, so every open
//! session owns a dedicated thread that builds the stream, reports back over
//! a crossbeam channel and then parks until it is told to stop. The audio
//! callback renders the session's [`MixGraph`] with `try_lock` so a control
//! thread pushing a matrix never stalls the device.

use super::mixdown::MixGraph;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{bounded, Sender};
use ear_core::domain::audio::{AudioError, DriverId, Usage};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Failures while opening or running an output stream
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("device {0} not found")]
    DeviceNotFound(DriverId),

    #[error("failed to enumerate devices: {0}")]
    Devices(#[from] cpal::DevicesError),

    #[error("failed to query default config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build stream: {0}")]
    Build(#[from] cpal::BuildStreamError),

    #[error("failed to start stream: {0}")]
    Play(#[from] cpal::PlayStreamError),

    #[error("stream thread failed: {0}")]
    Thread(String),
}

impl From<StreamError> for AudioError {
    fn from(err: StreamError) -> Self {
        AudioError::Backend(err.to_string())
    }
}

/// Stable hardware identifier for a device on a host
pub fn hardware_id(host: cpal::HostId, name: &str) -> String {
    format!("{:?}:{}", host, name)
}

/// Callback load, stored as `f32` bits so the audio thread never locks
#[derive(Debug, Default)]
pub struct LoadMeter {
    dsp: AtomicU32,
}

impl LoadMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one callback that took `elapsed` to render `frames` at `rate`
    pub fn record(&self, elapsed: Duration, frames: usize, rate: u32) {
        if frames == 0 || rate == 0 {
            return;
        }
        let period = frames as f32 / rate as f32;
        let percent = elapsed.as_secs_f32() / period * 100.0;
        self.dsp.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.dsp.store(0.0f32.to_bits(), Ordering::Relaxed);
    }

    pub fn usage(&self) -> Usage {
        let dsp = f32::from_bits(self.dsp.load(Ordering::Relaxed));
        Usage {
            dsp,
            total: dsp,
            ..Usage::default()
        }
    }
}

/// Settings for one output stream
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub driver: DriverId,
    pub speakers: usize,
    pub buffer_size: u32,
}

/// Running output stream, stopped on drop
pub struct OutputStream {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
    config: OutputConfig,
}

impl OutputStream {
    /// Open the device and start rendering `graph` into it
    pub fn open(
        config: OutputConfig,
        graph: Arc<Mutex<MixGraph>>,
        meter: Arc<LoadMeter>,
    ) -> Result<Self, StreamError> {
        info!(
            driver = %config.driver,
            speakers = config.speakers,
            buffer_size = config.buffer_size,
            "Opening output stream"
        );

        let (ready_tx, ready_rx) = bounded::<Result<(), StreamError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_config = config.clone();

        let thread = thread::Builder::new()
            .name("ear-output".to_string())
            .spawn(move || match build_stream(&thread_config, graph, meter) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // parked until close() or the sender drops
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!(driver = %thread_config.driver, "Output stream thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| StreamError::Thread(e.to_string()))?;

        let outcome = ready_rx
            .recv()
            .map_err(|_| StreamError::Thread("stream thread exited early".to_string()))
            .and_then(|r| r);

        match outcome {
            Ok(()) => Ok(Self {
                stop_tx,
                thread: Some(thread),
                config,
            }),
            Err(e) => {
                if thread.join().is_err() {
                    warn!("Output stream thread panicked");
                }
                Err(e)
            }
        }
    }

    /// Stop the stream and wait for its thread
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.stop_tx.send(());
            if thread.join().is_err() {
                error!(driver = %self.config.driver, "Output stream thread panicked");
            }
            info!(driver = %self.config.driver, "Output stream closed");
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn find_device(driver: &DriverId) -> Result<cpal::Device, StreamError> {
    let host = cpal::default_host();
    let host_id = host.id();
    #[allow(deprecated)]
    let device = host
        .output_devices()?
        .find(|d| {
            d.name()
                .map(|name| DriverId::from_hardware_id(&hardware_id(host_id, &name)) == *driver)
                .unwrap_or(false)
        });
    device.ok_or(StreamError::DeviceNotFound(*driver))
}

fn build_stream(
    config: &OutputConfig,
    graph: Arc<Mutex<MixGraph>>,
    meter: Arc<LoadMeter>,
) -> Result<cpal::Stream, StreamError> {
    let device = find_device(&config.driver)?;
    let default = device.default_output_config()?;
    let rate = default.sample_rate();
    let speakers = config.speakers;

    let stream_config = cpal::StreamConfig {
        channels: speakers as u16,
        sample_rate: rate,
        buffer_size: cpal::BufferSize::Fixed(config.buffer_size),
    };

    meter.reset();
    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let started = Instant::now();
            match graph.try_lock() {
                Ok(mut graph) => graph.render(data, speakers),
                // control side is mid-update; one block of silence
                Err(_) => data.fill(0.0),
            }
            meter.record(started.elapsed(), data.len() / speakers.max(1), rate);
        },
        |err| error!("Output stream error: {}", err),
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

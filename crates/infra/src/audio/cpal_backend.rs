//! CPAL-based audio backend
//!
//! Provides a cross-platform implementation of [`AudioBackend`] using the
//! CPAL library. Output devices become [`Driver`]s; each session renders its
//! channel groups in software and plays the result on one device.

use super::engine::{hardware_id, LoadMeter, OutputConfig, OutputStream, StreamError};
use super::mixdown::{GroupFeed, MixGraph};
use cpal::traits::{DeviceTrait, HostTrait};
use ear_core::domain::audio::{AudioError, Driver, Result, Usage};
use ear_core::domain::backend::{backend_error, AudioBackend, AudioSession, GroupHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Backend over the default CPAL host
#[derive(Debug, Clone)]
pub struct CpalBackend {
    buffer_size: u32,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(512)
    }
}

impl CpalBackend {
    pub fn new(buffer_size: u32) -> Self {
        debug!("Using audio host: {:?}", cpal::default_host().id());
        Self { buffer_size }
    }
}

impl AudioBackend for CpalBackend {
    fn drivers(&self) -> Result<Vec<Driver>> {
        info!("Enumerating output devices");
        let host = cpal::default_host();
        let host_id = host.id();
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::from(StreamError::from(e)))?;

        let mut drivers = Vec::new();
        for (index, device) in devices.enumerate() {
            #[allow(deprecated)]
            let name = match device.name() {
                Ok(name) => name,
                Err(e) => {
                    warn!("Skipping device without a name: {}", e);
                    continue;
                }
            };
            let config = match device.default_output_config() {
                Ok(config) => config,
                Err(e) => {
                    warn!(device = %name, "Skipping device without output config: {}", e);
                    continue;
                }
            };

            let driver = Driver::new(
                index,
                &hardware_id(host_id, &name),
                name,
                config.sample_rate(),
                config.channels(),
            );
            debug!(driver = %driver.id, name = %driver.name, channels = driver.channels, "Found device");
            drivers.push(driver);
        }

        info!("Found {} output devices", drivers.len());
        Ok(drivers)
    }

    fn create_session(&self) -> Result<Box<dyn AudioSession>> {
        Ok(Box::new(CpalSession::new(self.buffer_size)))
    }
}

/// One device binding with its software mix graph
pub struct CpalSession {
    buffer_size: u32,
    driver: Option<Driver>,
    graph: Arc<Mutex<MixGraph>>,
    feeds: HashMap<GroupHandle, GroupFeed>,
    meter: Arc<LoadMeter>,
    stream: Option<OutputStream>,
    next_group: u64,
    released: bool,
}

impl CpalSession {
    pub fn new(buffer_size: u32) -> Self {
        Self {
            buffer_size,
            driver: None,
            graph: Arc::new(Mutex::new(MixGraph::new())),
            feeds: HashMap::new(),
            meter: Arc::new(LoadMeter::new()),
            stream: None,
            next_group: 0,
            released: false,
        }
    }

    /// Sample queue feeding a channel group
    pub fn feed(&self, group: GroupHandle) -> Option<GroupFeed> {
        self.feeds.get(&group).cloned()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn graph(&self) -> MutexGuard<'_, MixGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_alive(&self) -> Result<()> {
        if self.released {
            return Err(AudioError::Backend("session released".to_string()));
        }
        Ok(())
    }

    fn next_handle(&mut self) -> GroupHandle {
        self.next_group += 1;
        GroupHandle::new(self.next_group)
    }

    /// Queue room for four device blocks per input
    fn queue_capacity(&self, inputs: usize) -> Result<usize> {
        (self.buffer_size as usize)
            .checked_mul(inputs)
            .and_then(|samples| samples.checked_mul(4))
            .ok_or_else(|| backend_error(format!("no queue fits {} inputs", inputs)))
    }
}

impl AudioSession for CpalSession {
    fn set_driver(&mut self, driver: &Driver) -> Result<()> {
        self.check_alive()?;
        if self.stream.is_some() {
            return Err(AudioError::Backend("close the stream before switching devices".to_string()));
        }
        self.driver = Some(driver.clone());
        Ok(())
    }

    fn init(&mut self, speakers: usize) -> Result<()> {
        self.check_alive()?;
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| AudioError::Backend("no driver selected".to_string()))?;
        if let Some(stream) = self.stream.take() {
            stream.close();
        }

        let config = OutputConfig {
            driver: driver.id,
            speakers,
            buffer_size: self.buffer_size,
        };
        let stream = OutputStream::open(config, Arc::clone(&self.graph), Arc::clone(&self.meter))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.check_alive()?;
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.meter.reset();
        Ok(())
    }

    fn create_main_bus(&mut self, speakers: usize) -> Result<GroupHandle> {
        self.check_alive()?;
        let group = self.next_handle();
        self.graph().set_main_bus(group, speakers);
        Ok(group)
    }

    fn create_group(&mut self, name: &str, inputs: usize) -> Result<GroupHandle> {
        self.check_alive()?;
        let capacity = self.queue_capacity(inputs)?;
        let group = self.next_handle();
        let feed = self.graph().add_group(group, inputs, capacity);
        self.feeds.insert(group, feed);
        debug!(group = %group, name, inputs, "Channel group created");
        Ok(group)
    }

    fn release_group(&mut self, group: GroupHandle) -> Result<()> {
        self.check_alive()?;
        self.feeds.remove(&group);
        if !self.graph().remove_group(group) {
            return Err(backend_error(format!("unknown {}", group)));
        }
        Ok(())
    }

    fn set_mix_matrix(
        &mut self,
        group: GroupHandle,
        matrix: &[f32],
        inputs: usize,
        outputs: usize,
    ) -> Result<()> {
        self.check_alive()?;
        self.graph().set_gains(group, matrix, inputs, outputs)
    }

    fn usage(&self) -> Result<Usage> {
        self.check_alive()?;
        Ok(self.meter.usage())
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.feeds.clear();
        self.graph().clear();
        self.released = true;
        Ok(())
    }
}

impl fmt::Debug for CpalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpalSession")
            .field("driver", &self.driver.as_ref().map(|d| &d.name))
            .field("open", &self.stream.is_some())
            .field("groups", &self.feeds.len())
            .finish()
    }
}

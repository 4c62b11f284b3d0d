//! In-memory backend for tests and headless runs
//!
//! Every session created by a [`MockBackend`] writes to a shared log that
//! tests inspect through a [`MockProbe`]. Failures can be injected to
//! exercise the router's error paths.

use super::{AudioBackend, AudioSession, GroupHandle};
use crate::domain::audio::{AudioError, Driver, DriverId, Result, Usage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Something a mock session was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    SetDriver(DriverId),
    Init { speakers: usize },
    Close,
    CreateMainBus { group: GroupHandle, speakers: usize },
    CreateGroup { group: GroupHandle, inputs: usize },
    ReleaseGroup(GroupHandle),
    Push { group: GroupHandle, matrix: Vec<f32>, inputs: usize, outputs: usize },
    Release,
}

#[derive(Debug, Default)]
struct MockLog {
    events: Vec<MockEvent>,
    matrices: HashMap<GroupHandle, Vec<f32>>,
    next_group: u64,
    fail_init: bool,
    fail_push: bool,
    usage: Usage,
}

fn lock(log: &Mutex<MockLog>) -> MutexGuard<'_, MockLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backend with a fixed driver list and no audio output
#[derive(Debug, Clone)]
pub struct MockBackend {
    drivers: Vec<Driver>,
    log: Arc<Mutex<MockLog>>,
}

impl MockBackend {
    pub fn new(drivers: Vec<Driver>) -> Self {
        Self {
            drivers,
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    /// Stereo, quad and 7.1 devices
    pub fn with_default_drivers() -> Self {
        Self::new(vec![
            Driver::new(0, "mock-stereo", "Mock Stereo".to_string(), 48000, 2),
            Driver::new(1, "mock-quad", "Mock Quad".to_string(), 48000, 4),
            Driver::new(2, "mock-7.1", "Mock 7.1".to_string(), 48000, 8),
        ])
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe {
            log: Arc::clone(&self.log),
        }
    }
}

impl AudioBackend for MockBackend {
    fn drivers(&self) -> Result<Vec<Driver>> {
        Ok(self.drivers.clone())
    }

    fn create_session(&self) -> Result<Box<dyn AudioSession>> {
        Ok(Box::new(MockSession {
            log: Arc::clone(&self.log),
            driver: None,
            running: false,
            groups: HashMap::new(),
            released: false,
        }))
    }
}

/// Read side of the mock log
#[derive(Debug, Clone)]
pub struct MockProbe {
    log: Arc<Mutex<MockLog>>,
}

impl MockProbe {
    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.log).events.clone()
    }

    /// Latest matrix pushed to a group
    pub fn matrix(&self, group: GroupHandle) -> Option<Vec<f32>> {
        lock(&self.log).matrices.get(&group).cloned()
    }

    /// Groups that received a push, in push order, since the log was cleared
    pub fn pushed_groups(&self) -> Vec<GroupHandle> {
        lock(&self.log)
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Push { group, .. } => Some(*group),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        lock(&self.log).events.clear();
    }

    pub fn fail_init(&self, fail: bool) {
        lock(&self.log).fail_init = fail;
    }

    pub fn fail_pushes(&self, fail: bool) {
        lock(&self.log).fail_push = fail;
    }

    pub fn set_usage(&self, usage: Usage) {
        lock(&self.log).usage = usage;
    }
}

struct MockSession {
    log: Arc<Mutex<MockLog>>,
    driver: Option<DriverId>,
    running: bool,
    groups: HashMap<GroupHandle, usize>,
    released: bool,
}

impl MockSession {
    fn check_alive(&self) -> Result<()> {
        if self.released {
            return Err(AudioError::Backend("session released".to_string()));
        }
        Ok(())
    }

    fn new_group(&mut self, inputs: usize) -> GroupHandle {
        let mut log = lock(&self.log);
        log.next_group += 1;
        let group = GroupHandle::new(log.next_group);
        self.groups.insert(group, inputs);
        group
    }
}

impl AudioSession for MockSession {
    fn set_driver(&mut self, driver: &Driver) -> Result<()> {
        self.check_alive()?;
        self.driver = Some(driver.id);
        lock(&self.log).events.push(MockEvent::SetDriver(driver.id));
        Ok(())
    }

    fn init(&mut self, speakers: usize) -> Result<()> {
        self.check_alive()?;
        let mut log = lock(&self.log);
        if log.fail_init {
            return Err(AudioError::Backend("device open failed".to_string()));
        }
        if self.driver.is_none() {
            return Err(AudioError::Backend("no driver selected".to_string()));
        }
        self.running = true;
        log.events.push(MockEvent::Init { speakers });
        debug!(speakers, "Mock session initialised");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.check_alive()?;
        self.running = false;
        lock(&self.log).events.push(MockEvent::Close);
        Ok(())
    }

    fn create_main_bus(&mut self, speakers: usize) -> Result<GroupHandle> {
        self.check_alive()?;
        let group = self.new_group(speakers);
        lock(&self.log)
            .events
            .push(MockEvent::CreateMainBus { group, speakers });
        Ok(group)
    }

    fn create_group(&mut self, _name: &str, inputs: usize) -> Result<GroupHandle> {
        self.check_alive()?;
        let group = self.new_group(inputs);
        lock(&self.log)
            .events
            .push(MockEvent::CreateGroup { group, inputs });
        Ok(group)
    }

    fn release_group(&mut self, group: GroupHandle) -> Result<()> {
        self.check_alive()?;
        if self.groups.remove(&group).is_none() {
            return Err(AudioError::Backend(format!("unknown {}", group)));
        }
        let mut log = lock(&self.log);
        log.matrices.remove(&group);
        log.events.push(MockEvent::ReleaseGroup(group));
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
        match self.groups.get(&group) {
            Some(expected) if *expected == inputs => {}
            Some(expected) => {
                return Err(AudioError::Backend(format!(
                    "{} has {} inputs, matrix has {}",
                    group, expected, inputs
                )))
            }
            None => return Err(AudioError::Backend(format!("unknown {}", group))),
        }
        if matrix.len() != inputs * outputs {
            return Err(AudioError::DimensionMismatch {
                expected: inputs * outputs,
                actual: matrix.len(),
            });
        }

        let mut log = lock(&self.log);
        if log.fail_push {
            return Err(AudioError::Backend("mix matrix rejected".to_string()));
        }
        log.matrices.insert(group, matrix.to_vec());
        log.events.push(MockEvent::Push {
            group,
            matrix: matrix.to_vec(),
            inputs,
            outputs,
        });
        Ok(())
    }

    fn usage(&self) -> Result<Usage> {
        self.check_alive()?;
        Ok(lock(&self.log).usage)
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.running = false;
        let mut log = lock(&self.log);
        for group in self.groups.drain().map(|(g, _)| g) {
            log.matrices.remove(&group);
        }
        log.events.push(MockEvent::Release);
        Ok(())
    }
}

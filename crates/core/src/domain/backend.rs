//! Audio engine seam
//!
//! The routing engine never touches hardware. It talks to an [`AudioBackend`]
//! to enumerate drivers and open sessions, and to an [`AudioSession`] to
//! create channel groups and push mix matrices. The CPAL implementation lives
//! in the `infra` crate; [`mock::MockBackend`] records everything in memory.

pub mod mock;

use crate::domain::audio::{AudioError, Driver, DriverId, Result, Usage};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a backend channel group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupHandle(u64);

impl GroupHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Entry point into an audio engine
pub trait AudioBackend: Send + Sync {
    /// Enumerate output devices, in backend order
    fn drivers(&self) -> Result<Vec<Driver>>;

    /// Find a device by its stable id
    fn driver(&self, id: &DriverId) -> Result<Option<Driver>> {
        Ok(self.drivers()?.into_iter().find(|d| d.id == *id))
    }

    /// Open a new, not yet initialised engine session
    fn create_session(&self) -> Result<Box<dyn AudioSession>>;
}

/// One engine instance bound to an output device
///
/// Groups and their matrices survive `close`; only the device stream is torn
/// down, so a session can be re-initialised without rebuilding its routing.
pub trait AudioSession: Send {
    /// Select the output device used by the next `init`
    fn set_driver(&mut self, driver: &Driver) -> Result<()>;

    /// Open the device with `speakers` raw output channels
    fn init(&mut self, speakers: usize) -> Result<()>;

    /// Close the device stream
    fn close(&mut self) -> Result<()>;

    /// Create the bus every channel group sums into
    fn create_main_bus(&mut self, speakers: usize) -> Result<GroupHandle>;

    /// Create a channel group fed by an `inputs`-channel stream
    fn create_group(&mut self, name: &str, inputs: usize) -> Result<GroupHandle>;

    fn release_group(&mut self, group: GroupHandle) -> Result<()>;

    /// Replace a group's mix matrix; `matrix` is row-major by input
    fn set_mix_matrix(
        &mut self,
        group: GroupHandle,
        matrix: &[f32],
        inputs: usize,
        outputs: usize,
    ) -> Result<()>;

    fn usage(&self) -> Result<Usage>;

    /// Final teardown; the session is unusable afterwards
    fn release(&mut self) -> Result<()>;
}

/// Shorthand for wrapping engine errors
pub fn backend_error(err: impl fmt::Display) -> AudioError {
    AudioError::Backend(err.to_string())
}

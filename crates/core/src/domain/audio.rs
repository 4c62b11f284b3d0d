//! Audio device abstractions and domain models
//!
//! This module defines the driver descriptors and error types shared by the
//! routing engine and the backend implementations. Platform code lives in the
//! `infra` crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the routing engine and its audio backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AudioError {
    /// A table or vector did not have the expected shape
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// An input, output or speaker index past the end of its table
    #[error("Index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },

    /// Linking the zones would make the zone graph cyclic
    #[error("Zone {child} is an ancestor of zone {parent}")]
    Cycle { parent: String, child: String },

    /// The zone is already a child of the parent, or a sibling owns its name
    #[error("Zone {parent} already has a child {child}")]
    DuplicateChild { parent: String, child: String },

    /// A zone, channel, attachment or speaker was not found
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Router is already running")]
    AlreadyRunning,

    #[error("Router is not running")]
    NotRunning,

    /// Volumes must be finite and non-negative
    #[error("Invalid volume: {0}")]
    InvalidVolume(f32),

    /// Opaque failure reported by the audio engine
    #[error("Backend failure: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Stable identity of an output device
///
/// Derived from the engine-reported hardware identifier, so the same device
/// keeps its id across enumerations and restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(Uuid);

impl DriverId {
    const PREFIX: &'static str = "ear.drivers.";

    /// Derive the id for a hardware identifier (GUID fragment, device name...)
    pub fn from_hardware_id(hardware_id: &str) -> Self {
        let name = format!("{}{}", Self::PREFIX, hardware_id);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()))
    }

    /// Parse a client-supplied id; `None` if it is not a UUID
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Speaker layout reported for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeakerMode {
    #[serde(rename = "raw")]
    Raw,
    #[serde(rename = "mono")]
    Mono,
    #[serde(rename = "stereo")]
    Stereo,
    #[serde(rename = "quad")]
    Quad,
    #[serde(rename = "surround")]
    Surround,
    #[serde(rename = "5.1")]
    Surround51,
    #[serde(rename = "7.1")]
    Surround71,
}

impl SpeakerMode {
    /// Best-guess layout for a device that only reports a channel count
    pub fn from_channels(channels: u16) -> Self {
        match channels {
            1 => SpeakerMode::Mono,
            2 => SpeakerMode::Stereo,
            4 => SpeakerMode::Quad,
            5 => SpeakerMode::Surround,
            6 => SpeakerMode::Surround51,
            8 => SpeakerMode::Surround71,
            _ => SpeakerMode::Raw,
        }
    }
}

/// Snapshot of an output device as reported by the engine
///
/// Re-fetched on every enumeration, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    /// Position in the backend's enumeration, used to select the device
    #[serde(skip)]
    pub index: usize,
    pub name: String,
    pub rate: u32,
    pub mode: SpeakerMode,
    pub channels: u16,
}

impl Driver {
    pub fn new(index: usize, hardware_id: &str, name: String, rate: u32, channels: u16) -> Self {
        Self {
            id: DriverId::from_hardware_id(hardware_id),
            index,
            name,
            rate,
            mode: SpeakerMode::from_channels(channels),
            channels,
        }
    }
}

/// Load snapshot reported by the backend, in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub dsp: f32,
    pub stream: f32,
    pub geometry: f32,
    pub update: f32,
    pub total: f32,
}

/// Reject volumes the gain computation cannot use
pub fn validate_volume(volume: f32) -> Result<f32> {
    if !volume.is_finite() || volume < 0.0 {
        return Err(AudioError::InvalidVolume(volume));
    }
    Ok(volume)
}

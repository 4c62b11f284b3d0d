//! Physical output channels of the active device
//!
//! A [`SpeakerGroup`] always holds exactly one [`Speaker`] per device channel.
//! Speaker volumes are applied in every channel matrix that reaches them.

use crate::domain::audio::{validate_volume, AudioError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One output slot of the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Speaker {
    pub index: usize,
    pub name: Option<String>,
    pub volume: f32,
}

impl Speaker {
    pub const UNITY: f32 = 1.0;

    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: None,
            volume: Self::UNITY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakerGroup {
    speakers: Vec<Speaker>,
}

impl SpeakerGroup {
    /// `count` speakers at unity gain
    pub fn new(count: usize) -> Self {
        Self {
            speakers: (0..count).map(Speaker::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Speaker> {
        self.speakers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Speaker> {
        self.speakers.iter()
    }

    /// Volume of a speaker, zero for indices the device does not have
    pub fn volume(&self, index: usize) -> f32 {
        self.speakers.get(index).map_or(0.0, |s| s.volume)
    }

    /// Set a speaker's volume, returning the previous value
    pub fn set_volume(&mut self, index: usize, volume: f32) -> Result<f32> {
        let volume = validate_volume(volume)?;
        let len = self.speakers.len();
        let speaker = self
            .speakers
            .get_mut(index)
            .ok_or(AudioError::OutOfRange { index, len })?;

        let previous = speaker.volume;
        speaker.volume = volume;
        debug!(speaker = index, volume, "Speaker volume set");
        Ok(previous)
    }

    pub fn set_name(&mut self, index: usize, name: Option<String>) -> Result<()> {
        let len = self.speakers.len();
        let speaker = self
            .speakers
            .get_mut(index)
            .ok_or(AudioError::OutOfRange { index, len })?;
        speaker.name = name;
        Ok(())
    }

    /// Resize to a new device's channel count
    ///
    /// Surviving speakers keep their name and volume; new ones start at unity.
    pub fn resize(&mut self, count: usize) {
        if count == self.speakers.len() {
            return;
        }
        debug!(from = self.speakers.len(), to = count, "Resizing speaker group");
        self.speakers.truncate(count);
        let start = self.speakers.len();
        self.speakers.extend((start..count).map(Speaker::new));
    }
}

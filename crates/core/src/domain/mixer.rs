//! Channels and their zone attachments
//!
//! A [`Channel`] is one live input stream. It owns a list of [`ChannelZone`]
//! attachments and the mix matrix derived from them. The derivation lives in
//! [`Channel::compute_matrix`]; pushing the result to the backend is the
//! router's job.

pub mod speaker;
pub mod zone;

use crate::domain::audio::{validate_volume, AudioError, Result};
use crate::domain::backend::GroupHandle;
use crate::domain::matrix::Matrix;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;
use uuid::Uuid;

pub use speaker::{Speaker, SpeakerGroup};
pub use zone::{Zone, ZoneId, ZoneTree};

/// Unique identifier for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// Fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attachment of a channel to a zone, with its own volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelZone {
    pub zone: ZoneId,
    pub volume: f32,
}

impl ChannelZone {
    pub const UNITY: f32 = 1.0;

    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            volume: Self::UNITY,
        }
    }
}

/// Live input stream routed through zones
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    group: GroupHandle,
    sub_channels: usize,
    zones: Vec<ChannelZone>,
    matrix: Matrix<f32>,
    stale: bool,
}

impl Channel {
    /// Widest source stream a channel accepts
    pub const MAX_SUB_CHANNELS: usize = 64;

    /// A channel with no attachments and a silent `sub_channels × speakers` matrix
    pub fn new(name: String, group: GroupHandle, sub_channels: usize, speakers: usize) -> Self {
        Self {
            id: ChannelId::generate(),
            name,
            group,
            sub_channels,
            zones: Vec::new(),
            matrix: Matrix::new(sub_channels, speakers, 0.0),
            stale: false,
        }
    }

    pub fn group(&self) -> GroupHandle {
        self.group
    }

    /// Number of sub-channels in the source stream (2 for stereo)
    pub fn sub_channels(&self) -> usize {
        self.sub_channels
    }

    pub fn zones(&self) -> &[ChannelZone] {
        &self.zones
    }

    pub fn attachment(&self, zone: ZoneId) -> Option<&ChannelZone> {
        self.zones.iter().find(|cz| cz.zone == zone)
    }

    pub fn is_attached(&self, zone: ZoneId) -> bool {
        self.attachment(zone).is_some()
    }

    /// Last matrix successfully pushed to the backend
    ///
    /// After a speaker count change this is a silent table of the new width
    /// until the first push at that width succeeds.
    pub fn matrix(&self) -> &Matrix<f32> {
        &self.matrix
    }

    /// True when the attachments changed but the backend push failed
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Attach a zone at unity volume
    ///
    /// Returns the attachment and whether it was newly created. An existing
    /// attachment is returned untouched.
    pub fn attach(&mut self, zone: ZoneId) -> (ChannelZone, bool) {
        if let Some(existing) = self.attachment(zone) {
            return (*existing, false);
        }
        let cz = ChannelZone::new(zone);
        self.zones.push(cz);
        (cz, true)
    }

    pub fn detach(&mut self, zone: ZoneId) -> Result<ChannelZone> {
        let pos = self
            .zones
            .iter()
            .position(|cz| cz.zone == zone)
            .ok_or_else(|| {
                AudioError::NotFound(format!("channel {} is not attached to zone {}", self.id, zone))
            })?;
        Ok(self.zones.remove(pos))
    }

    /// Change an attachment's volume, returning the previous value
    pub fn set_attachment_volume(&mut self, zone: ZoneId, volume: f32) -> Result<f32> {
        let volume = validate_volume(volume)?;
        let id = self.id;
        let cz = self
            .zones
            .iter_mut()
            .find(|cz| cz.zone == zone)
            .ok_or_else(|| {
                AudioError::NotFound(format!("channel {} is not attached to zone {}", id, zone))
            })?;
        let previous = cz.volume;
        cz.volume = volume;
        Ok(previous)
    }

    /// Drop every attachment to one of `zones`, returning how many went
    pub fn detach_all(&mut self, zones: &[ZoneId]) -> usize {
        let before = self.zones.len();
        self.zones.retain(|cz| !zones.contains(&cz.zone));
        before - self.zones.len()
    }

    /// Derive the `sub_channels × speakers` gain table from the attachments
    ///
    /// Every sub-channel feeds every speaker its zones resolve to, at
    /// attachment volume times speaker volume. Speakers reached through more
    /// than one attachment receive the sum.
    pub fn compute_matrix(&self, zones: &ZoneTree, speakers: &SpeakerGroup) -> Result<Matrix<f32>> {
        let outputs = speakers.len();
        let mut matrix = Matrix::new(self.sub_channels, outputs, 0.0);

        for cz in &self.zones {
            for speaker in zones.resolve(cz.zone)? {
                if speaker >= outputs {
                    continue;
                }
                let gain = cz.volume * speakers.volume(speaker);
                for input in 0..self.sub_channels {
                    matrix.accumulate(input, speaker, gain)?;
                }
            }
        }

        trace!(channel = %self.id, matrix = ?matrix.flatten(), "Channel matrix computed");
        Ok(matrix)
    }

    /// Record a matrix the backend accepted
    pub(crate) fn commit(&mut self, matrix: Matrix<f32>) {
        self.matrix = matrix;
        self.stale = false;
    }

    pub(crate) fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Swap in a silent matrix `speakers` wide that the backend has not seen
    pub(crate) fn reshape(&mut self, speakers: usize) {
        self.matrix = Matrix::new(self.sub_channels, speakers, 0.0);
        self.stale = true;
    }
}

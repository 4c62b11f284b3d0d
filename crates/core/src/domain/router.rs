//! Router: one engine session, its speakers, zones and channels
//!
//! Every mutation that can change a channel's resolved speakers recomputes
//! exactly the channels it touches and pushes their matrices to the backend.
//! A push the backend rejects leaves the channel on its last good matrix and
//! flags it stale until [`Router::refresh_channel`] succeeds.

use crate::domain::audio::{AudioError, Driver, Result, Usage};
use crate::domain::backend::{AudioSession, GroupHandle};
use crate::domain::matrix::Matrix;
use crate::domain::mixer::{Channel, ChannelId, ChannelZone, SpeakerGroup, ZoneId, ZoneTree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Lifecycle of a router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    Created,
    Started,
    Stopped,
}

pub struct Router {
    session: Box<dyn AudioSession>,
    driver: Driver,
    speakers: SpeakerGroup,
    zones: ZoneTree,
    channels: BTreeMap<ChannelId, Channel>,
    /// Channels attached to each zone
    attached: HashMap<ZoneId, BTreeSet<ChannelId>>,
    main_bus: Option<GroupHandle>,
    state: RouterState,
    released: bool,
}

impl Router {
    /// Bind a fresh engine session to `driver`
    pub fn new(mut session: Box<dyn AudioSession>, driver: Driver) -> Result<Self> {
        session.set_driver(&driver)?;
        info!(driver = %driver.name, channels = driver.channels, "Router created");

        Ok(Self {
            session,
            speakers: SpeakerGroup::new(usize::from(driver.channels)),
            driver,
            zones: ZoneTree::new(),
            channels: BTreeMap::new(),
            attached: HashMap::new(),
            main_bus: None,
            state: RouterState::Created,
            released: false,
        })
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RouterState::Started
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn num_speakers(&self) -> usize {
        self.speakers.len()
    }

    pub fn speakers(&self) -> &SpeakerGroup {
        &self.speakers
    }

    pub fn zones(&self) -> &ZoneTree {
        &self.zones
    }

    pub fn main_bus(&self) -> Option<GroupHandle> {
        self.main_bus
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels
            .get(&id)
            .ok_or_else(|| AudioError::NotFound(format!("channel {}", id)))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the device; the first start also builds the main bus
    pub fn start(&mut self) -> Result<()> {
        if self.state == RouterState::Started {
            return Err(AudioError::AlreadyRunning);
        }

        let speakers = self.num_speakers();
        self.session.init(speakers)?;

        if self.main_bus.is_none() {
            if let Err(e) = self.build_main_bus() {
                warn!(error = %e, "Main bus setup failed, closing session");
                if let Err(close_err) = self.session.close() {
                    warn!(error = %close_err, "Failed to close session after failed start");
                }
                return Err(e);
            }
        }

        self.state = RouterState::Started;
        info!(driver = %self.driver.name, speakers, "Router started");

        if let Err(e) = self.refresh_stale() {
            warn!(error = %e, "Some channels are still stale after start");
        }
        Ok(())
    }

    /// Close the device; groups and routing stay in place for a restart
    pub fn stop(&mut self) -> Result<()> {
        if self.state != RouterState::Started {
            return Err(AudioError::NotRunning);
        }
        self.session.close()?;
        self.state = RouterState::Stopped;
        info!(driver = %self.driver.name, "Router stopped");
        Ok(())
    }

    /// Rebind to another output device
    ///
    /// A running router is closed and reopened on the new device. If the
    /// channel count changes the speaker group, zone assignments, main bus
    /// and every channel matrix are rebuilt to the new width.
    pub fn set_driver(&mut self, driver: Driver) -> Result<()> {
        let was_running = self.is_running();
        if was_running {
            self.session.close()?;
            self.state = RouterState::Stopped;
        }

        self.session.set_driver(&driver)?;

        let count = usize::from(driver.channels);
        let resized = count != self.speakers.len();
        info!(
            from = %self.driver.name,
            to = %driver.name,
            channels = count,
            "Switching driver"
        );
        self.driver = driver;

        let mut outcome = Ok(());
        if resized {
            self.speakers.resize(count);
            self.zones.prune_speakers(count);

            if let Some(old) = self.main_bus.take() {
                if let Err(e) = self.session.release_group(old) {
                    warn!(group = %old, error = %e, "Failed to release old main bus");
                }
                outcome = self.build_main_bus();
            }

            for channel in self.channels.values_mut() {
                channel.reshape(count);
            }
            let all: Vec<ChannelId> = self.channels.keys().copied().collect();
            outcome = outcome.and(self.recompute(all));
        }

        if was_running {
            self.session.init(count)?;
            self.state = RouterState::Started;
        }
        outcome
    }

    /// Engine load, straight from the backend
    pub fn usage(&self) -> Result<Usage> {
        self.session.usage()
    }

    /// Release every group and the session; the router is inert afterwards
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if self.is_running() {
            if let Err(e) = self.session.close() {
                warn!(error = %e, "Failed to close session during release");
            }
            self.state = RouterState::Stopped;
        }

        for channel in std::mem::take(&mut self.channels).into_values() {
            if let Err(e) = self.session.release_group(channel.group()) {
                warn!(channel = %channel.id, error = %e, "Failed to release channel group");
            }
        }
        self.attached.clear();
        if let Some(bus) = self.main_bus.take() {
            if let Err(e) = self.session.release_group(bus) {
                warn!(error = %e, "Failed to release main bus");
            }
        }

        self.released = true;
        self.session.release()?;
        info!(driver = %self.driver.name, "Router released");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Speakers
    // ------------------------------------------------------------------

    /// Change a speaker's volume and recompute the channels that reach it
    pub fn set_speaker_volume(&mut self, index: usize, volume: f32) -> Result<Vec<ChannelId>> {
        self.speakers.set_volume(index, volume)?;
        let affected = self.channels_reaching_speaker(index)?;
        debug!(speaker = index, volume, affected = affected.len(), "Speaker volume changed");
        self.recompute(affected.iter().copied())?;
        Ok(affected)
    }

    pub fn set_speaker_name(&mut self, index: usize, name: Option<String>) -> Result<()> {
        self.speakers.set_name(index, name)
    }

    // ------------------------------------------------------------------
    // Zones
    // ------------------------------------------------------------------

    /// Create a top-level zone over `speakers`
    pub fn create_zone<I>(&mut self, name: &str, speakers: I) -> Result<ZoneId>
    where
        I: IntoIterator<Item = usize>,
    {
        let speakers = self.check_speakers(speakers)?;
        self.zones.create(name, speakers)
    }

    /// Create a zone directly under `parent`
    pub fn create_zone_in<I>(&mut self, parent: ZoneId, name: &str, speakers: I) -> Result<ZoneId>
    where
        I: IntoIterator<Item = usize>,
    {
        let speakers = self.check_speakers(speakers)?;
        let id = self.zones.create_in(parent, name, speakers)?;

        let affected = self.channels_attached_to(&self.zones.lineage(parent));
        self.recompute(affected)?;
        Ok(id)
    }

    /// Link `child` under `parent`, moving it if it already has a parent
    pub fn add_zone(&mut self, parent: ZoneId, child: ZoneId) -> Result<()> {
        let previous = self.zones.add(parent, child)?;

        let mut lineage = self.zones.lineage(parent);
        if let Some(previous) = previous {
            lineage.extend(self.zones.lineage(previous));
        }
        let affected = self.channels_attached_to(&lineage);
        self.recompute(affected)
    }

    /// Unlink a direct child; it becomes a top-level zone
    pub fn remove_zone(&mut self, parent: ZoneId, child: ZoneId) -> Result<()> {
        self.zones.remove(parent, child)?;
        let affected = self.channels_attached_to(&self.zones.lineage(parent));
        self.recompute(affected)
    }

    /// Destroy a zone and its subtree, detaching every channel that used them
    pub fn destroy_zone(&mut self, id: ZoneId) -> Result<Vec<ChannelId>> {
        let parent = self.zones.zone(id)?.parent;
        let lineage = parent.map(|p| self.zones.lineage(p)).unwrap_or_default();
        let removed = self.zones.destroy(id)?;

        let mut affected = self.channels_attached_to(&lineage);
        for zone in &removed {
            if let Some(channels) = self.attached.remove(zone) {
                affected.extend(channels);
            }
        }
        for channel_id in &affected {
            if let Some(channel) = self.channels.get_mut(channel_id) {
                channel.detach_all(&removed);
            }
        }

        let affected: Vec<ChannelId> = affected.into_iter().collect();
        debug!(zone = %id, removed = removed.len(), affected = affected.len(), "Zone destroyed");
        self.recompute(affected.iter().copied())?;
        Ok(affected)
    }

    /// Replace the speakers assigned directly to a zone
    pub fn set_zone_speakers<I>(&mut self, id: ZoneId, speakers: I) -> Result<()>
    where
        I: IntoIterator<Item = usize>,
    {
        let speakers = self.check_speakers(speakers)?;
        self.zones.set_speakers(id, speakers)?;
        let affected = self.channels_attached_to(&self.zones.lineage(id));
        self.recompute(affected)
    }

    pub fn rename_zone(&mut self, id: ZoneId, name: &str) -> Result<()> {
        self.zones.rename(id, name)
    }

    /// Speakers a zone reaches through its subtree
    pub fn resolve_zone(&self, id: ZoneId) -> Result<BTreeSet<usize>> {
        self.zones.resolve(id)
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Create a channel for a `sub_channels`-wide stream, initially silent
    ///
    /// Streams wider than [`Channel::MAX_SUB_CHANNELS`] are rejected.
    pub fn create_channel(&mut self, name: &str, sub_channels: usize) -> Result<ChannelId> {
        if sub_channels > Channel::MAX_SUB_CHANNELS {
            return Err(AudioError::OutOfRange {
                index: sub_channels,
                len: Channel::MAX_SUB_CHANNELS + 1,
            });
        }
        let group = self.session.create_group(name, sub_channels)?;
        let mut channel = Channel::new(name.to_string(), group, sub_channels, self.num_speakers());

        let silent = channel.matrix().clone();
        if let Err(e) = self.push(group, &silent) {
            if let Err(release_err) = self.session.release_group(group) {
                warn!(group = %group, error = %release_err, "Failed to release group");
            }
            return Err(e);
        }
        channel.commit(silent);

        let id = channel.id;
        debug!(channel = %id, name, sub_channels, "Channel created");
        self.channels.insert(id, channel);
        Ok(id)
    }

    pub fn destroy_channel(&mut self, id: ChannelId) -> Result<()> {
        let group = self.channel(id)?.group();
        self.session.release_group(group)?;

        if let Some(channel) = self.channels.remove(&id) {
            for cz in channel.zones() {
                if let Some(set) = self.attached.get_mut(&cz.zone) {
                    set.remove(&id);
                }
            }
        }
        debug!(channel = %id, "Channel destroyed");
        Ok(())
    }

    /// Attach a channel to a zone; attaching twice returns the existing link
    pub fn attach_zone(&mut self, channel: ChannelId, zone: ZoneId) -> Result<ChannelZone> {
        self.zones.zone(zone)?;
        let (cz, created) = self.channel_mut(channel)?.attach(zone);
        if created {
            self.attached.entry(zone).or_default().insert(channel);
            debug!(channel = %channel, zone = %zone, "Zone attached");
            self.recompute_channel(channel)?;
        }
        Ok(cz)
    }

    pub fn detach_zone(&mut self, channel: ChannelId, zone: ZoneId) -> Result<ChannelZone> {
        let cz = self.channel_mut(channel)?.detach(zone)?;
        if let Some(set) = self.attached.get_mut(&zone) {
            set.remove(&channel);
        }
        debug!(channel = %channel, zone = %zone, "Zone detached");
        self.recompute_channel(channel)?;
        Ok(cz)
    }

    /// Change one attachment's volume; only its channel is recomputed
    pub fn set_attachment_volume(&mut self, channel: ChannelId, zone: ZoneId, volume: f32) -> Result<()> {
        self.channel_mut(channel)?.set_attachment_volume(zone, volume)?;
        self.recompute_channel(channel)
    }

    /// Recompute and push one channel, clearing its stale flag on success
    pub fn refresh_channel(&mut self, id: ChannelId) -> Result<()> {
        self.recompute_channel(id)
    }

    /// Retry every stale channel, returning the ones that recovered
    pub fn refresh_stale(&mut self) -> Result<Vec<ChannelId>> {
        let stale: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|c| c.is_stale())
            .map(|c| c.id)
            .collect();
        self.recompute(stale.iter().copied())?;
        Ok(stale)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| AudioError::NotFound(format!("channel {}", id)))
    }

    fn check_speakers<I>(&self, speakers: I) -> Result<BTreeSet<usize>>
    where
        I: IntoIterator<Item = usize>,
    {
        let len = self.num_speakers();
        let speakers: BTreeSet<usize> = speakers.into_iter().collect();
        if let Some(&index) = speakers.iter().find(|s| **s >= len) {
            return Err(AudioError::OutOfRange { index, len });
        }
        Ok(speakers)
    }

    /// Channels attached to any of `zones`
    fn channels_attached_to(&self, zones: &[ZoneId]) -> BTreeSet<ChannelId> {
        zones
            .iter()
            .filter_map(|zone| self.attached.get(zone))
            .flatten()
            .copied()
            .collect()
    }

    /// Channels with an attachment whose zone resolves to `speaker`
    fn channels_reaching_speaker(&self, speaker: usize) -> Result<Vec<ChannelId>> {
        let mut out = BTreeSet::new();
        for (zone, channels) in &self.attached {
            if channels.is_empty() {
                continue;
            }
            if self.zones.resolve(*zone)?.contains(&speaker) {
                out.extend(channels.iter().copied());
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Identity bus sized to the speaker group
    fn build_main_bus(&mut self) -> Result<()> {
        let speakers = self.num_speakers();
        let group = self.session.create_main_bus(speakers)?;

        let mut matrix = Matrix::new(speakers, speakers, 0.0);
        for s in 0..speakers {
            matrix.set_input(s, s, 1.0)?;
        }
        if let Err(e) = self.push(group, &matrix) {
            if let Err(release_err) = self.session.release_group(group) {
                warn!(group = %group, error = %release_err, "Failed to release main bus");
            }
            return Err(e);
        }

        debug!(group = %group, speakers, "Main bus ready");
        self.main_bus = Some(group);
        Ok(())
    }

    fn push(&mut self, group: GroupHandle, matrix: &Matrix<f32>) -> Result<()> {
        self.session
            .set_mix_matrix(group, matrix.flatten(), matrix.inputs(), matrix.outputs())
    }

    fn recompute_channel(&mut self, id: ChannelId) -> Result<()> {
        let channel = self.channel(id)?;
        let group = channel.group();
        let matrix = channel.compute_matrix(&self.zones, &self.speakers)?;

        match self.push(group, &matrix) {
            Ok(()) => {
                self.channel_mut(id)?.commit(matrix);
                Ok(())
            }
            Err(e) => {
                warn!(channel = %id, error = %e, "Matrix push failed, channel left stale");
                self.channel_mut(id)?.mark_stale();
                Err(e)
            }
        }
    }

    /// Recompute every channel in `ids`, reporting the first failure
    fn recompute<I>(&mut self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = ChannelId>,
    {
        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.recompute_channel(id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "Router release failed on drop");
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("driver", &self.driver.name)
            .field("state", &self.state)
            .field("speakers", &self.speakers.len())
            .field("zones", &self.zones.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

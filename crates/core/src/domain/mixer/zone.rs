//! Zone hierarchy
//!
//! Zones are named groups of speakers arranged in a tree. A zone resolves to
//! the union of its own speakers and those of every descendant, so nesting a
//! "front-left" zone under "front" makes "front" reach both.

use crate::domain::audio::{AudioError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Router-local zone identifier, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(u32);

impl ZoneId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub parent: Option<ZoneId>,
    pub children: Vec<ZoneId>,
    /// Speakers assigned directly to this zone
    pub speakers: BTreeSet<usize>,
}

/// Name used in errors for the implicit top level
const TOP_LEVEL: &str = "<top>";

#[derive(Debug, Clone, Default)]
pub struct ZoneTree {
    zones: BTreeMap<ZoneId, Zone>,
    next_id: u32,
}

impl ZoneTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn get(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(&id)
    }

    pub fn zone(&self, id: ZoneId) -> Result<&Zone> {
        self.zones
            .get(&id)
            .ok_or_else(|| AudioError::NotFound(format!("zone {}", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    /// Look a zone up by name among a parent's children (`None` = top level)
    pub fn find(&self, parent: Option<ZoneId>, name: &str) -> Option<ZoneId> {
        self.siblings(parent)
            .find(|zone| zone.name == name)
            .map(|zone| zone.id)
    }

    /// Create a top-level zone
    pub fn create(&mut self, name: &str, speakers: BTreeSet<usize>) -> Result<ZoneId> {
        if self.find(None, name).is_some() {
            return Err(AudioError::DuplicateChild {
                parent: TOP_LEVEL.to_string(),
                child: name.to_string(),
            });
        }

        let id = ZoneId(self.next_id);
        self.next_id += 1;
        self.zones.insert(
            id,
            Zone {
                id,
                name: name.to_string(),
                parent: None,
                children: Vec::new(),
                speakers,
            },
        );
        debug!(zone = %id, name, "Zone created");
        Ok(id)
    }

    /// Create a zone directly under `parent`
    pub fn create_in(
        &mut self,
        parent: ZoneId,
        name: &str,
        speakers: BTreeSet<usize>,
    ) -> Result<ZoneId> {
        let parent_zone = self.zone(parent)?;
        if self.find(Some(parent), name).is_some() {
            return Err(AudioError::DuplicateChild {
                parent: parent_zone.name.clone(),
                child: name.to_string(),
            });
        }

        let id = ZoneId(self.next_id);
        self.next_id += 1;
        self.zones.insert(
            id,
            Zone {
                id,
                name: name.to_string(),
                parent: Some(parent),
                children: Vec::new(),
                speakers,
            },
        );
        if let Some(p) = self.zones.get_mut(&parent) {
            p.children.push(id);
        }
        debug!(zone = %id, parent = %parent, name, "Zone created");
        Ok(id)
    }

    /// Make `child` a child of `parent`
    ///
    /// A child that already hangs off another zone is moved. Returns the
    /// previous parent, if any.
    pub fn add(&mut self, parent: ZoneId, child: ZoneId) -> Result<Option<ZoneId>> {
        let parent_zone = self.zone(parent)?;
        let child_zone = self.zone(child)?;

        if child == parent || self.is_ancestor(child, parent) {
            return Err(AudioError::Cycle {
                parent: parent_zone.name.clone(),
                child: child_zone.name.clone(),
            });
        }
        if child_zone.parent == Some(parent)
            || self.find(Some(parent), &child_zone.name).is_some()
        {
            return Err(AudioError::DuplicateChild {
                parent: parent_zone.name.clone(),
                child: child_zone.name.clone(),
            });
        }

        let previous = child_zone.parent;
        if let Some(old) = previous {
            if let Some(old_zone) = self.zones.get_mut(&old) {
                old_zone.children.retain(|c| *c != child);
            }
        }
        if let Some(zone) = self.zones.get_mut(&child) {
            zone.parent = Some(parent);
        }
        if let Some(zone) = self.zones.get_mut(&parent) {
            zone.children.push(child);
        }

        debug!(parent = %parent, child = %child, "Zone linked");
        Ok(previous)
    }

    /// Detach a direct child, making it a top-level zone
    pub fn remove(&mut self, parent: ZoneId, child: ZoneId) -> Result<()> {
        let parent_zone = self.zone(parent)?;
        if !parent_zone.children.contains(&child) {
            return Err(AudioError::NotFound(format!(
                "zone {} is not a child of zone {}",
                child, parent
            )));
        }
        let child_zone = self.zone(child)?;
        if self.find(None, &child_zone.name).is_some() {
            return Err(AudioError::DuplicateChild {
                parent: TOP_LEVEL.to_string(),
                child: child_zone.name.clone(),
            });
        }

        if let Some(zone) = self.zones.get_mut(&parent) {
            zone.children.retain(|c| *c != child);
        }
        if let Some(zone) = self.zones.get_mut(&child) {
            zone.parent = None;
        }

        debug!(parent = %parent, child = %child, "Zone unlinked");
        Ok(())
    }

    /// Remove a zone and its whole subtree, returning the removed ids
    pub fn destroy(&mut self, id: ZoneId) -> Result<Vec<ZoneId>> {
        let parent = self.zone(id)?.parent;
        let removed = self.subtree(id);

        if let Some(parent) = parent {
            if let Some(zone) = self.zones.get_mut(&parent) {
                zone.children.retain(|c| *c != id);
            }
        }
        for zone in &removed {
            self.zones.remove(zone);
        }

        debug!(zone = %id, removed = removed.len(), "Zone destroyed");
        Ok(removed)
    }

    pub fn set_speakers(&mut self, id: ZoneId, speakers: BTreeSet<usize>) -> Result<()> {
        let zone = self
            .zones
            .get_mut(&id)
            .ok_or_else(|| AudioError::NotFound(format!("zone {}", id)))?;
        zone.speakers = speakers;
        Ok(())
    }

    pub fn rename(&mut self, id: ZoneId, name: &str) -> Result<()> {
        let zone = self.zone(id)?;
        if zone.name == name {
            return Ok(());
        }
        if self.find(zone.parent, name).is_some() {
            let parent = match zone.parent {
                Some(p) => self.zone(p)?.name.clone(),
                None => TOP_LEVEL.to_string(),
            };
            return Err(AudioError::DuplicateChild {
                parent,
                child: name.to_string(),
            });
        }
        if let Some(zone) = self.zones.get_mut(&id) {
            zone.name = name.to_string();
        }
        Ok(())
    }

    /// Every speaker reachable from a zone through its descendants
    pub fn resolve(&self, id: ZoneId) -> Result<BTreeSet<usize>> {
        self.zone(id)?;
        let mut speakers = BTreeSet::new();
        for zone in self.subtree(id) {
            if let Some(zone) = self.zones.get(&zone) {
                speakers.extend(zone.speakers.iter().copied());
            }
        }
        Ok(speakers)
    }

    /// The zone followed by its parent chain up to the top level
    ///
    /// These are exactly the zones whose resolved set can change when the
    /// zone's own speakers or children change.
    pub fn lineage(&self, id: ZoneId) -> Vec<ZoneId> {
        let mut lineage = Vec::new();
        let mut current = self.zones.get(&id).map(|z| z.id);
        while let Some(zone) = current {
            lineage.push(zone);
            current = self.zones.get(&zone).and_then(|z| z.parent);
        }
        lineage
    }

    /// True if `ancestor` sits on the parent chain above `zone`
    pub fn is_ancestor(&self, ancestor: ZoneId, zone: ZoneId) -> bool {
        self.lineage(zone).into_iter().skip(1).any(|z| z == ancestor)
    }

    /// Drop speaker indices a smaller device no longer has
    pub fn prune_speakers(&mut self, count: usize) {
        for zone in self.zones.values_mut() {
            zone.speakers.retain(|s| *s < count);
        }
    }

    fn siblings(&self, parent: Option<ZoneId>) -> impl Iterator<Item = &Zone> {
        self.zones.values().filter(move |z| z.parent == parent)
    }

    fn subtree(&self, id: ZoneId) -> Vec<ZoneId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(zone) = stack.pop() {
            if let Some(z) = self.zones.get(&zone) {
                out.push(zone);
                stack.extend(z.children.iter().copied());
            }
        }
        out
    }
}

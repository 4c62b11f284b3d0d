//! Software mixdown of channel groups onto the output device
//!
//! Every channel group carries a flattened `inputs × outputs` gain table,
//! row-major by input. The output callback sums all channel groups into a
//! speaker-wide bus, then runs the bus through the main bus table into the
//! device buffer.
//!
//! Performance characteristics:
//! - No allocations once the scratch buffers reach the callback's block size
//! - Silent input samples skip their gain row

use crossbeam::queue::ArrayQueue;
use ear_core::domain::audio::{AudioError, Result};
use ear_core::domain::backend::GroupHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Mix interleaved `input` frames through `gains` and add them into `out`
///
/// `input` holds `inputs` samples per frame, `out` holds `outputs`. Gain
/// `gains[i * outputs + o]` scales input `i` into output `o`. The shorter of
/// the two buffers bounds the number of frames mixed.
pub fn mix_block(input: &[f32], gains: &[f32], inputs: usize, outputs: usize, out: &mut [f32]) {
    if inputs == 0 || outputs == 0 || gains.len() != inputs * outputs {
        return;
    }
    let frames = (input.len() / inputs).min(out.len() / outputs);

    for f in 0..frames {
        let frame_in = &input[f * inputs..(f + 1) * inputs];
        let frame_out = &mut out[f * outputs..(f + 1) * outputs];
        for (i, &sample) in frame_in.iter().enumerate() {
            if sample == 0.0 {
                continue;
            }
            let row = &gains[i * outputs..(i + 1) * outputs];
            for (o, gain) in row.iter().enumerate() {
                frame_out[o] += sample * gain;
            }
        }
    }
}

/// Producer side of a channel group's sample queue
#[derive(Clone)]
pub struct GroupFeed {
    queue: Arc<ArrayQueue<f32>>,
    inputs: usize,
}

impl GroupFeed {
    /// Queue interleaved samples, returning how many fit
    pub fn push(&self, samples: &[f32]) -> usize {
        samples
            .iter()
            .take_while(|s| self.queue.push(**s).is_ok())
            .count()
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

struct GroupSlot {
    inputs: usize,
    gains: Vec<f32>,
    queue: Arc<ArrayQueue<f32>>,
}

/// Groups and gain tables of one session, shared with its output callback
#[derive(Default)]
pub struct MixGraph {
    groups: HashMap<GroupHandle, GroupSlot>,
    main_bus: Option<GroupHandle>,
    scratch_in: Vec<f32>,
    scratch_bus: Vec<f32>,
}

impl MixGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel group whose queue holds up to `capacity` samples
    pub fn add_group(&mut self, group: GroupHandle, inputs: usize, capacity: usize) -> GroupFeed {
        let queue = Arc::new(ArrayQueue::new(capacity.max(1)));
        self.groups.insert(
            group,
            GroupSlot {
                inputs,
                gains: Vec::new(),
                queue: Arc::clone(&queue),
            },
        );
        debug!(group = %group, inputs, capacity, "Mix group added");
        GroupFeed { queue, inputs }
    }

    /// Register the speaker-wide bus every channel group sums into
    pub fn set_main_bus(&mut self, group: GroupHandle, speakers: usize) {
        self.add_group(group, speakers, 1);
        self.main_bus = Some(group);
    }

    pub fn main_bus(&self) -> Option<GroupHandle> {
        self.main_bus
    }

    pub fn remove_group(&mut self, group: GroupHandle) -> bool {
        if self.main_bus == Some(group) {
            self.main_bus = None;
        }
        self.groups.remove(&group).is_some()
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.main_bus = None;
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Replace a group's gain table
    pub fn set_gains(
        &mut self,
        group: GroupHandle,
        gains: &[f32],
        inputs: usize,
        outputs: usize,
    ) -> Result<()> {
        let slot = self
            .groups
            .get_mut(&group)
            .ok_or_else(|| AudioError::Backend(format!("unknown {}", group)))?;
        if slot.inputs != inputs {
            return Err(AudioError::DimensionMismatch {
                expected: slot.inputs,
                actual: inputs,
            });
        }
        if gains.len() != inputs * outputs {
            return Err(AudioError::DimensionMismatch {
                expected: inputs * outputs,
                actual: gains.len(),
            });
        }
        slot.gains.clear();
        slot.gains.extend_from_slice(gains);
        trace!(group = %group, inputs, outputs, "Gains updated");
        Ok(())
    }

    pub fn gains(&self, group: GroupHandle) -> Option<&[f32]> {
        self.groups.get(&group).map(|slot| slot.gains.as_slice())
    }

    /// Fill one device buffer of `speakers`-wide frames
    ///
    /// Queues that run dry contribute silence. Groups whose table does not
    /// match the current speaker count are skipped.
    pub fn render(&mut self, out: &mut [f32], speakers: usize) {
        out.fill(0.0);
        if speakers == 0 {
            return;
        }
        let frames = out.len() / speakers;

        self.scratch_bus.clear();
        self.scratch_bus.resize(frames * speakers, 0.0);

        for (handle, slot) in &self.groups {
            if Some(*handle) == self.main_bus || slot.gains.len() != slot.inputs * speakers {
                continue;
            }
            self.scratch_in.clear();
            self.scratch_in.extend(
                (0..frames * slot.inputs).map(|_| slot.queue.pop().unwrap_or(0.0)),
            );
            mix_block(&self.scratch_in, &slot.gains, slot.inputs, speakers, &mut self.scratch_bus);
        }

        let main_gains = self
            .main_bus
            .and_then(|bus| self.groups.get(&bus))
            .map(|slot| slot.gains.as_slice())
            .filter(|gains| gains.len() == speakers * speakers);

        match main_gains {
            Some(gains) => mix_block(&self.scratch_bus, gains, speakers, speakers, out),
            None => {
                let n = self.scratch_bus.len().min(out.len());
                out[..n].copy_from_slice(&self.scratch_bus[..n]);
            }
        }
    }
}

use std::collections::HashMap;

use crate::net::{ProtocolError, StateUpdate};

use super::entity::EntitySnapshot;
use super::world::WorldSnapshot;

/// Folds per-entity state updates into whole-world snapshots.
///
/// Updates sharing a timestamp belong to one server tick. The first update with a newer
/// timestamp finalizes the pending snapshot. Entities not mentioned in a tick carry over
/// their last known state.
#[derive(Debug, Default)]
pub struct SnapshotAssembler {
    pending: Option<WorldSnapshot>,
    known: HashMap<u64, EntitySnapshot>,
}

impl SnapshotAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the finished snapshot of the previous tick, if this update started a new one.
    pub fn push(&mut self, update: &StateUpdate) -> Result<Option<WorldSnapshot>, ProtocolError> {
        let mut finished = None;
        match &self.pending {
            Some(pending) if update.timestamp < pending.timestamp => {
                log::debug!(
                    "Ignoring update for entity {} at {} older than tick {}",
                    update.entity_id,
                    update.timestamp,
                    pending.timestamp
                );
                return Ok(None);
            }
            Some(pending) if update.timestamp == pending.timestamp => {}
            _ => {
                finished = self.pending.take();
                self.pending = Some(self.carried_forward(update.timestamp));
            }
        }

        let entity = match self.known.get(&update.entity_id) {
            Some(known) => {
                let mut entity = *known;
                entity.apply_update(update)?;
                Some(entity)
            }
            None => EntitySnapshot::from_update(update)?,
        };

        if let Some(entity) = entity {
            self.known.insert(entity.entity_id, entity);
            if let Some(pending) = self.pending.as_mut() {
                pending.insert(entity);
            }
        }
        Ok(finished)
    }

    /// Finalizes the pending snapshot without waiting for the next tick.
    pub fn flush(&mut self) -> Option<WorldSnapshot> {
        self.pending.take()
    }

    pub fn forget(&mut self, entity_id: u64) {
        self.known.remove(&entity_id);
        if let Some(pending) = self.pending.as_mut() {
            pending.remove(entity_id);
        }
    }

    pub fn known(&self, entity_id: u64) -> Option<&EntitySnapshot> {
        self.known.get(&entity_id)
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.known.clear();
    }

    fn carried_forward(&self, timestamp: u64) -> WorldSnapshot {
        WorldSnapshot {
            timestamp,
            entities: self.known.clone(),
        }
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::net::StateUpdate;

use super::entity::EntitySnapshot;

/// Every known entity at one timestamp (Unix ms on the server's clock).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub timestamp: u64,
    pub entities: HashMap<u64, EntitySnapshot>,
}

impl WorldSnapshot {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            entities: HashMap::new(),
        }
    }

    pub fn with_entity(mut self, entity: EntitySnapshot) -> Self {
        self.insert(entity);
        self
    }

    pub fn insert(&mut self, entity: EntitySnapshot) {
        self.entities.insert(entity.entity_id, entity);
    }

    pub fn remove(&mut self, entity_id: u64) -> Option<EntitySnapshot> {
        self.entities.remove(&entity_id)
    }

    pub fn get(&self, entity_id: u64) -> Option<&EntitySnapshot> {
        self.entities.get(&entity_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySnapshot> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// One update per entity, ordered by entity id.
    pub fn to_updates(&self) -> Vec<StateUpdate> {
        let mut entities: Vec<_> = self.entities.values().collect();
        entities.sort_by_key(|e| e.entity_id);
        entities
            .into_iter()
            .map(|e| e.to_update(self.timestamp))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    #[test]
    fn updates_are_sorted_and_stamped() {
        let world = WorldSnapshot::new(300)
            .with_entity(EntitySnapshot::new(9, Vec2::ONE))
            .with_entity(EntitySnapshot::new(2, Vec2::ZERO));

        let updates = world.to_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].entity_id, 2);
        assert_eq!(updates[1].entity_id, 9);
        assert!(updates.iter().all(|u| u.timestamp == 300));
    }
}

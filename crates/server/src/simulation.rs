use std::collections::BTreeMap;

use glam::Vec2;

use netsync::{
    ComponentData, EntitySnapshot, InputCommand, MovementModel, PredictionModel, StateUpdate,
    WorldSnapshot,
};

const SPAWN_SPACING: f32 = 4.0;

#[derive(Debug, Clone, Copy)]
struct Player {
    entity: EntitySnapshot,
    /// Highest input sequence applied for this player.
    last_applied: u32,
}

/// Authoritative demo world: one entity per player, keyed by player id.
#[derive(Debug)]
pub struct World {
    players: BTreeMap<u64, Player>,
    model: MovementModel,
}

impl World {
    pub fn new(model: MovementModel) -> Self {
        Self {
            players: BTreeMap::new(),
            model,
        }
    }

    pub fn spawn(&mut self, player_id: u64) -> EntitySnapshot {
        let slot = (player_id % 8) as f32;
        let position = Vec2::from_angle(slot * std::f32::consts::FRAC_PI_4) * SPAWN_SPACING;
        let entity = EntitySnapshot::new(player_id, position);
        self.players.insert(
            player_id,
            Player {
                entity,
                last_applied: 0,
            },
        );
        entity
    }

    pub fn despawn(&mut self, player_id: u64) -> bool {
        self.players.remove(&player_id).is_some()
    }

    pub fn entity(&self, player_id: u64) -> Option<&EntitySnapshot> {
        self.players.get(&player_id).map(|p| &p.entity)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Runs the input through the movement model and records it as applied.
    /// Inputs from unknown players are ignored.
    pub fn apply_input(&mut self, input: &InputCommand) -> bool {
        let Some(player) = self.players.get_mut(&input.player_id) else {
            return false;
        };
        self.model.apply_input(&mut player.entity, input);
        player.last_applied = player.last_applied.max(input.sequence_number);
        true
    }

    pub fn acknowledge(&mut self, player_id: u64, sequence: u32) {
        if let Some(player) = self.players.get_mut(&player_id) {
            player.last_applied = player.last_applied.max(sequence);
        }
    }

    pub fn snapshot(&self, timestamp: u64) -> WorldSnapshot {
        self.players
            .values()
            .fold(WorldSnapshot::new(timestamp), |world, player| {
                world.with_entity(player.entity)
            })
    }

    /// One update per entity, each stamped with its owner's applied input sequence.
    pub fn updates(&self, timestamp: u64) -> Vec<StateUpdate> {
        self.players
            .values()
            .map(|player| {
                player
                    .entity
                    .to_update(timestamp)
                    .with_component(ComponentData::input_ack(player.last_applied))
            })
            .collect()
    }
}

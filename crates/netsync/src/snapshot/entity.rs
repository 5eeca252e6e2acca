use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::net::{ComponentData, POSITION_COMPONENT, ProtocolError, StateUpdate, VELOCITY_COMPONENT};

/// Kinematic state of one entity at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: u64,
    pub position: Vec2,
    pub velocity: Vec2,
}

impl EntitySnapshot {
    pub fn new(entity_id: u64, position: Vec2) -> Self {
        Self {
            entity_id,
            position,
            velocity: Vec2::ZERO,
        }
    }

    pub fn with_velocity(mut self, velocity: Vec2) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            entity_id: self.entity_id,
            position: self.position.lerp(other.position, t),
            velocity: self.velocity.lerp(other.velocity, t),
        }
    }

    /// Builds a snapshot from an update carrying at least a position.
    pub fn from_update(update: &StateUpdate) -> Result<Option<Self>, ProtocolError> {
        let Some(position) = update.component(POSITION_COMPONENT) else {
            return Ok(None);
        };
        let mut entity = Self::new(update.entity_id, position.as_vec2()?);
        if let Some(velocity) = update.component(VELOCITY_COMPONENT) {
            entity.velocity = velocity.as_vec2()?;
        }
        Ok(Some(entity))
    }

    /// Overwrites whichever kinematic components the update carries.
    pub fn apply_update(&mut self, update: &StateUpdate) -> Result<(), ProtocolError> {
        if let Some(position) = update.component(POSITION_COMPONENT) {
            self.position = position.as_vec2()?;
        }
        if let Some(velocity) = update.component(VELOCITY_COMPONENT) {
            self.velocity = velocity.as_vec2()?;
        }
        Ok(())
    }

    pub fn to_update(&self, timestamp: u64) -> StateUpdate {
        StateUpdate::new(timestamp, self.entity_id)
            .with_component(ComponentData::position(self.position))
            .with_component(ComponentData::velocity(self.velocity))
    }
}

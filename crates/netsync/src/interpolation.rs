use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshot::{EntitySnapshot, SnapshotHistory, SnapshotLookup, WorldSnapshot};

pub const DEFAULT_INTERPOLATION_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    /// How far behind the newest server time remote entities are rendered.
    pub delay: Duration,
    /// How far past the newest snapshot motion may be extrapolated. Zero clamps instead.
    pub extrapolation_limit: Duration,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_INTERPOLATION_DELAY,
            extrapolation_limit: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Interpolator {
    config: InterpolationConfig,
}

impl Interpolator {
    pub fn new(delay: Duration) -> Self {
        Self::with_config(InterpolationConfig {
            delay,
            ..Default::default()
        })
    }

    pub fn with_config(config: InterpolationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InterpolationConfig {
        &self.config
    }

    pub fn delay(&self) -> Duration {
        self.config.delay
    }

    pub fn render_time(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.config.delay.as_millis() as u64)
    }

    /// The world as it looked at `render_time`, blended from the bracketing snapshots.
    pub fn interpolate(&self, history: &SnapshotHistory, render_time: u64) -> Option<WorldSnapshot> {
        let snapshot = match history.get_snapshot(render_time)? {
            SnapshotLookup::Exact(snapshot) => WorldSnapshot::clone(&snapshot),
            SnapshotLookup::Between { before, after } => blend(&before, &after, render_time),
            SnapshotLookup::Clamped(edge) => {
                let ahead = render_time.saturating_sub(edge.timestamp);
                let limit = self.config.extrapolation_limit.as_millis() as u64;
                if ahead > 0 && limit > 0 {
                    extrapolate(&edge, ahead.min(limit))
                } else {
                    WorldSnapshot::clone(&edge)
                }
            }
        };
        Some(snapshot)
    }

    pub fn interpolate_entity(
        &self,
        history: &SnapshotHistory,
        entity_id: u64,
        render_time: u64,
    ) -> Option<EntitySnapshot> {
        self.interpolate(history, render_time)?
            .get(entity_id)
            .copied()
    }
}

/// Linear blend by time fraction. Entities present in only one snapshot are taken as-is.
pub fn blend(before: &WorldSnapshot, after: &WorldSnapshot, timestamp: u64) -> WorldSnapshot {
    let span = after.timestamp.saturating_sub(before.timestamp);
    let t = if span == 0 {
        1.0
    } else {
        (timestamp.saturating_sub(before.timestamp) as f64 / span as f64).clamp(0.0, 1.0) as f32
    };

    let mut world = WorldSnapshot::new(timestamp);
    for entity in after.iter() {
        let blended = match before.get(entity.entity_id) {
            Some(previous) => previous.lerp(entity, t),
            None => *entity,
        };
        world.insert(blended);
    }
    for entity in before.iter() {
        if after.get(entity.entity_id).is_none() {
            world.insert(*entity);
        }
    }
    world
}

fn extrapolate(snapshot: &WorldSnapshot, ahead_ms: u64) -> WorldSnapshot {
    let dt = ahead_ms as f32 / 1000.0;
    let mut world = WorldSnapshot::new(snapshot.timestamp + ahead_ms);
    for entity in snapshot.iter() {
        let mut moved = *entity;
        moved.position += moved.velocity * dt;
        world.insert(moved);
    }
    world
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    fn history() -> SnapshotHistory {
        let mut history = SnapshotHistory::new(10);
        history.insert(WorldSnapshot::new(100).with_entity(EntitySnapshot::new(1, Vec2::ZERO)));
        history.insert(
            WorldSnapshot::new(150).with_entity(EntitySnapshot::new(1, Vec2::new(50.0, 0.0))),
        );
        history
    }

    #[test]
    fn midpoint_blend() {
        let interpolator = Interpolator::default();
        let entity = interpolator.interpolate_entity(&history(), 1, 125).unwrap();
        assert_eq!(entity.position, Vec2::new(25.0, 0.0));
    }

    #[test]
    fn render_time_applies_delay() {
        let interpolator = Interpolator::default();
        assert_eq!(interpolator.render_time(1_000), 900);
        assert_eq!(interpolator.render_time(50), 0);
    }

    #[test]
    fn out_of_range_clamps() {
        let interpolator = Interpolator::default();
        let history = history();
        assert_eq!(
            interpolator.interpolate_entity(&history, 1, 10).unwrap().position,
            Vec2::ZERO
        );
        assert_eq!(
            interpolator.interpolate_entity(&history, 1, 400).unwrap().position,
            Vec2::new(50.0, 0.0)
        );
        assert!(interpolator.interpolate(&SnapshotHistory::default(), 100).is_none());
    }

    #[test]
    fn entity_in_one_snapshot_is_taken_as_is() {
        let before = WorldSnapshot::new(0).with_entity(EntitySnapshot::new(1, Vec2::ZERO));
        let after = WorldSnapshot::new(100)
            .with_entity(EntitySnapshot::new(1, Vec2::new(10.0, 0.0)))
            .with_entity(EntitySnapshot::new(2, Vec2::new(7.0, 7.0)));

        let world = blend(&before, &after, 50);
        assert_eq!(world.get(1).unwrap().position, Vec2::new(5.0, 0.0));
        assert_eq!(world.get(2).unwrap().position, Vec2::new(7.0, 7.0));
    }

    #[test]
    fn bounded_extrapolation() {
        let interpolator = Interpolator::with_config(InterpolationConfig {
            delay: DEFAULT_INTERPOLATION_DELAY,
            extrapolation_limit: Duration::from_millis(100),
        });
        let mut history = SnapshotHistory::new(4);
        history.insert(
            WorldSnapshot::new(1_000)
                .with_entity(EntitySnapshot::new(1, Vec2::ZERO).with_velocity(Vec2::new(10.0, 0.0))),
        );

        let entity = interpolator.interpolate_entity(&history, 1, 1_050).unwrap();
        assert!((entity.position.x - 0.5).abs() < 1e-5);
        let entity = interpolator.interpolate_entity(&history, 1, 5_000).unwrap();
        assert!((entity.position.x - 1.0).abs() < 1e-5);
    }
}

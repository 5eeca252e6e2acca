//! Server-side rewinding of the world to what a client saw when it acted.

use std::time::Duration;

use bytes::{Buf, BufMut};
use glam::Vec2;

use crate::interpolation::{DEFAULT_INTERPOLATION_DELAY, Interpolator};
use crate::net::InputCommand;
use crate::snapshot::{DEFAULT_HISTORY_CAPACITY, EntitySnapshot, SnapshotHistory, WorldSnapshot};

pub const DEFAULT_MAX_REWIND: Duration = Duration::from_millis(5000);

/// Hit-scan request: the aim direction as two little-endian `f32`s.
pub const FIRE_INPUT: &str = "fire";

pub fn encode_fire(direction: Vec2) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.put_f32_le(direction.x);
    data.put_f32_le(direction.y);
    data
}

pub fn decode_fire(input: &InputCommand) -> Option<Vec2> {
    if input.input_type != FIRE_INPUT || input.data.len() != 8 {
        return None;
    }
    let mut data = input.data.as_slice();
    Some(Vec2::new(data.get_f32_le(), data.get_f32_le()))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub entity_id: u64,
    pub point: Vec2,
    pub distance: f32,
    /// Server time of the rewound world the hit was tested against.
    pub rewound_to: u64,
}

#[derive(Debug)]
pub struct LagCompensator {
    history: SnapshotHistory,
    interpolator: Interpolator,
    max_rewind: Duration,
}

impl Default for LagCompensator {
    fn default() -> Self {
        Self::new(
            DEFAULT_HISTORY_CAPACITY,
            DEFAULT_INTERPOLATION_DELAY,
            DEFAULT_MAX_REWIND,
        )
    }
}

impl LagCompensator {
    pub fn new(capacity: usize, interpolation_delay: Duration, max_rewind: Duration) -> Self {
        Self {
            history: SnapshotHistory::new(capacity),
            interpolator: Interpolator::new(interpolation_delay),
            max_rewind,
        }
    }

    pub fn record(&mut self, snapshot: WorldSnapshot) -> bool {
        self.history.insert(snapshot)
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    pub fn max_rewind(&self) -> Duration {
        self.max_rewind
    }

    /// The server time a client with `latency` was looking at when it acted at `now_ms`.
    pub fn target_time(&self, now_ms: u64, latency: Duration) -> u64 {
        let floor = now_ms.saturating_sub(self.max_rewind.as_millis() as u64);
        let target = self
            .interpolator
            .render_time(now_ms)
            .saturating_sub(latency.as_millis() as u64);
        target.max(floor)
    }

    pub fn rewind(&self, now_ms: u64, latency: Duration) -> Option<WorldSnapshot> {
        let target = self.target_time(now_ms, latency);
        self.interpolator.interpolate(&self.history, target)
    }

    /// Nearest entity whose circle of `radius` the ray crosses, excluding the shooter.
    #[allow(clippy::too_many_arguments)]
    pub fn hit_scan(
        &self,
        now_ms: u64,
        latency: Duration,
        shooter: u64,
        origin: Vec2,
        direction: Vec2,
        max_distance: f32,
        radius: f32,
    ) -> Option<Hit> {
        let direction = direction.try_normalize()?;
        let world = self.rewind(now_ms, latency)?;

        world
            .iter()
            .filter(|entity| entity.entity_id != shooter)
            .filter_map(|entity| {
                let distance = ray_circle(origin, direction, entity.position, radius)?;
                (distance <= max_distance).then(|| Hit {
                    entity_id: entity.entity_id,
                    point: origin + direction * distance,
                    distance,
                    rewound_to: world.timestamp,
                })
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
    }

    /// Entities whose rewound position lies within `radius` of `center`, nearest first.
    pub fn entities_within(
        &self,
        now_ms: u64,
        latency: Duration,
        center: Vec2,
        radius: f32,
    ) -> Vec<EntitySnapshot> {
        let Some(world) = self.rewind(now_ms, latency) else {
            return Vec::new();
        };

        let mut found: Vec<_> = world
            .iter()
            .filter(|entity| entity.position.distance_squared(center) <= radius * radius)
            .copied()
            .collect();
        found.sort_by(|a, b| {
            a.position
                .distance_squared(center)
                .total_cmp(&b.position.distance_squared(center))
                .then(a.entity_id.cmp(&b.entity_id))
        });
        found
    }
}

/// Distance along a normalized ray to the first point inside the circle.
fn ray_circle(origin: Vec2, direction: Vec2, center: Vec2, radius: f32) -> Option<f32> {
    let m = origin - center;
    let b = m.dot(direction);
    let c = m.length_squared() - radius * radius;
    if c > 0.0 && b > 0.0 {
        return None;
    }

    let discriminant = b * b - c;
    if discriminant < 0.0 {
        return None;
    }
    Some((-b - discriminant.sqrt()).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compensator() -> LagCompensator {
        let mut compensator = LagCompensator::new(16, Duration::from_millis(100), DEFAULT_MAX_REWIND);
        // Target moves from x=0 at 1000 to x=10 at 1100.
        compensator.record(
            WorldSnapshot::new(1_000)
                .with_entity(EntitySnapshot::new(1, Vec2::ZERO))
                .with_entity(EntitySnapshot::new(2, Vec2::new(0.0, 10.0))),
        );
        compensator.record(
            WorldSnapshot::new(1_100)
                .with_entity(EntitySnapshot::new(1, Vec2::ZERO))
                .with_entity(EntitySnapshot::new(2, Vec2::new(10.0, 10.0))),
        );
        compensator
    }

    #[test]
    fn rewind_subtracts_latency_and_delay() {
        let compensator = compensator();
        assert_eq!(compensator.target_time(1_200, Duration::from_millis(50)), 1_050);

        let world = compensator.rewind(1_200, Duration::from_millis(50)).unwrap();
        assert_eq!(world.get(2).unwrap().position, Vec2::new(5.0, 10.0));
    }

    #[test]
    fn rewind_is_bounded() {
        let compensator = LagCompensator::new(4, Duration::ZERO, Duration::from_millis(500));
        assert_eq!(compensator.target_time(10_000, Duration::from_secs(60)), 9_500);
        assert!(compensator.rewind(10_000, Duration::ZERO).is_none());
    }

    #[test]
    fn hit_scan_uses_rewound_positions() {
        let compensator = compensator();
        // Shooter 1 at the origin fires straight up at 1050; target 2 was at (5, 10).
        let shot = |x: f32| {
            compensator.hit_scan(
                1_200,
                Duration::from_millis(50),
                1,
                Vec2::new(x, 0.0),
                Vec2::Y,
                100.0,
                1.0,
            )
        };

        let hit = shot(5.0).unwrap();
        assert_eq!(hit.entity_id, 2);
        assert_eq!(hit.rewound_to, 1_050);
        assert!((hit.distance - 9.0).abs() < 1e-4);
        assert!((hit.point - Vec2::new(5.0, 9.0)).length() < 1e-4);

        // Where the target is now, it was not then.
        assert!(shot(10.0).is_none());
    }

    #[test]
    fn hit_scan_excludes_shooter_and_respects_range() {
        let compensator = compensator();
        let latency = Duration::from_millis(50);
        assert!(
            compensator
                .hit_scan(1_200, latency, 2, Vec2::new(5.0, 0.0), Vec2::Y, 100.0, 1.0)
                .is_none()
        );
        assert!(
            compensator
                .hit_scan(1_200, latency, 1, Vec2::new(5.0, 0.0), Vec2::Y, 5.0, 1.0)
                .is_none()
        );
        assert!(
            compensator
                .hit_scan(1_200, latency, 1, Vec2::new(5.0, 0.0), Vec2::ZERO, 100.0, 1.0)
                .is_none()
        );
    }

    #[test]
    fn hit_scan_picks_nearest() {
        let mut compensator = LagCompensator::new(4, Duration::ZERO, DEFAULT_MAX_REWIND);
        compensator.record(
            WorldSnapshot::new(500)
                .with_entity(EntitySnapshot::new(7, Vec2::new(20.0, 0.0)))
                .with_entity(EntitySnapshot::new(8, Vec2::new(10.0, 0.0))),
        );
        let hit = compensator
            .hit_scan(500, Duration::ZERO, 1, Vec2::ZERO, Vec2::X, 50.0, 2.0)
            .unwrap();
        assert_eq!(hit.entity_id, 8);
        assert!((hit.distance - 8.0).abs() < 1e-4);
    }

    #[test]
    fn fire_payload() {
        let input = InputCommand::new(1, 0, 1, FIRE_INPUT, encode_fire(Vec2::new(0.0, -1.0)));
        assert_eq!(decode_fire(&input), Some(Vec2::new(0.0, -1.0)));
        let moved = InputCommand::new(1, 0, 1, "move", encode_fire(Vec2::X));
        assert_eq!(decode_fire(&moved), None);
    }

    #[test]
    fn entities_within_radius_nearest_first() {
        let compensator = compensator();
        let found = compensator.entities_within(
            1_200,
            Duration::from_millis(50),
            Vec2::new(4.0, 10.0),
            2.0,
        );
        let ids: Vec<_> = found.iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![2]);

        let found = compensator.entities_within(1_200, Duration::from_millis(50), Vec2::ZERO, 20.0);
        let ids: Vec<_> = found.iter().map(|e| e.entity_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}

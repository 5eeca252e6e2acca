use std::time::Duration;

use netsync::lag_compensation::DEFAULT_MAX_REWIND;
use netsync::prediction::DEFAULT_MOVE_SPEED;
use netsync::snapshot::DEFAULT_HISTORY_CAPACITY;
use netsync::DEFAULT_INTERPOLATION_DELAY;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub move_speed: f32,
    pub hit_radius: f32,
    pub fire_range: f32,
    pub history_capacity: usize,
    pub interpolation_delay: Duration,
    pub max_rewind: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            move_speed: DEFAULT_MOVE_SPEED,
            hit_radius: 0.5,
            fire_range: 50.0,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            interpolation_delay: DEFAULT_INTERPOLATION_DELAY,
            max_rewind: DEFAULT_MAX_REWIND,
        }
    }
}

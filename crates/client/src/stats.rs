use std::collections::VecDeque;
use std::time::Instant;

use netsync::Reconciliation;

const SAMPLE_COUNT: usize = 60;

#[derive(Debug, Default)]
pub struct NetStats {
    update_times: VecDeque<Instant>,
    update_rate: f32,
    corrections: u64,
    replayed: u64,
    stale_acks: u64,
}

impl NetStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_update(&mut self) {
        self.record_update_at(Instant::now());
    }

    pub fn record_update_at(&mut self, now: Instant) {
        if self.update_times.len() >= SAMPLE_COUNT {
            self.update_times.pop_front();
        }
        self.update_times.push_back(now);

        if let Some(oldest) = self.update_times.front() {
            let elapsed = now.duration_since(*oldest).as_secs_f32();
            if elapsed > 0.0 {
                self.update_rate = (self.update_times.len() - 1) as f32 / elapsed;
            }
        }
    }

    pub fn record_reconciliation(&mut self, result: &Reconciliation) {
        if result.stale {
            self.stale_acks += 1;
        } else {
            self.corrections += 1;
            self.replayed += result.replayed as u64;
        }
    }

    /// State updates per second over the last samples.
    pub fn update_rate(&self) -> f32 {
        self.update_rate
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    pub fn stale_acks(&self) -> u64 {
        self.stale_acks
    }
}

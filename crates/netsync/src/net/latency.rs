use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_MAX_OUTSTANDING: usize = 64;

/// Round-trip measurement over ping/pong control frames.
///
/// Ping timestamps are milliseconds since the tracker's own monotonic epoch, so they
/// only have to make sense to the side that issued them.
#[derive(Debug)]
pub struct LatencyTracker {
    epoch: Instant,
    outstanding: VecDeque<u64>,
    max_outstanding: usize,
    last_rtt: Option<Duration>,
    srtt: Option<f32>,
    rtt_var: f32,
    samples: u64,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::with_epoch(Instant::now())
    }

    pub fn with_epoch(epoch: Instant) -> Self {
        Self {
            epoch,
            outstanding: VecDeque::with_capacity(DEFAULT_MAX_OUTSTANDING),
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            last_rtt: None,
            srtt: None,
            rtt_var: 0.0,
            samples: 0,
        }
    }

    pub fn issue_ping(&mut self) -> u64 {
        self.issue_ping_at(Instant::now())
    }

    pub fn issue_ping_at(&mut self, now: Instant) -> u64 {
        while self.outstanding.len() >= self.max_outstanding {
            self.outstanding.pop_front();
        }
        let timestamp = self.millis_at(now);
        self.outstanding.push_back(timestamp);
        timestamp
    }

    pub fn record_pong(&mut self, timestamp_ms: u64) -> Option<Duration> {
        self.record_pong_at(timestamp_ms, Instant::now())
    }

    /// Returns `None` for a pong that matches no outstanding ping.
    pub fn record_pong_at(&mut self, timestamp_ms: u64, now: Instant) -> Option<Duration> {
        let index = self.outstanding.iter().position(|&t| t == timestamp_ms)?;
        // Pongs come back in order, so anything older was lost with a previous connection.
        self.outstanding.drain(..=index);

        let rtt = Duration::from_millis(self.millis_at(now).saturating_sub(timestamp_ms));
        self.last_rtt = Some(rtt);
        self.update_rtt(rtt.as_secs_f32() * 1000.0);
        Some(rtt)
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        self.samples += 1;
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rtt_var = rtt / 2.0;
            }
            Some(srtt) => {
                let diff = (rtt - srtt).abs();
                self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
                self.srtt = Some((1.0 - ALPHA) * srtt + ALPHA * rtt);
            }
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn smoothed_latency(&self) -> Option<Duration> {
        self.srtt
            .map(|ms| Duration::from_secs_f32(ms.max(0.0) / 1000.0))
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn oldest_outstanding_age(&self) -> Option<Duration> {
        self.oldest_outstanding_age_at(Instant::now())
    }

    pub fn oldest_outstanding_age_at(&self, now: Instant) -> Option<Duration> {
        let oldest = *self.outstanding.front()?;
        Some(Duration::from_millis(
            self.millis_at(now).saturating_sub(oldest),
        ))
    }

    fn millis_at(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_yields_rtt() {
        let epoch = Instant::now();
        let mut tracker = LatencyTracker::with_epoch(epoch);
        assert_eq!(tracker.latency(), None);

        let ts = tracker.issue_ping_at(epoch + Duration::from_millis(10));
        let rtt = tracker.record_pong_at(ts, epoch + Duration::from_millis(90));

        assert_eq!(rtt, Some(Duration::from_millis(80)));
        assert_eq!(tracker.latency(), Some(Duration::from_millis(80)));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn smoothing_moves_toward_samples() {
        let epoch = Instant::now();
        let mut tracker = LatencyTracker::with_epoch(epoch);

        let ts = tracker.issue_ping_at(epoch);
        tracker.record_pong_at(ts, epoch + Duration::from_millis(100));
        let first = tracker.smoothed_latency().unwrap();

        let ts = tracker.issue_ping_at(epoch + Duration::from_millis(1000));
        tracker.record_pong_at(ts, epoch + Duration::from_millis(1300));
        let second = tracker.smoothed_latency().unwrap();

        assert_eq!(tracker.latency(), Some(Duration::from_millis(300)));
        assert!(second > first);
        assert!(second < Duration::from_millis(300));
        assert_eq!(tracker.sample_count(), 2);
    }

    #[test]
    fn unknown_pong_is_ignored() {
        let mut tracker = LatencyTracker::new();
        assert_eq!(tracker.record_pong(12345), None);
        assert_eq!(tracker.sample_count(), 0);
    }

    #[test]
    fn outstanding_age_tracks_oldest_ping() {
        let epoch = Instant::now();
        let mut tracker = LatencyTracker::with_epoch(epoch);
        assert_eq!(tracker.oldest_outstanding_age_at(epoch), None);

        tracker.issue_ping_at(epoch + Duration::from_millis(100));
        let second = tracker.issue_ping_at(epoch + Duration::from_millis(600));

        let now = epoch + Duration::from_millis(1100);
        assert_eq!(
            tracker.oldest_outstanding_age_at(now),
            Some(Duration::from_millis(1000))
        );

        tracker.record_pong_at(second, now);
        assert_eq!(tracker.outstanding(), 0);
    }
}

use std::f32::consts::TAU;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glam::Vec2;
use tokio::time::MissedTickBehavior;

use netsync::{
    EntitySnapshot, FIRE_INPUT, Interpolator, MOVE_INPUT, MovementModel, NetworkClient,
    PredictionEngine, Reconciler, SnapshotAssembler, SnapshotHistory, StateUpdate, WorldSnapshot,
    encode_fire,
};

use crate::stats::NetStats;

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub update_rate: u32,
    pub move_speed: f32,
    /// Seconds for one lap of the circle the bot walks.
    pub orbit_period: f32,
    /// Fire at the nearest remote entity every this many frames. Zero disables firing.
    pub fire_every: u32,
    pub interpolation_delay: Duration,
    pub history_capacity: usize,
}

/// Estimates current server time from the newest state update timestamp.
#[derive(Debug, Default)]
struct ServerClock {
    latest: Option<(u64, Instant)>,
}

impl ServerClock {
    fn observe(&mut self, timestamp: u64) {
        if self.latest.is_none_or(|(seen, _)| timestamp > seen) {
            self.latest = Some((timestamp, Instant::now()));
        }
    }

    fn now(&self) -> Option<u64> {
        self.latest
            .map(|(timestamp, at)| timestamp + at.elapsed().as_millis() as u64)
    }
}

enum Step {
    Frame,
    Stop,
    Failed(Option<netsync::ConnectionError>),
}

pub struct Bot {
    client: NetworkClient,
    player_id: u64,
    model: MovementModel,
    reconciler: Option<Reconciler<MovementModel>>,
    assembler: SnapshotAssembler,
    history: SnapshotHistory,
    interpolator: Interpolator,
    clock: ServerClock,
    stats: NetStats,
    config: BotConfig,
    frame: u64,
}

impl Bot {
    pub fn new(client: NetworkClient, player_id: u64, config: BotConfig) -> Self {
        let dt = 1.0 / config.update_rate.max(1) as f32;
        Self {
            client,
            player_id,
            model: MovementModel::new(config.move_speed, dt),
            reconciler: None,
            assembler: SnapshotAssembler::new(),
            history: SnapshotHistory::new(config.history_capacity),
            interpolator: Interpolator::new(config.interpolation_delay),
            clock: ServerClock::default(),
            stats: NetStats::new(),
            config,
            frame: 0,
        }
    }

    /// Runs frames at the update rate until `shutdown` resolves or the connection fails.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let period = Duration::from_secs_f32(1.0 / self.config.update_rate.max(1) as f32);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let result = loop {
            let step = tokio::select! {
                _ = &mut shutdown => Step::Stop,
                _ = ticker.tick() => Step::Frame,
                error = self.client.recv_error() => Step::Failed(error),
            };

            match step {
                Step::Frame => {
                    if let Err(e) = self.step(period.as_secs_f32()).await {
                        break Err(e);
                    }
                }
                Step::Stop => break Ok(()),
                Step::Failed(Some(error)) => break Err(error).context("connection lost"),
                Step::Failed(None) => break Ok(()),
            }
        };

        self.client.disconnect().await;
        result
    }

    async fn step(&mut self, dt: f32) -> Result<()> {
        self.frame += 1;
        self.drain_updates()?;

        let Some(reconciler) = self.reconciler.as_mut() else {
            // Nothing to predict from until the server has placed us.
            return Ok(());
        };
        reconciler.update(dt);

        let direction = self.steer();
        let command = self
            .client
            .send_input(MOVE_INPUT, MovementModel::encode_move(direction))
            .await?;
        if let Some(reconciler) = self.reconciler.as_mut() {
            if let Err(e) = reconciler.predict(command) {
                log::warn!("Prediction skipped: {e}");
            }
        }

        let fire_every = self.config.fire_every as u64;
        if fire_every > 0 && self.frame % fire_every == 0 {
            self.fire().await?;
        }

        if self.frame % self.config.update_rate.max(1) as u64 == 0 {
            self.report();
        }
        Ok(())
    }

    fn drain_updates(&mut self) -> Result<()> {
        while let Some(update) = self.client.try_recv_state_update() {
            self.stats.record_update();
            self.clock.observe(update.timestamp);

            if update.entity_id == self.player_id {
                self.apply_own(&update)?;
            }
            if let Some(snapshot) = self.assembler.push(&update)? {
                self.history.insert(snapshot);
            }
        }
        Ok(())
    }

    fn apply_own(&mut self, update: &StateUpdate) -> Result<()> {
        match self.reconciler.as_mut() {
            Some(reconciler) => {
                if let Some(result) = reconciler.apply_update(update)? {
                    self.stats.record_reconciliation(&result);
                }
            }
            None => {
                if let Some(entity) = EntitySnapshot::from_update(update)? {
                    log::info!("Spawned at {}", entity.position);
                    self.reconciler = Some(Reconciler::new(
                        self.player_id,
                        PredictionEngine::new(self.model, entity),
                    ));
                }
            }
        }
        Ok(())
    }

    fn steer(&self) -> Vec2 {
        let frames_per_lap = (self.config.orbit_period * self.config.update_rate as f32).max(1.0);
        Vec2::from_angle(self.frame as f32 / frames_per_lap * TAU)
    }

    /// Remote entities as they should be drawn now.
    fn remote_view(&self) -> Option<WorldSnapshot> {
        let render_time = self.interpolator.render_time(self.clock.now()?);
        let mut world = self.interpolator.interpolate(&self.history, render_time)?;
        world.remove(self.player_id);
        Some(world)
    }

    async fn fire(&mut self) -> Result<()> {
        let Some(origin) = self.reconciler.as_ref().map(|r| r.visual_position()) else {
            return Ok(());
        };
        let Some(target) = self.remote_view().and_then(|world| {
            world
                .iter()
                .min_by(|a, b| {
                    a.position
                        .distance_squared(origin)
                        .total_cmp(&b.position.distance_squared(origin))
                })
                .copied()
        }) else {
            return Ok(());
        };

        let command = self
            .client
            .send_input(FIRE_INPUT, encode_fire(target.position - origin))
            .await?;
        log::debug!(
            "Fired at entity {} (input {})",
            target.entity_id,
            command.sequence_number
        );
        Ok(())
    }

    fn report(&self) {
        let remote = self.remote_view().map_or(0, |world| world.len());
        let (position, pending) = self
            .reconciler
            .as_ref()
            .map(|r| (r.visual_position(), r.engine().pending().len()))
            .unwrap_or_default();

        log::info!(
            "rtt {:?} (smoothed {:?}), {:.1} updates/s, at {position}, {pending} pending, \
             {} corrections ({} replayed, {} stale), {remote} remote entities",
            self.client.latency(),
            self.client.smoothed_latency(),
            self.stats.update_rate(),
            self.stats.corrections(),
            self.stats.replayed(),
            self.stats.stale_acks(),
        );
    }
}

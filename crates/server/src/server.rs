use std::future::Future;

use tokio::time::MissedTickBehavior;

use netsync::time::unix_millis;
use netsync::{
    InputCommand, LagCompensator, MOVE_INPUT, MovementModel, NetworkServer, ServerConfig,
    ServerError, ServerEvent, decode_fire,
};

use crate::config::SimulationConfig;
use crate::simulation::World;

pub struct GameServer {
    network: NetworkServer,
    world: World,
    lag: LagCompensator,
    config: SimulationConfig,
    tick: u64,
}

impl GameServer {
    pub fn new(network: ServerConfig, config: SimulationConfig) -> Self {
        let model = MovementModel::new(config.move_speed, network.tick_interval().as_secs_f32());
        Self {
            network: NetworkServer::new(network),
            world: World::new(model),
            lag: LagCompensator::new(
                config.history_capacity,
                config.interpolation_delay,
                config.max_rewind,
            ),
            config,
            tick: 0,
        }
    }

    pub async fn start(&mut self) -> Result<(), ServerError> {
        self.network.start().await.map(|_| ())
    }

    /// Ticks at the configured update rate until `shutdown` resolves.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.network.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.network.stop().await;
        log::info!("Server stopped after {} ticks", self.tick);
    }

    fn tick(&mut self) {
        self.tick += 1;
        self.process_events();

        while let Some(input) = self.network.try_recv_input() {
            self.process_input(&input);
        }

        let now = unix_millis();
        self.lag.record(self.world.snapshot(now));

        for update in self.world.updates(now) {
            match self.network.broadcast_state_update(update) {
                Ok(receipt) if !receipt.skipped.is_empty() => {
                    log::debug!("Tick {} skipped backed-up players {:?}", self.tick, receipt.skipped);
                }
                Ok(_) => {}
                Err(e) => log::error!("Broadcast failed: {e}"),
            }
        }

        if self.tick % (self.network.config().update_rate.max(1) as u64 * 10) == 0 {
            for player in self.network.players() {
                log::info!(
                    "Player {} at {}: connected {:?}, rtt {:?}, last input {}",
                    player.player_id,
                    player.addr,
                    player.connected_for,
                    player.latency,
                    player.last_input_sequence
                );
            }
        }
    }

    fn process_events(&mut self) {
        while let Some(event) = self.network.next_event() {
            match event {
                ServerEvent::ClientConnected { player_id, addr } => {
                    let entity = self.world.spawn(player_id);
                    log::info!(
                        "Spawned entity for player {player_id} ({addr}) at {}",
                        entity.position
                    );
                }
                ServerEvent::ClientDisconnected { player_id, reason } => {
                    self.world.despawn(player_id);
                    log::info!("Despawned player {player_id}: {}", reason.as_str());
                }
                ServerEvent::ConnectionDenied { addr, reason } => {
                    log::warn!("Connection denied to {addr}: {reason:?}");
                }
                ServerEvent::Error {
                    addr,
                    player_id,
                    message,
                } => match player_id {
                    Some(id) => log::error!("Player {id} ({addr}): {message}"),
                    None => log::error!("{addr}: {message}"),
                },
            }
        }
    }

    fn process_input(&mut self, input: &InputCommand) {
        if input.input_type == MOVE_INPUT {
            self.world.apply_input(input);
            return;
        }

        self.world.acknowledge(input.player_id, input.sequence_number);
        let Some(direction) = decode_fire(input) else {
            log::debug!(
                "Ignoring {} input from player {}",
                input.input_type,
                input.player_id
            );
            return;
        };
        let Some(origin) = self.world.entity(input.player_id).map(|e| e.position) else {
            return;
        };

        // No measurement yet means no compensation.
        let now = unix_millis();
        let latency = self.network.latency(input.player_id).unwrap_or_default();
        match self.lag.hit_scan(
            now,
            latency,
            input.player_id,
            origin,
            direction,
            self.config.fire_range,
            self.config.hit_radius,
        ) {
            Some(hit) => log::info!(
                "Player {} hit entity {} at {} ({:.2} away, rewound to {})",
                input.player_id,
                hit.entity_id,
                hit.point,
                hit.distance,
                hit.rewound_to
            ),
            None => log::debug!("Player {} missed", input.player_id),
        }
    }
}

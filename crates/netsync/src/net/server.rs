use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::ServerConfig;
use super::error::{ConnectionError, ServerError, UnknownTargetError};
use super::events::{DisconnectReason, ServerEvent};
use super::frame::{ControlMessage, DenyReason, Frame};
use super::protocol::{
    InputCommand, PROTOCOL_MAGIC, PROTOCOL_VERSION, StateUpdate, sequence_greater_than,
};
use super::registry::{ConnectionRegistry, Delivery, PlayerHandle, PlayerInfo};
use super::stream::{FrameReader, FrameWriter, classify, lock, split, write_frame};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReceipt {
    pub sequence: u32,
    pub delivered: usize,
    /// Players whose queues were full. They miss this update and stay connected.
    pub skipped: Vec<u64>,
}

/// Cloned into every task the server spawns.
#[derive(Clone)]
struct Shared {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    inputs: mpsc::Sender<InputCommand>,
    events: mpsc::UnboundedSender<ServerEvent>,
    tracker: TaskTracker,
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

/// Accepts connections up to `max_players` and fans state updates out to them.
///
/// Every connection runs as a receive task plus a send task under its own child of the
/// server's cancellation token. `stop` cancels the root and waits for every task.
pub struct NetworkServer {
    shared: Shared,
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    /// Held while a state sequence number is drawn and its frame queued.
    send_order: Mutex<u32>,
    input_rx: mpsc::Receiver<InputCommand>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl NetworkServer {
    pub fn new(config: ServerConfig) -> Self {
        let (inputs, input_rx) = mpsc::channel(config.buffer_size.max(1));
        let (events, event_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new(config.max_players));

        Self {
            shared: Shared {
                config: Arc::new(config),
                registry,
                inputs,
                events,
                tracker: TaskTracker::new(),
            },
            shutdown: CancellationToken::new(),
            local_addr: None,
            send_order: Mutex::new(0),
            input_rx,
            event_rx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Binds the listener and starts accepting. Returns the bound address, which
    /// differs from the configured one when port 0 was requested.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.local_addr.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = self.shared.config.address.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        self.shared.tracker.spawn(accept_loop(
            listener,
            self.shared.clone(),
            self.shutdown.clone(),
        ));
        self.local_addr = Some(local_addr);

        log::info!(
            "Server listening on {} (max {} players, {} Hz)",
            local_addr,
            self.shared.config.max_players,
            self.shared.config.update_rate
        );
        Ok(local_addr)
    }

    /// Stops accepting, closes every connection, and waits until all tasks have finished.
    pub async fn stop(&mut self) {
        if !self.shutdown.is_cancelled() {
            log::info!("Stopping server");
            self.shutdown.cancel();
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.is_some() && !self.shutdown.is_cancelled()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn broadcast_state_update(
        &self,
        mut update: StateUpdate,
    ) -> Result<BroadcastReceipt, ServerError> {
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }

        let mut sequence = lock(&self.send_order);
        let next = sequence.wrapping_add(1);
        update.sequence_number = next;
        let body = Bytes::from(update.encode()?);
        *sequence = next;

        let mut receipt = BroadcastReceipt {
            sequence: next,
            delivered: 0,
            skipped: Vec::new(),
        };
        for handle in self.shared.registry.handles() {
            match handle.deliver(Frame::EncodedState(body.clone())) {
                Delivery::Queued => receipt.delivered += 1,
                Delivery::Skipped => {
                    log::trace!("Queue full, player {} misses update {next}", handle.player_id);
                    receipt.skipped.push(handle.player_id);
                }
                Delivery::Closed => {}
            }
        }
        Ok(receipt)
    }

    /// Sends one update to a single player. Shares the sequence counter with broadcasts.
    ///
    /// Fails with `QueueFull` when the player's outbound queue has no room; the drawn
    /// sequence number is then skipped.
    pub fn send_state_update(
        &self,
        player_id: u64,
        mut update: StateUpdate,
    ) -> Result<u32, ServerError> {
        let mut sequence = lock(&self.send_order);

        let unknown = || {
            log::warn!("Unicast to unknown player {player_id}");
            ServerError::from(UnknownTargetError { player_id })
        };
        let handle = self.shared.registry.get(player_id).ok_or_else(unknown)?;

        let next = sequence.wrapping_add(1);
        update.sequence_number = next;
        let body = Bytes::from(update.encode()?);
        *sequence = next;

        match handle.deliver(Frame::EncodedState(body)) {
            Delivery::Queued => Ok(next),
            Delivery::Skipped => Err(ServerError::QueueFull { player_id }),
            Delivery::Closed => Err(unknown()),
        }
    }

    pub fn player_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn players(&self) -> Vec<PlayerInfo> {
        self.shared.registry.infos()
    }

    /// Smoothed round trip of the server's pings to `player_id`.
    pub fn latency(&self, player_id: u64) -> Option<Duration> {
        self.shared.registry.get(player_id)?.latency()
    }

    pub fn last_input_sequence(&self, player_id: u64) -> Option<u32> {
        self.shared
            .registry
            .get(player_id)
            .map(|handle| handle.last_input_sequence())
    }

    /// Closes one player's connection. Returns `false` when the player is unknown.
    pub fn kick(&self, player_id: u64) -> bool {
        match self.shared.registry.get(player_id) {
            Some(handle) => {
                handle.close(DisconnectReason::Kicked);
                true
            }
            None => false,
        }
    }

    pub async fn recv_input(&mut self) -> Option<InputCommand> {
        self.input_rx.recv().await
    }

    pub fn try_recv_input(&mut self) -> Option<InputCommand> {
        self.input_rx.try_recv().ok()
    }

    pub async fn recv_event(&mut self) -> Option<ServerEvent> {
        self.event_rx.recv().await
    }

    pub fn next_event(&mut self) -> Option<ServerEvent> {
        self.event_rx.try_recv().ok()
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Shared, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("Accepted connection from {addr}");
                    shared.tracker.spawn(run_connection(
                        stream,
                        addr,
                        shared.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    log::debug!("Accept loop stopped");
}

/// Receive side of one connection: handshake, registration, then the read loop.
/// Owns the close path, so it is also the only place a player leaves the registry.
async fn run_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Shared,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = split(stream);
    let config = &shared.config;

    let hello = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        hello = tokio::time::timeout(config.read_timeout, reader.next()) => hello,
    };

    let handshake_error = |message: String| {
        log::warn!("Handshake with {addr} failed: {message}");
        shared.emit(ServerEvent::Error {
            addr,
            player_id: None,
            message,
        });
    };

    match hello {
        Ok(Some(Ok(Frame::Control(ControlMessage::Hello { magic, version }))))
            if magic == PROTOCOL_MAGIC =>
        {
            if version != PROTOCOL_VERSION {
                let reason = DenyReason::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: version,
                };
                deny(&mut writer, addr, reason, &shared).await;
                return;
            }
        }
        Ok(Some(Ok(other))) => {
            handshake_error(format!("expected hello, got {other:?}"));
            return;
        }
        Ok(Some(Err(e))) => {
            handshake_error(classify(e).to_string());
            return;
        }
        Ok(None) => {
            log::debug!("{addr} closed before handshake");
            return;
        }
        Err(_) => {
            handshake_error(ConnectionError::ReadTimeout(config.read_timeout).to_string());
            return;
        }
    }

    let player_id = shared.registry.allocate_player_id();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.buffer_size.max(1));
    let handle = PlayerHandle::new(player_id, addr, outbound_tx, cancel.clone());

    if let Err(e) = shared.registry.try_insert(handle.clone()) {
        log::warn!("Rejecting {addr}: {e}");
        let reason = DenyReason::ServerFull {
            max_players: e.max_players,
        };
        deny(&mut writer, addr, reason, &shared).await;
        return;
    }

    let welcome = ControlMessage::Welcome {
        player_id,
        max_players: config.max_players,
    };
    if let Err(e) = write_frame(&mut writer, welcome.into(), config.write_timeout).await {
        shared.registry.remove(player_id);
        handshake_error(e.to_string());
        return;
    }

    log::info!("Player {player_id} connected from {addr}");
    shared.emit(ServerEvent::ClientConnected { player_id, addr });

    let send_task = shared.tracker.spawn(send_loop(
        writer,
        outbound_rx,
        cancel.clone(),
        config.write_timeout,
        config.ping_interval,
        handle.clone(),
    ));

    let reason = read_loop(&mut reader, &handle, &shared, &cancel).await;
    handle.close(reason);
    if let Err(e) = send_task.await {
        log::error!("Send task for player {player_id} failed: {e}");
    }

    shared.registry.remove(player_id);
    let reason = handle.close_reason().unwrap_or(reason);
    log::info!("Player {} {}", player_id, reason.as_str());
    shared.emit(ServerEvent::ClientDisconnected { player_id, reason });
}

async fn deny(writer: &mut FrameWriter, addr: SocketAddr, reason: DenyReason, shared: &Shared) {
    let frame = Frame::Control(ControlMessage::Denied(reason.clone()));
    if let Err(e) = write_frame(writer, frame, shared.config.write_timeout).await {
        log::debug!("Denial to {addr} not delivered: {e}");
    }
    shared.emit(ServerEvent::ConnectionDenied { addr, reason });
}

async fn read_loop(
    reader: &mut FrameReader,
    handle: &PlayerHandle,
    shared: &Shared,
    cancel: &CancellationToken,
) -> DisconnectReason {
    let read_timeout = shared.config.read_timeout;
    let player_id = handle.player_id;
    let mut last_sequence: Option<u32> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return handle.close_reason().unwrap_or(DisconnectReason::Shutdown);
            }
            next = tokio::time::timeout(read_timeout, reader.next()) => next,
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                return match classify(e) {
                    ConnectionError::Reset => DisconnectReason::Closed,
                    e => {
                        log::warn!("Dropping player {player_id}: {e}");
                        shared.emit(ServerEvent::Error {
                            addr: handle.addr,
                            player_id: Some(player_id),
                            message: e.to_string(),
                        });
                        match e {
                            ConnectionError::Protocol(_) => DisconnectReason::Protocol,
                            _ => DisconnectReason::Closed,
                        }
                    }
                };
            }
            Ok(None) => return DisconnectReason::Closed,
            Err(_) => {
                log::warn!("Player {player_id} silent for {read_timeout:?}, dropping");
                return DisconnectReason::Timeout;
            }
        };

        match frame {
            Frame::Input(mut command) => {
                command.player_id = player_id;
                let sequence = command.sequence_number;
                if let Some(last) = last_sequence {
                    if !sequence_greater_than(sequence, last) {
                        log::debug!(
                            "Dropping stale input {sequence} from player {player_id} (last {last})"
                        );
                        continue;
                    }
                }
                last_sequence = Some(sequence);
                handle.set_last_input_sequence(sequence);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return handle.close_reason().unwrap_or(DisconnectReason::Shutdown);
                    }
                    sent = shared.inputs.send(command) => {
                        if sent.is_err() {
                            log::debug!("Input queue closed, discarding input from player {player_id}");
                        }
                    }
                }
            }
            Frame::Control(ControlMessage::Ping { timestamp_ms }) => {
                if handle.deliver(ControlMessage::Pong { timestamp_ms }.into()) == Delivery::Skipped {
                    log::trace!("Queue full, pong to player {player_id} skipped");
                }
            }
            Frame::Control(ControlMessage::Pong { timestamp_ms }) => {
                if let Some(rtt) = handle.record_pong(timestamp_ms) {
                    log::trace!("Player {player_id} RTT {rtt:?}");
                }
            }
            Frame::Control(ControlMessage::Disconnect) => return DisconnectReason::Graceful,
            other => {
                log::debug!("Ignoring unexpected frame from player {player_id}: {other:?}");
            }
        }
    }
}

async fn send_loop(
    mut writer: FrameWriter,
    mut outbound: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    write_timeout: Duration,
    ping_interval: Duration,
    handle: PlayerHandle,
) {
    let mut ping = tokio::time::interval(ping_interval.max(Duration::from_millis(1)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => Frame::Control(ControlMessage::Ping {
                timestamp_ms: handle.issue_ping(),
            }),
        };

        if let Err(e) = write_frame(&mut writer, frame, write_timeout).await {
            let reason = match e {
                ConnectionError::WriteTimeout(_) => DisconnectReason::Timeout,
                _ => DisconnectReason::Closed,
            };
            log::warn!("Write to player {} failed: {e}", handle.player_id);
            handle.close(reason);
            return;
        }
    }

    // Flush whatever was already queued, then say goodbye, all within one write timeout.
    let drain = async {
        while let Ok(frame) = outbound.try_recv() {
            writer.feed(frame).await?;
        }
        writer.send(Frame::from(ControlMessage::Disconnect)).await
    };
    match tokio::time::timeout(write_timeout, drain).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::debug!("Disconnect notice to player {} failed: {e}", handle.player_id),
        Err(_) => log::debug!("Disconnect notice to player {} timed out", handle.player_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            address: "127.0.0.1:0".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let mut server = NetworkServer::new(local_config());
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));

        server.stop().await;
        assert!(!server.is_running());
        // idempotent
        server.stop().await;
    }

    #[tokio::test]
    async fn broadcast_requires_running_server() {
        let server = NetworkServer::new(local_config());
        assert!(matches!(
            server.broadcast_state_update(StateUpdate::new(1, 1)),
            Err(ServerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn broadcast_sequences_increase_without_players() {
        let mut server = NetworkServer::new(local_config());
        server.start().await.unwrap();

        let first = server.broadcast_state_update(StateUpdate::new(1, 1)).unwrap();
        let second = server.broadcast_state_update(StateUpdate::new(2, 1)).unwrap();
        assert_eq!(first.delivered, 0);
        assert!(sequence_greater_than(second.sequence, first.sequence));

        server.stop().await;
    }

    #[tokio::test]
    async fn unicast_to_unknown_player_fails() {
        let mut server = NetworkServer::new(local_config());
        server.start().await.unwrap();

        assert!(matches!(
            server.send_state_update(99, StateUpdate::new(1, 1)),
            Err(ServerError::UnknownTarget(UnknownTargetError { player_id: 99 }))
        ));
        assert!(!server.kick(99));

        server.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let mut server = NetworkServer::new(ServerConfig {
            address: "not an address".into(),
            ..Default::default()
        });
        assert!(matches!(server.start().await, Err(ServerError::Bind { .. })));
    }
}

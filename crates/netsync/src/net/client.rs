use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::config::ClientConfig;
use super::error::{CapacityError, ConnectionError};
use super::frame::{ControlMessage, DenyReason, Frame};
use super::latency::LatencyTracker;
use super::protocol::{InputCommand, StateUpdate};
use super::stream::{FrameReader, FrameWriter, classify, lock, split, write_frame};
use crate::time::unix_millis;

const MIN_WATCHDOG_PERIOD: Duration = Duration::from_millis(10);
const MAX_WATCHDOG_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

struct Session {
    player_id: u64,
    max_players: u32,
    next_sequence: u32,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

/// Shared between the two background tasks of one session.
#[derive(Clone)]
struct TaskContext {
    state: Arc<AtomicU8>,
    latency: Arc<Mutex<LatencyTracker>>,
    errors: mpsc::UnboundedSender<ConnectionError>,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Reports the error unless the session is already shutting down, then stops both tasks.
    fn fail(&self, error: ConnectionError) {
        if !self.cancel.is_cancelled() {
            log::warn!("Connection lost: {error}");
            let _ = self.errors.send(error);
        }
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::Release);
        self.cancel.cancel();
    }
}

/// Client side of one duplex connection to the server.
///
/// A live connection owns exactly two tasks: the send task drains queued inputs and
/// emits pings, the receive task forwards state updates and records pongs. It also
/// answers the server's pings. Failures are reported on the error channel and leave
/// the client `Disconnected`; reconnecting is an explicit `connect` call.
pub struct NetworkClient {
    config: ClientConfig,
    state: Arc<AtomicU8>,
    latency: Arc<Mutex<LatencyTracker>>,
    session: Option<Session>,
    updates: Option<mpsc::Receiver<StateUpdate>>,
    error_tx: mpsc::UnboundedSender<ConnectionError>,
    error_rx: mpsc::UnboundedReceiver<ConnectionError>,
}

impl NetworkClient {
    pub fn new(config: ClientConfig) -> Self {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
            latency: Arc::new(Mutex::new(LatencyTracker::new())),
            session: None,
            updates: None,
            error_tx,
            error_rx,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn player_id(&self) -> Option<u64> {
        self.session
            .as_ref()
            .filter(|_| self.is_connected())
            .map(|s| s.player_id)
    }

    pub fn max_players(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.max_players)
    }

    /// Dials the server and completes the handshake within `timeout`.
    pub async fn connect(&mut self, timeout: Duration) -> Result<u64, ConnectionError> {
        if self.session.is_some() {
            self.disconnect().await;
        }

        self.set_state(ConnectionState::Connecting);
        log::info!("Connecting to {}", self.config.server_address);

        let (reader, writer, player_id, max_players) =
            match tokio::time::timeout(timeout, self.handshake()).await {
                Ok(Ok(established)) => established,
                Ok(Err(e)) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(_) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ConnectionError::HandshakeTimeout(timeout));
                }
            };

        let buffer_size = self.config.buffer_size.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);
        let (updates_tx, updates_rx) = mpsc::channel(buffer_size);

        *lock(&self.latency) = LatencyTracker::new();
        let cancel = CancellationToken::new();
        let ctx = TaskContext {
            state: Arc::clone(&self.state),
            latency: Arc::clone(&self.latency),
            errors: self.error_tx.clone(),
            cancel: cancel.clone(),
        };

        // Connected before the tasks start, so an immediate failure is not overwritten.
        self.set_state(ConnectionState::Connected);

        let send_task = tokio::spawn(send_loop(
            writer,
            outbound_rx,
            ctx.clone(),
            self.config.ping_interval,
            self.config.max_latency,
        ));
        let recv_task = tokio::spawn(recv_loop(
            reader,
            updates_tx,
            outbound_tx.clone(),
            ctx,
            self.config.max_latency,
        ));

        self.session = Some(Session {
            player_id,
            max_players,
            next_sequence: 1,
            outbound: outbound_tx,
            cancel,
            send_task,
            recv_task,
        });
        self.updates = Some(updates_rx);

        log::info!("Connected as player {player_id}");
        Ok(player_id)
    }

    async fn handshake(&self) -> Result<(FrameReader, FrameWriter, u64, u32), ConnectionError> {
        let addr = self.config.server_address.clone();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ConnectionError::Dial { addr, source })?;
        let (mut reader, mut writer) = split(stream);

        writer.send(Frame::from(ControlMessage::hello())).await?;

        match reader.next().await {
            Some(Ok(Frame::Control(ControlMessage::Welcome {
                player_id,
                max_players,
            }))) => Ok((reader, writer, player_id, max_players)),
            Some(Ok(Frame::Control(ControlMessage::Denied(reason)))) => Err(match reason {
                DenyReason::ServerFull { max_players } => CapacityError { max_players }.into(),
                DenyReason::VersionMismatch { expected, actual } => {
                    ConnectionError::VersionMismatch { expected, actual }
                }
            }),
            Some(Ok(other)) => Err(ConnectionError::Handshake(format!(
                "unexpected frame {other:?}"
            ))),
            Some(Err(e)) => Err(classify(e)),
            None => Err(ConnectionError::Closed),
        }
    }

    /// Stops both tasks and waits for them. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            drop(session.outbound);
            for task in [session.send_task, session.recv_task] {
                if let Err(e) = task.await {
                    log::error!("Connection task failed: {e}");
                }
            }
            log::info!("Disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Queues an input with the next sequence number. Waits while the outbound queue is full.
    pub async fn send_input(
        &mut self,
        input_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Result<InputCommand, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let session = self.session.as_mut().ok_or(ConnectionError::NotConnected)?;

        let command = InputCommand::new(
            session.player_id,
            unix_millis(),
            session.next_sequence,
            input_type,
            data,
        );
        session
            .outbound
            .send(Frame::Input(command.clone()))
            .await
            .map_err(|_| ConnectionError::NotConnected)?;
        session.next_sequence = session.next_sequence.wrapping_add(1);
        Ok(command)
    }

    /// Next state update from the server. `None` once the session has ended and its
    /// queue is drained.
    pub async fn recv_state_update(&mut self) -> Option<StateUpdate> {
        match self.updates.as_mut() {
            Some(updates) => updates.recv().await,
            None => None,
        }
    }

    pub fn try_recv_state_update(&mut self) -> Option<StateUpdate> {
        self.updates.as_mut()?.try_recv().ok()
    }

    pub fn next_error(&mut self) -> Option<ConnectionError> {
        self.error_rx.try_recv().ok()
    }

    pub async fn recv_error(&mut self) -> Option<ConnectionError> {
        self.error_rx.recv().await
    }

    pub fn latency(&self) -> Option<Duration> {
        lock(&self.latency).latency()
    }

    pub fn smoothed_latency(&self) -> Option<Duration> {
        lock(&self.latency).smoothed_latency()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for NetworkClient {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

async fn send_loop(
    mut writer: FrameWriter,
    mut outbound: mpsc::Receiver<Frame>,
    ctx: TaskContext,
    ping_interval: Duration,
    write_timeout: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval.max(Duration::from_millis(1)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => {
                let timestamp_ms = lock(&ctx.latency).issue_ping();
                Frame::Control(ControlMessage::Ping { timestamp_ms })
            }
        };

        if let Err(e) = write_frame(&mut writer, frame, write_timeout).await {
            ctx.fail(e);
            return;
        }
    }

    if let Err(e) = write_frame(&mut writer, ControlMessage::Disconnect.into(), write_timeout).await {
        log::debug!("Disconnect notice not delivered: {e}");
    }
}

async fn recv_loop(
    mut reader: FrameReader,
    updates: mpsc::Sender<StateUpdate>,
    outbound: mpsc::Sender<Frame>,
    ctx: TaskContext,
    max_latency: Duration,
) {
    let mut watchdog =
        tokio::time::interval((max_latency / 4).clamp(MIN_WATCHDOG_PERIOD, MAX_WATCHDOG_PERIOD));
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = watchdog.tick() => {
                let age = lock(&ctx.latency).oldest_outstanding_age();
                if let Some(age) = age.filter(|age| *age > max_latency) {
                    ctx.fail(ConnectionError::LatencyExceeded(age));
                    break;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Frame::State(update))) => {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => break,
                        sent = updates.send(update) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Frame::Control(ControlMessage::Pong { timestamp_ms }))) => {
                    if let Some(rtt) = lock(&ctx.latency).record_pong(timestamp_ms) {
                        log::trace!("RTT {:?}", rtt);
                    }
                }
                Some(Ok(Frame::Control(ControlMessage::Ping { timestamp_ms }))) => {
                    // A full queue loses this pong; the server measures on the next ping.
                    let _ = outbound.try_send(ControlMessage::Pong { timestamp_ms }.into());
                }
                Some(Ok(Frame::Control(ControlMessage::Disconnect))) => {
                    log::info!("Server closed the connection");
                    ctx.fail(ConnectionError::Closed);
                    break;
                }
                Some(Ok(other)) => {
                    log::debug!("Ignoring unexpected frame from server: {:?}", other);
                }
                Some(Err(e)) => {
                    ctx.fail(classify(e));
                    break;
                }
                None => {
                    ctx.fail(ConnectionError::Closed);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_input_requires_connection() {
        let mut client = NetworkClient::new(ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            client.send_input("move", vec![0; 8]).await,
            Err(ConnectionError::NotConnected)
        ));
        assert_eq!(client.latency(), None);
        assert!(client.try_recv_state_update().is_none());
    }

    #[tokio::test]
    async fn dial_failure_returns_to_disconnected() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = NetworkClient::new(ClientConfig {
            server_address: addr.to_string(),
            ..Default::default()
        });
        let err = client.connect(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Dial { .. } | ConnectionError::HandshakeTimeout(_)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn silent_server_times_out_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let mut client = NetworkClient::new(ClientConfig {
            server_address: addr.to_string(),
            ..Default::default()
        });
        let err = client.connect(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::HandshakeTimeout(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        drop(accept);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut client = NetworkClient::new(ClientConfig::default());
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}

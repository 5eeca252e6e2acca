use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::error::CapacityError;
use super::events::DisconnectReason;
use super::frame::Frame;
use super::latency::LatencyTracker;
use super::stream::lock;

/// Everything the server needs to reach one registered connection without touching its tasks.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    pub player_id: u64,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    last_input_sequence: Arc<AtomicU32>,
    latency: Arc<Mutex<LatencyTracker>>,
    close_reason: Arc<OnceLock<DisconnectReason>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub player_id: u64,
    pub addr: SocketAddr,
    pub connected_for: Duration,
    pub last_input_sequence: u32,
    /// Smoothed round trip of the server's pings. `None` until the first pong.
    pub latency: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The queue was full, so this frame was not queued. The connection stays open.
    Skipped,
    Closed,
}

impl PlayerHandle {
    pub fn new(
        player_id: u64,
        addr: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            player_id,
            addr,
            connected_at: Instant::now(),
            outbound,
            cancel,
            last_input_sequence: Arc::new(AtomicU32::new(0)),
            latency: Arc::new(Mutex::new(LatencyTracker::new())),
            close_reason: Arc::new(OnceLock::new()),
        }
    }

    /// Non-blocking enqueue. A full queue skips the frame; a peer that stops reading
    /// is caught by the send task's write timeout instead.
    pub fn deliver(&self, frame: Frame) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Skipped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// The first reason recorded wins; later calls only re-cancel.
    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason.get().copied()
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn last_input_sequence(&self) -> u32 {
        self.last_input_sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_input_sequence(&self, sequence: u32) {
        self.last_input_sequence.store(sequence, Ordering::Release);
    }

    pub(crate) fn issue_ping(&self) -> u64 {
        lock(&self.latency).issue_ping()
    }

    pub(crate) fn record_pong(&self, timestamp_ms: u64) -> Option<Duration> {
        lock(&self.latency).record_pong(timestamp_ms)
    }

    pub fn latency(&self) -> Option<Duration> {
        lock(&self.latency).smoothed_latency()
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            player_id: self.player_id,
            addr: self.addr,
            connected_for: self.connected_at.elapsed(),
            last_input_sequence: self.last_input_sequence(),
            latency: self.latency(),
        }
    }
}

/// Connected players keyed by id, behind a single lock.
///
/// Only the accept path inserts and only the close path removes. Readers clone
/// the handles they need and release the lock before doing any I/O.
#[derive(Debug)]
pub struct ConnectionRegistry {
    players: RwLock<HashMap<u64, PlayerHandle>>,
    max_players: u32,
    next_player_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(max_players: u32) -> Self {
        Self {
            players: RwLock::new(HashMap::new()),
            max_players,
            next_player_id: AtomicU64::new(1),
        }
    }

    pub fn max_players(&self) -> u32 {
        self.max_players
    }

    pub fn allocate_player_id(&self) -> u64 {
        self.next_player_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn try_insert(&self, handle: PlayerHandle) -> Result<(), CapacityError> {
        let mut players = self.write();
        if players.len() >= self.max_players as usize {
            return Err(CapacityError {
                max_players: self.max_players,
            });
        }
        players.insert(handle.player_id, handle);
        Ok(())
    }

    pub fn remove(&self, player_id: u64) -> Option<PlayerHandle> {
        self.write().remove(&player_id)
    }

    pub fn get(&self, player_id: u64) -> Option<PlayerHandle> {
        self.read().get(&player_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn handles(&self) -> Vec<PlayerHandle> {
        self.read().values().cloned().collect()
    }

    pub fn infos(&self) -> Vec<PlayerInfo> {
        let mut infos: Vec<_> = self.read().values().map(PlayerHandle::info).collect();
        infos.sort_by_key(|info| info.player_id);
        infos
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, PlayerHandle>> {
        match self.players.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, PlayerHandle>> {
        match self.players.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

use std::io;
use std::time::Duration;

use rkyv::rancor;

/// Malformed or truncated bytes met while decoding, or a value that cannot be
/// represented on the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated {field}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },
    #[error("{field} is not valid utf-8")]
    InvalidUtf8 { field: &'static str },
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("{field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{0} components exceed the per-update limit")]
    TooManyComponents(usize),
    #[error("unknown frame kind {0:#04x}")]
    UnknownFrameKind(u8),
    #[error("frame body of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("control message: {0}")]
    Control(rancor::Error),
    #[error("component {component} has {actual} bytes, expected {expected}")]
    InvalidComponent {
        component: String,
        expected: usize,
        actual: usize,
    },
}

/// A new connection was refused because the server is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("server is full ({max_players} players)")]
pub struct CapacityError {
    pub max_players: u32,
}

/// A unicast addressed a player that is not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("player {player_id} is not connected")]
pub struct UnknownTargetError {
    pub player_id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("not connected")]
    NotConnected,
    #[error("connection reset by peer")]
    Reset,
    #[error("connection closed by peer")]
    Closed,
    #[error("no data received within {0:?}")]
    ReadTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("ping unanswered for {0:?}")]
    LatencyExceeded(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,
    #[error("server is not running")]
    NotRunning,
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    UnknownTarget(#[from] UnknownTargetError),
    #[error("outbound queue of player {player_id} is full")]
    QueueFull { player_id: u64 },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

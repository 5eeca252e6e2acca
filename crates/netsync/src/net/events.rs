use std::net::SocketAddr;

use super::frame::DenyReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        player_id: u64,
        addr: SocketAddr,
    },
    ClientDisconnected {
        player_id: u64,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: DenyReason,
    },
    Error {
        addr: SocketAddr,
        player_id: Option<u64>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a `Disconnect` control frame.
    Graceful,
    /// The peer closed or reset the stream.
    Closed,
    /// A read or a write outlasted its timeout.
    Timeout,
    Kicked,
    Protocol,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Closed => "connection closed",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Protocol => "protocol violation",
            DisconnectReason::Shutdown => "server shutdown",
        }
    }
}

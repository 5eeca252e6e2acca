use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::protocol::{DEFAULT_PORT, DEFAULT_UPDATE_RATE};

pub const DEFAULT_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub connection_timeout: Duration,
    pub ping_interval: Duration,
    /// An unanswered ping older than this fails the connection. Also bounds each write.
    pub max_latency: Duration,
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: format!("127.0.0.1:{DEFAULT_PORT}"),
            connection_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            max_latency: Duration::from_secs(5),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub max_players: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// How often each connection is pinged to measure its round trip.
    pub ping_interval: Duration,
    /// State updates per second.
    pub update_rate: u32,
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_players: 32,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(1),
            update_rate: DEFAULT_UPDATE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.update_rate.max(1) as f64)
    }
}

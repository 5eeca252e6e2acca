mod client;
mod config;
mod error;
mod events;
mod frame;
mod latency;
mod protocol;
mod registry;
mod server;
mod stream;

pub use client::{ConnectionState, NetworkClient};
pub use config::{ClientConfig, DEFAULT_BUFFER_SIZE, ServerConfig};
pub use error::{CapacityError, ConnectionError, ProtocolError, ServerError, UnknownTargetError};
pub use events::{DisconnectReason, ServerEvent};
pub use frame::{ControlMessage, DenyReason, FRAME_HEADER_LEN, Frame, FrameCodec, MAX_FRAME_SIZE};
pub use latency::LatencyTracker;
pub use protocol::{
    COMPONENT_HEADER_LEN, ComponentData, DEFAULT_PORT, DEFAULT_UPDATE_RATE, INPUT_ACK_COMPONENT,
    INPUT_COMMAND_HEADER_LEN, InputCommand, POSITION_COMPONENT, PROTOCOL_MAGIC, PROTOCOL_VERSION,
    STATE_UPDATE_HEADER_LEN, StateUpdate, VELOCITY_COMPONENT, decode_input_command,
    decode_state_update, encode_input_command, encode_state_update, sequence_greater_than,
};
pub use registry::{ConnectionRegistry, Delivery, PlayerHandle, PlayerInfo};
pub use server::{BroadcastReceipt, NetworkServer};

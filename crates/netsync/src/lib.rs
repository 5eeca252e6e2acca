pub mod interpolation;
pub mod lag_compensation;
pub mod net;
pub mod prediction;
pub mod reconciliation;
pub mod snapshot;
pub mod time;

pub use interpolation::{DEFAULT_INTERPOLATION_DELAY, InterpolationConfig, Interpolator};
pub use lag_compensation::{
    DEFAULT_MAX_REWIND, FIRE_INPUT, Hit, LagCompensator, decode_fire, encode_fire,
};
pub use net::{
    BroadcastReceipt, ClientConfig, ComponentData, ConnectionError, ConnectionState,
    DEFAULT_PORT, DEFAULT_UPDATE_RATE, DisconnectReason, InputCommand, NetworkClient,
    NetworkServer, PlayerInfo, ProtocolError, ServerConfig, ServerError, ServerEvent,
    StateUpdate,
};
pub use prediction::{
    MOVE_INPUT, MovementModel, PendingInputBuffer, PredictionEngine, PredictionError,
    PredictionModel,
};
pub use reconciliation::{CorrectionSmoother, Reconciler, Reconciliation};
pub use snapshot::{
    EntitySnapshot, SnapshotAssembler, SnapshotHistory, SnapshotLookup, WorldSnapshot,
};

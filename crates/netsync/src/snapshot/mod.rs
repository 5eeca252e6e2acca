mod assembler;
mod entity;
mod history;
mod world;

pub use assembler::SnapshotAssembler;
pub use entity::EntitySnapshot;
pub use history::{DEFAULT_HISTORY_CAPACITY, SnapshotHistory, SnapshotLookup};
pub use world::WorldSnapshot;

//! # worldstate-core - data model and merge engine for the world mirror
//!
//! Pure, synchronous building blocks shared by every consumer of replicated
//! world state:
//!
//! - [`entity`]: validated ids and the JSON entity document
//! - [`patch`]: per-entity patches and the tick messages that bundle them
//! - [`merge`]: recursive object merge (arrays and scalars replace)
//! - [`store`]: the id → entity map, patch application, snapshot loading
//! - [`codec`]: gzip + JSON wire format for ticks and snapshots
//!
//! Nothing here performs I/O or spawns tasks; `worldstate-sync` drives it.

pub mod codec;
pub mod entity;
pub mod error;
pub mod merge;
pub mod patch;
pub mod store;

pub use codec::{decode_snapshot, decode_tick, encode_snapshot, encode_tick};
pub use entity::{Entity, EntityId, UUID_FIELD};
pub use error::StateError;
pub use merge::deep_merge;
pub use patch::{DecodedTick, Patch, TickMessage, TOMBSTONE_FIELD};
pub use store::{Applied, Store, DEFAULT_TYPE_FIELD};

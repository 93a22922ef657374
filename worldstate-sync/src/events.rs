//! Events published by a mirror to its observers.

use std::collections::HashMap;
use std::sync::Arc;

use worldstate_core::{Entity, EntityId, TickMessage};

/// What one applied tick changed.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// The tick, restricted to the changes that were actually applied
    pub message: TickMessage,
    /// Last value of every entity a tombstone removed
    pub deleted: HashMap<EntityId, Entity>,
}

impl TickReport {
    /// Ids touched by this tick, removals included.
    pub fn touched(&self) -> impl Iterator<Item = &EntityId> {
        self.message.changed_ids()
    }
}

#[derive(Debug, Clone)]
pub enum WorldEvent {
    /// The snapshot was applied; the mirror is now in steady state.
    WorldLoaded { entities: usize },
    /// A tick message was applied to the store.
    WorldTick(Arc<TickReport>),
    /// The completed tick advanced. `delay_ms` is wall time minus `ts`.
    Tick { ts: u64, delay_ms: i64 },
    /// The connection dropped and local state was discarded.
    WorldReset,
}

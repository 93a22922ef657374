//! Tick delivery pipeline.
//!
//! Owns the ingress queue and applies one raw message at a time to the shared
//! store. It is the only writer of the store and the completed tick; readers
//! go through [`Shared`] and take short read locks.
//!
//! ```text
//! raw bytes ──▶ queue ──▶ gunzip + decode ──▶ Store::apply (per change)
//!                                               │
//!                          completed tick ◀─────┤
//!                          wait registry  ◀─────┤
//!                          event bus      ◀─────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, watch};
use worldstate_core::{codec, Applied, Entity, EntityId, Store, TickMessage};

use crate::clock::Clock;
use crate::error::{ProtocolViolation, SyncError};
use crate::events::{TickReport, WorldEvent};
use crate::stats::PipelineStats;
use crate::wait::WaitRegistry;

/// Where the mirror is in its connection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No live connection. The store is empty.
    Disconnected,
    /// Subscribed; fetching the snapshot. Ticks are buffered.
    LoadingSnapshot,
    /// Snapshot applied; ticks are applied as they arrive.
    Steady,
}

pub(crate) struct World {
    pub(crate) store: Store,
    pub(crate) completed_tick: u64,
    pub(crate) phase: Phase,
}

/// Published on every completed-tick change. `epoch` bumps on every reset so
/// tick waiters can tell a reset apart from a slow tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TickState {
    pub(crate) epoch: u64,
    pub(crate) completed: u64,
    pub(crate) stopped: bool,
}

/// State shared between the worker and the mirror handle.
pub(crate) struct Shared {
    world: RwLock<World>,
    waits: Mutex<WaitRegistry>,
    observers: Mutex<Vec<mpsc::UnboundedSender<WorldEvent>>>,
    pub(crate) ticks: watch::Sender<TickState>,
    pub(crate) stats: PipelineStats,
    clock: Arc<dyn Clock>,
}

impl Shared {
    pub(crate) fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        let (ticks, _) = watch::channel(TickState::default());
        Self {
            world: RwLock::new(World {
                store,
                completed_tick: 0,
                phase: Phase::Disconnected,
            }),
            waits: Mutex::new(WaitRegistry::default()),
            observers: Mutex::new(Vec::new()),
            ticks,
            stats: PipelineStats::default(),
            clock,
        }
    }

    // Lock order: world before waits. A poisoned lock only means a predicate
    // panicked; the data itself is still consistent.
    pub(crate) fn read_world(&self) -> RwLockReadGuard<'_, World> {
        self.world.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_world(&self) -> RwLockWriteGuard<'_, World> {
        self.world.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lock_waits(&self) -> MutexGuard<'_, WaitRegistry> {
        self.waits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers an observer with its own unbounded channel.
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<WorldEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_observers().push(tx);
        rx
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.lock_observers().len()
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<WorldEvent>>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delivers to every live observer; dropped receivers are pruned here.
    fn emit(&self, event: WorldEvent) {
        self.lock_observers().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// The single consumer of the ingress queue.
pub(crate) struct TickPipeline {
    shared: Arc<Shared>,
    queue: VecDeque<Vec<u8>>,
    phase: Phase,
}

impl TickPipeline {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            queue: VecDeque::new(),
            phase: Phase::Disconnected,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn enqueue(&mut self, raw: Vec<u8>) {
        self.queue.push_back(raw);
        self.shared.stats.set_queue_len(self.queue.len());
    }

    /// Messages are only drained in steady state.
    pub(crate) fn has_work(&self) -> bool {
        self.phase == Phase::Steady && !self.queue.is_empty()
    }

    /// Applies the next queued message. Returns the completed tick afterwards,
    /// or `None` if nothing was applied.
    pub(crate) fn process_next(&mut self) -> Option<u64> {
        if self.phase != Phase::Steady {
            return None;
        }
        let raw = self.queue.pop_front()?;
        self.shared.stats.set_queue_len(self.queue.len());
        let started = std::time::Instant::now();

        let decoded = match codec::decode_tick(&raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Dropping tick message ({} bytes): {e}", raw.len());
                self.shared.stats.record_failed_message();
                return None;
            }
        };
        let ts = decoded.message.ts;
        for rejected in &decoded.rejected {
            log::warn!("Skipping malformed change in tick {ts}: {rejected}");
        }
        let mut skipped = decoded.rejected.len();

        let mut report = TickReport {
            message: TickMessage::new(ts),
            deleted: HashMap::new(),
        };
        let (completed, regressed) = {
            let mut world = self.shared.write_world();
            for (id, patch) in decoded.message.changes {
                match world.store.apply(&id, &patch) {
                    Ok(applied) => {
                        if let Applied::Removed(Some(previous)) = applied {
                            report.deleted.insert(id, previous);
                        }
                        report.message.changes.insert(id, patch);
                    }
                    Err(e) => {
                        log::warn!("Skipping patch in tick {ts}: {e}");
                        skipped += 1;
                    }
                }
            }

            let regressed = ts < world.completed_tick;
            if regressed {
                let violation = ProtocolViolation::TickRegression {
                    current: world.completed_tick,
                    received: ts,
                };
                log::error!("{violation}; keeping completed tick {}", world.completed_tick);
                self.shared.stats.record_violation();
            } else {
                world.completed_tick = ts;
            }
            (world.completed_tick, regressed)
        };
        if skipped > 0 {
            self.shared.stats.record_rejected_patches(skipped);
        }

        self.shared.ticks.send_modify(|state| state.completed = completed);

        let report = Arc::new(report);
        {
            let world = self.shared.read_world();
            self.shared.lock_waits().on_tick(&world.store, &report);
        }

        let delay_ms = self.shared.clock.now_millis() as i64 - ts as i64;
        let changes = report.message.changes.len();
        self.shared.emit(WorldEvent::WorldTick(report));
        // The completed tick did not move, so there is no advance to announce.
        if !regressed {
            self.shared.emit(WorldEvent::Tick { ts, delay_ms });
        }
        self.shared.stats.record_tick(started.elapsed(), delay_ms);
        log::debug!("Applied tick {ts} ({changes} changes, delay {delay_ms}ms)");

        Some(completed)
    }

    pub(crate) fn begin_loading(&mut self) {
        self.set_phase(Phase::LoadingSnapshot);
    }

    /// Merges a decoded snapshot and enters steady state.
    pub(crate) fn finish_loading(&mut self, entities: HashMap<EntityId, Entity>) {
        let count = entities.len();
        {
            let mut world = self.shared.write_world();
            world.store.merge_entities(entities);
            world.phase = Phase::Steady;
        }
        self.phase = Phase::Steady;
        self.shared.stats.record_snapshot_load();

        {
            let world = self.shared.read_world();
            self.shared.lock_waits().on_loaded(&world.store);
        }
        log::info!(
            "World loaded: {count} entities, {} buffered messages",
            self.queue.len()
        );
        self.shared.emit(WorldEvent::WorldLoaded { entities: count });
    }

    /// Drops all local state after a disconnect.
    pub(crate) fn reset(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.shared.stats.set_queue_len(0);
        {
            let mut world = self.shared.write_world();
            world.store.clear();
            world.completed_tick = 0;
            world.phase = Phase::Disconnected;
        }
        self.phase = Phase::Disconnected;

        self.shared.ticks.send_modify(|state| {
            state.epoch += 1;
            state.completed = 0;
        });
        self.shared.lock_waits().reject_all(&SyncError::WorldReset);
        self.shared.stats.record_reset();
        log::info!("World reset ({dropped} queued messages discarded)");
        self.shared.emit(WorldEvent::WorldReset);
    }

    /// Final teardown: every outstanding wait learns the mirror is gone and
    /// readers see an unloaded, empty world.
    pub(crate) fn stop(&mut self) {
        self.queue.clear();
        self.shared.stats.set_queue_len(0);
        {
            let mut world = self.shared.write_world();
            world.store.clear();
            world.phase = Phase::Disconnected;
        }
        self.phase = Phase::Disconnected;
        self.shared.ticks.send_modify(|state| state.stopped = true);
        self.shared.lock_waits().reject_all(&SyncError::MirrorStopped);
        log::debug!("Tick pipeline stopped");
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.shared.write_world().phase = phase;
    }
}

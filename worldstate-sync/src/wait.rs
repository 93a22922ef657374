//! Pending condition waits.
//!
//! A wait is registered with the set of entity ids it cares about. After each
//! tick the registry re-evaluates only the waits whose ids were touched, each
//! against a single-entity view of the touched id. Waits resolve once, time
//! out, or are rejected in bulk when the world resets.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use worldstate_core::{Entity, EntityId, Store};

use crate::error::SyncError;
use crate::events::TickReport;

/// What a wait predicate gets to look at.
#[derive(Debug, Clone, Copy)]
pub enum WorldView<'a> {
    /// The whole store.
    Full(&'a Store),
    /// One entity touched by a tick. For a removal, `entity` is the value it
    /// had just before the tombstone.
    Single {
        id: &'a EntityId,
        entity: Option<&'a Entity>,
        removed: bool,
    },
}

impl<'a> WorldView<'a> {
    pub fn get(&self, id: &EntityId) -> Option<&'a Entity> {
        match *self {
            WorldView::Full(store) => store.get(id),
            WorldView::Single { id: only, entity, .. } => {
                if only == id {
                    entity
                } else {
                    None
                }
            }
        }
    }

    /// Every visible entity.
    pub fn entities(&self) -> Box<dyn Iterator<Item = (&'a EntityId, &'a Entity)> + 'a> {
        match *self {
            WorldView::Full(store) => Box::new(store.iter()),
            WorldView::Single { id, entity, .. } => Box::new(entity.map(|e| (id, e)).into_iter()),
        }
    }

    /// Whether `id` was deleted by the tick being evaluated.
    pub fn was_removed(&self, id: &EntityId) -> bool {
        matches!(*self, WorldView::Single { id: only, removed: true, .. } if only == id)
    }
}

/// Which touched ids trigger re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitKeys {
    Any,
    Only(HashSet<EntityId>),
}

impl WaitKeys {
    pub fn one(id: EntityId) -> Self {
        WaitKeys::Only(HashSet::from([id]))
    }

    fn covers(&self, id: &EntityId) -> bool {
        match self {
            WaitKeys::Any => true,
            WaitKeys::Only(ids) => ids.contains(id),
        }
    }
}

/// Type-erased registered wait.
pub(crate) trait PendingWait: Send {
    /// Evaluates the wait. Returns true once it has resolved.
    fn try_resolve(&mut self, view: &WorldView<'_>) -> bool;

    fn reject(self: Box<Self>, error: SyncError);

    /// The waiting caller went away.
    fn is_abandoned(&self) -> bool;
}

pub(crate) type WaitOutcome<T> = Result<T, SyncError>;

/// A predicate plus the channel its result goes back on.
pub(crate) struct ConditionWait<T, F> {
    predicate: F,
    reply: Option<oneshot::Sender<WaitOutcome<T>>>,
}

impl<T, F> ConditionWait<T, F>
where
    F: Fn(&WorldView<'_>) -> Option<T>,
{
    pub(crate) fn new(predicate: F, reply: oneshot::Sender<WaitOutcome<T>>) -> Self {
        Self {
            predicate,
            reply: Some(reply),
        }
    }
}

impl<T, F> PendingWait for ConditionWait<T, F>
where
    T: Send,
    F: Fn(&WorldView<'_>) -> Option<T> + Send,
{
    fn try_resolve(&mut self, view: &WorldView<'_>) -> bool {
        if self.reply.is_none() {
            return true;
        }
        match (self.predicate)(view) {
            Some(value) => {
                if let Some(reply) = self.reply.take() {
                    let _ = reply.send(Ok(value));
                }
                true
            }
            None => false,
        }
    }

    fn reject(mut self: Box<Self>, error: SyncError) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(error));
        }
    }

    fn is_abandoned(&self) -> bool {
        self.reply.as_ref().map_or(true, oneshot::Sender::is_closed)
    }
}

pub(crate) type WaitId = u64;

struct Registered {
    keys: WaitKeys,
    deadline: Instant,
    timeout: Duration,
    wait: Box<dyn PendingWait>,
}

/// Every outstanding condition wait of one mirror.
#[derive(Default)]
pub(crate) struct WaitRegistry {
    next_id: WaitId,
    waits: HashMap<WaitId, Registered>,
}

impl WaitRegistry {
    pub(crate) fn register(
        &mut self,
        keys: WaitKeys,
        timeout: Duration,
        wait: Box<dyn PendingWait>,
    ) -> WaitId {
        let id = self.next_id;
        self.next_id += 1;
        self.waits.insert(
            id,
            Registered {
                keys,
                deadline: Instant::now() + timeout,
                timeout,
                wait,
            },
        );
        id
    }

    pub(crate) fn remove(&mut self, id: WaitId) -> bool {
        self.waits.remove(&id).is_some()
    }

    /// Purges expired waits, then re-evaluates the rest against each id the
    /// tick touched.
    pub(crate) fn on_tick(&mut self, store: &Store, report: &TickReport) {
        self.purge_expired(Instant::now());
        if self.waits.is_empty() {
            return;
        }

        let mut resolved = Vec::new();
        for id in report.touched() {
            let removed = report.deleted.get(id);
            let view = WorldView::Single {
                id,
                entity: store.get(id).or(removed),
                removed: removed.is_some(),
            };
            for (wait_id, registered) in self.waits.iter_mut() {
                if registered.keys.covers(id) && registered.wait.try_resolve(&view) {
                    resolved.push(*wait_id);
                }
            }
            for wait_id in resolved.drain(..) {
                self.waits.remove(&wait_id);
            }
        }
    }

    /// Re-evaluates every wait against the freshly loaded store.
    pub(crate) fn on_loaded(&mut self, store: &Store) {
        let view = WorldView::Full(store);
        self.waits
            .retain(|_, registered| !registered.wait.try_resolve(&view));
    }

    pub(crate) fn reject_all(&mut self, error: &SyncError) {
        let count = self.waits.len();
        for (_, registered) in self.waits.drain() {
            registered.wait.reject(error.clone());
        }
        if count > 0 {
            log::debug!("Rejected {count} pending waits: {error}");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waits.len()
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<WaitId> = self
            .waits
            .iter()
            .filter(|(_, r)| r.deadline <= now || r.wait.is_abandoned())
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(registered) = self.waits.remove(&id) {
                let after = registered.timeout;
                registered.wait.reject(SyncError::WaitTimeout { after });
            }
        }
    }
}

//! The world mirror handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use worldstate_core::{Entity, EntityId, Store};

use crate::clock::{Clock, SystemClock};
use crate::command::CommandChannel;
use crate::config::MirrorConfig;
use crate::error::SyncError;
use crate::events::WorldEvent;
use crate::lifecycle::Lifecycle;
use crate::pipeline::{Phase, Shared};
use crate::stats::StatsSnapshot;
use crate::transport::TransportFactory;
use crate::wait::{ConditionWait, WaitId, WaitKeys, WorldView};

/// A local, continuously updated copy of the world.
///
/// Owns one worker task that applies ticks; every method here is a reader or
/// talks to the authority. Several mirrors can live in one process. Dropping
/// the handle stops the worker the same way [`shutdown`](Self::shutdown) does,
/// without waiting for it.
pub struct WorldMirror {
    config: Arc<MirrorConfig>,
    shared: Arc<Shared>,
    commands: CommandChannel,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorldMirror {
    /// Connects, subscribes to the state channel and starts the worker.
    ///
    /// Returns as soon as the subscription exists; use [`is_loaded`](Self::is_loaded)
    /// or the [`WorldEvent::WorldLoaded`] event to learn when the snapshot is in.
    pub async fn start(config: MirrorConfig, factory: &dyn TransportFactory) -> Result<Self, SyncError> {
        Self::start_with_clock(config, factory, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(
        config: MirrorConfig,
        factory: &dyn TransportFactory,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SyncError> {
        let config = Arc::new(config);
        let state_conn = factory.connect(&config.endpoint).await?;
        let client_conn = factory.connect(&config.endpoint).await?;
        log::info!(
            "Connected to {}:{} for world state",
            config.endpoint.host,
            config.endpoint.port
        );

        let store = Store::with_type_field(config.type_field.clone());
        let shared = Arc::new(Shared::new(store, clock));

        let events = state_conn.subscribe(&config.state_channel);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let lifecycle = Lifecycle::new(shared.clone(), state_conn, config.clone());
        let worker = tokio::spawn(lifecycle.run(events, shutdown_rx));

        Ok(Self {
            commands: CommandChannel::new(client_conn, &config),
            config,
            shared,
            shutdown: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    // ---- reads ----

    /// Clone of one entity.
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.shared.read_world().store.get(id).cloned()
    }

    /// Like [`get`](Self::get) for an unparsed id.
    pub fn get_str(&self, uuid: &str) -> Result<Option<Entity>, SyncError> {
        let id = EntityId::parse(uuid)?;
        Ok(self.get(&id))
    }

    /// Copy of the whole store.
    pub fn get_all(&self) -> HashMap<EntityId, Entity> {
        self.shared.read_world().store.to_map()
    }

    pub fn completed_tick(&self) -> u64 {
        self.shared.read_world().completed_tick
    }

    /// True once the snapshot is applied and until the next disconnect.
    pub fn is_loaded(&self) -> bool {
        self.phase() == Phase::Steady
    }

    pub fn phase(&self) -> Phase {
        self.shared.read_world().phase
    }

    /// New observer of world events.
    ///
    /// Each observer gets its own unbounded channel, so a slow reader never
    /// loses events and never blocks the worker. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WorldEvent> {
        self.shared.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Registered condition waits plus in-flight tick waits.
    pub fn pending_waits(&self) -> usize {
        self.shared.lock_waits().len() + self.shared.ticks.receiver_count()
    }

    // ---- waits ----

    /// Resolves with the completed tick once it reaches `target`.
    ///
    /// Fails with `WaitTimeout` after `timeout` (default from config) and with
    /// `WorldReset` if the world resets first.
    pub async fn wait_for_tick(&self, target: u64, timeout: Option<Duration>) -> Result<u64, SyncError> {
        let timeout = timeout.unwrap_or(self.config.tick_timeout);
        let mut ticks = self.shared.ticks.subscribe();
        let epoch = {
            let state = ticks.borrow_and_update();
            if state.stopped {
                return Err(SyncError::MirrorStopped);
            }
            if state.completed >= target {
                return Ok(state.completed);
            }
            state.epoch
        };

        let advanced = async {
            loop {
                if ticks.changed().await.is_err() {
                    return Err(SyncError::MirrorStopped);
                }
                let state = *ticks.borrow_and_update();
                if state.stopped {
                    return Err(SyncError::MirrorStopped);
                }
                if state.epoch != epoch {
                    return Err(SyncError::WorldReset);
                }
                if state.completed >= target {
                    return Ok(state.completed);
                }
            }
        };

        match tokio::time::timeout(timeout, advanced).await {
            Ok(result) => result,
            Err(_) => {
                log::debug!("wait_for_tick({target}) timed out after {timeout:?}");
                Err(SyncError::WaitTimeout { after: timeout })
            }
        }
    }

    /// Resolves with the first `Some` the predicate returns.
    ///
    /// The predicate is evaluated immediately against the whole store, then
    /// after every tick against each touched entity alone. It runs under the
    /// store lock and must not block.
    pub async fn wait_for_condition<T, F>(&self, predicate: F, timeout: Option<Duration>) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: Fn(&WorldView<'_>) -> Option<T> + Send + 'static,
    {
        self.wait_keyed(WaitKeys::Any, predicate, timeout).await
    }

    /// Like [`wait_for_condition`](Self::wait_for_condition) but only
    /// re-evaluated when `id` changes. The predicate sees the entity, or `None`
    /// if it does not exist.
    pub async fn wait_for_entity<T, F>(
        &self,
        id: EntityId,
        predicate: F,
        timeout: Option<Duration>,
    ) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: Fn(Option<&Entity>) -> Option<T> + Send + 'static,
    {
        let keyed = move |view: &WorldView<'_>| {
            let current = if view.was_removed(&id) { None } else { view.get(&id) };
            predicate(current)
        };
        self.wait_keyed(WaitKeys::one(id), keyed, timeout).await
    }

    /// Resolves with the first entity containing every field of `filter`
    /// (nested objects match as subsets).
    pub async fn wait_for_match(&self, filter: Value, timeout: Option<Duration>) -> Result<Entity, SyncError> {
        let filter: Map<String, Value> = match filter {
            Value::Object(fields) => fields,
            other => {
                return Err(SyncError::InvalidCommand(format!("match filter must be an object, got {other}")));
            }
        };
        self.wait_for_condition(
            move |view: &WorldView<'_>| {
                view.entities()
                    .find(|(id, entity)| !view.was_removed(id) && entity.matches(&filter))
                    .map(|(_, entity)| entity.clone())
            },
            timeout,
        )
        .await
    }

    async fn wait_keyed<T, F>(&self, keys: WaitKeys, predicate: F, timeout: Option<Duration>) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: Fn(&WorldView<'_>) -> Option<T> + Send + 'static,
    {
        let timeout = timeout.unwrap_or(self.config.condition_timeout);
        let (reply, outcome) = oneshot::channel();

        let id = {
            let world = self.shared.read_world();
            if self.shared.ticks.borrow().stopped {
                return Err(SyncError::MirrorStopped);
            }
            if let Some(value) = predicate(&WorldView::Full(&world.store)) {
                return Ok(value);
            }
            self.shared
                .lock_waits()
                .register(keys, timeout, Box::new(ConditionWait::new(predicate, reply)))
        };
        let _registration = Registration { shared: &self.shared, id };

        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::MirrorStopped),
            Err(_) => {
                log::debug!("Condition wait timed out after {timeout:?}");
                Err(SyncError::WaitTimeout { after: timeout })
            }
        }
    }

    // ---- commands ----

    /// Queues `{uuid, patch}` for the authority. Invalid input fails before
    /// any transport call.
    pub async fn queue_change(&self, uuid: &str, patch: Value) -> Result<(), SyncError> {
        self.commands.queue_change(uuid, patch).await
    }

    /// Synchronous request/response for one value. Waits without a timeout.
    pub async fn request_value(&self, uuid: &str) -> Result<Value, SyncError> {
        self.commands.request_value(uuid).await
    }

    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    // ---- lifecycle ----

    /// Stops the worker. Outstanding waits fail with `MirrorStopped`.
    ///
    /// Afterwards the mirror is `Disconnected`: `is_loaded()` is false and
    /// the store is empty.
    pub async fn shutdown(&self) {
        let signal = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(signal) = signal {
            let _ = signal.send(());
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("Mirror worker ended abnormally: {e}");
            }
        }
    }
}

/// Removes a condition wait's registration however the wait ends.
struct Registration<'a> {
    shared: &'a Shared,
    id: WaitId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.shared.lock_waits().remove(self.id);
    }
}

//! Connection lifecycle worker.
//!
//! One task per mirror. It consumes the state-channel subscription, drives the
//! snapshot loader, and feeds the pipeline:
//!
//! ```text
//! Disconnected ──Ready──▶ LoadingSnapshot ──snapshot ok──▶ Steady
//!      ▲                        │  ▲                          │
//!      │                        └──┘ retry with backoff       │
//!      └────────────────────────Closed────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use worldstate_core::{codec, Entity, EntityId};

use crate::config::MirrorConfig;
use crate::error::SyncError;
use crate::pipeline::{Phase, Shared, TickPipeline};
use crate::transport::{EventStream, Transport, TransportEvent};

type Loaded = (u64, HashMap<EntityId, Entity>);

pub(crate) struct Lifecycle {
    pipeline: TickPipeline,
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: Arc<MirrorConfig>,
    /// Bumped on every connect and disconnect; stale loader results are dropped.
    epoch: u64,
    loader: Option<JoinHandle<()>>,
    loaded_tx: mpsc::UnboundedSender<Loaded>,
    loaded_rx: mpsc::UnboundedReceiver<Loaded>,
}

impl Lifecycle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        transport: Arc<dyn Transport>,
        config: Arc<MirrorConfig>,
    ) -> Self {
        let (loaded_tx, loaded_rx) = mpsc::unbounded_channel();
        Self {
            pipeline: TickPipeline::new(shared.clone()),
            shared,
            transport,
            config,
            epoch: 0,
            loader: None,
            loaded_tx,
            loaded_rx,
        }
    }

    /// Runs until shutdown is requested or the subscription ends for good.
    pub(crate) async fn run(mut self, mut events: EventStream, mut shutdown: oneshot::Receiver<()>) {
        log::info!("Mirror worker started on channel {:?}", self.config.state_channel);

        loop {
            let has_work = self.pipeline.has_work();
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Mirror worker shutting down");
                    break;
                }
                event = events.next() => match event {
                    Some(TransportEvent::Ready) => self.on_ready(),
                    Some(TransportEvent::Message(raw)) => self.pipeline.enqueue(raw),
                    Some(TransportEvent::Closed) => self.on_closed(),
                    None => {
                        log::warn!("State subscription ended");
                        break;
                    }
                },
                Some((epoch, entities)) = self.loaded_rx.recv() => {
                    if epoch == self.epoch && self.pipeline.phase() == Phase::LoadingSnapshot {
                        self.loader = None;
                        self.pipeline.finish_loading(entities);
                    }
                }
                _ = std::future::ready(()), if has_work => {
                    self.pipeline.process_next();
                    tokio::task::yield_now().await;
                }
            }
        }

        self.abort_loader();
        self.pipeline.stop();
    }

    fn on_ready(&mut self) {
        if self.pipeline.phase() != Phase::Disconnected {
            log::warn!("Transport ready while {:?}; resynchronizing", self.pipeline.phase());
            self.abort_loader();
            self.pipeline.reset();
        }
        self.epoch += 1;
        self.pipeline.begin_loading();
        log::info!("Transport ready; loading snapshot {:?}", self.config.snapshot_key);

        self.loader = Some(tokio::spawn(load_snapshot(
            self.transport.clone(),
            self.config.clone(),
            self.shared.clone(),
            self.epoch,
            self.loaded_tx.clone(),
        )));
    }

    fn on_closed(&mut self) {
        log::warn!("Transport connection lost");
        self.epoch += 1;
        self.abort_loader();
        self.pipeline.reset();
    }

    fn abort_loader(&mut self) {
        if let Some(loader) = self.loader.take() {
            loader.abort();
        }
    }
}

/// Fetches and decodes the snapshot, retrying with backoff until it succeeds
/// or the task is aborted.
async fn load_snapshot(
    transport: Arc<dyn Transport>,
    config: Arc<MirrorConfig>,
    shared: Arc<Shared>,
    epoch: u64,
    loaded: mpsc::UnboundedSender<Loaded>,
) {
    let mut attempt = 0;
    loop {
        match fetch_snapshot(transport.as_ref(), &config.snapshot_key).await {
            Ok(entities) => {
                let _ = loaded.send((epoch, entities));
                return;
            }
            Err(e) => {
                shared.stats.record_snapshot_failure();
                let delay = config.retry_delay(attempt);
                log::warn!("Snapshot load failed (attempt {}): {e}; retrying in {delay:?}", attempt + 1);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// A missing key is an empty world.
async fn fetch_snapshot(
    transport: &dyn Transport,
    key: &str,
) -> Result<HashMap<EntityId, Entity>, SyncError> {
    match transport.get(key).await? {
        Some(blob) => Ok(codec::decode_snapshot(&blob)?),
        None => {
            log::info!("Snapshot key {key:?} is empty; starting from an empty world");
            Ok(HashMap::new())
        }
    }
}

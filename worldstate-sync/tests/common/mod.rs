//! Helpers shared by the mirror integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use tokio::time::{sleep, timeout, Duration};
use worldstate_core::{encode_snapshot, encode_tick, Entity, EntityId, Patch, TickMessage};
use worldstate_sync::{ManualClock, MemoryBroker, MirrorConfig, WorldMirror};

pub const CHANNEL: &str = "worldstate";
pub const SNAPSHOT_KEY: &str = "worldstate";
pub const PATIENCE: Duration = Duration::from_secs(2);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn merge(v: Value) -> Patch {
    match v {
        Value::Object(m) => Patch::Merge(m),
        other => panic!("expected object patch, got {other}"),
    }
}

pub fn entity(id: &EntityId, v: Value) -> Entity {
    match v {
        Value::Object(m) => Entity::from_fields(id, m).unwrap(),
        other => panic!("expected object entity, got {other}"),
    }
}

pub fn set_snapshot(broker: &MemoryBroker, entities: &[(EntityId, Entity)]) {
    let blob = encode_snapshot(entities.iter().map(|(id, e)| (id, e))).unwrap();
    broker.set(SNAPSHOT_KEY, blob);
}

pub fn publish(broker: &MemoryBroker, tick: &TickMessage) {
    broker.publish(CHANNEL, encode_tick(tick).unwrap());
}

pub async fn start(broker: &MemoryBroker) -> WorldMirror {
    start_at(broker, 0).await
}

/// Starts a mirror whose wall clock reads `now_millis`.
pub async fn start_at(broker: &MemoryBroker, now_millis: u64) -> WorldMirror {
    init_logging();
    WorldMirror::start_with_clock(
        MirrorConfig::for_testing(),
        broker,
        Arc::new(ManualClock::new(now_millis)),
    )
    .await
    .unwrap()
}

/// Starts a mirror and waits for its snapshot to be applied.
pub async fn start_loaded(broker: &MemoryBroker) -> WorldMirror {
    let mirror = start(broker).await;
    until(|| mirror.is_loaded()).await;
    mirror
}

/// Polls `condition` until it holds, failing the test after [`PATIENCE`].
pub async fn until<F: Fn() -> bool>(condition: F) {
    let polled = timeout(PATIENCE, async {
        while !condition() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached within {PATIENCE:?}");
}

//! In-process broker implementing channels, keys and lists.
//!
//! Every [`MemoryTransport`] handed out by one [`MemoryBroker`] sees the same
//! data, like clients of one server. The broker can drop and restore all
//! connections at once so reconnect handling can be exercised without a
//! network.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, Notify};

use super::{EventStream, Transport, TransportEvent, TransportFactory};
use crate::config::Endpoint;
use crate::error::TransportError;

struct BrokerInner {
    password: Option<String>,
    connected: AtomicBool,
    keys: Mutex<HashMap<String, Vec<u8>>>,
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    /// Woken on every push and on disconnect
    list_changed: Notify,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<TransportEvent>>>>,
    calls: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared in-memory broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Connected broker accepting any credential.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Broker that only accepts endpoints carrying `password`.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self::build(Some(password.into()))
    }

    fn build(password: Option<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                password,
                connected: AtomicBool::new(true),
                keys: Mutex::new(HashMap::new()),
                lists: Mutex::new(HashMap::new()),
                list_changed: Notify::new(),
                subscribers: Mutex::new(HashMap::new()),
                calls: AtomicU64::new(0),
            }),
        }
    }

    /// Publishes to every live subscriber of `channel`.
    ///
    /// Returns how many received it. Nothing is delivered while disconnected.
    pub fn publish(&self, channel: &str, payload: Vec<u8>) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let mut subscribers = lock(&self.inner.subscribers);
        let Some(senders) = subscribers.get_mut(channel) else {
            return 0;
        };
        senders.retain(|tx| tx.send(TransportEvent::Message(payload.clone())).is_ok());
        senders.len()
    }

    pub fn set(&self, key: &str, value: Vec<u8>) {
        lock(&self.inner.keys).insert(key.to_string(), value);
    }

    pub fn delete(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.inner.keys).remove(key)
    }

    /// Current contents of a list, head first.
    pub fn list(&self, name: &str) -> Vec<Vec<u8>> {
        lock(&self.inner.lists)
            .get(name)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every connection: subscribers see `Closed`, blocked pops fail.
    pub fn disconnect_all(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            log::info!("Memory broker: dropping all connections");
            self.broadcast_state(TransportEvent::Closed);
            self.inner.list_changed.notify_waiters();
        }
    }

    /// Restores connections: subscribers see `Ready`.
    pub fn reconnect_all(&self) {
        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            log::info!("Memory broker: connections restored");
            self.broadcast_state(TransportEvent::Ready);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Number of key and list operations issued by clients so far.
    pub fn call_count(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.inner.subscribers)
            .get_mut(channel)
            .map(|senders| {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            })
            .unwrap_or(0)
    }

    fn broadcast_state(&self, event: TransportEvent) {
        let mut subscribers = lock(&self.inner.subscribers);
        for senders in subscribers.values_mut() {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryBroker {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError> {
        if let Some(expected) = &self.inner.password {
            if endpoint.password.as_deref() != Some(expected.as_str()) {
                log::warn!("Memory broker: rejected connection to {}:{}", endpoint.host, endpoint.port);
                return Err(TransportError::Auth);
            }
        }
        Ok(Arc::new(MemoryTransport {
            broker: self.clone(),
        }))
    }
}

/// One client connection to a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    fn begin_call(&self) -> Result<&BrokerInner, TransportError> {
        let inner = &*self.broker.inner;
        inner.calls.fetch_add(1, Ordering::SeqCst);
        if inner.connected.load(Ordering::SeqCst) {
            Ok(inner)
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn subscribe(&self, channel: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut subscribers = lock(&self.broker.inner.subscribers);
            if self.broker.is_connected() {
                let _ = tx.send(TransportEvent::Ready);
            }
            subscribers.entry(channel.to_string()).or_default().push(tx);
        }

        stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
        .boxed()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let inner = self.begin_call()?;
        Ok(lock(&inner.keys).get(key).cloned())
    }

    async fn rpush(&self, list: &str, value: Vec<u8>) -> Result<usize, TransportError> {
        let inner = self.begin_call()?;
        let len = {
            let mut lists = lock(&inner.lists);
            let items = lists.entry(list.to_string()).or_default();
            items.push_back(value);
            items.len()
        };
        inner.list_changed.notify_waiters();
        Ok(len)
    }

    async fn blpop(
        &self,
        list: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let inner = self.begin_call()?;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            // Register for wake-ups before checking, so a push in between is not missed.
            let mut notified = pin!(inner.list_changed.notified());
            notified.as_mut().enable();

            if !inner.connected.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            let popped = lock(&inner.lists).get_mut(list).and_then(VecDeque::pop_front);
            if popped.is_some() {
                return Ok(popped);
            }

            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client(broker: &MemoryBroker) -> Arc<dyn Transport> {
        broker.connect(&Endpoint::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_reports_ready_then_messages() {
        let broker = MemoryBroker::new();
        let conn = client(&broker).await;
        let mut events = conn.subscribe("worldstate");

        assert_eq!(broker.publish("worldstate", b"one".to_vec()), 1);
        assert_eq!(broker.publish("elsewhere", b"x".to_vec()), 0);

        assert_eq!(events.next().await, Some(TransportEvent::Ready));
        assert_eq!(events.next().await, Some(TransportEvent::Message(b"one".to_vec())));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_are_signalled() {
        let broker = MemoryBroker::new();
        let conn = client(&broker).await;
        let mut events = conn.subscribe("worldstate");
        assert_eq!(events.next().await, Some(TransportEvent::Ready));

        broker.disconnect_all();
        assert_eq!(broker.publish("worldstate", b"lost".to_vec()), 0);
        assert_eq!(conn.get("k").await, Err(TransportError::Disconnected));
        broker.reconnect_all();

        assert_eq!(events.next().await, Some(TransportEvent::Closed));
        assert_eq!(events.next().await, Some(TransportEvent::Ready));
    }

    #[tokio::test]
    async fn test_blpop_wakes_on_push() {
        let broker = MemoryBroker::new();
        let popper = client(&broker).await;
        let pusher = client(&broker).await;

        let waiting = tokio::spawn(async move { popper.blpop("replies", None).await });
        tokio::task::yield_now().await;
        assert_eq!(pusher.rpush("replies", b"42".to_vec()).await, Ok(1));

        let popped = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Ok(Some(b"42".to_vec())));
        assert!(broker.list("replies").is_empty());
    }

    #[tokio::test]
    async fn test_blpop_times_out_empty() {
        let broker = MemoryBroker::new();
        let conn = client(&broker).await;
        let popped = conn.blpop("nothing", Some(Duration::from_millis(10))).await;
        assert_eq!(popped, Ok(None));
    }

    #[tokio::test]
    async fn test_blpop_fails_on_disconnect() {
        let broker = MemoryBroker::new();
        let conn = client(&broker).await;
        let waiting = tokio::spawn(async move { conn.blpop("replies", None).await });
        tokio::task::yield_now().await;

        broker.disconnect_all();
        let popped = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_password_is_checked() {
        let broker = MemoryBroker::with_password("hunter2");
        assert!(matches!(
            broker.connect(&Endpoint::default()).await,
            Err(TransportError::Auth)
        ));

        let endpoint = Endpoint::parse("redis://:hunter2@localhost:6379").unwrap();
        assert!(broker.connect(&endpoint).await.is_ok());
    }

    #[tokio::test]
    async fn test_call_count_tracks_operations() {
        let broker = MemoryBroker::new();
        let conn = client(&broker).await;
        assert_eq!(broker.call_count(), 0);
        conn.get("missing").await.unwrap();
        conn.rpush("commands", b"{}".to_vec()).await.unwrap();
        assert_eq!(broker.call_count(), 2);
    }
}

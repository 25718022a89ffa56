//! Topic registry: which connections are subscribed to which topics.
//!
//! ```text
//!                    ┌──────────────────────────────────────────┐
//!  connect() ──────► │ TopicRegistry                            │
//!                    │   topics: Topic → Arc<TopicChannel>      │
//!                    │              ├ gate (RwLock<()>)         │
//!                    │              ├ version (AtomicU64)       │
//!                    │              └ subscribers: conn → sub   │
//!                    └──────────────────────────────────────────┘
//!                                        │ subscribers_of()
//!                                        ▼
//!                    ConnectionHandle ── mpsc::Sender<Frame> ──► writer task
//! ```
//!
//! Each [`TopicChannel`] carries the topic's serialization gate: mutations
//! hold it exclusively across commit and publish, loads hold it shared
//! across subscribe, query and delivery of `Loaded`. Topics never share a
//! gate.
//!
//! The registry is an owned value: the server creates it at start and calls
//! [`TopicRegistry::shutdown`] when it stops.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::auth::{Authorizer, Principal};
use crate::error::{SyncError, SyncResult};
use crate::protocol::Topic;

/// Pre-encoded server message. Clones share one buffer across recipients.
pub type Frame = Bytes;

/// Identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Connection already closed; the frame is dropped.
    Closed,
    /// Outbound queue full; the subscriber is too slow.
    Full,
}

struct ConnectionShared {
    id: ConnectionId,
    principal: Principal,
    sender: mpsc::Sender<Frame>,
    closed: AtomicBool,
    closing: Notify,
    topics: Mutex<HashSet<Topic>>,
}

/// Cheap, cloneable reference to a live (or closed) connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionShared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("principal", &self.inner.principal)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn principal(&self) -> &Principal {
        &self.inner.principal
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Queue a frame without waiting. Never blocks the caller.
    pub fn try_push(&self, frame: Frame) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        match self.inner.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Queue a frame, waiting for room. Used for replies to the connection's
    /// own requests.
    pub async fn send(&self, frame: Frame) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::ConnectionClosed);
        }
        self.inner
            .sender
            .send(frame)
            .await
            .map_err(|_| SyncError::ConnectionClosed)
    }

    /// Resolves once the registry has closed this connection.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.closing.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    fn mark_closed(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.closing.notify_waiters();
        }
    }
}

/// Proof of a (connection, topic) subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    topic: Topic,
    connection: ConnectionId,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

struct Subscriber {
    subscription: u64,
    connection: ConnectionHandle,
}

/// Per-topic state: serialization gate, commit version, subscriber set.
pub struct TopicChannel {
    topic: Topic,
    gate: RwLock<()>,
    version: AtomicU64,
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
}

impl TopicChannel {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            gate: RwLock::new(()),
            version: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Exclusive access for one mutation (commit + publish).
    pub async fn writer(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    /// Shared access for loads; excludes mutations, not other loads.
    pub async fn reader(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Last committed version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Bump the version for a new commit. Call only while holding `writer()`.
    pub fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.subscribers
            .read()
            .await
            .values()
            .filter(|s| !s.connection.is_closed())
            .map(|s| s.connection.clone())
            .collect()
    }
}

/// Registry of connections, topics and subscriptions.
pub struct TopicRegistry {
    authorizer: Arc<dyn Authorizer>,
    outbound_capacity: usize,
    max_subscriptions: usize,
    topics: RwLock<HashMap<Topic, Arc<TopicChannel>>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    next_subscription: AtomicU64,
    shut_down: AtomicBool,
}

impl TopicRegistry {
    /// Create a registry. `outbound_capacity` bounds each connection's push
    /// queue.
    pub fn new(authorizer: Arc<dyn Authorizer>, outbound_capacity: usize) -> Self {
        Self {
            authorizer,
            outbound_capacity: outbound_capacity.max(1),
            max_subscriptions: usize::MAX,
            topics: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_max_subscriptions(mut self, max: usize) -> Self {
        self.max_subscriptions = max;
        self
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    /// Register a new connection. The receiver yields frames to write to the
    /// client, in queue order.
    pub async fn connect(
        &self,
        principal: Principal,
    ) -> SyncResult<(ConnectionHandle, mpsc::Receiver<Frame>)> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SyncError::ConnectionClosed);
        }
        let (sender, receiver) = mpsc::channel(self.outbound_capacity);
        let handle = ConnectionHandle {
            inner: Arc::new(ConnectionShared {
                id: ConnectionId::new(),
                principal,
                sender,
                closed: AtomicBool::new(false),
                closing: Notify::new(),
                topics: Mutex::new(HashSet::new()),
            }),
        };
        self.connections
            .write()
            .await
            .insert(handle.id(), handle.clone());
        log::debug!("Connection {} registered for {}", handle.id(), handle.principal());
        Ok((handle, receiver))
    }

    /// Get or create the channel for a topic.
    pub async fn channel(&self, topic: &Topic) -> Arc<TopicChannel> {
        {
            let topics = self.topics.read().await;
            if let Some(channel) = topics.get(topic) {
                return channel.clone();
            }
        }

        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(channel) = topics.get(topic) {
            return channel.clone();
        }
        let channel = Arc::new(TopicChannel::new(topic.clone()));
        topics.insert(topic.clone(), channel.clone());
        channel
    }

    /// Subscribe `connection` to `topic`, replacing any previous subscription
    /// of that pair.
    pub async fn subscribe(
        &self,
        topic: &Topic,
        connection: &ConnectionHandle,
    ) -> SyncResult<SubscriptionHandle> {
        if !self.authorizer.can_read(connection.principal(), topic) {
            return Err(SyncError::Unauthorized {
                principal: connection.principal().to_string(),
                action: "read",
                topic: topic.to_string(),
            });
        }

        let channel = self.channel(topic).await;
        // Held until the subscriber is in the channel, so a concurrent
        // disconnect either rejects us or sees the topic when it drains.
        let mut topics = connection.inner.topics.lock().await;
        if connection.is_closed() {
            return Err(SyncError::ConnectionClosed);
        }
        if !topics.contains(topic) && topics.len() >= self.max_subscriptions {
            return Err(SyncError::Validation(format!(
                "connection already holds {} subscriptions",
                topics.len()
            )));
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        topics.insert(topic.clone());
        channel.subscribers.write().await.insert(
            connection.id(),
            Subscriber {
                subscription: id,
                connection: connection.clone(),
            },
        );
        log::debug!("Connection {} subscribed to {topic} (#{id})", connection.id());

        Ok(SubscriptionHandle {
            id,
            topic: topic.clone(),
            connection: connection.id(),
        })
    }

    /// Remove a subscription. No-op if it was already removed or replaced.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let connection = self.connections.read().await.get(&handle.connection).cloned();
        let channel = self.topics.read().await.get(&handle.topic).cloned();
        let (Some(connection), Some(channel)) = (connection, channel) else {
            return;
        };

        {
            let mut topics = connection.inner.topics.lock().await;
            let mut subscribers = channel.subscribers.write().await;
            let current = subscribers
                .get(&handle.connection)
                .is_some_and(|s| s.subscription == handle.id);
            if current {
                subscribers.remove(&handle.connection);
                topics.remove(&handle.topic);
                log::debug!(
                    "Connection {} unsubscribed from {} (#{})",
                    handle.connection,
                    handle.topic,
                    handle.id
                );
            }
        }

        drop(channel);
        self.release(&handle.topic).await;
    }

    /// Current subscription of a connection to a topic, if any.
    pub async fn subscription(
        &self,
        topic: &Topic,
        connection: ConnectionId,
    ) -> Option<SubscriptionHandle> {
        let channel = self.topics.read().await.get(topic).cloned()?;
        let subscribers = channel.subscribers.read().await;
        subscribers.get(&connection).map(|s| SubscriptionHandle {
            id: s.subscription,
            topic: topic.clone(),
            connection,
        })
    }

    /// Snapshot of the live subscribers of a topic.
    pub async fn subscribers_of(&self, topic: &Topic) -> Vec<ConnectionHandle> {
        let channel = self.topics.read().await.get(topic).cloned();
        match channel {
            Some(channel) => channel.snapshot().await,
            None => Vec::new(),
        }
    }

    /// Close a connection and drop all its subscriptions. Idempotent.
    pub async fn disconnect(&self, id: ConnectionId) {
        let Some(handle) = self.connections.write().await.remove(&id) else {
            return;
        };
        handle.mark_closed();

        let topics: Vec<Topic> = handle.inner.topics.lock().await.drain().collect();
        for topic in &topics {
            let channel = self.topics.read().await.get(topic).cloned();
            if let Some(channel) = channel {
                channel.subscribers.write().await.remove(&id);
            }
            self.release(topic).await;
        }
        log::debug!("Connection {id} closed ({} subscriptions dropped)", topics.len());
    }

    /// Disconnect a subscriber that cannot keep up.
    pub async fn evict(&self, id: ConnectionId) {
        log::warn!("Evicting connection {id}: outbound queue full");
        self.disconnect(id).await;
    }

    /// Close every connection and refuse new ones.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let ids: Vec<ConnectionId> = self.connections.read().await.keys().copied().collect();
        for id in ids {
            self.disconnect(id).await;
        }
        log::info!("Topic registry shut down");
    }

    /// Drop a topic's channel once nothing references it.
    pub async fn release(&self, topic: &Topic) {
        let mut topics = self.topics.write().await;
        let idle = match topics.get(topic) {
            Some(channel) => {
                Arc::strong_count(channel) == 1 && channel.subscribers.read().await.is_empty()
            }
            None => false,
        };
        if idle {
            topics.remove(topic);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

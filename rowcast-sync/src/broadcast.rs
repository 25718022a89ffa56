//! Fan-out of change events to topic subscribers.
//!
//! Each event is encoded once into a shared [`Frame`] and queued on every
//! subscriber's outbound channel with a non-blocking send. A closed
//! subscriber is skipped; a subscriber whose queue is full is evicted so it
//! can never hold up the topic or observe a gap.
//!
//! Per-subscriber order follows queue order. The handler publishes while
//! holding the topic's gate, so queue order is commit order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::SyncResult;
use crate::protocol::{ChangeEvent, ServerMessage, Topic};
use crate::registry::{ConnectionHandle, Frame, PushError, TopicRegistry};

/// Statistics for monitoring dispatch health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events_published: u64,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub evictions: u64,
}

/// Lock-free counters behind [`DispatchStats`].
#[derive(Default)]
struct AtomicDispatchStats {
    events_published: AtomicU64,
    frames_delivered: AtomicU64,
    frames_dropped: AtomicU64,
    evictions: AtomicU64,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers closed while the publish was in flight.
    pub dropped: usize,
    pub evicted: usize,
}

/// Delivers events to the subscribers the registry knows about.
#[derive(Clone)]
pub struct BroadcastDispatcher {
    registry: Arc<TopicRegistry>,
    stats: Arc<AtomicDispatchStats>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<TopicRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(AtomicDispatchStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Deliver `event` to every current subscriber of `topic`.
    ///
    /// Failures are per subscriber and never fail the publish.
    pub async fn publish<T: Entity>(
        &self,
        topic: &Topic,
        version: u64,
        event: ChangeEvent<T>,
    ) -> SyncResult<PublishReport> {
        let name = event.name();
        let frame = encode_event(topic, version, event)?;
        let subscribers = self.registry.subscribers_of(topic).await;

        let mut report = PublishReport::default();
        let mut slow = Vec::new();
        for connection in &subscribers {
            match connection.try_push(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(PushError::Closed) => {
                    report.dropped += 1;
                    log::debug!("Dropped {name} for closed connection {}", connection.id());
                }
                Err(PushError::Full) => {
                    report.evicted += 1;
                    slow.push(connection.id());
                }
            }
        }
        for id in slow {
            self.registry.evict(id).await;
        }

        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        self.record(&report);
        log::trace!(
            "Published {name} v{version} on {topic} to {} subscribers",
            report.delivered
        );
        Ok(report)
    }

    /// Deliver `event` to one connection only (used for `Loaded`).
    ///
    /// Returns false if the connection was closed or evicted.
    pub async fn deliver_to<T: Entity>(
        &self,
        connection: &ConnectionHandle,
        topic: &Topic,
        version: u64,
        event: ChangeEvent<T>,
    ) -> SyncResult<bool> {
        let frame = encode_event(topic, version, event)?;
        let mut report = PublishReport::default();
        match connection.try_push(frame) {
            Ok(()) => report.delivered = 1,
            Err(PushError::Closed) => report.dropped = 1,
            Err(PushError::Full) => {
                report.evicted = 1;
                self.registry.evict(connection.id()).await;
            }
        }
        self.record(&report);
        Ok(report.delivered == 1)
    }

    /// Snapshot of dispatch counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &PublishReport) {
        self.stats
            .frames_delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .frames_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.stats
            .evictions
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
    }
}

fn encode_event<T: Entity>(topic: &Topic, version: u64, event: ChangeEvent<T>) -> SyncResult<Frame> {
    let msg = ServerMessage::Event {
        topic: topic.clone(),
        version,
        event,
    };
    Ok(Frame::from(msg.encode()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, Principal};
    use crate::testing::Article;
    use tokio::sync::mpsc;

    fn setup(capacity: usize) -> (Arc<TopicRegistry>, BroadcastDispatcher) {
        let registry = Arc::new(TopicRegistry::new(Arc::new(AllowAll), capacity));
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        (registry, dispatcher)
    }

    fn next_event(rx: &mut mpsc::Receiver<Frame>) -> (u64, ChangeEvent<Article>) {
        let frame = rx.try_recv().expect("frame queued");
        match ServerMessage::<Article>::decode(&frame).unwrap() {
            ServerMessage::Event { version, event, .. } => (version, event),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_subscribers() {
        let (registry, dispatcher) = setup(16);
        let topic = Topic::from("articles");

        let mut receivers = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let (conn, rx) = registry.connect(Principal::new(name)).await.unwrap();
            registry.subscribe(&topic, &conn).await.unwrap();
            receivers.push(rx);
        }

        let report = dispatcher
            .publish(&topic, 1, ChangeEvent::Added(Article::new("Ring A", 10.0)))
            .await
            .unwrap();
        assert_eq!(report.delivered, 3);

        for rx in &mut receivers {
            let (version, event) = next_event(rx);
            assert_eq!(version, 1);
            assert!(matches!(event, ChangeEvent::Added(a) if a.name == "Ring A"));
        }
    }

    #[tokio::test]
    async fn test_subscribers_share_one_encoded_frame() {
        let (registry, dispatcher) = setup(4);
        let topic = Topic::from("articles");
        let (a, mut rx_a) = registry.connect(Principal::new("a")).await.unwrap();
        let (b, mut rx_b) = registry.connect(Principal::new("b")).await.unwrap();
        registry.subscribe(&topic, &a).await.unwrap();
        registry.subscribe(&topic, &b).await.unwrap();

        dispatcher
            .publish::<Article>(&topic, 1, ChangeEvent::Removed(1))
            .await
            .unwrap();

        let frame_a = rx_a.try_recv().unwrap();
        let frame_b = rx_b.try_recv().unwrap();
        assert_eq!(frame_a, frame_b);
        assert_eq!(frame_a.as_ptr(), frame_b.as_ptr());
    }

    #[tokio::test]
    async fn test_publish_preserves_order_per_subscriber() {
        let (registry, dispatcher) = setup(64);
        let topic = Topic::from("articles");
        let (conn, mut rx) = registry.connect(Principal::anonymous()).await.unwrap();
        registry.subscribe(&topic, &conn).await.unwrap();

        for v in 1..=20u64 {
            dispatcher
                .publish::<Article>(&topic, v, ChangeEvent::Removed(v))
                .await
                .unwrap();
        }
        for v in 1..=20u64 {
            assert_eq!(next_event(&mut rx), (v, ChangeEvent::Removed(v)));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted_without_affecting_others() {
        let (registry, dispatcher) = setup(1);
        let topic = Topic::from("articles");
        let (slow, _slow_rx) = registry.connect(Principal::new("slow")).await.unwrap();
        let (fast, mut fast_rx) = registry.connect(Principal::new("fast")).await.unwrap();
        registry.subscribe(&topic, &slow).await.unwrap();
        registry.subscribe(&topic, &fast).await.unwrap();

        let first = dispatcher
            .publish::<Article>(&topic, 1, ChangeEvent::Removed(1))
            .await
            .unwrap();
        assert_eq!(first.delivered, 2);
        assert_eq!(next_event(&mut fast_rx).0, 1);

        // `slow` never drains its queue of one.
        let second = dispatcher
            .publish::<Article>(&topic, 2, ChangeEvent::Removed(2))
            .await
            .unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(second.evicted, 1);
        assert!(slow.is_closed());
        assert_eq!(next_event(&mut fast_rx).0, 2);

        let stats = dispatcher.stats();
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(registry.subscribers_of(&topic).await.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_to_targets_one_connection() {
        let (registry, dispatcher) = setup(8);
        let topic = Topic::from("articles");
        let (a, mut rx_a) = registry.connect(Principal::new("a")).await.unwrap();
        let (b, mut rx_b) = registry.connect(Principal::new("b")).await.unwrap();
        registry.subscribe(&topic, &a).await.unwrap();
        registry.subscribe(&topic, &b).await.unwrap();

        let delivered = dispatcher
            .deliver_to::<Article>(
                &a,
                &topic,
                0,
                ChangeEvent::Loaded {
                    items: vec![],
                    total_count: None,
                },
            )
            .await
            .unwrap();
        assert!(delivered);
        assert!(matches!(next_event(&mut rx_a).1, ChangeEvent::Loaded { .. }));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_connection_is_skipped() {
        let (registry, dispatcher) = setup(8);
        let topic = Topic::from("articles");
        let (conn, mut rx) = registry.connect(Principal::anonymous()).await.unwrap();
        registry.subscribe(&topic, &conn).await.unwrap();
        registry.disconnect(conn.id()).await;

        let report = dispatcher
            .publish::<Article>(&topic, 1, ChangeEvent::Removed(1))
            .await
            .unwrap();
        assert_eq!(report, PublishReport::default());
        assert!(rx.try_recv().is_err());

        let delivered = dispatcher
            .deliver_to::<Article>(&conn, &topic, 1, ChangeEvent::Removed(1))
            .await
            .unwrap();
        assert!(!delivered);
        assert_eq!(dispatcher.stats().frames_dropped, 1);
    }
}

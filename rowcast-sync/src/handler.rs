//! Server action handler: applies client requests to the store and hands the
//! resulting events to the dispatcher.
//!
//! Per topic, mutations run one at a time under the topic's gate, and each
//! one's commit and publish happen inside that critical section. Loads share
//! the gate with each other, so they run in parallel but never between a
//! commit and its publish. Different topics never contend.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::broadcast::BroadcastDispatcher;
use crate::entity::Entity;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ChangeEvent, ClientMessage, ServerMessage, Topic};
use crate::query::{translate, LoadOptions};
use crate::registry::{ConnectionHandle, SubscriptionHandle, TopicRegistry};
use crate::store::BackingStore;

/// Entry point for requests arriving on a connection.
pub struct ServerActionHandler<T: Entity, S: BackingStore<T>> {
    store: Arc<S>,
    registry: Arc<TopicRegistry>,
    dispatcher: BroadcastDispatcher,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, S: BackingStore<T>> Clone for ServerActionHandler<T, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity, S: BackingStore<T>> ServerActionHandler<T, S> {
    pub fn new(store: Arc<S>, registry: Arc<TopicRegistry>) -> Self {
        let dispatcher = BroadcastDispatcher::new(registry.clone());
        Self {
            store,
            registry,
            dispatcher,
            _entity: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &BroadcastDispatcher {
        &self.dispatcher
    }

    /// Subscribe `conn` to `topic` and push it a `Loaded` snapshot.
    ///
    /// Invalid options fail before the subscription is touched. If the store
    /// query fails, the connection is left unsubscribed from `topic`.
    pub async fn load(
        &self,
        conn: &ConnectionHandle,
        topic: &Topic,
        options: &LoadOptions,
    ) -> SyncResult<SubscriptionHandle> {
        let query = translate::<T>(options)?;
        let channel = self.registry.channel(topic).await;

        let result: SyncResult<SubscriptionHandle> = async {
            let _shared = channel.reader().await;
            let subscription = self.registry.subscribe(topic, conn).await?;
            let page = match self.store.query(topic, &query).await {
                Ok(page) => page,
                Err(e) => {
                    self.registry.unsubscribe(&subscription).await;
                    return Err(SyncError::from(e));
                }
            };
            let loaded = ChangeEvent::Loaded {
                items: page.items,
                total_count: page.total_count,
            };
            self.dispatcher
                .deliver_to(conn, topic, channel.version(), loaded)
                .await?;
            Ok(subscription)
        }
        .await;

        drop(channel);
        self.registry.release(topic).await;
        result
    }

    /// Insert `value` and broadcast `Added` with the stored row.
    pub async fn insert(&self, conn: &ConnectionHandle, topic: &Topic, value: T) -> SyncResult<T> {
        self.check_write(conn, topic)?;
        self.mutate(topic, |store| async move {
            let stored = store.insert(topic, value).await?;
            Ok::<_, SyncError>((ChangeEvent::Added(stored.clone()), stored))
        })
        .await
    }

    /// Patch the row at `key` and broadcast `Updated`.
    pub async fn update(
        &self,
        conn: &ConnectionHandle,
        topic: &Topic,
        key: T::Key,
        patch: T::Patch,
    ) -> SyncResult<T> {
        self.check_write(conn, topic)?;
        self.mutate(topic, |store| async move {
            let updated = store.update(topic, &key, &patch).await?;
            Ok::<_, SyncError>((ChangeEvent::Updated { key, patch }, updated))
        })
        .await
    }

    /// Delete the row at `key` and broadcast `Removed`.
    pub async fn remove(&self, conn: &ConnectionHandle, topic: &Topic, key: T::Key) -> SyncResult<()> {
        self.check_write(conn, topic)?;
        self.mutate(topic, |store| async move {
            store.remove(topic, &key).await?;
            Ok::<_, SyncError>((ChangeEvent::Removed(key), ()))
        })
        .await
    }

    /// Drop the connection's subscription to `topic`, if any.
    pub async fn unsubscribe(&self, conn: &ConnectionHandle, topic: &Topic) {
        if let Some(subscription) = self.registry.subscription(topic, conn.id()).await {
            self.registry.unsubscribe(&subscription).await;
        }
    }

    /// Execute one client message and build the reply for its sender.
    pub async fn handle(&self, conn: &ConnectionHandle, msg: ClientMessage<T>) -> ServerMessage<T> {
        let request_id = match msg.request_id() {
            Some(id) => id,
            None => return ServerMessage::Pong,
        };
        let action = action_name(&msg);
        let topic = msg.topic().cloned();

        let result = match msg {
            ClientMessage::Load { topic, options, .. } => {
                self.load(conn, &topic, &options).await.map(|_| ())
            }
            ClientMessage::Insert { topic, value, .. } => {
                self.insert(conn, &topic, value).await.map(|_| ())
            }
            ClientMessage::Update {
                topic, key, patch, ..
            } => self.update(conn, &topic, key, patch).await.map(|_| ()),
            ClientMessage::Remove { topic, key, .. } => self.remove(conn, &topic, key).await,
            ClientMessage::Unsubscribe { topic, .. } => {
                self.unsubscribe(conn, &topic).await;
                Ok(())
            }
            ClientMessage::Ping => return ServerMessage::Pong,
        };

        match result {
            Ok(()) => ServerMessage::Ack { request_id },
            Err(e) => {
                log::debug!(
                    "{action} #{request_id} on {} from {} rejected: {e}",
                    topic.as_ref().map_or("-", Topic::as_str),
                    conn.principal()
                );
                ServerMessage::Rejected {
                    request_id,
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        }
    }

    fn check_write(&self, conn: &ConnectionHandle, topic: &Topic) -> SyncResult<()> {
        if self.registry.authorizer().can_write(conn.principal(), topic) {
            Ok(())
        } else {
            Err(SyncError::Unauthorized {
                principal: conn.principal().to_string(),
                action: "write",
                topic: topic.to_string(),
            })
        }
    }

    /// Run `commit` under the topic's exclusive gate and publish its event.
    ///
    /// A failed commit bumps no version and publishes nothing.
    async fn mutate<'a, R, F, Fut>(&'a self, topic: &'a Topic, commit: F) -> SyncResult<R>
    where
        F: FnOnce(&'a S) -> Fut,
        Fut: std::future::Future<Output = SyncResult<(ChangeEvent<T>, R)>>,
    {
        let channel = self.registry.channel(topic).await;

        let result: SyncResult<R> = async {
            let _exclusive = channel.writer().await;
            let (event, output) = commit(self.store.as_ref()).await?;
            let version = channel.next_version();
            let name = event.name();
            let report = self.dispatcher.publish(topic, version, event).await?;
            log::debug!(
                "{name} v{version} committed on {topic}, delivered to {}",
                report.delivered
            );
            Ok(output)
        }
        .await;

        drop(channel);
        self.registry.release(topic).await;
        result
    }
}

fn action_name<T: Entity>(msg: &ClientMessage<T>) -> &'static str {
    match msg {
        ClientMessage::Load { .. } => "Load",
        ClientMessage::Insert { .. } => "Insert",
        ClientMessage::Update { .. } => "Update",
        ClientMessage::Remove { .. } => "Remove",
        ClientMessage::Unsubscribe { .. } => "Unsubscribe",
        ClientMessage::Ping => "Ping",
    }
}

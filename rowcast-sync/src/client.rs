//! WebSocket sync client for connecting to a rowcast server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Typed requests with client-chosen request ids
//! - A typed event stream of pushes and replies
//! - Offline queue for requests issued while disconnected

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::entity::Entity;
use crate::error::ErrorKind;
use crate::protocol::{ChangeEvent, ClientMessage, ProtocolError, RequestId, ServerMessage, Topic};
use crate::query::LoadOptions;
use crate::server::DEFAULT_PRINCIPAL_HEADER;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<T: Entity> {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Change pushed for a subscribed topic
    Event {
        topic: Topic,
        version: u64,
        event: ChangeEvent<T>,
    },
    /// Request applied
    Ack(RequestId),
    /// Request refused; nothing was committed
    Rejected {
        request_id: RequestId,
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

impl<T: Entity> From<ServerMessage<T>> for ClientEvent<T> {
    fn from(msg: ServerMessage<T>) -> Self {
        match msg {
            ServerMessage::Event {
                topic,
                version,
                event,
            } => ClientEvent::Event {
                topic,
                version,
                event,
            },
            ServerMessage::Ack { request_id } => ClientEvent::Ack(request_id),
            ServerMessage::Rejected {
                request_id,
                kind,
                message,
            } => ClientEvent::Rejected {
                request_id,
                kind,
                message,
            },
            ServerMessage::Pong => ClientEvent::Pong,
        }
    }
}

/// Requests issued while disconnected.
///
/// Queued requests are replayed, in order, on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedRequest>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedRequest {
    request_id: RequestId,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded request. Returns false when full.
    pub fn enqueue(&mut self, request_id: RequestId, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedRequest {
            request_id,
            payload,
        });
        true
    }

    /// Drain all queued requests for replay.
    pub fn drain(&mut self) -> Vec<(RequestId, Vec<u8>)> {
        self.queue
            .drain(..)
            .map(|r| (r.request_id, r.payload))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|r| r.payload.len()).sum()
    }
}

/// The sync client.
///
/// Holds one WebSocket connection. Replies and pushes arrive on the event
/// stream returned by [`SyncClient::take_event_rx`]; request methods return
/// the id to correlate them with.
pub struct SyncClient<T: Entity> {
    /// Subject sent in the principal handshake header
    principal: Option<String>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    next_request: AtomicU64,

    /// Requests issued while disconnected
    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent<T>>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<ClientEvent<T>>,

    server_url: String,

    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> SyncClient<T> {
    /// Create a new, unconnected client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            principal: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_request: AtomicU64::new(1),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
            _entity: PhantomData,
        }
    }

    /// Identify as `subject` during the handshake.
    pub fn with_principal(mut self, subject: impl Into<String>) -> Self {
        self.principal = Some(subject.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent<T>>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages, then
    /// replays the offline queue.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        if let Some(subject) = &self.principal {
            let value = HeaderValue::from_str(subject)
                .map_err(|e| ProtocolError::Transport(e.to_string()))?;
            request.headers_mut().insert(DEFAULT_PRINCIPAL_HEADER, value);
        }

        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::debug!("Connect to {} failed: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Replay offline queue
        {
            let queued = self.offline_queue.lock().await.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued requests", queued.len());
                for (_, payload) in queued {
                    out_tx
                        .send(payload)
                        .await
                        .map_err(|_| ProtocolError::ConnectionClosed)?;
                }
            }
        }

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::<T>::decode(&data) {
                        Ok(msg) => {
                            if event_tx.send(msg.into()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Queued pushes not yet read are discarded.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Subscribe to `topic` and request a `Loaded` snapshot.
    pub async fn load(&self, topic: &Topic, options: LoadOptions) -> Result<RequestId, ProtocolError> {
        let request_id = self.next_request_id();
        self.send(ClientMessage::Load {
            request_id,
            topic: topic.clone(),
            options,
        })
        .await
    }

    pub async fn insert(&self, topic: &Topic, value: T) -> Result<RequestId, ProtocolError> {
        let request_id = self.next_request_id();
        self.send(ClientMessage::Insert {
            request_id,
            topic: topic.clone(),
            value,
        })
        .await
    }

    pub async fn update(
        &self,
        topic: &Topic,
        key: T::Key,
        patch: T::Patch,
    ) -> Result<RequestId, ProtocolError> {
        let request_id = self.next_request_id();
        self.send(ClientMessage::Update {
            request_id,
            topic: topic.clone(),
            key,
            patch,
        })
        .await
    }

    pub async fn remove(&self, topic: &Topic, key: T::Key) -> Result<RequestId, ProtocolError> {
        let request_id = self.next_request_id();
        self.send(ClientMessage::Remove {
            request_id,
            topic: topic.clone(),
            key,
        })
        .await
    }

    pub async fn unsubscribe(&self, topic: &Topic) -> Result<RequestId, ProtocolError> {
        let request_id = self.next_request_id();
        self.send(ClientMessage::Unsubscribe {
            request_id,
            topic: topic.clone(),
        })
        .await
    }

    /// Send an application-level ping. Dropped while offline.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let encoded = ClientMessage::<T>::Ping.encode()?;
        self.write(encoded).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Get offline queue length.
    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request now, or queue it while disconnected.
    async fn send(&self, msg: ClientMessage<T>) -> Result<RequestId, ProtocolError> {
        let request_id = msg.request_id().unwrap_or_default();
        let encoded = msg.encode()?;

        if self.connection_state().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(request_id, encoded) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(request_id);
        }

        self.write(encoded).await?;
        Ok(request_id)
    }

    async fn write(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Article, ArticlePatch};

    fn client() -> SyncClient<Article> {
        SyncClient::new("ws://localhost:9090")
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_requests_offline_are_queued_with_increasing_ids() {
        let client = client();
        let topic = Topic::from("articles");

        let first = client.load(&topic, LoadOptions::new()).await.unwrap();
        let second = client
            .insert(&topic, Article::new("Ring A", 1.0))
            .await
            .unwrap();
        let third = client
            .update(&topic, 1, ArticlePatch::name("Ring A2"))
            .await
            .unwrap();
        assert_eq!((first, second, third), (1, 2, 3));
        assert_eq!(client.offline_queue_len().await, 3);

        let queued = client.offline_queue.lock().await.drain();
        let replayed = ClientMessage::<Article>::decode(&queued[1].1).unwrap();
        assert_eq!(replayed.request_id(), Some(2));
        assert!(matches!(replayed, ClientMessage::Insert { .. }));
    }

    #[tokio::test]
    async fn test_ping_offline_is_dropped() {
        let client = client();
        client.send_ping().await.unwrap();
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client: SyncClient<Article> = SyncClient::new(format!("ws://127.0.0.1:{port}"));
        assert_eq!(client.connect().await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(1, vec![1, 2, 3]);
        queue.enqueue(2, vec![4, 5, 6, 7]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], (1, vec![1, 2, 3]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);

        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2]));
        assert!(queue.enqueue(3, vec![3]));
        assert!(!queue.enqueue(4, vec![4])); // Full

        assert_eq!(queue.len(), 3);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_server_message_to_event() {
        let event: ClientEvent<Article> = ServerMessage::Ack { request_id: 5 }.into();
        assert_eq!(event, ClientEvent::Ack(5));

        let event: ClientEvent<Article> = ServerMessage::Event {
            topic: Topic::from("articles"),
            version: 2,
            event: ChangeEvent::Removed(1),
        }
        .into();
        assert!(matches!(event, ClientEvent::Event { version: 2, .. }));
    }

    #[test]
    fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}

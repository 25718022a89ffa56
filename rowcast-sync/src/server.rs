//! WebSocket sync server with topic-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── BackingStore
//!             ├── reader loop ──► ServerActionHandler
//! Client B ──┘        │                 │
//!                     │           TopicRegistry ── per-topic gate + version
//!                     │                 │
//!                     │           BroadcastDispatcher
//!                     │                 │ try_push(frame)
//!                     ▼                 ▼
//!               outbound queue (bounded mpsc, one per connection)
//!                     │
//!                writer task ── heartbeat pings ──► Client
//! ```
//!
//! Each connection gets:
//! - A principal taken from a handshake header (see [`ServerConfig`])
//! - A bounded outbound queue drained by a dedicated writer task
//! - A reader loop that routes each request to a per-topic lane
//!
//! Requests on one topic run in arrival order; requests on different topics
//! run concurrently, so a stalled store call on one topic never holds up the
//! same connection's other topics. Lanes are tasks of their own, so a
//! mutation whose connection drops mid-flight still commits and reaches the
//! remaining subscribers.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{AllowAll, Authorizer, Principal};
use crate::broadcast::DispatchStats;
use crate::entity::Entity;
use crate::handler::ServerActionHandler;
use crate::protocol::{ClientMessage, ServerMessage, Topic};
use crate::registry::{ConnectionHandle, TopicRegistry};
use crate::store::BackingStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handshake header a fronting proxy uses to pass the authenticated user.
pub const DEFAULT_PRINCIPAL_HEADER: &str = "x-forwarded-user";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Queued requests per topic lane before the reader waits.
const LANE_CAPACITY: usize = 64;

/// A lane with no requests for this long shuts down.
const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
    /// Maximum topics a single connection may subscribe to
    pub max_subscriptions_per_connection: usize,
    /// Heartbeat interval in seconds (0 disables pings)
    pub heartbeat_interval_secs: u64,
    /// Handshake header carrying the authenticated principal
    pub principal_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            max_subscriptions_per_connection: 64,
            heartbeat_interval_secs: 30,
            principal_header: DEFAULT_PRINCIPAL_HEADER.to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `ROWCAST_BIND`, `ROWCAST_OUTBOUND_CAPACITY`,
    /// `ROWCAST_MAX_SUBSCRIPTIONS`, `ROWCAST_HEARTBEAT_SECS` and
    /// `ROWCAST_PRINCIPAL_HEADER`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("ROWCAST_BIND") {
            config.bind_addr = addr;
        }
        if let Some(capacity) = lookup("ROWCAST_OUTBOUND_CAPACITY").and_then(|v| v.parse().ok()) {
            config.outbound_capacity = capacity;
        }
        if let Some(max) = lookup("ROWCAST_MAX_SUBSCRIPTIONS").and_then(|v| v.parse().ok()) {
            config.max_subscriptions_per_connection = max;
        }
        if let Some(secs) = lookup("ROWCAST_HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(header) = lookup("ROWCAST_PRINCIPAL_HEADER") {
            config.principal_header = header.to_ascii_lowercase();
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// The sync server.
pub struct SyncServer<T: Entity, S: BackingStore<T>> {
    config: ServerConfig,
    handler: ServerActionHandler<T, S>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl<T: Entity, S: BackingStore<T>> SyncServer<T, S> {
    /// Create a new sync server over `store`.
    pub fn new(config: ServerConfig, store: Arc<S>, authorizer: Arc<dyn Authorizer>) -> Self {
        let registry = TopicRegistry::new(authorizer, config.outbound_capacity)
            .with_max_subscriptions(config.max_subscriptions_per_connection);
        Self {
            handler: ServerActionHandler::new(store, Arc::new(registry)),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration and no access restrictions.
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(ServerConfig::default(), store, Arc::new(AllowAll))
    }

    /// Listen on the configured address until the process ends.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.run_until(std::future::pending()).await
    }

    /// Listen on the configured address until `signal` resolves.
    pub async fn run_until(&self, signal: impl Future<Output = ()>) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener, signal).await
    }

    /// Accept connections on `listener` until `signal` resolves, then close
    /// every connection.
    pub async fn serve(
        &self,
        listener: TcpListener,
        signal: impl Future<Output = ()>,
    ) -> Result<(), BoxError> {
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let handler = self.handler.clone();
                    let stats = self.stats.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, handler, stats, config).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        log::info!("Sync server stopping");
        self.handler.registry().shutdown().await;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        handler: ServerActionHandler<T, S>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let mut principal = Principal::anonymous();
        let header = config.principal_header.as_str();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if let Some(subject) = request
                    .headers()
                    .get(header)
                    .and_then(|v| v.to_str().ok())
                {
                    principal = Principal::new(subject);
                }
                Ok(response)
            },
        )
        .await?;

        let (conn, mut outbound) = handler.registry().connect(principal).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!(
            "WebSocket connection {} established from {addr} for {}",
            conn.id(),
            conn.principal()
        );

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let writer = tokio::spawn({
            let conn = conn.clone();
            let stats = stats.clone();
            let mut heartbeat = heartbeat(config.heartbeat_interval_secs);
            async move {
                loop {
                    let msg = tokio::select! {
                        biased;
                        _ = conn.closed() => break,
                        frame = outbound.recv() => match frame {
                            Some(frame) => Message::Binary(frame),
                            None => break,
                        },
                        _ = tick(&mut heartbeat) => Message::Ping(Bytes::new()),
                    };
                    let len = msg.len() as u64;

                    // A peer that stops reading must not pin this task after eviction.
                    tokio::select! {
                        sent = ws_sender.send(msg) => {
                            if let Err(e) = sent {
                                log::debug!("Write to {} failed: {e}", conn.id());
                                break;
                            }
                        }
                        _ = conn.closed() => break,
                    }
                    stats.write().await.bytes_sent += len;
                }
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_sender.send(Message::Close(None))).await;
            }
        });

        let mut lanes = RequestLanes::new(handler.clone(), conn.clone(), stats.clone(), addr);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.write().await.bytes_received += data.len() as u64;
                            let request = match ClientMessage::<T>::decode(&data) {
                                Ok(request) => request,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            lanes.dispatch(request).await;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {} closed from {addr}", conn.id());
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                _ = conn.closed() => {
                    log::info!("Connection {} closed by server", conn.id());
                    break;
                }
            }
        }

        handler.registry().disconnect(conn.id()).await;
        lanes.finish().await;
        let _ = writer.await;

        stats.write().await.active_connections -= 1;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.handler.dispatcher().stats()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        self.handler.registry()
    }

    pub fn handler(&self) -> &ServerActionHandler<T, S> {
        &self.handler
    }
}

/// Per-topic request queues of one connection.
///
/// Each lane is a task that executes its topic's requests one at a time and
/// queues the replies. Requests without a topic (`Ping`) share one lane.
struct RequestLanes<T: Entity, S: BackingStore<T>> {
    handler: ServerActionHandler<T, S>,
    conn: ConnectionHandle,
    stats: Arc<RwLock<ServerStats>>,
    addr: SocketAddr,
    lanes: HashMap<Option<Topic>, mpsc::Sender<ClientMessage<T>>>,
    tasks: JoinSet<()>,
}

impl<T: Entity, S: BackingStore<T>> RequestLanes<T, S> {
    fn new(
        handler: ServerActionHandler<T, S>,
        conn: ConnectionHandle,
        stats: Arc<RwLock<ServerStats>>,
        addr: SocketAddr,
    ) -> Self {
        Self {
            handler,
            conn,
            stats,
            addr,
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Queue `request` behind earlier requests on its topic.
    ///
    /// Waits only while that topic's lane is full. Drops the request if the
    /// connection closes meanwhile.
    async fn dispatch(&mut self, mut request: ClientMessage<T>) {
        let key = request.topic().cloned();
        loop {
            let live = self.lanes.get(&key).filter(|s| !s.is_closed()).cloned();
            let sender = match live {
                Some(sender) => sender,
                None => self.open(key.clone()),
            };
            tokio::select! {
                sent = sender.send(request) => match sent {
                    Ok(()) => return,
                    // Lane went idle after the lookup; open a fresh one.
                    Err(mpsc::error::SendError(returned)) => request = returned,
                },
                _ = self.conn.closed() => return,
            }
        }
    }

    fn open(&mut self, key: Option<Topic>) -> mpsc::Sender<ClientMessage<T>> {
        self.lanes.retain(|_, sender| !sender.is_closed());
        while self.tasks.try_join_next().is_some() {}

        let (sender, receiver) = mpsc::channel(LANE_CAPACITY);
        self.tasks.spawn(run_lane(
            self.handler.clone(),
            self.conn.clone(),
            self.stats.clone(),
            self.addr,
            receiver,
        ));
        self.lanes.insert(key, sender.clone());
        sender
    }

    /// Stop accepting requests and wait for every queued one to finish.
    async fn finish(mut self) {
        self.lanes.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("Request lane for {} failed: {e}", self.addr);
            }
        }
    }
}

async fn run_lane<T: Entity, S: BackingStore<T>>(
    handler: ServerActionHandler<T, S>,
    conn: ConnectionHandle,
    stats: Arc<RwLock<ServerStats>>,
    addr: SocketAddr,
    mut requests: mpsc::Receiver<ClientMessage<T>>,
) {
    loop {
        let request = match tokio::time::timeout(LANE_IDLE_TIMEOUT, requests.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(_) => {
                // Refuse new requests, then drain whatever is already queued.
                requests.close();
                continue;
            }
        };

        let reply = handler.handle(&conn, request).await;
        {
            let mut s = stats.write().await;
            s.total_requests += 1;
            if matches!(reply, ServerMessage::Rejected { .. }) {
                s.rejected_requests += 1;
            }
        }
        match reply.encode() {
            Ok(bytes) => {
                if conn.send(Bytes::from(bytes)).await.is_err() {
                    log::debug!("Reply to {addr} dropped: connection closed");
                }
            }
            Err(e) => log::error!("Failed to encode reply for {addr}: {e}"),
        }
    }
}

fn heartbeat(secs: u64) -> Option<Interval> {
    (secs > 0).then(|| {
        let period = Duration::from_secs(secs);
        interval_at(Instant::now() + period, period)
    })
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::Article;
    use std::collections::HashMap;

    type ArticleServer = SyncServer<Article, MemoryStore<Article>>;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.max_subscriptions_per_connection, 64);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.principal_header, "x-forwarded-user");
    }

    #[test]
    fn test_config_from_lookup() {
        let vars = HashMap::from([
            ("ROWCAST_BIND", "0.0.0.0:8080"),
            ("ROWCAST_OUTBOUND_CAPACITY", "32"),
            ("ROWCAST_HEARTBEAT_SECS", "not-a-number"),
            ("ROWCAST_PRINCIPAL_HEADER", "X-Remote-User"),
        ]);
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.outbound_capacity, 32);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.max_subscriptions_per_connection, 64);
        assert_eq!(config.principal_header, "x-remote-user");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server: ArticleServer = SyncServer::with_defaults(Arc::new(MemoryStore::new()));
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_requests, 0);
        assert_eq!(server.dispatch_stats(), DispatchStats::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_heartbeat_disabled() {
        assert!(heartbeat(0).is_none());
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let server: ArticleServer = SyncServer::with_defaults(Arc::new(MemoryStore::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let serving = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
                .unwrap();
            server
        });
        stop_tx.send(()).unwrap();

        let server = tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(server.registry().is_shut_down());
    }
}

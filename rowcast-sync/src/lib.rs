//! # rowcast-sync: Real-time synchronized collections
//!
//! Keeps server-side collections ("topics") synchronized with any number of
//! connected clients. Clients `Load`, `Insert`, `Update` and `Remove`; the
//! server applies each request to a backing store and pushes the resulting
//! change to every subscriber of the topic.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer           │
//! │ TopicMirror │     Binary Proto    │  ServerActionHandler │
//! └─────────────┘                     └──────────┬───────────┘
//!                                                │
//!                     ┌──────────────────────────┼──────────────────┐
//!                     ▼                          ▼                  ▼
//!              ┌─────────────┐          ┌────────────────┐   ┌──────────────┐
//!              │ translate() │ ───────► │ BackingStore   │   │ TopicRegistry│
//!              │ LoadOptions │          │ (MemoryStore)  │   │ gate/version │
//!              └─────────────┘          └────────────────┘   └──────┬───────┘
//!                                                                   │
//!                                                        ┌──────────┴─────────┐
//!                                                        │ BroadcastDispatcher│
//!                                                        │ (fan-out)          │
//!                                                        └────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Mutations on one topic commit and publish one at a time; every
//!   subscriber sees them in the same order, tagged with consecutive versions.
//! - A subscriber receives its `Loaded` before any mutation event of that
//!   topic.
//! - Topics never block each other.
//! - Failed requests are reported to the requester only and publish nothing.
//!
//! ## Modules
//!
//! - [`entity`]: The `Entity` capability trait and field values
//! - [`query`]: `LoadOptions` and their translation to store queries
//! - [`store`]: Backing store contract and in-memory adapter
//! - [`registry`]: Connections, topics and subscriptions
//! - [`broadcast`]: Per-topic fan-out with slow-subscriber eviction
//! - [`handler`]: Request execution and per-topic serialization
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue
//! - [`mirror`]: Client-side replica with gap detection

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod entity;
pub mod error;
pub mod handler;
pub mod mirror;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod server;
pub mod store;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use auth::{AllowAll, Authorizer, Principal};
pub use broadcast::{BroadcastDispatcher, DispatchStats, PublishReport};
pub use client::{ClientEvent, ConnectionState, OfflineQueue, SyncClient};
pub use entity::{Entity, FieldDef, FieldType, Schema, SequentialKey, Value};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use handler::ServerActionHandler;
pub use mirror::{MirrorError, TopicMirror};
pub use protocol::{ChangeEvent, ClientMessage, ProtocolError, RequestId, ServerMessage, Topic};
pub use query::{
    translate, FilterNode, FilterOp, LoadOptions, SortDirection, SortKey, StoreQuery,
};
pub use registry::{ConnectionHandle, ConnectionId, SubscriptionHandle, TopicRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{BackingStore, MemoryStore, Page, StoreError};

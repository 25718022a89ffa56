//! Logical request/push protocol between clients and the sync server.
//!
//! Messages are bincode-encoded (serde, standard config) and carried as
//! WebSocket binary frames:
//! ```text
//! Client ──► Server                       Server ──► Client
//! ┌─────────────────────────────┐         ┌──────────────────────────────────┐
//! │ Load   { id, topic, opts }  │         │ Event { topic, version, event }  │
//! │ Insert { id, topic, value } │         │   Loaded | Added | Updated |     │
//! │ Update { id, topic, k, p }  │         │   Removed                        │
//! │ Remove { id, topic, key }   │         │ Ack      { id }                  │
//! │ Unsubscribe { id, topic }   │         │ Rejected { id, kind, message }   │
//! │ Ping                        │         │ Pong                             │
//! └─────────────────────────────┘         └──────────────────────────────────┘
//! ```
//!
//! `version` is the topic's commit counter. Mutation events carry the
//! version they produced; `Loaded` carries the version its snapshot
//! reflects.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::entity::Entity;
use crate::error::ErrorKind;
use crate::query::LoadOptions;

/// Upper bound on bytes a decoded message may claim, matching the
/// WebSocket layer's default maximum message size.
pub const MAX_MESSAGE_BYTES: usize = 64 << 20;

/// Client-chosen correlation id for acks and rejections.
pub type RequestId = u64;

/// Identifier of one synchronized collection, e.g. `articles-of-project-42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Change pushed to subscribers of a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Entity")]
pub enum ChangeEvent<T: Entity> {
    /// Snapshot answering a `Load`; sent to the requester only.
    Loaded {
        items: Vec<T>,
        total_count: Option<u64>,
    },
    Added(T),
    Updated {
        key: T::Key,
        patch: T::Patch,
    },
    Removed(T::Key),
}

impl<T: Entity> ChangeEvent<T> {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeEvent::Loaded { .. } => "Loaded",
            ChangeEvent::Added(_) => "Added",
            ChangeEvent::Updated { .. } => "Updated",
            ChangeEvent::Removed(_) => "Removed",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, ChangeEvent::Loaded { .. })
    }
}

/// Request from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Entity")]
pub enum ClientMessage<T: Entity> {
    /// Subscribe (if not already) and receive a `Loaded` snapshot.
    Load {
        request_id: RequestId,
        topic: Topic,
        options: LoadOptions,
    },
    Insert {
        request_id: RequestId,
        topic: Topic,
        value: T,
    },
    Update {
        request_id: RequestId,
        topic: Topic,
        key: T::Key,
        patch: T::Patch,
    },
    Remove {
        request_id: RequestId,
        topic: Topic,
        key: T::Key,
    },
    Unsubscribe {
        request_id: RequestId,
        topic: Topic,
    },
    Ping,
}

impl<T: Entity> ClientMessage<T> {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Load { request_id, .. }
            | ClientMessage::Insert { request_id, .. }
            | ClientMessage::Update { request_id, .. }
            | ClientMessage::Remove { request_id, .. }
            | ClientMessage::Unsubscribe { request_id, .. } => Some(*request_id),
            ClientMessage::Ping => None,
        }
    }

    pub fn topic(&self) -> Option<&Topic> {
        match self {
            ClientMessage::Load { topic, .. }
            | ClientMessage::Insert { topic, .. }
            | ClientMessage::Update { topic, .. }
            | ClientMessage::Remove { topic, .. }
            | ClientMessage::Unsubscribe { topic, .. } => Some(topic),
            ClientMessage::Ping => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Push or reply from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Entity")]
pub enum ServerMessage<T: Entity> {
    Event {
        topic: Topic,
        version: u64,
        event: ChangeEvent<T>,
    },
    Ack {
        request_id: RequestId,
    },
    Rejected {
        request_id: RequestId,
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

impl<T: Entity> ServerMessage<T> {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Encode any protocol value to its binary wire format.
pub fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode a protocol value from its binary wire format.
///
/// Fails on messages claiming more than [`MAX_MESSAGE_BYTES`] and on filter
/// trees nested deeper than [`MAX_FILTER_DEPTH`](crate::query::MAX_FILTER_DEPTH).
pub fn decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<M, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_MESSAGE_BYTES>();
    let (msg, _) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// Codec and transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),
}

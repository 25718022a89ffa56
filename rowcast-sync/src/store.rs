//! Backing store contract and an in-memory reference adapter.
//!
//! The sync core only talks to persistence through [`BackingStore`]. The
//! store owns durability, key uniqueness and schema validation; the core
//! owns ordering and fan-out.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::entity::{Entity, SequentialKey, Value};
use crate::protocol::Topic;
use crate::query::{SortDirection, StoreQuery};

/// Adapter failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no row with key {0}")]
    NotFound(String),

    #[error("duplicate key {0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unavailable(String),
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching rows before paging, when the query asked for it.
    pub total_count: Option<u64>,
}

/// Narrow read/write contract with the persistence layer.
///
/// Implementations must leave no partial state behind when they return an
/// error.
#[async_trait]
pub trait BackingStore<T: Entity>: Send + Sync + 'static {
    async fn query(&self, topic: &Topic, query: &StoreQuery) -> Result<Page<T>, StoreError>;

    /// Insert `value`, assigning a key if it has none. Returns the stored row.
    async fn insert(&self, topic: &Topic, value: T) -> Result<T, StoreError>;

    /// Apply `patch` to the row at `key`. Returns the updated row.
    async fn update(&self, topic: &Topic, key: &T::Key, patch: &T::Patch) -> Result<T, StoreError>;

    async fn remove(&self, topic: &Topic, key: &T::Key) -> Result<(), StoreError>;
}

type Validator<T> = Box<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

struct Collection<T: Entity> {
    rows: BTreeMap<T::Key, T>,
    next_seq: u64,
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_seq: 1,
        }
    }
}

/// In-memory [`BackingStore`]: one ordered map per topic.
///
/// Keys are generated from a per-topic sequence starting at 1. An optional
/// validator stands in for store-defined schema constraints.
pub struct MemoryStore<T: Entity> {
    topics: RwLock<HashMap<Topic, Collection<T>>>,
    validator: Option<Validator<T>>,
    available: AtomicBool,
}

impl<T: Entity> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            validator: None,
            available: AtomicBool::new(true),
        }
    }

    /// Reject rows for which `validator` returns an error.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Simulate an outage: every call fails with `Unavailable` while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// All rows of a topic in key order.
    pub async fn rows(&self, topic: &Topic) -> Vec<T> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|c| c.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, topic: &Topic) -> usize {
        self.topics.read().await.get(topic).map_or(0, |c| c.rows.len())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn validate(&self, row: &T) -> Result<(), StoreError> {
        match &self.validator {
            Some(validate) => validate(row).map_err(StoreError::Validation),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<T> BackingStore<T> for MemoryStore<T>
where
    T: Entity,
    T::Key: SequentialKey,
{
    async fn query(&self, topic: &Topic, query: &StoreQuery) -> Result<Page<T>, StoreError> {
        self.check_available()?;
        let topics = self.topics.read().await;
        let Some(collection) = topics.get(topic) else {
            return Ok(Page {
                items: Vec::new(),
                total_count: query.count_total.then_some(0),
            });
        };

        // Rows come out in key order, and the sort is stable, so ties
        // break on key.
        let mut matched: Vec<&T> = collection
            .rows
            .values()
            .filter(|row| query.filter.as_ref().map_or(true, |p| p.matches(*row)))
            .collect();

        if !query.order.is_empty() {
            matched.sort_by(|a, b| {
                for term in &query.order {
                    let left = a.field(term.field).unwrap_or(Value::Null);
                    let right = b.field(term.field).unwrap_or(Value::Null);
                    let ord = match term.direction {
                        SortDirection::Asc => left.sort_cmp(&right),
                        SortDirection::Desc => right.sort_cmp(&left),
                    };
                    if ord.is_ne() {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let total_count = query.count_total.then_some(matched.len() as u64);
        let items = matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(Page { items, total_count })
    }

    async fn insert(&self, topic: &Topic, mut value: T) -> Result<T, StoreError> {
        self.check_available()?;
        self.validate(&value)?;

        let mut topics = self.topics.write().await;
        let collection = topics.entry(topic.clone()).or_default();

        let key = match value.key() {
            Some(key) => {
                if collection.rows.contains_key(&key) {
                    return Err(StoreError::Conflict(format!("{key:?}")));
                }
                key
            }
            None => loop {
                let Some(candidate) = T::Key::from_sequence(collection.next_seq) else {
                    return Err(StoreError::Validation(format!(
                        "key space of topic {topic} is exhausted"
                    )));
                };
                collection.next_seq += 1;
                if !collection.rows.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        value.set_key(key.clone());
        collection.rows.insert(key, value.clone());
        Ok(value)
    }

    async fn update(&self, topic: &Topic, key: &T::Key, patch: &T::Patch) -> Result<T, StoreError> {
        self.check_available()?;
        let mut topics = self.topics.write().await;
        let row = topics
            .get_mut(topic)
            .and_then(|c| c.rows.get_mut(key))
            .ok_or_else(|| StoreError::NotFound(format!("{key:?}")))?;

        let mut updated = row.clone();
        updated.apply_patch(patch);
        self.validate(&updated)?;
        *row = updated.clone();
        Ok(updated)
    }

    async fn remove(&self, topic: &Topic, key: &T::Key) -> Result<(), StoreError> {
        self.check_available()?;
        let mut topics = self.topics.write().await;
        topics
            .get_mut(topic)
            .and_then(|c| c.rows.remove(key))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{key:?}")))
    }
}

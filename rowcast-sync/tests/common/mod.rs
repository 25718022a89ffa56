//! Article entity and a store with a held topic, shared by the integration
//! tests and benchmarks.

#![allow(dead_code)]

use async_trait::async_trait;
use rowcast_sync::{
    BackingStore, Entity, FieldDef, FieldType, MemoryStore, Page, Schema, StoreError, StoreQuery,
    Topic, Value,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

static ARTICLE_SCHEMA: Schema = Schema::new(&[
    FieldDef::new("id", FieldType::Int),
    FieldDef::new("name", FieldType::Text),
    FieldDef::new("price", FieldType::Float),
    FieldDef::nullable("category", FieldType::Text),
]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: Option<u64>,
    pub name: String,
    pub price: f64,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticlePatch {
    pub name: Option<String>,
    pub price: Option<f64>,
}

impl Article {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            price: 0.0,
            category: None,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn priced(mut self, price: f64) -> Self {
        self.price = price;
        self
    }
}

impl ArticlePatch {
    pub fn name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

impl Entity for Article {
    type Key = u64;
    type Patch = ArticlePatch;

    fn schema() -> &'static Schema {
        &ARTICLE_SCHEMA
    }

    fn key(&self) -> Option<u64> {
        self.id
    }

    fn set_key(&mut self, key: u64) {
        self.id = Some(key);
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(self.id.into()),
            "name" => Some(self.name.as_str().into()),
            "price" => Some(self.price.into()),
            "category" => Some(self.category.clone().into()),
            _ => None,
        }
    }

    fn apply_patch(&mut self, patch: &ArticlePatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(price) = patch.price {
            self.price = price;
        }
    }
}

/// Memory store whose inserts on `held` wait for a permit.
pub struct HeldStore {
    pub inner: MemoryStore<Article>,
    pub held: Topic,
    pub permits: Semaphore,
}

impl HeldStore {
    pub fn new(held: &str) -> Self {
        Self {
            inner: MemoryStore::new(),
            held: Topic::from(held),
            permits: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl BackingStore<Article> for HeldStore {
    async fn query(&self, topic: &Topic, query: &StoreQuery) -> Result<Page<Article>, StoreError> {
        self.inner.query(topic, query).await
    }

    async fn insert(&self, topic: &Topic, value: Article) -> Result<Article, StoreError> {
        if *topic == self.held {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            permit.forget();
        }
        self.inner.insert(topic, value).await
    }

    async fn update(
        &self,
        topic: &Topic,
        key: &u64,
        patch: &ArticlePatch,
    ) -> Result<Article, StoreError> {
        self.inner.update(topic, key, patch).await
    }

    async fn remove(&self, topic: &Topic, key: &u64) -> Result<(), StoreError> {
        self.inner.remove(topic, key).await
    }
}

//! Shared fixtures for unit tests.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, FieldDef, FieldType, Schema, Value};

static ARTICLE_SCHEMA: Schema = Schema::new(&[
    FieldDef::new("id", FieldType::Int),
    FieldDef::new("name", FieldType::Text),
    FieldDef::new("price", FieldType::Float),
    FieldDef::new("in_stock", FieldType::Bool),
    FieldDef::nullable("category", FieldType::Text),
]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: Option<u64>,
    pub name: String,
    pub price: f64,
    pub in_stock: bool,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticlePatch {
    pub name: Option<String>,
    pub price: Option<f64>,
    pub in_stock: Option<bool>,
}

impl Article {
    pub fn new(name: &str, price: f64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            price,
            in_stock: true,
            category: None,
        }
    }

    pub fn in_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
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
            "in_stock" => Some(self.in_stock.into()),
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
        if let Some(in_stock) = patch.in_stock {
            self.in_stock = in_stock;
        }
    }
}

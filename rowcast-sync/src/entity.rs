//! Entity capability trait and the dynamic field values used by queries.
//!
//! The sync core never inspects an entity beyond what [`Entity`] exposes:
//! a stable key, a patch type, and named field access for filtering and
//! sorting. Any row type can take part by implementing the trait.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::Hash;
use uuid::Uuid;

/// Declared type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Text,
}

impl FieldType {
    /// Whether ordering comparisons (`<`, `>=`, ...) make sense.
    pub fn is_ordered(self) -> bool {
        !matches!(self, FieldType::Bool)
    }

    /// Whether substring operators apply.
    pub fn is_text(self) -> bool {
        matches!(self, FieldType::Text)
    }
}

/// A single field in an entity schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: FieldType,
    pub nullable: bool,
}

impl FieldDef {
    pub const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
        }
    }

    pub const fn nullable(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
        }
    }
}

/// Static description of the fields a client may filter, sort and group on.
#[derive(Debug)]
pub struct Schema {
    fields: &'static [FieldDef],
}

impl Schema {
    pub const fn new(fields: &'static [FieldDef]) -> Self {
        Self { fields }
    }

    /// Look up a field by name (case-sensitive).
    pub fn field(&self, name: &str) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &'static [FieldDef] {
        self.fields
    }
}

/// A dynamically typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Whether this value may be compared against a field of type `ty`.
    ///
    /// Integers are accepted for float fields.
    pub fn fits(&self, ty: FieldType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Bool(_), FieldType::Bool)
                | (Value::Int(_), FieldType::Int)
                | (Value::Int(_), FieldType::Float)
                | (Value::Float(_), FieldType::Float)
                | (Value::Text(_), FieldType::Text)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Total order used for sorting. `Null` sorts first; values of
    /// incomparable types fall back to a fixed type rank.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        self.partial_cmp_value(other)
            .unwrap_or_else(|| self.rank().cmp(&other.rank()))
    }

    /// Comparison between two non-null values of compatible types.
    pub fn partial_cmp_value(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Keys a store can generate from a per-topic sequence number.
///
/// Returns `None` once `seq` no longer fits the key type.
pub trait SequentialKey: Sized {
    fn from_sequence(seq: u64) -> Option<Self>;
}

impl SequentialKey for u64 {
    fn from_sequence(seq: u64) -> Option<Self> {
        Some(seq)
    }
}

impl SequentialKey for i64 {
    fn from_sequence(seq: u64) -> Option<Self> {
        i64::try_from(seq).ok()
    }
}

impl SequentialKey for u32 {
    fn from_sequence(seq: u64) -> Option<Self> {
        u32::try_from(seq).ok()
    }
}

impl SequentialKey for Uuid {
    fn from_sequence(_seq: u64) -> Option<Self> {
        Some(Uuid::new_v4())
    }
}

/// A row type that can be synchronized.
///
/// `Key` is assigned once (by the client or the store) and never changes.
/// `Patch` is a partial set of field values applied by `Update`.
pub trait Entity:
    Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Key: Debug + Clone + Eq + Hash + Ord + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Patch: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Fields visible to load options.
    fn schema() -> &'static Schema;

    /// The key, or `None` if the store has not assigned one yet.
    fn key(&self) -> Option<Self::Key>;

    fn set_key(&mut self, key: Self::Key);

    /// Current value of a schema field. `None` for unknown names.
    fn field(&self, name: &str) -> Option<Value>;

    fn apply_patch(&mut self, patch: &Self::Patch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Article;

    #[test]
    fn test_value_fits_declared_type() {
        assert!(Value::Int(3).fits(FieldType::Float));
        assert!(!Value::Float(3.0).fits(FieldType::Int));
        assert!(Value::Null.fits(FieldType::Text));
        assert!(!Value::Text("x".into()).fits(FieldType::Bool));
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(Value::Int(2).sort_cmp(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(Value::Null.sort_cmp(&Value::Int(-100)), Ordering::Less);
        assert_eq!(
            Value::from("Ring B").sort_cmp(&Value::from("Ring A")),
            Ordering::Greater
        );
        assert!(Value::Bool(true).partial_cmp_value(&Value::Int(1)).is_none());
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_schema_lookup() {
        let schema = Article::schema();
        assert_eq!(schema.field("price").map(|f| f.ty), Some(FieldType::Float));
        assert!(schema.field("Price").is_none());
        assert!(schema.fields().len() >= 3);
    }

    #[test]
    fn test_sequential_keys() {
        assert_eq!(u64::from_sequence(7), Some(7));
        assert_ne!(Uuid::from_sequence(1), Uuid::from_sequence(1));
        assert_eq!(u32::from_sequence(u64::from(u32::MAX)), Some(u32::MAX));
    }

    #[test]
    fn test_sequential_keys_do_not_wrap() {
        assert_eq!(u32::from_sequence(u64::from(u32::MAX) + 1), None);
        assert_eq!(i64::from_sequence(i64::MAX as u64 + 1), None);
        assert_eq!(i64::from_sequence(42), Some(42));
    }
}

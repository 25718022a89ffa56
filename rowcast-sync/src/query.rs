//! Load options and their translation into store queries.
//!
//! Clients describe what they want to see with [`LoadOptions`]: paging,
//! sort keys, a filter tree and group keys. [`translate`] validates the
//! options against the entity [`Schema`](crate::entity::Schema) and builds a
//! [`StoreQuery`] for the backing store. Translation is pure; evaluation of
//! the filter happens in the store.
//!
//! ```text
//! LoadOptions ──translate::<T>()──► StoreQuery ──BackingStore::query()──► Page<T>
//!   (untrusted, by name)              (validated, &'static field names)
//! ```

use std::cell::Cell;

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::entity::{Entity, FieldDef, Value};
use crate::error::{SyncError, SyncResult};

/// Deepest filter tree accepted, counting a lone condition as depth 1.
///
/// Decoding, translation and evaluation all recurse per level; the bound
/// keeps them well inside a worker thread's stack.
pub const MAX_FILTER_DEPTH: usize = 128;

/// Sort direction for a single key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Comparison operator of a filter condition.
///
/// Every operator has a negated counterpart, which is how NOT is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
}

impl FilterOp {
    pub fn negate(self) -> Self {
        match self {
            FilterOp::Eq => FilterOp::NotEq,
            FilterOp::NotEq => FilterOp::Eq,
            FilterOp::Gt => FilterOp::Le,
            FilterOp::Le => FilterOp::Gt,
            FilterOp::Lt => FilterOp::Ge,
            FilterOp::Ge => FilterOp::Lt,
            FilterOp::Contains => FilterOp::NotContains,
            FilterOp::NotContains => FilterOp::Contains,
            FilterOp::StartsWith => FilterOp::NotStartsWith,
            FilterOp::NotStartsWith => FilterOp::StartsWith,
            FilterOp::EndsWith => FilterOp::NotEndsWith,
            FilterOp::NotEndsWith => FilterOp::EndsWith,
        }
    }

    fn is_ordering(self) -> bool {
        matches!(self, FilterOp::Gt | FilterOp::Ge | FilterOp::Lt | FilterOp::Le)
    }

    fn is_substring(self) -> bool {
        matches!(
            self,
            FilterOp::Contains
                | FilterOp::NotContains
                | FilterOp::StartsWith
                | FilterOp::NotStartsWith
                | FilterOp::EndsWith
                | FilterOp::NotEndsWith
        )
    }
}

/// Filter expression tree as sent by the client.
///
/// Deserialization fails for trees deeper than [`MAX_FILTER_DEPTH`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FilterNode {
    Condition {
        field: String,
        op: FilterOp,
        value: Value,
    },
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
}

impl FilterNode {
    pub fn condition(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        FilterNode::Condition {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::condition(field, FilterOp::Eq, value)
    }

    /// Logical NOT, pushed down to the leaves (De Morgan).
    pub fn negate(self) -> Self {
        match self {
            FilterNode::Condition { field, op, value } => FilterNode::Condition {
                field,
                op: op.negate(),
                value,
            },
            FilterNode::And(children) => {
                FilterNode::Or(children.into_iter().map(FilterNode::negate).collect())
            }
            FilterNode::Or(children) => {
                FilterNode::And(children.into_iter().map(FilterNode::negate).collect())
            }
        }
    }
}

/// Wire shape of [`FilterNode`]; children go back through the depth check.
#[derive(Deserialize)]
#[serde(rename = "FilterNode")]
enum FilterNodeRepr {
    Condition {
        field: String,
        op: FilterOp,
        value: Value,
    },
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
}

thread_local! {
    static DECODE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// One level of filter nesting on the current thread's decode stack.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        DECODE_DEPTH.with(|depth| {
            if depth.get() >= MAX_FILTER_DEPTH {
                None
            } else {
                depth.set(depth.get() + 1);
                Some(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DECODE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

impl<'de> Deserialize<'de> for FilterNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let _level = DepthGuard::enter().ok_or_else(|| {
            de::Error::custom(format!("filter nested deeper than {MAX_FILTER_DEPTH} levels"))
        })?;
        Ok(match FilterNodeRepr::deserialize(deserializer)? {
            FilterNodeRepr::Condition { field, op, value } => {
                FilterNode::Condition { field, op, value }
            }
            FilterNodeRepr::And(children) => FilterNode::And(children),
            FilterNodeRepr::Or(children) => FilterNode::Or(children),
        })
    }
}

/// Nesting depth of a filter tree, walked without recursion.
fn filter_depth(root: &FilterNode) -> usize {
    let mut deepest = 0;
    let mut pending = vec![(root, 1)];
    while let Some((node, depth)) = pending.pop() {
        deepest = deepest.max(depth);
        if let FilterNode::And(children) | FilterNode::Or(children) = node {
            pending.extend(children.iter().map(|child| (child, depth + 1)));
        }
    }
    deepest
}

/// Client-specified paging, sorting, filtering and grouping.
///
/// The default value means unfiltered, unpaged, default (key) order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadOptions {
    pub skip: Option<i64>,
    pub take: Option<i64>,
    pub sort: Vec<SortKey>,
    pub filter: Option<FilterNode>,
    pub group: Vec<String>,
    pub require_total_count: bool,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(mut self, n: i64) -> Self {
        self.skip = Some(n);
        self
    }

    pub fn take(mut self, n: i64) -> Self {
        self.take = Some(n);
        self
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn filter(mut self, node: FilterNode) -> Self {
        self.filter = Some(node);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group.push(field.into());
        self
    }

    pub fn with_total_count(mut self) -> Self {
        self.require_total_count = true;
        self
    }
}

/// One validated ordering term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub field: &'static str,
    pub direction: SortDirection,
}

/// Validated filter, ready for evaluation by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        field: &'static str,
        op: FilterOp,
        value: Value,
    },
    /// Conjunction; empty means `true`.
    All(Vec<Predicate>),
    /// Disjunction; empty means `false`.
    Any(Vec<Predicate>),
}

impl Predicate {
    /// Evaluate against an entity, short-circuiting groups.
    pub fn matches<T: Entity>(&self, entity: &T) -> bool {
        match self {
            Predicate::All(children) => children.iter().all(|p| p.matches(entity)),
            Predicate::Any(children) => children.iter().any(|p| p.matches(entity)),
            Predicate::Compare { field, op, value } => {
                let actual = entity.field(field).unwrap_or(Value::Null);
                compare(&actual, *op, value)
            }
        }
    }
}

fn compare(actual: &Value, op: FilterOp, expected: &Value) -> bool {
    use std::cmp::Ordering;

    match op {
        FilterOp::Eq => actual.partial_cmp_value(expected) == Some(Ordering::Equal),
        FilterOp::NotEq => actual.partial_cmp_value(expected) != Some(Ordering::Equal),
        FilterOp::Gt | FilterOp::Ge | FilterOp::Lt | FilterOp::Le => {
            if actual.is_null() || expected.is_null() {
                return false;
            }
            match actual.partial_cmp_value(expected) {
                Some(ord) => match op {
                    FilterOp::Gt => ord == Ordering::Greater,
                    FilterOp::Ge => ord != Ordering::Less,
                    FilterOp::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                },
                None => false,
            }
        }
        _ => {
            // Substring operators compare case-insensitively; a null field
            // never contains anything.
            let (Some(haystack), Some(needle)) = (actual.as_text(), expected.as_text()) else {
                return matches!(
                    op,
                    FilterOp::NotContains | FilterOp::NotStartsWith | FilterOp::NotEndsWith
                );
            };
            let haystack = haystack.to_lowercase();
            let needle = needle.to_lowercase();
            match op {
                FilterOp::Contains => haystack.contains(&needle),
                FilterOp::NotContains => !haystack.contains(&needle),
                FilterOp::StartsWith => haystack.starts_with(&needle),
                FilterOp::NotStartsWith => !haystack.starts_with(&needle),
                FilterOp::EndsWith => haystack.ends_with(&needle),
                _ => !haystack.ends_with(&needle),
            }
        }
    }
}

/// Query handed to a [`BackingStore`](crate::store::BackingStore).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreQuery {
    pub filter: Option<Predicate>,
    /// Group keys first, then sort keys. Ties break on entity key.
    pub order: Vec<OrderBy>,
    pub group: Vec<&'static str>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub count_total: bool,
}

/// Validate `options` against `T`'s schema and build a store query.
///
/// Filters deeper than [`MAX_FILTER_DEPTH`] are rejected, which also bounds
/// [`Predicate::matches`] on the result.
///
/// Duplicate sort fields: the last occurrence wins, at its own position.
/// Group keys order ahead of sort keys, ascending unless a sort key names
/// the same field.
pub fn translate<T: Entity>(options: &LoadOptions) -> SyncResult<StoreQuery> {
    let offset = non_negative("skip", options.skip)?.unwrap_or(0);
    let limit = non_negative("take", options.take)?;

    if let Some(root) = &options.filter {
        let depth = filter_depth(root);
        if depth > MAX_FILTER_DEPTH {
            return Err(SyncError::InvalidOptions(format!(
                "filter nested {depth} levels deep (max {MAX_FILTER_DEPTH})"
            )));
        }
    }
    let filter = options
        .filter
        .as_ref()
        .map(translate_filter::<T>)
        .transpose()?;

    let mut sort = Vec::with_capacity(options.sort.len());
    for (i, key) in options.sort.iter().enumerate() {
        let def = lookup::<T>(&key.field)?;
        let overridden = options.sort[i + 1..].iter().any(|k| k.field == key.field);
        if !overridden {
            sort.push(OrderBy {
                field: def.name,
                direction: key.direction,
            });
        }
    }

    let mut group: Vec<&'static str> = Vec::with_capacity(options.group.len());
    for name in &options.group {
        let def = lookup::<T>(name)?;
        if !group.contains(&def.name) {
            group.push(def.name);
        }
    }

    let mut order: Vec<OrderBy> = group
        .iter()
        .map(|&field| OrderBy {
            field,
            direction: sort
                .iter()
                .find(|o| o.field == field)
                .map_or(SortDirection::Asc, |o| o.direction),
        })
        .collect();
    order.extend(sort.into_iter().filter(|o| !group.contains(&o.field)));

    Ok(StoreQuery {
        filter,
        order,
        group,
        offset,
        limit,
        count_total: options.require_total_count,
    })
}

fn non_negative(name: &str, value: Option<i64>) -> SyncResult<Option<usize>> {
    match value {
        None => Ok(None),
        Some(v) if v < 0 => Err(SyncError::InvalidOptions(format!(
            "{name} must not be negative (got {v})"
        ))),
        Some(v) => usize::try_from(v)
            .map(Some)
            .map_err(|_| SyncError::InvalidOptions(format!("{name} out of range (got {v})"))),
    }
}

fn lookup<T: Entity>(name: &str) -> SyncResult<&'static FieldDef> {
    T::schema()
        .field(name)
        .ok_or_else(|| SyncError::InvalidOptions(format!("unknown field '{name}'")))
}

fn translate_filter<T: Entity>(node: &FilterNode) -> SyncResult<Predicate> {
    match node {
        FilterNode::And(children) => Ok(Predicate::All(
            children
                .iter()
                .map(translate_filter::<T>)
                .collect::<SyncResult<_>>()?,
        )),
        FilterNode::Or(children) => Ok(Predicate::Any(
            children
                .iter()
                .map(translate_filter::<T>)
                .collect::<SyncResult<_>>()?,
        )),
        FilterNode::Condition { field, op, value } => {
            let def = lookup::<T>(field)?;
            if op.is_ordering() && !def.ty.is_ordered() {
                return Err(SyncError::InvalidOptions(format!(
                    "operator {op:?} is not supported for {:?} field '{field}'",
                    def.ty
                )));
            }
            if op.is_substring() && !def.ty.is_text() {
                return Err(SyncError::InvalidOptions(format!(
                    "operator {op:?} is not supported for {:?} field '{field}'",
                    def.ty
                )));
            }
            if value.is_null() && !matches!(op, FilterOp::Eq | FilterOp::NotEq) {
                return Err(SyncError::InvalidOptions(format!(
                    "operator {op:?} on '{field}' needs a non-null value"
                )));
            }
            if !value.fits(def.ty) {
                return Err(SyncError::InvalidOptions(format!(
                    "value {value:?} does not match {:?} field '{field}'",
                    def.ty
                )));
            }
            Ok(Predicate::Compare {
                field: def.name,
                op: *op,
                value: value.clone(),
            })
        }
    }
}

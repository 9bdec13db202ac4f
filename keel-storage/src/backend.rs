//! The storage contract the commit and snapshot services are written against.
//!
//! A backend is a key-ordered store of tables. Each table is addressed by a
//! string partition key plus an integer sort key, and may carry secondary
//! orderings (indexes) over the same partition sorted by another integer
//! attribute. The only write is a conditional put; atomicity of that put is
//! the whole concurrency story of the store.

use keel_core::BackendError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A stored item: an attribute map.
pub type Item = Map<String, Value>;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

// ============================================================================
// SCHEMA
// ============================================================================

/// A secondary ordering over a table's partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    /// Integer attribute the index sorts by
    pub sort_attribute: String,
}

/// Physical layout of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// String attribute holding the partition key
    pub partition_attribute: String,
    /// Integer attribute holding the primary sort key
    pub sort_attribute: String,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    /// Create a table schema without indexes.
    pub fn new(
        name: impl Into<String>,
        partition_attribute: impl Into<String>,
        sort_attribute: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            partition_attribute: partition_attribute.into(),
            sort_attribute: sort_attribute.into(),
            indexes: Vec::new(),
        }
    }

    /// Add a secondary ordering.
    pub fn with_index(mut self, name: impl Into<String>, sort_attribute: impl Into<String>) -> Self {
        self.indexes.push(IndexSchema {
            name: name.into(),
            sort_attribute: sort_attribute.into(),
        });
        self
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Sort attribute for a query: the index's when given, else the primary.
    pub fn sort_attribute_for(&self, index: Option<&str>) -> BackendResult<&str> {
        match index {
            None => Ok(&self.sort_attribute),
            Some(name) => self
                .index(name)
                .map(|i| i.sort_attribute.as_str())
                .ok_or_else(|| BackendError::IndexNotFound {
                    table: self.name.clone(),
                    index: name.to_string(),
                }),
        }
    }

    /// Extract the partition key of an item.
    pub fn partition_of<'a>(&self, item: &'a Item) -> BackendResult<&'a str> {
        item.get(&self.partition_attribute)
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::InvalidItem {
                table: self.name.clone(),
                reason: format!("missing string attribute {}", self.partition_attribute),
            })
    }

    /// Extract an integer sort attribute of an item.
    pub fn integer_of(&self, item: &Item, attribute: &str) -> BackendResult<i64> {
        item.get(attribute)
            .and_then(Value::as_i64)
            .ok_or_else(|| BackendError::InvalidItem {
                table: self.name.clone(),
                reason: format!("missing integer attribute {}", attribute),
            })
    }
}

// ============================================================================
// WRITES
// ============================================================================

/// Condition checked atomically with a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Write unconditionally, replacing any existing item
    Always,
    /// Write only if no item exists at the item's (partition, sort) key
    KeyAbsent,
}

/// Outcome of a conditional put that reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    PreconditionFailed,
}

// ============================================================================
// READS
// ============================================================================

/// Inclusive bounds on a sort attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortRange {
    pub min: i64,
    pub max: i64,
}

impl SortRange {
    /// Every sort key.
    pub const fn all() -> Self {
        Self {
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    /// Sort keys in `[min, max]`.
    pub const fn between(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    /// Sort keys `<= max`.
    pub const fn up_to(max: i64) -> Self {
        Self { min: i64::MIN, max }
    }

    /// Sort keys `>= min`.
    pub const fn at_least(min: i64) -> Self {
        Self { min, max: i64::MAX }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

/// Position to resume a scan after. Index values are not unique, so the
/// primary sort key breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageCursor {
    pub sort_key: i64,
    pub primary_sort_key: i64,
}

/// A range scan over one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub table: String,
    /// Secondary ordering to scan; `None` scans the primary key
    pub index: Option<String>,
    pub partition_key: String,
    pub range: SortRange,
    pub ascending: bool,
    /// Maximum items per page; `None` returns everything in one page
    pub limit: Option<usize>,
    pub start_after: Option<PageCursor>,
}

impl RangeQuery {
    /// Ascending scan of a partition's primary key.
    pub fn new(table: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            index: None,
            partition_key: partition_key.into(),
            range: SortRange::all(),
            ascending: true,
            limit: None,
            start_after: None,
        }
    }

    pub fn on_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn range(mut self, range: SortRange) -> Self {
        self.range = range;
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `cursor` lies strictly after `start_after` in scan order.
    pub fn is_past_start(&self, cursor: PageCursor) -> bool {
        match self.start_after {
            None => true,
            Some(start) if self.ascending => cursor > start,
            Some(start) => cursor < start,
        }
    }
}

/// One page of scan results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    /// Resume point; present only when more items remain
    pub next: Option<PageCursor>,
}

// ============================================================================
// STORAGE BACKEND TRAIT
// ============================================================================

/// Key-ordered persistent store.
///
/// Implementations must make `conditional_put` atomic with respect to every
/// other put on the same table. Nothing else is required for the append
/// protocol to be correct under concurrent writers.
pub trait StorageBackend: Send + Sync {
    /// Create a table and its secondary orderings.
    ///
    /// # Errors
    ///
    /// [`BackendError::TableAlreadyExists`] if the name is taken.
    fn create_table(&self, schema: &TableSchema) -> BackendResult<()>;

    /// Remove a table and every item in it.
    ///
    /// # Errors
    ///
    /// [`BackendError::TableNotFound`] if no such table exists.
    fn delete_table(&self, name: &str) -> BackendResult<()>;

    /// Names of all tables.
    fn list_tables(&self) -> BackendResult<Vec<String>>;

    /// Put an item if the precondition holds, atomically.
    fn conditional_put(
        &self,
        table: &str,
        item: Item,
        precondition: Precondition,
    ) -> BackendResult<PutOutcome>;

    /// Scan one partition in sort order, one page at a time.
    fn query_range(&self, query: &RangeQuery) -> BackendResult<Page>;

    /// The item with the greatest sort value `<= upper_bound`, if any.
    fn query_point_descending(
        &self,
        table: &str,
        index: Option<&str>,
        partition_key: &str,
        upper_bound: i64,
    ) -> BackendResult<Option<Item>> {
        let mut query = RangeQuery::new(table, partition_key)
            .range(SortRange::up_to(upper_bound))
            .descending()
            .limit(1);
        query.index = index.map(str::to_string);
        let page = self.query_range(&query)?;
        Ok(page.items.into_iter().next())
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<B> {
    fn create_table(&self, schema: &TableSchema) -> BackendResult<()> {
        (**self).create_table(schema)
    }

    fn delete_table(&self, name: &str) -> BackendResult<()> {
        (**self).delete_table(name)
    }

    fn list_tables(&self) -> BackendResult<Vec<String>> {
        (**self).list_tables()
    }

    fn conditional_put(
        &self,
        table: &str,
        item: Item,
        precondition: Precondition,
    ) -> BackendResult<PutOutcome> {
        (**self).conditional_put(table, item, precondition)
    }

    fn query_range(&self, query: &RangeQuery) -> BackendResult<Page> {
        (**self).query_range(query)
    }

    fn query_point_descending(
        &self,
        table: &str,
        index: Option<&str>,
        partition_key: &str,
        upper_bound: i64,
    ) -> BackendResult<Option<Item>> {
        (**self).query_point_descending(table, index, partition_key, upper_bound)
    }
}

//! In-memory storage backend for testing and development.

use keel_core::BackendError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use crate::backend::{
    BackendResult, Item, Page, PageCursor, Precondition, PutOutcome, RangeQuery, StorageBackend,
    TableSchema,
};

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    partitions: HashMap<String, MemoryPartition>,
}

/// Rows of one partition plus one ordering per secondary index, keyed by
/// `(index value, primary sort key)`.
#[derive(Debug, Default)]
struct MemoryPartition {
    rows: BTreeMap<i64, Item>,
    indexes: HashMap<String, BTreeSet<PageCursor>>,
}

impl MemoryPartition {
    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Scan bounds for `[low, high]` resuming strictly after `start_after`.
/// `None` when nothing can remain.
fn scan_bounds<K: Ord + Copy>(
    low: K,
    high: K,
    start_after: Option<K>,
    ascending: bool,
) -> Option<(Bound<K>, Bound<K>)> {
    if low > high {
        return None;
    }
    let mut bounds = (Bound::Included(low), Bound::Included(high));
    match start_after {
        Some(start) if ascending => {
            if start >= high {
                return None;
            }
            if start >= low {
                bounds.0 = Bound::Excluded(start);
            }
        }
        Some(start) => {
            if start <= low {
                return None;
            }
            if start <= high {
                bounds.1 = Bound::Excluded(start);
            }
        }
        None => {}
    }
    Some(bounds)
}

/// In-memory backend.
///
/// Tables live behind one `RwLock`; a conditional put holds the write lock
/// for its check and its insert, which is what makes it a compare-and-swap.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items stored in a table, across partitions.
    pub fn item_count(&self, table: &str) -> BackendResult<usize> {
        let tables = self.tables.read().map_err(|_| BackendError::LockPoisoned)?;
        let table = tables.get(table).ok_or_else(|| BackendError::TableNotFound {
            table: table.to_string(),
        })?;
        Ok(table.partitions.values().map(MemoryPartition::len).sum())
    }

    /// Drop every table.
    pub fn clear(&self) -> BackendResult<()> {
        self.tables
            .write()
            .map_err(|_| BackendError::LockPoisoned)?
            .clear();
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn create_table(&self, schema: &TableSchema) -> BackendResult<()> {
        let mut tables = self.tables.write().map_err(|_| BackendError::LockPoisoned)?;
        if tables.contains_key(&schema.name) {
            return Err(BackendError::TableAlreadyExists {
                table: schema.name.clone(),
            });
        }
        tables.insert(
            schema.name.clone(),
            MemoryTable {
                schema: schema.clone(),
                partitions: HashMap::new(),
            },
        );
        Ok(())
    }

    fn delete_table(&self, name: &str) -> BackendResult<()> {
        let mut tables = self.tables.write().map_err(|_| BackendError::LockPoisoned)?;
        tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::TableNotFound {
                table: name.to_string(),
            })
    }

    fn list_tables(&self) -> BackendResult<Vec<String>> {
        let tables = self.tables.read().map_err(|_| BackendError::LockPoisoned)?;
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn conditional_put(
        &self,
        table: &str,
        item: Item,
        precondition: Precondition,
    ) -> BackendResult<PutOutcome> {
        let mut tables = self.tables.write().map_err(|_| BackendError::LockPoisoned)?;
        let table = tables
            .get_mut(table)
            .ok_or_else(|| BackendError::TableNotFound {
                table: table.to_string(),
            })?;

        let partition = table.schema.partition_of(&item)?.to_string();
        let sort_key = table.schema.integer_of(&item, &table.schema.sort_attribute)?;
        let mut index_keys = Vec::with_capacity(table.schema.indexes.len());
        for index in &table.schema.indexes {
            index_keys.push((
                index.name.clone(),
                table.schema.integer_of(&item, &index.sort_attribute)?,
            ));
        }

        let rows = table.partitions.entry(partition).or_default();
        if let Some(previous) = rows.rows.get(&sort_key) {
            if precondition == Precondition::KeyAbsent {
                return Ok(PutOutcome::PreconditionFailed);
            }
            for index in &table.schema.indexes {
                let old = table.schema.integer_of(previous, &index.sort_attribute)?;
                if let Some(ordering) = rows.indexes.get_mut(&index.name) {
                    ordering.remove(&PageCursor {
                        sort_key: old,
                        primary_sort_key: sort_key,
                    });
                }
            }
        }

        for (name, value) in index_keys {
            rows.indexes.entry(name).or_default().insert(PageCursor {
                sort_key: value,
                primary_sort_key: sort_key,
            });
        }
        rows.rows.insert(sort_key, item);
        Ok(PutOutcome::Written)
    }

    fn query_range(&self, query: &RangeQuery) -> BackendResult<Page> {
        let tables = self.tables.read().map_err(|_| BackendError::LockPoisoned)?;
        let table = tables
            .get(&query.table)
            .ok_or_else(|| BackendError::TableNotFound {
                table: query.table.clone(),
            })?;
        table.schema.sort_attribute_for(query.index.as_deref())?;

        let Some(partition) = table.partitions.get(&query.partition_key) else {
            return Ok(Page::default());
        };
        let range = query.range;

        let scan: Box<dyn Iterator<Item = (PageCursor, &Item)> + '_> = match query.index.as_deref() {
            None => {
                let start = query.start_after.map(|c| c.primary_sort_key);
                let Some(bounds) = scan_bounds(range.min, range.max, start, query.ascending) else {
                    return Ok(Page::default());
                };
                let found = partition.rows.range(bounds).map(|(key, item)| {
                    let cursor = PageCursor {
                        sort_key: *key,
                        primary_sort_key: *key,
                    };
                    (cursor, item)
                });
                if query.ascending {
                    Box::new(found)
                } else {
                    Box::new(found.rev())
                }
            }
            Some(index) => {
                let Some(ordering) = partition.indexes.get(index) else {
                    return Ok(Page::default());
                };
                let low = PageCursor {
                    sort_key: range.min,
                    primary_sort_key: i64::MIN,
                };
                let high = PageCursor {
                    sort_key: range.max,
                    primary_sort_key: i64::MAX,
                };
                let Some(bounds) = scan_bounds(low, high, query.start_after, query.ascending) else {
                    return Ok(Page::default());
                };
                let found = ordering.range(bounds).filter_map(|cursor| {
                    partition
                        .rows
                        .get(&cursor.primary_sort_key)
                        .map(|item| (*cursor, item))
                });
                if query.ascending {
                    Box::new(found)
                } else {
                    Box::new(found.rev())
                }
            }
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        let mut remaining = scan.peekable();
        let mut page = Page::default();
        let mut last = None;
        while page.items.len() < limit {
            match remaining.next() {
                Some((cursor, item)) => {
                    page.items.push(item.clone());
                    last = Some(cursor);
                }
                None => break,
            }
        }
        if remaining.peek().is_some() {
            page.next = last;
        }
        Ok(page)
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::backend::SortRange;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Paging through a range with any page size yields exactly the items
        /// in range, in order, with no repeats.
        #[test]
        fn prop_paging_is_complete_and_ordered(
            keys in prop::collection::btree_set(-50i64..50, 0..40),
            min in -60i64..60,
            span in 0i64..80,
            page_size in 1usize..7,
            ascending in any::<bool>(),
        ) {
            let backend = InMemoryBackend::new();
            backend.create_table(&TableSchema::new("t", "pk", "seq")).unwrap();
            for key in &keys {
                let item = json!({"pk": "p", "seq": key}).as_object().cloned().unwrap_or_default();
                backend.conditional_put("t", item, Precondition::KeyAbsent).unwrap();
            }

            let range = SortRange::between(min, min + span);
            let mut query = RangeQuery::new("t", "p").range(range).limit(page_size);
            if !ascending {
                query = query.descending();
            }

            let mut seen = Vec::new();
            loop {
                let page = backend.query_range(&query).unwrap();
                prop_assert!(page.items.len() <= page_size);
                seen.extend(page.items.iter().map(|i| i["seq"].as_i64().unwrap()));
                match page.next {
                    Some(next) => query.start_after = Some(next),
                    None => break,
                }
            }

            let mut expected: Vec<i64> = keys.iter().copied().filter(|k| range.contains(*k)).collect();
            if !ascending {
                expected.reverse();
            }
            prop_assert_eq!(seen, expected);
        }
    }
}

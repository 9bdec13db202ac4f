//! LMDB binding for the storage contract.
//!
//! Uses the heed crate (Rust bindings for LMDB). Every table is one named
//! database keyed by `partition ++ sort`, and every secondary ordering is
//! another named database keyed by `partition ++ index value ++ sort` whose
//! value is the primary sort key. A catalog database records each table's
//! schema so tables survive a reopen.
//!
//! # Key encoding
//!
//! - Partition: big-endian `u32` length, then the UTF-8 bytes. The length
//!   prefix keeps `"ab" ++ ...` from interleaving with `"a" ++ ...`.
//! - Integers: big-endian with the sign bit flipped, so byte order is
//!   numeric order across negative and positive values.
//!
//! # Thread Safety
//!
//! LMDB admits one write transaction at a time. A conditional put does its
//! existence check and its writes inside a single write transaction, which
//! is what makes it atomic with respect to every other put.

use std::collections::HashMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use keel_core::BackendError;
use tracing::{debug, info};

use crate::backend::{
    BackendResult, Item, Page, PageCursor, Precondition, PutOutcome, RangeQuery, StorageBackend,
    TableSchema,
};

type RawDb = Database<Bytes, Bytes>;

const CATALOG_DB: &str = "__keel_catalog";
const SORT_KEY_LEN: usize = 8;

fn map_size_bytes(map_size_mb: usize) -> BackendResult<usize> {
    map_size_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| BackendError::Unavailable {
            reason: format!("map size of {} MB overflows the address space", map_size_mb),
        })
}

fn txn_err(e: heed::Error) -> BackendError {
    match e {
        heed::Error::Io(io) => BackendError::Io {
            reason: io.to_string(),
        },
        other => BackendError::TransactionFailed {
            reason: other.to_string(),
        },
    }
}

// ============================================================================
// KEY ENCODING
// ============================================================================

pub(crate) fn encode_partition(partition_key: &str) -> Vec<u8> {
    let bytes = partition_key.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len() + 2 * SORT_KEY_LEN);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

pub(crate) fn encode_sort(value: i64) -> [u8; SORT_KEY_LEN] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

pub(crate) fn decode_sort(bytes: &[u8]) -> BackendResult<i64> {
    let raw: [u8; SORT_KEY_LEN] =
        bytes
            .try_into()
            .map_err(|_| BackendError::TransactionFailed {
                reason: format!("corrupt sort key of {} bytes", bytes.len()),
            })?;
    Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
}

fn primary_key(partition: &[u8], sort_key: i64) -> Vec<u8> {
    let mut key = partition.to_vec();
    key.extend_from_slice(&encode_sort(sort_key));
    key
}

fn index_key(partition: &[u8], index_value: i64, sort_key: i64) -> Vec<u8> {
    let mut key = primary_key(partition, index_value);
    key.extend_from_slice(&encode_sort(sort_key));
    key
}

fn encode_item(table: &str, item: &Item) -> BackendResult<Vec<u8>> {
    serde_json::to_vec(item).map_err(|e| BackendError::InvalidItem {
        table: table.to_string(),
        reason: e.to_string(),
    })
}

fn decode_item(table: &str, bytes: &[u8]) -> BackendResult<Item> {
    serde_json::from_slice(bytes).map_err(|e| BackendError::InvalidItem {
        table: table.to_string(),
        reason: format!("stored item is not a JSON object: {}", e),
    })
}

// ============================================================================
// BACKEND
// ============================================================================

#[derive(Clone)]
struct OpenTable {
    schema: TableSchema,
    primary: RawDb,
    indexes: Vec<(String, RawDb)>,
}

impl OpenTable {
    fn index_db(&self, name: &str) -> BackendResult<RawDb> {
        self.indexes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, db)| *db)
            .ok_or_else(|| BackendError::IndexNotFound {
                table: self.schema.name.clone(),
                index: name.to_string(),
            })
    }
}

fn index_db_name(table: &str, index: &str) -> String {
    format!("{}#{}", table, index)
}

/// LMDB-backed storage.
pub struct LmdbBackend {
    env: Env,
    path: PathBuf,
    catalog: RawDb,
    tables: RwLock<HashMap<String, OpenTable>>,
}

impl std::fmt::Debug for LmdbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LmdbBackend {
    /// Open or create an environment at `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory holding the LMDB files; created if missing
    /// * `map_size_mb` - Maximum size of the memory map in megabytes
    /// * `max_tables` - Named databases the environment may hold, counting
    ///   the catalog and one per secondary ordering
    pub fn open<P: AsRef<Path>>(
        path: P,
        map_size_mb: usize,
        max_tables: u32,
    ) -> BackendResult<Self> {
        let map_size = map_size_bytes(map_size_mb)?;
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(|e| BackendError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;

        // SAFETY: the environment is opened once per backend and the files are
        // not modified by anything outside LMDB while it is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(max_tables)
                .open(&path)
        }
        .map_err(txn_err)?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let catalog: RawDb = env
            .create_database(&mut wtxn, Some(CATALOG_DB))
            .map_err(txn_err)?;

        let mut schemas = Vec::new();
        for entry in catalog.iter(&wtxn).map_err(txn_err)? {
            let (name, raw) = entry.map_err(txn_err)?;
            let schema: TableSchema =
                serde_json::from_slice(raw).map_err(|e| BackendError::TransactionFailed {
                    reason: format!(
                        "corrupt catalog entry {}: {}",
                        String::from_utf8_lossy(name),
                        e
                    ),
                })?;
            schemas.push(schema);
        }

        let mut tables = HashMap::new();
        for schema in schemas {
            let open = Self::open_table(&env, &mut wtxn, schema)?;
            tables.insert(open.schema.name.clone(), open);
        }
        wtxn.commit().map_err(txn_err)?;

        info!(path = %path.display(), tables = tables.len(), "Opened LMDB environment");

        Ok(Self {
            env,
            path,
            catalog,
            tables: RwLock::new(tables),
        })
    }

    /// Directory the environment lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_table(env: &Env, wtxn: &mut heed::RwTxn, schema: TableSchema) -> BackendResult<OpenTable> {
        let primary: RawDb = env
            .create_database(wtxn, Some(&schema.name))
            .map_err(txn_err)?;
        let mut indexes = Vec::with_capacity(schema.indexes.len());
        for index in &schema.indexes {
            let db: RawDb = env
                .create_database(wtxn, Some(&index_db_name(&schema.name, &index.name)))
                .map_err(txn_err)?;
            indexes.push((index.name.clone(), db));
        }
        Ok(OpenTable {
            schema,
            primary,
            indexes,
        })
    }

    fn table(&self, name: &str) -> BackendResult<OpenTable> {
        let tables = self.tables.read().map_err(|_| BackendError::LockPoisoned)?;
        tables
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::TableNotFound {
                table: name.to_string(),
            })
    }

    /// Scan bounds for a query, narrowed by its resume cursor.
    fn bounds(
        query: &RangeQuery,
        partition: &[u8],
    ) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let indexed = query.index.is_some();
        let key_at = |sort_key: i64, primary: i64| {
            if indexed {
                index_key(partition, sort_key, primary)
            } else {
                primary_key(partition, sort_key)
            }
        };

        let lo = key_at(query.range.min, i64::MIN);
        let hi = key_at(query.range.max, i64::MAX);
        let mut lower = Bound::Included(lo);
        let mut upper = Bound::Included(hi);

        if let Some(cursor) = query.start_after {
            let at = if indexed {
                key_at(cursor.sort_key, cursor.primary_sort_key)
            } else {
                key_at(cursor.primary_sort_key, 0)
            };
            if query.ascending {
                if matches!(&lower, Bound::Included(lo) if at >= *lo) {
                    lower = Bound::Excluded(at);
                }
            } else if matches!(&upper, Bound::Included(hi) if at <= *hi) {
                upper = Bound::Excluded(at);
            }
        }
        (lower, upper)
    }

    /// Position of an iterated key, for the resume cursor.
    fn cursor_of(key: &[u8], partition_len: usize, indexed: bool) -> BackendResult<PageCursor> {
        let first = decode_sort(&key[partition_len..partition_len + SORT_KEY_LEN])?;
        if indexed {
            let primary = decode_sort(&key[partition_len + SORT_KEY_LEN..])?;
            Ok(PageCursor {
                sort_key: first,
                primary_sort_key: primary,
            })
        } else {
            Ok(PageCursor {
                sort_key: first,
                primary_sort_key: first,
            })
        }
    }

    fn scan(
        &self,
        rtxn: &RoTxn,
        table: &OpenTable,
        query: &RangeQuery,
    ) -> BackendResult<Page> {
        let partition = encode_partition(&query.partition_key);
        let (db, indexed) = match &query.index {
            Some(name) => (table.index_db(name)?, true),
            None => (table.primary, false),
        };

        let (lower, upper) = Self::bounds(query, &partition);
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (
            lower.as_ref().map(Vec::as_slice),
            upper.as_ref().map(Vec::as_slice),
        );

        let expected_len = partition.len() + SORT_KEY_LEN * if indexed { 2 } else { 1 };
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut page = Page::default();
        let mut last = None;

        let iter: Box<dyn Iterator<Item = heed::Result<(&[u8], &[u8])>> + '_> = if query.ascending {
            Box::new(db.range(rtxn, &bounds).map_err(txn_err)?)
        } else {
            Box::new(db.rev_range(rtxn, &bounds).map_err(txn_err)?)
        };

        for entry in iter {
            let (key, value) = entry.map_err(txn_err)?;
            if key.len() != expected_len {
                return Err(BackendError::TransactionFailed {
                    reason: format!("unexpected key length {} in {}", key.len(), table.schema.name),
                });
            }
            if page.items.len() == limit {
                page.next = last;
                break;
            }

            let cursor = Self::cursor_of(key, partition.len(), indexed)?;
            let raw = if indexed {
                let primary = primary_key(&partition, decode_sort(value)?);
                table
                    .primary
                    .get(rtxn, &primary)
                    .map_err(txn_err)?
                    .ok_or_else(|| BackendError::TransactionFailed {
                        reason: format!("dangling index entry in {}", table.schema.name),
                    })?
            } else {
                value
            };
            page.items.push(decode_item(&table.schema.name, raw)?);
            last = Some(cursor);
        }
        Ok(page)
    }
}

impl StorageBackend for LmdbBackend {
    fn create_table(&self, schema: &TableSchema) -> BackendResult<()> {
        let mut tables = self.tables.write().map_err(|_| BackendError::LockPoisoned)?;
        if tables.contains_key(&schema.name) {
            return Err(BackendError::TableAlreadyExists {
                table: schema.name.clone(),
            });
        }

        let raw_schema = serde_json::to_vec(schema).map_err(|e| BackendError::InvalidItem {
            table: schema.name.clone(),
            reason: e.to_string(),
        })?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let open = Self::open_table(&self.env, &mut wtxn, schema.clone())?;
        self.catalog
            .put(&mut wtxn, schema.name.as_bytes(), &raw_schema)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        debug!(table = %schema.name, indexes = schema.indexes.len(), "Created table");
        tables.insert(schema.name.clone(), open);
        Ok(())
    }

    fn delete_table(&self, name: &str) -> BackendResult<()> {
        let mut tables = self.tables.write().map_err(|_| BackendError::LockPoisoned)?;
        let open = tables.get(name).ok_or_else(|| BackendError::TableNotFound {
            table: name.to_string(),
        })?;

        // LMDB cannot drop a named database through heed, so empty it instead.
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        open.primary.clear(&mut wtxn).map_err(txn_err)?;
        for (_, db) in &open.indexes {
            db.clear(&mut wtxn).map_err(txn_err)?;
        }
        self.catalog
            .delete(&mut wtxn, name.as_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        debug!(table = %name, "Deleted table");
        tables.remove(name);
        Ok(())
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
        let open = self.table(table)?;
        let schema = &open.schema;

        let partition = encode_partition(schema.partition_of(&item)?);
        let sort_key = schema.integer_of(&item, &schema.sort_attribute)?;
        let mut index_values = Vec::with_capacity(open.indexes.len());
        for (db, index) in open.indexes.iter().map(|(_, db)| db).zip(&schema.indexes) {
            index_values.push((*db, index, schema.integer_of(&item, &index.sort_attribute)?));
        }
        let key = primary_key(&partition, sort_key);
        let raw = encode_item(table, &item)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let existing = open
            .primary
            .get(&wtxn, &key)
            .map_err(txn_err)?
            .map(<[u8]>::to_vec);

        if let Some(existing) = existing {
            if precondition == Precondition::KeyAbsent {
                // Dropping the transaction aborts it.
                return Ok(PutOutcome::PreconditionFailed);
            }
            let previous = decode_item(table, &existing)?;
            for (db, index, _) in &index_values {
                let old_value = schema.integer_of(&previous, &index.sort_attribute)?;
                db.delete(&mut wtxn, &index_key(&partition, old_value, sort_key))
                    .map_err(txn_err)?;
            }
        }

        open.primary.put(&mut wtxn, &key, &raw).map_err(txn_err)?;
        for (db, _, value) in &index_values {
            db.put(
                &mut wtxn,
                &index_key(&partition, *value, sort_key),
                &encode_sort(sort_key),
            )
            .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(PutOutcome::Written)
    }

    fn query_range(&self, query: &RangeQuery) -> BackendResult<Page> {
        let open = self.table(&query.table)?;
        if query.range.is_empty() {
            // Still reject unknown indexes on an empty range.
            if let Some(index) = &query.index {
                open.index_db(index)?;
            }
            return Ok(Page::default());
        }
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.scan(&rtxn, &open, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SortRange;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(pk: &str, seq: i64, stamp: i64) -> Item {
        json!({"pk": pk, "seq": seq, "stamp": stamp})
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    fn schema() -> TableSchema {
        TableSchema::new("t", "pk", "seq").with_index("ByStamp", "stamp")
    }

    fn open(dir: &TempDir) -> LmdbBackend {
        LmdbBackend::open(dir.path(), 16, 8).unwrap()
    }

    fn seqs(page: &Page) -> Vec<i64> {
        page.items.iter().map(|i| i["seq"].as_i64().unwrap()).collect()
    }

    #[test]
    fn test_oversized_map_is_rejected_before_opening() {
        let dir = TempDir::new().unwrap();
        let err = LmdbBackend::open(dir.path().join("env"), usize::MAX, 8).unwrap_err();
        assert!(matches!(err, BackendError::Unavailable { .. }));
        assert!(!dir.path().join("env").exists());
    }

    #[test]
    fn test_sort_encoding_preserves_order() {
        let values = [i64::MIN, -1_000, -1, 0, 1, 42, 1_000, i64::MAX];
        for pair in values.windows(2) {
            assert!(encode_sort(pair[0]) < encode_sort(pair[1]));
        }
        for v in values {
            assert_eq!(decode_sort(&encode_sort(v)).unwrap(), v);
        }
        assert!(decode_sort(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_partition_prefix_is_unambiguous() {
        let a = primary_key(&encode_partition("a"), 1);
        let ab = encode_partition("ab");
        assert!(!a.starts_with(&ab));
        assert!(!ab.starts_with(&encode_partition("a")));
    }

    #[test]
    fn test_key_absent_precondition() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.create_table(&schema()).unwrap();

        assert_eq!(
            backend.conditional_put("t", item("p", 1, 10), Precondition::KeyAbsent).unwrap(),
            PutOutcome::Written
        );
        assert_eq!(
            backend.conditional_put("t", item("p", 1, 99), Precondition::KeyAbsent).unwrap(),
            PutOutcome::PreconditionFailed
        );
        let stored = backend.query_point_descending("t", None, "p", 1).unwrap().unwrap();
        assert_eq!(stored["stamp"], json!(10));
    }

    #[test]
    fn test_overwrite_moves_index_entry() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.create_table(&schema()).unwrap();

        backend.conditional_put("t", item("p", 1, 10), Precondition::Always).unwrap();
        backend.conditional_put("t", item("p", 1, 50), Precondition::Always).unwrap();

        let page = backend
            .query_range(&RangeQuery::new("t", "p").on_index("ByStamp"))
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["stamp"], json!(50));
    }

    #[test]
    fn test_index_scan_pages_in_order() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.create_table(&schema()).unwrap();
        for (seq, stamp) in [(1, 30), (2, 10), (3, 20), (4, 20), (5, -5)] {
            backend
                .conditional_put("t", item("p", seq, stamp), Precondition::KeyAbsent)
                .unwrap();
        }
        backend.conditional_put("t", item("other", 9, 15), Precondition::KeyAbsent).unwrap();

        let mut query = RangeQuery::new("t", "p")
            .on_index("ByStamp")
            .range(SortRange::between(0, 30))
            .limit(2);
        let mut seen = Vec::new();
        loop {
            let page = backend.query_range(&query).unwrap();
            seen.extend(seqs(&page));
            match page.next {
                Some(next) => query.start_after = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, vec![2, 3, 4, 1]);

        let newest = backend
            .query_point_descending("t", Some("ByStamp"), "p", 19)
            .unwrap()
            .unwrap();
        assert_eq!(newest["seq"], json!(2));
    }

    #[test]
    fn test_descending_primary_scan() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.create_table(&schema()).unwrap();
        for seq in 1..=5 {
            backend
                .conditional_put("t", item("p", seq, seq), Precondition::KeyAbsent)
                .unwrap();
        }

        let mut query = RangeQuery::new("t", "p").descending().limit(3);
        let first = backend.query_range(&query).unwrap();
        assert_eq!(seqs(&first), vec![5, 4, 3]);
        query.start_after = first.next;
        let second = backend.query_range(&query).unwrap();
        assert_eq!(seqs(&second), vec![2, 1]);
        assert!(second.next.is_none());
    }

    #[test]
    fn test_tables_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = open(&dir);
            backend.create_table(&schema()).unwrap();
            backend.conditional_put("t", item("p", 1, 10), Precondition::KeyAbsent).unwrap();
        }

        let backend = open(&dir);
        assert_eq!(backend.list_tables().unwrap(), vec!["t".to_string()]);
        let page = backend.query_range(&RangeQuery::new("t", "p")).unwrap();
        assert_eq!(seqs(&page), vec![1]);
    }

    #[test]
    fn test_delete_table_empties_it() {
        let dir = TempDir::new().unwrap();
        let backend = open(&dir);
        backend.create_table(&schema()).unwrap();
        backend.conditional_put("t", item("p", 1, 10), Precondition::KeyAbsent).unwrap();

        backend.delete_table("t").unwrap();
        assert!(backend.list_tables().unwrap().is_empty());
        assert!(matches!(
            backend.query_range(&RangeQuery::new("t", "p")),
            Err(BackendError::TableNotFound { .. })
        ));

        backend.create_table(&schema()).unwrap();
        let page = backend.query_range(&RangeQuery::new("t", "p")).unwrap();
        assert!(page.items.is_empty());
    }
}

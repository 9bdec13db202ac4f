//! Keel Storage - Storage Contract and Bindings
//!
//! Defines the key-ordered table abstraction the commit and snapshot services
//! are written against, plus two bindings: [`InMemoryBackend`] for tests and
//! development, and [`LmdbBackend`] for durable local storage.

pub mod backend;
pub mod lmdb;
pub mod memory;

pub use backend::{
    BackendResult, IndexSchema, Item, Page, PageCursor, Precondition, PutOutcome, RangeQuery,
    SortRange, StorageBackend, TableSchema,
};
pub use lmdb::LmdbBackend;
pub use memory::InMemoryBackend;

use keel_core::BackendConfig;
use std::sync::Arc;
use tracing::info;

/// Construct the backend a configuration names.
pub fn open_backend(config: &BackendConfig) -> BackendResult<Arc<dyn StorageBackend>> {
    match config {
        BackendConfig::Memory => {
            info!("Using in-memory storage backend");
            Ok(Arc::new(InMemoryBackend::new()))
        }
        BackendConfig::Lmdb {
            path,
            map_size_mb,
            max_tables,
        } => {
            let backend = LmdbBackend::open(path, *map_size_mb, *max_tables)?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory_backend() {
        let backend = open_backend(&BackendConfig::Memory).unwrap();
        assert!(backend.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_open_lmdb_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = open_backend(&BackendConfig::Lmdb {
            path: dir.path().join("store"),
            map_size_mb: 16,
            max_tables: 8,
        })
        .unwrap();
        backend
            .create_table(&TableSchema::new("t", "pk", "seq"))
            .unwrap();
        assert_eq!(backend.list_tables().unwrap(), vec!["t".to_string()]);
    }
}

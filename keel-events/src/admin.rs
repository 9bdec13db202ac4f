//! Provisioning and teardown of the commits and snapshots tables.

use std::sync::Arc;

use keel_core::{BackendError, EventStoreError, EventStoreResult, Operation, StoreConfig};
use keel_storage::{StorageBackend, TableSchema};
use tracing::{debug, info};

use crate::record::{commits_schema, snapshots_schema};

/// Creates and drops the two tables the store depends on.
///
/// Both operations are idempotent and check tables by name: an existing
/// table is never recreated, a missing one is never an error on drop.
pub struct PersistenceAdmin<B: StorageBackend + ?Sized> {
    backend: Arc<B>,
    commits_table: String,
    snapshots_table: String,
}

impl<B: StorageBackend + ?Sized> Clone for PersistenceAdmin<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            commits_table: self.commits_table.clone(),
            snapshots_table: self.snapshots_table.clone(),
        }
    }
}

impl<B: StorageBackend + ?Sized> PersistenceAdmin<B> {
    pub fn new(backend: Arc<B>, config: &StoreConfig) -> Self {
        Self {
            backend,
            commits_table: config.commits_table.clone(),
            snapshots_table: config.snapshots_table.clone(),
        }
    }

    /// Layout of the commits table: primary sort on `commit_sequence`, plus
    /// `RevisionIndex` and `CommitStampIndex`.
    pub fn commits_schema(&self) -> TableSchema {
        commits_schema(&self.commits_table)
    }

    /// Layout of the snapshots table: primary sort on `stream_revision`.
    pub fn snapshots_schema(&self) -> TableSchema {
        snapshots_schema(&self.snapshots_table)
    }

    fn schema_error(&self, operation: Operation, table: &str, source: BackendError) -> EventStoreError {
        EventStoreError::Schema {
            operation,
            table: table.to_string(),
            source,
        }
    }

    /// Ensure both tables exist.
    pub fn initialize(&self) -> EventStoreResult<()> {
        let existing = self
            .backend
            .list_tables()
            .map_err(|e| self.schema_error(Operation::Initialize, &self.commits_table, e))?;

        for schema in [self.commits_schema(), self.snapshots_schema()] {
            if existing.contains(&schema.name) {
                debug!(table = %schema.name, "Table already exists");
                continue;
            }
            match self.backend.create_table(&schema) {
                Ok(()) => info!(table = %schema.name, "Created table"),
                // Another process won the race; the table is there either way.
                Err(BackendError::TableAlreadyExists { .. }) => {
                    debug!(table = %schema.name, "Table created concurrently");
                }
                Err(e) => return Err(self.schema_error(Operation::Initialize, &schema.name, e)),
            }
        }
        Ok(())
    }

    /// Remove both tables and everything in them.
    pub fn drop_tables(&self) -> EventStoreResult<()> {
        let existing = self
            .backend
            .list_tables()
            .map_err(|e| self.schema_error(Operation::Drop, &self.commits_table, e))?;

        for table in [&self.commits_table, &self.snapshots_table] {
            if !existing.contains(table) {
                continue;
            }
            match self.backend.delete_table(table) {
                Ok(()) => info!(table = %table, "Dropped table"),
                Err(BackendError::TableNotFound { .. }) => {}
                Err(e) => return Err(self.schema_error(Operation::Drop, table, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_storage::InMemoryBackend;

    fn admin() -> (Arc<InMemoryBackend>, PersistenceAdmin<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let admin = PersistenceAdmin::new(Arc::clone(&backend), &StoreConfig::default());
        (backend, admin)
    }

    #[test]
    fn test_initialize_creates_both_tables() {
        let (backend, admin) = admin();
        admin.initialize().unwrap();
        assert_eq!(
            backend.list_tables().unwrap(),
            vec!["commits".to_string(), "snapshots".to_string()]
        );
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (backend, admin) = admin();
        admin.initialize().unwrap();
        backend
            .conditional_put(
                "snapshots",
                crate::record::snapshot_to_item(&keel_core::Snapshot::new("b", "s", 1, vec![1]))
                    .unwrap(),
                keel_storage::Precondition::KeyAbsent,
            )
            .unwrap();

        admin.initialize().unwrap();
        assert_eq!(backend.item_count("snapshots").unwrap(), 1);
    }

    #[test]
    fn test_initialize_creates_only_missing_table() {
        let (backend, admin) = admin();
        backend.create_table(&admin.commits_schema()).unwrap();
        admin.initialize().unwrap();
        assert_eq!(backend.list_tables().unwrap().len(), 2);
    }

    #[test]
    fn test_drop_is_idempotent() {
        let (backend, admin) = admin();
        admin.drop_tables().unwrap();
        admin.initialize().unwrap();
        admin.drop_tables().unwrap();
        admin.drop_tables().unwrap();
        assert!(backend.list_tables().unwrap().is_empty());
    }
}

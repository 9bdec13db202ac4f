//! SnapshotManager: write-once projections per stream revision.

use std::sync::Arc;

use keel_core::{
    partition_key, BackendError, EventStoreError, EventStoreResult, Headers, Operation, Snapshot,
    StoreConfig,
};
use keel_storage::{Precondition, PutOutcome, RangeQuery, SortRange, StorageBackend};
use tracing::debug;

use crate::record;

/// Snapshots read per backend call when looking one up.
const SCAN_PAGE: usize = 4;

/// Result of adding a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Added,
    /// A snapshot at this revision was already stored; it was left as is.
    AlreadyExists,
}

/// Stores and retrieves snapshots.
pub struct SnapshotManager<B: StorageBackend + ?Sized = dyn StorageBackend> {
    backend: Arc<B>,
    table: String,
}

impl<B: StorageBackend + ?Sized> Clone for SnapshotManager<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            table: self.table.clone(),
        }
    }
}

impl<B: StorageBackend + ?Sized> std::fmt::Debug for SnapshotManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + ?Sized> SnapshotManager<B> {
    pub fn new(backend: Arc<B>, config: &StoreConfig) -> Self {
        Self {
            backend,
            table: config.snapshots_table.clone(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn backend_error(
        operation: Operation,
        bucket_id: &str,
        stream_id: &str,
        source: BackendError,
    ) -> EventStoreError {
        EventStoreError::Backend {
            operation,
            bucket_id: bucket_id.to_string(),
            stream_id: stream_id.to_string(),
            source,
        }
    }

    /// The latest snapshot with `stream_revision <= max_revision`.
    ///
    /// `None` means replay from revision 0.
    pub fn get(
        &self,
        bucket_id: &str,
        stream_id: &str,
        max_revision: i64,
    ) -> EventStoreResult<Option<Snapshot>> {
        if max_revision < 0 {
            return Ok(None);
        }

        let decode_error = |source| EventStoreError::Decode {
            bucket_id: bucket_id.to_string(),
            stream_id: stream_id.to_string(),
            source,
        };

        let mut query = RangeQuery::new(&self.table, partition_key(bucket_id, stream_id))
            .range(SortRange::up_to(max_revision))
            .descending()
            .limit(SCAN_PAGE);
        loop {
            let page = self.backend.query_range(&query).map_err(|source| {
                Self::backend_error(Operation::GetSnapshot, bucket_id, stream_id, source)
            })?;
            for item in &page.items {
                // Skip snapshots of other streams sharing the partition key.
                if record::belongs_to(item, bucket_id, stream_id).map_err(decode_error)? {
                    return record::item_to_snapshot(item).map(Some).map_err(decode_error);
                }
            }
            match page.next {
                Some(cursor) => query.start_after = Some(cursor),
                None => return Ok(None),
            }
        }
    }

    /// The latest snapshot of a stream, if any.
    pub fn latest(&self, bucket_id: &str, stream_id: &str) -> EventStoreResult<Option<Snapshot>> {
        self.get(bucket_id, stream_id, i64::MAX)
    }

    /// Store a snapshot unless one already exists at its revision.
    ///
    /// `headers` are merged over the snapshot's own headers before writing.
    pub fn add(&self, snapshot: &Snapshot, headers: &Headers) -> EventStoreResult<SnapshotOutcome> {
        let mut stored = snapshot.clone();
        stored
            .headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        let item = record::snapshot_to_item(&stored)?;

        let written = self
            .backend
            .conditional_put(&self.table, item, Precondition::KeyAbsent)
            .map_err(|source| {
                Self::backend_error(
                    Operation::AddSnapshot,
                    &snapshot.bucket_id,
                    &snapshot.stream_id,
                    source,
                )
            })?;

        match written {
            PutOutcome::Written => {
                debug!(
                    bucket_id = %snapshot.bucket_id,
                    stream_id = %snapshot.stream_id,
                    stream_revision = snapshot.stream_revision,
                    bytes = snapshot.payload.len(),
                    "Added snapshot"
                );
                Ok(SnapshotOutcome::Added)
            }
            PutOutcome::PreconditionFailed => {
                debug!(
                    bucket_id = %snapshot.bucket_id,
                    stream_id = %snapshot.stream_id,
                    stream_revision = snapshot.stream_revision,
                    "Snapshot already exists"
                );
                Ok(SnapshotOutcome::AlreadyExists)
            }
        }
    }
}

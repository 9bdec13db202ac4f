//! EventStore: the three services bundled over one backend.

use std::sync::Arc;

use keel_core::{
    Clock, EventStoreResult, EventStream, Snapshot, StoreConfig, TopicRegistry,
};
use keel_storage::{open_backend, StorageBackend};
use tracing::debug;

use crate::admin::PersistenceAdmin;
use crate::commits::CommitSequencer;
use crate::snapshots::SnapshotManager;

/// Commit sequencer, snapshot manager, and admin sharing one backend and
/// one configuration.
pub struct EventStore<B: StorageBackend + ?Sized = dyn StorageBackend> {
    commits: CommitSequencer<B>,
    snapshots: SnapshotManager<B>,
    admin: PersistenceAdmin<B>,
}

impl<B: StorageBackend + ?Sized> Clone for EventStore<B> {
    fn clone(&self) -> Self {
        Self {
            commits: self.commits.clone(),
            snapshots: self.snapshots.clone(),
            admin: self.admin.clone(),
        }
    }
}

impl EventStore {
    /// Open the backend a configuration names and build a store over it.
    ///
    /// Tables are not created; call [`EventStore::initialize`].
    pub fn open(config: &StoreConfig, topics: TopicRegistry) -> EventStoreResult<Self> {
        config.validate()?;
        let backend = open_backend(&config.backend).map_err(|source| {
            keel_core::EventStoreError::Schema {
                operation: keel_core::Operation::Initialize,
                table: config.commits_table.clone(),
                source,
            }
        })?;
        Ok(Self::new(backend, config, topics))
    }
}

impl<B: StorageBackend + ?Sized> EventStore<B> {
    pub fn new(backend: Arc<B>, config: &StoreConfig, topics: TopicRegistry) -> Self {
        let topics = Arc::new(topics);
        Self {
            commits: CommitSequencer::new(Arc::clone(&backend), topics, config),
            snapshots: SnapshotManager::new(Arc::clone(&backend), config),
            admin: PersistenceAdmin::new(backend, config),
        }
    }

    /// Replace the clock used for commit stamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.commits = self.commits.with_clock(clock);
        self
    }

    pub fn commits(&self) -> &CommitSequencer<B> {
        &self.commits
    }

    pub fn snapshots(&self) -> &SnapshotManager<B> {
        &self.snapshots
    }

    pub fn admin(&self) -> &PersistenceAdmin<B> {
        &self.admin
    }

    /// Create the commits and snapshots tables if missing.
    pub fn initialize(&self) -> EventStoreResult<()> {
        self.admin.initialize()
    }

    /// Rebuild a stream holding the events with revisions in
    /// `[min_revision, max_revision]`.
    ///
    /// The stream's commit sequence is that of the last commit read in full.
    /// When `max_revision` cuts a commit, that commit's sequence is not
    /// claimed; the first append conflicts and the refreshed stream carries
    /// the rest of it.
    pub fn open_stream(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: i64,
        max_revision: i64,
    ) -> EventStoreResult<EventStream> {
        let min_revision = min_revision.max(0);
        let commits = self.commits_through(bucket_id, stream_id, min_revision, max_revision)?;
        debug!(
            bucket_id = %bucket_id,
            stream_id = %stream_id,
            commits = commits.len(),
            "Opened stream"
        );
        Ok(EventStream::new(bucket_id, stream_id).populate(
            min_revision.saturating_sub(1),
            max_revision,
            commits,
        ))
    }

    /// Rebuild a stream on top of a snapshot, replaying only what follows it.
    ///
    /// The commit holding the snapshot's revision is read too, so the
    /// stream's commit sequence is known even when nothing follows.
    pub fn open_stream_from_snapshot(
        &self,
        snapshot: &Snapshot,
        max_revision: i64,
    ) -> EventStoreResult<EventStream> {
        let commits = self.commits_through(
            &snapshot.bucket_id,
            &snapshot.stream_id,
            snapshot.stream_revision,
            max_revision,
        )?;
        Ok(EventStream::from_snapshot(snapshot).populate(
            snapshot.stream_revision,
            max_revision,
            commits,
        ))
    }

    /// The latest snapshot of a stream (if any) and the stream rebuilt to
    /// its head from that point.
    pub fn load_stream(
        &self,
        bucket_id: &str,
        stream_id: &str,
    ) -> EventStoreResult<(Option<Snapshot>, EventStream)> {
        match self.snapshots.latest(bucket_id, stream_id)? {
            Some(snapshot) => {
                let stream = self.open_stream_from_snapshot(&snapshot, i64::MAX)?;
                Ok((Some(snapshot), stream))
            }
            None => Ok((None, self.open_stream(bucket_id, stream_id, 0, i64::MAX)?)),
        }
    }

    /// Commits holding any revision in `[min_revision, max_revision]`,
    /// including one that straddles `max_revision`.
    fn commits_through(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: i64,
        max_revision: i64,
    ) -> EventStoreResult<Vec<keel_core::Commit>> {
        let mut commits = Vec::new();
        for commit in self.commits.get(bucket_id, stream_id, min_revision, i64::MAX) {
            let commit = commit?;
            if commit.first_revision() > max_revision {
                break;
            }
            commits.push(commit);
        }
        Ok(commits)
    }
}

//! CommitSequencer: optimistic-concurrency appends and ordered commit reads.
//!
//! # Append protocol
//!
//! ```text
//!   to_commit(seq + 1) ──► conditional_put(KeyAbsent)
//!                              │
//!              Written ◄───────┴──────► PreconditionFailed
//!                 │                           │
//!            Committed              detect_duplicate(commit_id)
//!                                      │              │
//!                                    same id       other id
//!                                      │              │
//!                                  Duplicate       Conflict
//! ```
//!
//! The sequencer allocates nothing and holds no lock across the write: the
//! caller's stream decides the sequence, and the backend's atomic put is the
//! only arbiter between concurrent writers.

use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::sync::Arc;

use chrono::SubsecRound;
use keel_core::{
    partition_key, BackendError, Clock, CodecError, Commit, CommitId, EventStoreError,
    EventStoreResult, EventStream, Operation, StoreConfig, SystemClock, Timestamp, TopicRegistry,
};
use keel_storage::{Item, Precondition, PutOutcome, RangeQuery, SortRange, StorageBackend};
use tracing::{debug, warn};

use crate::record::{self, COMMIT_STAMP_INDEX, REVISION_INDEX};

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of an append that reached the backend.
///
/// Every variant hands the stream back: advanced on success, refreshed from
/// storage otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// The commit was written by this call.
    Committed { commit: Commit, stream: EventStream },
    /// A commit with the same id already sits at this sequence; this call was
    /// a retry of a write that landed. Pending changes are cleared.
    Duplicate { stream: EventStream },
    /// Another writer holds this sequence. Pending changes are kept so the
    /// caller can re-validate them against the refreshed stream and retry.
    Conflict { stream: EventStream },
}

impl AppendOutcome {
    /// Whether the caller's events are durably stored, by this call or an
    /// earlier attempt with the same commit id.
    pub fn is_success(&self) -> bool {
        !self.is_conflict()
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, AppendOutcome::Committed { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppendOutcome::Conflict { .. })
    }

    /// The commit written by this call, if any.
    pub fn commit(&self) -> Option<&Commit> {
        match self {
            AppendOutcome::Committed { commit, .. } => Some(commit),
            _ => None,
        }
    }

    pub fn stream(&self) -> &EventStream {
        match self {
            AppendOutcome::Committed { stream, .. }
            | AppendOutcome::Duplicate { stream }
            | AppendOutcome::Conflict { stream } => stream,
        }
    }

    pub fn into_stream(self) -> EventStream {
        match self {
            AppendOutcome::Committed { stream, .. }
            | AppendOutcome::Duplicate { stream }
            | AppendOutcome::Conflict { stream } => stream,
        }
    }
}

// ============================================================================
// COMMIT SEQUENCER
// ============================================================================

/// Appends commits to streams and reads them back in revision or time order.
///
/// Stateless apart from configuration; share it freely across threads.
pub struct CommitSequencer<B: StorageBackend + ?Sized = dyn StorageBackend> {
    backend: Arc<B>,
    topics: Arc<TopicRegistry>,
    clock: Arc<dyn Clock>,
    table: String,
    page_size: usize,
}

impl<B: StorageBackend + ?Sized> Clone for CommitSequencer<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            topics: Arc::clone(&self.topics),
            clock: Arc::clone(&self.clock),
            table: self.table.clone(),
            page_size: self.page_size,
        }
    }
}

impl<B: StorageBackend + ?Sized> std::fmt::Debug for CommitSequencer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitSequencer")
            .field("table", &self.table)
            .field("page_size", &self.page_size)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + ?Sized> CommitSequencer<B> {
    /// Create a sequencer stamping commits with the system clock.
    pub fn new(backend: Arc<B>, topics: Arc<TopicRegistry>, config: &StoreConfig) -> Self {
        Self {
            backend,
            topics,
            clock: Arc::new(SystemClock),
            table: config.commits_table.clone(),
            page_size: config.page_size.max(1),
        }
    }

    /// Replace the clock used for commit stamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
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

    fn decode_error(bucket_id: &str, stream_id: &str, source: CodecError) -> EventStoreError {
        EventStoreError::Decode {
            bucket_id: bucket_id.to_string(),
            stream_id: stream_id.to_string(),
            source,
        }
    }

    /// Persist the stream's pending events as its next commit.
    ///
    /// The commit is written at `commit_sequence + 1` only if nothing occupies
    /// that slot yet. Conflicts and idempotent retries are outcomes, not
    /// errors; see [`AppendOutcome`].
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::Validation`] if the stream has nothing pending
    /// - [`EventStoreError::Codec`] if an event's topic is not registered;
    ///   nothing is written
    /// - [`EventStoreError::Backend`] for storage faults, never retried here
    pub fn append(&self, stream: EventStream, commit_id: CommitId) -> EventStoreResult<AppendOutcome> {
        let stamp: Timestamp = self.clock.now().trunc_subsecs(0);
        let commit = stream.to_commit(commit_id, stamp)?;
        let item = record::commit_to_item(&commit, &self.topics)?;

        let written = self
            .backend
            .conditional_put(&self.table, item, Precondition::KeyAbsent)
            .map_err(|source| {
                Self::backend_error(Operation::Append, &commit.bucket_id, &commit.stream_id, source)
            })?;

        match written {
            PutOutcome::Written => {
                debug!(
                    bucket_id = %commit.bucket_id,
                    stream_id = %commit.stream_id,
                    commit_sequence = commit.commit_sequence,
                    stream_revision = commit.stream_revision,
                    commit_id = %commit_id,
                    events = commit.events.len(),
                    "Appended commit"
                );
                let stream = stream.apply(&commit);
                Ok(AppendOutcome::Committed { commit, stream })
            }
            PutOutcome::PreconditionFailed => {
                let duplicate = self.detect_duplicate(
                    commit_id,
                    &commit.bucket_id,
                    &commit.stream_id,
                    commit.commit_sequence,
                )?;
                let mut stream = self.refresh(stream)?;

                if duplicate {
                    debug!(
                        bucket_id = %commit.bucket_id,
                        stream_id = %commit.stream_id,
                        commit_sequence = commit.commit_sequence,
                        commit_id = %commit_id,
                        "Commit already stored, treating append as a retry"
                    );
                    stream.clear_changes();
                    Ok(AppendOutcome::Duplicate { stream })
                } else {
                    warn!(
                        bucket_id = %commit.bucket_id,
                        stream_id = %commit.stream_id,
                        commit_sequence = commit.commit_sequence,
                        commit_id = %commit_id,
                        refreshed_sequence = stream.commit_sequence(),
                        "Concurrency conflict on append"
                    );
                    Ok(AppendOutcome::Conflict { stream })
                }
            }
        }
    }

    /// Whether the commit stored at `commit_sequence` carries `commit_id`.
    pub fn detect_duplicate(
        &self,
        commit_id: CommitId,
        bucket_id: &str,
        stream_id: &str,
        commit_sequence: i64,
    ) -> EventStoreResult<bool> {
        let stored = self
            .backend
            .query_point_descending(
                &self.table,
                None,
                &partition_key(bucket_id, stream_id),
                commit_sequence,
            )
            .map_err(|source| {
                Self::backend_error(Operation::DetectDuplicate, bucket_id, stream_id, source)
            })?;

        let Some(stored) = stored else {
            return Ok(false);
        };
        let stored_sequence = record::commit_sequence_of(&stored)
            .map_err(|e| Self::decode_error(bucket_id, stream_id, e))?;
        if stored_sequence != commit_sequence {
            return Ok(false);
        }
        let stored_id =
            record::commit_id_of(&stored).map_err(|e| Self::decode_error(bucket_id, stream_id, e))?;
        Ok(stored_id == commit_id)
    }

    /// Commits with `min_revision <= stream_revision <= max_revision`, in
    /// ascending revision order.
    ///
    /// A negative `min_revision` reads from the start; `i64::MAX` as
    /// `max_revision` reads to the head. Each call starts a fresh scan.
    pub fn get(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: i64,
        max_revision: i64,
    ) -> CommitIter<B> {
        let query = RangeQuery::new(&self.table, partition_key(bucket_id, stream_id))
            .on_index(REVISION_INDEX)
            .range(SortRange::between(min_revision.max(0), max_revision))
            .limit(self.page_size);
        CommitIter::new(self, Operation::GetCommits, bucket_id, stream_id, query, None)
    }

    /// Commits stamped at or before `max_time`, in ascending stamp order.
    ///
    /// Pass [`chrono::DateTime::<chrono::Utc>::MAX_UTC`] for the full history
    /// by time. The scan is unbounded above and stops at the first commit
    /// stamped later than `max_time`.
    pub fn get_to(&self, bucket_id: &str, stream_id: &str, max_time: Timestamp) -> CommitIter<B> {
        let query = RangeQuery::new(&self.table, partition_key(bucket_id, stream_id))
            .on_index(COMMIT_STAMP_INDEX)
            .limit(self.page_size);
        CommitIter::new(
            self,
            Operation::GetCommitsTo,
            bucket_id,
            stream_id,
            query,
            Some(max_time.timestamp()),
        )
    }

    /// Commits stored after `commit_sequence`, in sequence order.
    fn after_sequence(&self, bucket_id: &str, stream_id: &str, commit_sequence: i64) -> CommitIter<B> {
        let query = RangeQuery::new(&self.table, partition_key(bucket_id, stream_id))
            .range(SortRange::at_least(commit_sequence.saturating_add(1)))
            .limit(self.page_size);
        CommitIter::new(self, Operation::GetCommits, bucket_id, stream_id, query, None)
    }

    /// Replay every commit the stream has not seen yet.
    ///
    /// Reads by commit sequence, so a stream whose sequence trails its
    /// revision (one started from a bare snapshot) catches up as well.
    /// Pending changes survive the refresh.
    pub fn refresh(&self, stream: EventStream) -> EventStoreResult<EventStream> {
        let missed = self
            .after_sequence(stream.bucket_id(), stream.stream_id(), stream.commit_sequence())
            .collect::<EventStoreResult<Vec<_>>>()?;
        Ok(stream.with_commits(missed))
    }
}

// ============================================================================
// COMMIT ITERATOR
// ============================================================================

/// Lazy, paged scan over one stream's commits.
///
/// Fetches one page per backend call as the caller consumes it. The first
/// error is yielded once and ends the iteration.
pub struct CommitIter<B: StorageBackend + ?Sized = dyn StorageBackend> {
    backend: Arc<B>,
    topics: Arc<TopicRegistry>,
    operation: Operation,
    bucket_id: String,
    stream_id: String,
    query: RangeQuery,
    stamp_ceiling: Option<i64>,
    buffer: VecDeque<Item>,
    last_page: bool,
    done: bool,
}

impl<B: StorageBackend + ?Sized> CommitIter<B> {
    fn new(
        sequencer: &CommitSequencer<B>,
        operation: Operation,
        bucket_id: &str,
        stream_id: &str,
        query: RangeQuery,
        stamp_ceiling: Option<i64>,
    ) -> Self {
        let last_page = query.range.is_empty();
        Self {
            backend: Arc::clone(&sequencer.backend),
            topics: Arc::clone(&sequencer.topics),
            operation,
            bucket_id: bucket_id.to_string(),
            stream_id: stream_id.to_string(),
            query,
            stamp_ceiling,
            buffer: VecDeque::new(),
            last_page,
            done: false,
        }
    }

    fn fail(&mut self, error: EventStoreError) -> Option<EventStoreResult<Commit>> {
        self.done = true;
        self.buffer.clear();
        Some(Err(error))
    }

    fn decode_error(&self, source: CodecError) -> EventStoreError {
        CommitSequencer::<B>::decode_error(&self.bucket_id, &self.stream_id, source)
    }

    /// Whether a buffered item is yielded, skipped, or ends the scan.
    fn admit(&self, item: &Item) -> Result<Admit, CodecError> {
        if let Some(ceiling) = self.stamp_ceiling {
            // Ordered by stamp, so nothing later can qualify.
            if record::commit_stamp_of(item)? > ceiling {
                return Ok(Admit::Stop);
            }
        }
        if record::belongs_to(item, &self.bucket_id, &self.stream_id)? {
            Ok(Admit::Yield)
        } else {
            Ok(Admit::Skip)
        }
    }
}

enum Admit {
    Yield,
    /// Another stream's commit sharing this partition key
    Skip,
    Stop,
}

impl<B: StorageBackend + ?Sized> Iterator for CommitIter<B> {
    type Item = EventStoreResult<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(item) = self.buffer.pop_front() {
                match self.admit(&item) {
                    Ok(Admit::Yield) => {}
                    Ok(Admit::Skip) => continue,
                    Ok(Admit::Stop) => {
                        self.done = true;
                        self.buffer.clear();
                        return None;
                    }
                    Err(e) => {
                        let error = self.decode_error(e);
                        return self.fail(error);
                    }
                }
                return match record::item_to_commit(&item, &self.topics) {
                    Ok(commit) => Some(Ok(commit)),
                    Err(e) => {
                        let error = self.decode_error(e);
                        self.fail(error)
                    }
                };
            }
            if self.last_page {
                self.done = true;
                return None;
            }

            match self.backend.query_range(&self.query) {
                Ok(page) => {
                    match page.next {
                        Some(cursor) => self.query.start_after = Some(cursor),
                        None => self.last_page = true,
                    }
                    self.buffer.extend(page.items);
                }
                Err(source) => {
                    let error = CommitSequencer::<B>::backend_error(
                        self.operation,
                        &self.bucket_id,
                        &self.stream_id,
                        source,
                    );
                    return self.fail(error);
                }
            }
        }
    }
}

impl<B: StorageBackend + ?Sized> FusedIterator for CommitIter<B> {}

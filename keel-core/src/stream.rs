//! EventStream: the caller-owned accumulator for one stream.
//!
//! An `EventStream` holds what a writer knows about a stream (its committed
//! revision, last commit sequence, and the events folded so far) plus the
//! events it intends to append next. It is a single-owner value: replaying
//! missed commits consumes the stream and returns a refreshed one, so no two
//! writers ever alias the same accumulator.
//!
//! ```text
//!   new ──add()──► pending ──to_commit()──► Commit ──(persisted)──► apply()
//!                     ▲                                               │
//!                     └──────────── with_commits() on conflict ◄──────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::event::{Commit, EventMessage, Headers, Snapshot};
use crate::identity::{CommitId, StreamKey, Timestamp};

/// In-memory accumulator scoped to one `(bucket_id, stream_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStream {
    bucket_id: String,
    stream_id: String,
    stream_revision: i64,
    commit_sequence: i64,
    committed_events: Vec<EventMessage>,
    committed_headers: Headers,
    uncommitted_events: Vec<EventMessage>,
    uncommitted_headers: Headers,
}

impl EventStream {
    /// Create an empty stream at revision 0 with no commits.
    pub fn new(bucket_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision: 0,
            commit_sequence: 0,
            committed_events: Vec::new(),
            committed_headers: Headers::new(),
            uncommitted_events: Vec::new(),
            uncommitted_headers: Headers::new(),
        }
    }

    /// Create a stream from its coordinates.
    pub fn for_key(key: &StreamKey) -> Self {
        Self::new(key.bucket_id.clone(), key.stream_id.clone())
    }

    /// Start a stream at a snapshot's revision. Events up to and including
    /// that revision are represented by the snapshot payload, not replayed.
    ///
    /// The commit sequence is unknown until the commit holding the snapshot
    /// revision is applied through [`EventStream::with_commits`].
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut stream = Self::new(snapshot.bucket_id.clone(), snapshot.stream_id.clone());
        stream.stream_revision = snapshot.stream_revision;
        stream
    }

    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Coordinates of this stream.
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.bucket_id.clone(), self.stream_id.clone())
    }

    /// Highest committed revision observed.
    pub fn stream_revision(&self) -> i64 {
        self.stream_revision
    }

    /// Sequence of the last commit observed (0 when none).
    pub fn commit_sequence(&self) -> i64 {
        self.commit_sequence
    }

    pub fn committed_events(&self) -> &[EventMessage] {
        &self.committed_events
    }

    /// Headers accumulated from every applied commit; later commits win.
    pub fn committed_headers(&self) -> &Headers {
        &self.committed_headers
    }

    pub fn uncommitted_events(&self) -> &[EventMessage] {
        &self.uncommitted_events
    }

    pub fn uncommitted_headers(&self) -> &Headers {
        &self.uncommitted_headers
    }

    /// Whether there is anything to commit.
    pub fn has_changes(&self) -> bool {
        !self.uncommitted_events.is_empty()
    }

    /// Queue an event for the next commit.
    pub fn add(&mut self, event: EventMessage) {
        self.uncommitted_events.push(event);
    }

    /// Queue several events for the next commit, preserving order.
    pub fn add_all<I: IntoIterator<Item = EventMessage>>(&mut self, events: I) {
        self.uncommitted_events.extend(events);
    }

    /// Set a commit-level header for the next commit.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.uncommitted_headers.insert(key.into(), value.into());
    }

    /// Drop every pending event and header.
    pub fn clear_changes(&mut self) {
        self.uncommitted_events.clear();
        self.uncommitted_headers.clear();
    }

    /// Freeze the pending events into the next commit.
    ///
    /// The commit lands at `commit_sequence + 1` and moves the revision forward
    /// by the number of pending events. The stream itself is left untouched;
    /// it only advances once the commit is known to be persisted.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyCommit`] when nothing is pending.
    pub fn to_commit(
        &self,
        commit_id: CommitId,
        commit_stamp: Timestamp,
    ) -> Result<Commit, ValidationError> {
        if self.uncommitted_events.is_empty() {
            return Err(ValidationError::EmptyCommit {
                bucket_id: self.bucket_id.clone(),
                stream_id: self.stream_id.clone(),
            });
        }

        Ok(Commit {
            bucket_id: self.bucket_id.clone(),
            stream_id: self.stream_id.clone(),
            stream_revision: self.stream_revision + self.uncommitted_events.len() as i64,
            commit_id,
            commit_sequence: self.commit_sequence + 1,
            commit_stamp,
            headers: self.uncommitted_headers.clone(),
            events: self.uncommitted_events.clone(),
        })
    }

    /// Fold in a commit this stream just persisted and clear pending changes.
    pub fn apply(mut self, commit: &Commit) -> Self {
        self = self.with_commits(std::iter::once(commit.clone()));
        self.clear_changes();
        self
    }

    /// Replay commits read from storage on top of what this stream knows.
    ///
    /// Commits at or below the current commit sequence are skipped, so
    /// replaying an overlapping range is harmless. Pending changes are kept.
    pub fn with_commits<I: IntoIterator<Item = Commit>>(self, commits: I) -> Self {
        let floor = self.stream_revision;
        self.populate(floor, i64::MAX, commits)
    }

    /// Fold in events with `after_revision < revision <= max_revision`.
    ///
    /// Commits that straddle `after_revision` still advance the commit
    /// sequence; only their already-summarized events are skipped. A commit
    /// that straddles `max_revision` contributes its events up to the limit
    /// but not its sequence, so `commit_sequence` always names the last
    /// commit held in full. Appending from such a stream conflicts, and the
    /// refresh completes the cut commit.
    pub fn populate<I: IntoIterator<Item = Commit>>(
        mut self,
        after_revision: i64,
        max_revision: i64,
        commits: I,
    ) -> Self {
        for commit in commits {
            if commit.commit_sequence <= self.commit_sequence {
                continue;
            }
            if commit.first_revision() > max_revision {
                break;
            }

            let truncated = commit.stream_revision > max_revision;
            if truncated {
                self.commit_sequence = commit.commit_sequence - 1;
            } else {
                self.commit_sequence = commit.commit_sequence;
                self.committed_headers
                    .extend(commit.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
            }

            let first = commit.first_revision();
            for (offset, event) in commit.events.into_iter().enumerate() {
                let revision = first + offset as i64;
                if revision > max_revision {
                    break;
                }
                if revision > after_revision {
                    self.committed_events.push(event);
                }
                self.stream_revision = self.stream_revision.max(revision);
            }

            if truncated {
                break;
            }
        }
        self
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Revision after a run of commits equals the total event count and
        /// the commit sequence equals the number of commits.
        #[test]
        fn prop_revision_is_running_total(batches in prop::collection::vec(1usize..6, 1..12)) {
            let mut stream = EventStream::new("b", "s");
            for (i, size) in batches.iter().enumerate() {
                for n in 0..*size {
                    stream.add(EventMessage::new("t", json!({ "batch": i, "n": n })));
                }
                let commit = stream.to_commit(Uuid::now_v7(), Utc::now()).unwrap();
                prop_assert_eq!(commit.commit_sequence, i as i64 + 1);
                stream = stream.apply(&commit);
            }

            let total: usize = batches.iter().sum();
            prop_assert_eq!(stream.stream_revision(), total as i64);
            prop_assert_eq!(stream.commit_sequence(), batches.len() as i64);
            prop_assert_eq!(stream.committed_events().len(), total);
        }
    }
}

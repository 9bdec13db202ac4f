//! Keel Events - Commit Sequencer and Snapshot Store
//!
//! Event-sourced persistence over a key-ordered storage backend:
//!
//! - [`CommitSequencer`]: appends ordered event batches to a stream with
//!   optimistic-concurrency conflict detection, and reads them back by
//!   revision or by commit time.
//! - [`SnapshotManager`]: write-once projections keyed by stream revision.
//! - [`PersistenceAdmin`]: idempotent provisioning of both tables.
//! - [`EventStore`]: the three bundled over one backend and configuration.
//!
//! # Concurrency
//!
//! ```text
//!   writer X ──► append(seq 2, id U1) ──► Written            ──► Committed
//!   writer Y ──► append(seq 2, id U2) ──► PreconditionFailed ──► Conflict
//!   writer X ──► append(seq 2, id U1) ──► PreconditionFailed ──► Duplicate
//! ```
//!
//! No lock is held across a write; the backend's conditional put decides.
//! A writer that gets [`AppendOutcome::Conflict`] receives its stream
//! refreshed from storage and retries against the new head.

pub mod admin;
pub mod commits;
pub mod record;
pub mod snapshots;
pub mod store;

pub use admin::PersistenceAdmin;
pub use commits::{AppendOutcome, CommitIter, CommitSequencer};
pub use snapshots::{SnapshotManager, SnapshotOutcome};
pub use store::EventStore;

// Re-export core types for convenience
pub use keel_core::{
    new_commit_id, Commit, CommitId, DomainEvent, EventMessage, EventStoreError,
    EventStoreResult, EventStream, Headers, Snapshot, StoreConfig, StreamKey, TopicRegistry,
};

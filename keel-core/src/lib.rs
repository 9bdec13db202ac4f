//! Keel Core - Data Model
//!
//! Pure data structures shared by every Keel crate: stream identity, event
//! messages, commits, snapshots, the caller-owned [`EventStream`] accumulator,
//! the topic registry, configuration, and the error taxonomy.
//!
//! Nothing here touches storage. The append protocol lives in `keel-events`,
//! the storage contract in `keel-storage`.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod stream;
pub mod topic;

pub use clock::{Clock, SystemClock};
pub use config::{BackendConfig, StoreConfig, MIN_LMDB_TABLES};
pub use error::{
    BackendError, CodecError, ConfigError, EventStoreError, EventStoreResult, Operation,
    ValidationError,
};
pub use event::{Commit, DomainEvent, EventMessage, Headers, Snapshot};
pub use identity::{new_commit_id, partition_key, CommitId, StreamKey, Timestamp, DEFAULT_BUCKET};
pub use stream::EventStream;
pub use topic::TopicRegistry;

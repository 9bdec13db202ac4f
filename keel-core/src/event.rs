//! Event, commit, and snapshot records.
//!
//! A [`Commit`] is the unit of persistence: an ordered batch of
//! [`EventMessage`]s appended atomically to one stream. A [`Snapshot`] is an
//! opaque projection of a stream as of one revision. The two never reference
//! each other directly; they share the `(bucket_id, stream_id, stream_revision)`
//! coordinate space.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::CodecError;
use crate::identity::{CommitId, StreamKey, Timestamp};

/// Header mapping carried by messages, commits, and snapshots.
pub type Headers = BTreeMap<String, Value>;

// ============================================================================
// DOMAIN EVENTS
// ============================================================================

/// A typed domain event with a stable topic tag.
///
/// The topic is what gets persisted; renaming the Rust type is free, renaming
/// the topic needs a [`crate::TopicRegistry::alias`].
pub trait DomainEvent: Serialize + DeserializeOwned {
    /// Topic tag written alongside the event body.
    const TOPIC: &'static str;
}

// ============================================================================
// EVENT MESSAGE
// ============================================================================

/// One domain event plus its header metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Topic tag resolving to a registered codec
    pub topic: String,
    /// Per-event metadata
    #[serde(default)]
    pub headers: Headers,
    /// Decoded event body
    pub body: Value,
}

impl EventMessage {
    /// Create a message from a topic and an already-serialized body.
    pub fn new(topic: impl Into<String>, body: Value) -> Self {
        Self {
            topic: topic.into(),
            headers: Headers::new(),
            body,
        }
    }

    /// Create a message from a typed domain event.
    pub fn from_event<E: DomainEvent>(event: &E) -> Result<Self, CodecError> {
        let body = serde_json::to_value(event).map_err(|e| CodecError::Serialization {
            reason: e.to_string(),
        })?;
        Ok(Self::new(E::TOPIC, body))
    }

    /// Attach a header, replacing any previous value under the same key.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Deserialize the body into a typed domain event.
    pub fn body_as<E: DomainEvent>(&self) -> Result<E, CodecError> {
        if self.topic != E::TOPIC {
            return Err(CodecError::InvalidBody {
                topic: self.topic.clone(),
                reason: format!("expected topic {}", E::TOPIC),
            });
        }
        serde_json::from_value(self.body.clone()).map_err(|e| CodecError::InvalidBody {
            topic: self.topic.clone(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// COMMIT
// ============================================================================

/// An immutable, durably persisted batch of events for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub bucket_id: String,
    pub stream_id: String,
    /// Total event count of the stream once this commit is applied
    pub stream_revision: i64,
    pub commit_id: CommitId,
    /// Conflict-detection key, contiguous from 1 per stream
    pub commit_sequence: i64,
    /// Wall-clock stamp in whole seconds; used for time-range reads only
    pub commit_stamp: Timestamp,
    pub headers: Headers,
    /// Events in application order
    pub events: Vec<EventMessage>,
}

impl Commit {
    /// Coordinates of the stream this commit belongs to.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.bucket_id.clone(), self.stream_id.clone())
    }

    /// Partition key of the stream this commit belongs to.
    pub fn partition_key(&self) -> String {
        crate::identity::partition_key(&self.bucket_id, &self.stream_id)
    }

    /// Revision of the first event in this commit.
    pub fn first_revision(&self) -> i64 {
        self.stream_revision - self.events.len() as i64 + 1
    }

    /// Events paired with the stream revision each one establishes.
    pub fn revisioned_events(&self) -> impl Iterator<Item = (i64, &EventMessage)> {
        let first = self.first_revision();
        self.events
            .iter()
            .enumerate()
            .map(move |(offset, event)| (first + offset as i64, event))
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// A point-in-time projection summarizing a stream up to `stream_revision`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub bucket_id: String,
    pub stream_id: String,
    /// Last revision folded into the payload (inclusive)
    pub stream_revision: i64,
    /// Opaque serialized projection state
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl Snapshot {
    /// Create a snapshot without headers.
    pub fn new(
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
        stream_revision: i64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision,
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Attach a header, replacing any previous value under the same key.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Coordinates of the stream this snapshot summarizes.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.bucket_id.clone(), self.stream_id.clone())
    }

    /// Partition key of the stream this snapshot summarizes.
    pub fn partition_key(&self) -> String {
        crate::identity::partition_key(&self.bucket_id, &self.stream_id)
    }
}

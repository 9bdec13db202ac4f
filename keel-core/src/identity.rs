//! Identity types for streams and commits

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Commit identifier. Assigned by the committer, globally unique.
pub type CommitId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Bucket used when the caller does not partition streams by domain.
pub const DEFAULT_BUCKET: &str = "default";

/// Generate a new UUIDv7 CommitId (timestamp-sortable).
pub fn new_commit_id() -> CommitId {
    Uuid::now_v7()
}

/// Coordinates of one stream: the bucket namespace plus the stream id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub bucket_id: String,
    pub stream_id: String,
}

impl StreamKey {
    /// Create a stream key.
    pub fn new(bucket_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
        }
    }

    /// Stream key in the default bucket.
    pub fn in_default_bucket(stream_id: impl Into<String>) -> Self {
        Self::new(DEFAULT_BUCKET, stream_id)
    }

    /// Partition key shared by every commit and snapshot of this stream.
    pub fn partition_key(&self) -> String {
        partition_key(&self.bucket_id, &self.stream_id)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket_id, self.stream_id)
    }
}

/// Composite partition key: `bucket_id ++ stream_id`.
///
/// The plain concatenation is part of the persisted layout and must stay
/// byte-identical across implementations reading the same tables. It is not
/// injective: `("ab", "c")` and `("a", "bc")` share a partition.
pub fn partition_key(bucket_id: &str, stream_id: &str) -> String {
    let mut key = String::with_capacity(bucket_id.len() + stream_id.len());
    key.push_str(bucket_id);
    key.push_str(stream_id);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_is_concatenation() {
        assert_eq!(partition_key("bucketA", "orderA"), "bucketAorderA");
        assert_eq!(StreamKey::new("b", "s").partition_key(), "bs");
    }

    #[test]
    fn test_default_bucket() {
        let key = StreamKey::in_default_bucket("order-1");
        assert_eq!(key.bucket_id, DEFAULT_BUCKET);
        assert_eq!(key.to_string(), "default/order-1");
    }

    #[test]
    fn test_commit_ids_are_unique() {
        assert_ne!(new_commit_id(), new_commit_id());
    }
}

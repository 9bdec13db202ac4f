//! Persisted item layout for commits and snapshots.
//!
//! Attribute names and value encodings are fixed so that stores written by
//! other implementations of the same layout stay readable:
//!
//! | attribute           | commit                      | snapshot            |
//! |---------------------|-----------------------------|---------------------|
//! | `bucket_and_stream` | partition key               | partition key       |
//! | `bucket_id`         | string                      | string              |
//! | `stream_id`         | string                      | string              |
//! | `stream_revision`   | int, `RevisionIndex` sort   | int, primary sort   |
//! | `commit_id`         | hyphenated UUID             |                     |
//! | `commit_sequence`   | int, primary sort           |                     |
//! | `commit_stamp`      | int epoch seconds           |                     |
//! | `headers`           | JSON string                 | JSON string         |
//! | `events`            | JSON string of encoded msgs |                     |
//! | `payload`           |                             | hex string          |

use chrono::DateTime;
use keel_core::{CodecError, Commit, CommitId, Headers, Snapshot, Timestamp, TopicRegistry};
use keel_storage::{Item, TableSchema};
use serde_json::Value;
use uuid::Uuid;

pub const PARTITION_ATTR: &str = "bucket_and_stream";
pub const BUCKET_ID_ATTR: &str = "bucket_id";
pub const STREAM_ID_ATTR: &str = "stream_id";
pub const STREAM_REVISION_ATTR: &str = "stream_revision";
pub const COMMIT_ID_ATTR: &str = "commit_id";
pub const COMMIT_SEQUENCE_ATTR: &str = "commit_sequence";
pub const COMMIT_STAMP_ATTR: &str = "commit_stamp";
pub const HEADERS_ATTR: &str = "headers";
pub const EVENTS_ATTR: &str = "events";
pub const PAYLOAD_ATTR: &str = "payload";

/// Secondary ordering of commits by `stream_revision`.
pub const REVISION_INDEX: &str = "RevisionIndex";
/// Secondary ordering of commits by `commit_stamp`.
pub const COMMIT_STAMP_INDEX: &str = "CommitStampIndex";

/// Layout of the commits table.
pub fn commits_schema(table: &str) -> TableSchema {
    TableSchema::new(table, PARTITION_ATTR, COMMIT_SEQUENCE_ATTR)
        .with_index(REVISION_INDEX, STREAM_REVISION_ATTR)
        .with_index(COMMIT_STAMP_INDEX, COMMIT_STAMP_ATTR)
}

/// Layout of the snapshots table.
pub fn snapshots_schema(table: &str) -> TableSchema {
    TableSchema::new(table, PARTITION_ATTR, STREAM_REVISION_ATTR)
}

// ============================================================================
// ATTRIBUTE ACCESS
// ============================================================================

fn missing(attribute: &str, kind: &str) -> CodecError {
    CodecError::Malformed {
        reason: format!("missing {} attribute {}", kind, attribute),
    }
}

fn str_attr<'a>(item: &'a Item, attribute: &str) -> Result<&'a str, CodecError> {
    item.get(attribute)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(attribute, "string"))
}

fn int_attr(item: &Item, attribute: &str) -> Result<i64, CodecError> {
    item.get(attribute)
        .and_then(Value::as_i64)
        .ok_or_else(|| missing(attribute, "integer"))
}

fn headers_to_json(headers: &Headers) -> Result<String, CodecError> {
    serde_json::to_string(headers).map_err(|e| CodecError::Serialization {
        reason: e.to_string(),
    })
}

fn headers_from_item(item: &Item) -> Result<Headers, CodecError> {
    match item.get(HEADERS_ATTR) {
        None | Some(Value::Null) => Ok(Headers::new()),
        Some(_) => {
            let raw = str_attr(item, HEADERS_ATTR)?;
            serde_json::from_str(raw).map_err(|e| CodecError::Malformed {
                reason: format!("headers: {}", e),
            })
        }
    }
}

/// Whether an item was written for exactly this stream.
///
/// Distinct coordinates can share a partition key, so readers check the
/// stored coordinates before trusting an item.
pub fn belongs_to(item: &Item, bucket_id: &str, stream_id: &str) -> Result<bool, CodecError> {
    Ok(str_attr(item, BUCKET_ID_ATTR)? == bucket_id && str_attr(item, STREAM_ID_ATTR)? == stream_id)
}

/// Sequence number stored on a commit item.
pub fn commit_sequence_of(item: &Item) -> Result<i64, CodecError> {
    int_attr(item, COMMIT_SEQUENCE_ATTR)
}

/// Commit id stored on a commit item.
pub fn commit_id_of(item: &Item) -> Result<CommitId, CodecError> {
    let raw = str_attr(item, COMMIT_ID_ATTR)?;
    Uuid::parse_str(raw).map_err(|e| CodecError::Malformed {
        reason: format!("commit_id {}: {}", raw, e),
    })
}

/// Epoch-second stamp stored on a commit item.
pub fn commit_stamp_of(item: &Item) -> Result<i64, CodecError> {
    int_attr(item, COMMIT_STAMP_ATTR)
}

// ============================================================================
// COMMITS
// ============================================================================

/// Encode a commit as a storage item. Fails on unregistered topics.
pub fn commit_to_item(commit: &Commit, topics: &TopicRegistry) -> Result<Item, CodecError> {
    let events = commit
        .events
        .iter()
        .map(|event| topics.encode(event))
        .collect::<Result<Vec<_>, _>>()?;
    let events = serde_json::to_string(&events).map_err(|e| CodecError::Serialization {
        reason: e.to_string(),
    })?;

    let mut item = Item::new();
    item.insert(PARTITION_ATTR.into(), commit.partition_key().into());
    item.insert(BUCKET_ID_ATTR.into(), commit.bucket_id.clone().into());
    item.insert(STREAM_ID_ATTR.into(), commit.stream_id.clone().into());
    item.insert(STREAM_REVISION_ATTR.into(), commit.stream_revision.into());
    item.insert(
        COMMIT_ID_ATTR.into(),
        commit.commit_id.hyphenated().to_string().into(),
    );
    item.insert(COMMIT_SEQUENCE_ATTR.into(), commit.commit_sequence.into());
    item.insert(COMMIT_STAMP_ATTR.into(), commit.commit_stamp.timestamp().into());
    item.insert(HEADERS_ATTR.into(), headers_to_json(&commit.headers)?.into());
    item.insert(EVENTS_ATTR.into(), events.into());
    Ok(item)
}

/// Decode a storage item back into a commit, resolving every event's topic.
pub fn item_to_commit(item: &Item, topics: &TopicRegistry) -> Result<Commit, CodecError> {
    let stamp = commit_stamp_of(item)?;
    let commit_stamp: Timestamp =
        DateTime::from_timestamp(stamp, 0).ok_or_else(|| CodecError::Malformed {
            reason: format!("commit_stamp {} out of range", stamp),
        })?;

    let raw_events: Vec<Value> = serde_json::from_str(str_attr(item, EVENTS_ATTR)?)
        .map_err(|e| CodecError::Malformed {
            reason: format!("events: {}", e),
        })?;
    let events = raw_events
        .iter()
        .map(|raw| topics.decode(raw))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Commit {
        bucket_id: str_attr(item, BUCKET_ID_ATTR)?.to_string(),
        stream_id: str_attr(item, STREAM_ID_ATTR)?.to_string(),
        stream_revision: int_attr(item, STREAM_REVISION_ATTR)?,
        commit_id: commit_id_of(item)?,
        commit_sequence: commit_sequence_of(item)?,
        commit_stamp,
        headers: headers_from_item(item)?,
        events,
    })
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// Encode a snapshot as a storage item.
pub fn snapshot_to_item(snapshot: &Snapshot) -> Result<Item, CodecError> {
    let mut item = Item::new();
    item.insert(PARTITION_ATTR.into(), snapshot.partition_key().into());
    item.insert(BUCKET_ID_ATTR.into(), snapshot.bucket_id.clone().into());
    item.insert(STREAM_ID_ATTR.into(), snapshot.stream_id.clone().into());
    item.insert(STREAM_REVISION_ATTR.into(), snapshot.stream_revision.into());
    item.insert(PAYLOAD_ATTR.into(), hex::encode(&snapshot.payload).into());
    item.insert(HEADERS_ATTR.into(), headers_to_json(&snapshot.headers)?.into());
    Ok(item)
}

/// Decode a storage item back into a snapshot.
pub fn item_to_snapshot(item: &Item) -> Result<Snapshot, CodecError> {
    let payload = hex::decode(str_attr(item, PAYLOAD_ATTR)?).map_err(|e| CodecError::Malformed {
        reason: format!("payload: {}", e),
    })?;
    Ok(Snapshot {
        bucket_id: str_attr(item, BUCKET_ID_ATTR)?.to_string(),
        stream_id: str_attr(item, STREAM_ID_ATTR)?.to_string(),
        stream_revision: int_attr(item, STREAM_REVISION_ATTR)?,
        payload,
        headers: headers_from_item(item)?,
    })
}

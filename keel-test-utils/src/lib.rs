//! Keel Test Utilities
//!
//! Centralized test infrastructure for the Keel workspace:
//! - Proptest generators for identities, events, and snapshots
//! - Fixtures: typed test events, a manual clock, ready-to-use stores
//! - Backend wrappers that inject faults or count calls
//! - Custom assertions for commit-log invariants

pub use keel_core::{
    BackendError, Clock, Commit, CommitId, DomainEvent, EventMessage, EventStoreError,
    EventStoreResult, EventStream, Headers, Operation, Snapshot, StoreConfig, Timestamp,
    TopicRegistry,
};
pub use keel_events::{AppendOutcome, EventStore, SnapshotOutcome};
pub use keel_storage::{InMemoryBackend, StorageBackend};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Install a fmt subscriber filtered by `RUST_LOG`. Safe to call from every
/// test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Keel records.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    /// Generate a random commit id.
    pub fn arb_commit_id() -> impl Strategy<Value = CommitId> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a bucket id.
    pub fn arb_bucket_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    /// Generate a stream id.
    pub fn arb_stream_id() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9-]{1,24}"
    }

    /// Generate a header value.
    pub fn arb_header_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,16}".prop_map(Value::from),
        ]
    }

    /// Generate a header mapping.
    pub fn arb_headers() -> impl Strategy<Value = Headers> {
        prop::collection::btree_map("[a-z_]{1,8}", arb_header_value(), 0..4)
    }

    /// Generate one event under a registered test topic.
    pub fn arb_event_message() -> impl Strategy<Value = EventMessage> {
        prop_oneof![
            ("[A-Z]{3}-[0-9]{4}", 0i64..1_000_000).prop_map(|(order_id, total_cents)| {
                fixtures::order_placed(&order_id, total_cents)
            }),
            ("[a-z]{3,10}", 1u32..100).prop_map(|(sku, quantity)| fixtures::item_added(&sku, quantity)),
            any::<u64>().prop_map(|n| EventMessage::new(fixtures::AUDIT_TOPIC, json!({ "n": n }))),
        ]
        .prop_flat_map(|event| {
            arb_headers().prop_map(move |headers| {
                let mut event = event.clone();
                event.headers = headers;
                event
            })
        })
    }

    /// Generate a non-empty batch of events for one commit.
    pub fn arb_event_batch(max_len: usize) -> impl Strategy<Value = Vec<EventMessage>> {
        prop::collection::vec(arb_event_message(), 1..=max_len.max(1))
    }

    /// Generate a sequence of non-empty batches, one per commit.
    pub fn arb_commit_batches(
        max_commits: usize,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<Vec<EventMessage>>> {
        prop::collection::vec(arb_event_batch(max_len), 1..=max_commits.max(1))
    }

    /// Generate a snapshot for a fixed stream.
    pub fn arb_snapshot(bucket_id: String, stream_id: String) -> impl Strategy<Value = Snapshot> {
        (0i64..1_000, prop::collection::vec(any::<u8>(), 0..64), arb_headers()).prop_map(
            move |(revision, payload, headers)| Snapshot {
                bucket_id: bucket_id.clone(),
                stream_id: stream_id.clone(),
                stream_revision: revision,
                payload,
                headers,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use chrono::{DateTime, Duration, TimeZone};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Topic with no typed body, registered opaque.
    pub const AUDIT_TOPIC: &str = "audit.note";

    /// An order was placed.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct OrderPlaced {
        pub order_id: String,
        pub total_cents: i64,
    }

    impl DomainEvent for OrderPlaced {
        const TOPIC: &'static str = "order.placed";
    }

    /// An item was added to an order.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ItemAdded {
        pub sku: String,
        pub quantity: u32,
    }

    impl DomainEvent for ItemAdded {
        const TOPIC: &'static str = "order.item_added";
    }

    /// Registry holding every test topic, plus the legacy alias
    /// `order.created` for `order.placed`.
    pub fn test_topics() -> TopicRegistry {
        let mut topics = TopicRegistry::new();
        topics
            .register::<OrderPlaced>()
            .register::<ItemAdded>()
            .register_opaque(AUDIT_TOPIC)
            .alias("order.created", OrderPlaced::TOPIC);
        topics
    }

    pub fn order_placed(order_id: &str, total_cents: i64) -> EventMessage {
        EventMessage::new(
            OrderPlaced::TOPIC,
            json!({ "order_id": order_id, "total_cents": total_cents }),
        )
    }

    pub fn item_added(sku: &str, quantity: u32) -> EventMessage {
        EventMessage::new(ItemAdded::TOPIC, json!({ "sku": sku, "quantity": quantity }))
    }

    /// `n` distinguishable audit events, numbered from `start`.
    pub fn numbered_events(start: u64, n: u64) -> Vec<EventMessage> {
        (start..start + n)
            .map(|i| EventMessage::new(AUDIT_TOPIC, json!({ "n": i })))
            .collect()
    }

    /// The `n` field of an audit event.
    pub fn event_number(event: &EventMessage) -> Option<u64> {
        event.body.get("n").and_then(|n| n.as_u64())
    }

    /// A stream with `events` pending.
    pub fn pending_stream(bucket_id: &str, stream_id: &str, events: Vec<EventMessage>) -> EventStream {
        let mut stream = EventStream::new(bucket_id, stream_id);
        stream.add_all(events);
        stream
    }

    /// A fixed, recognisable start time.
    pub fn epoch() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(start: Timestamp) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: Timestamp) {
            if let Ok(mut now) = self.now.lock() {
                *now = to;
            }
        }

        /// Move forward by `seconds`.
        pub fn advance_secs(&self, seconds: i64) {
            if let Ok(mut now) = self.now.lock() {
                *now += Duration::seconds(seconds);
            }
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Timestamp {
            self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
        }
    }

    /// An initialized in-memory store with the test topics.
    pub fn memory_store() -> (Arc<InMemoryBackend>, EventStore<InMemoryBackend>) {
        memory_store_with(StoreConfig::default())
    }

    /// An initialized in-memory store with the test topics and a given config.
    pub fn memory_store_with(
        config: StoreConfig,
    ) -> (Arc<InMemoryBackend>, EventStore<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = EventStore::new(Arc::clone(&backend), &config, test_topics());
        if let Err(e) = store.initialize() {
            panic!("in-memory store failed to initialize: {}", e);
        }
        (backend, store)
    }

    /// An initialized in-memory store whose commits are stamped by `clock`.
    pub fn memory_store_with_clock(
        clock: Arc<ManualClock>,
    ) -> (Arc<InMemoryBackend>, EventStore<InMemoryBackend>) {
        let (backend, store) = memory_store();
        (backend, store.with_clock(clock))
    }
}

// ============================================================================
// BACKEND WRAPPERS
// ============================================================================

pub mod backends {
    //! Storage backends that wrap another to inject faults or observe calls.

    use super::*;
    use keel_storage::{BackendResult, Item, Page, Precondition, PutOutcome, RangeQuery, TableSchema};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Fails selected operations with a fixed error until disarmed.
    #[derive(Debug)]
    pub struct FailingBackend<B: StorageBackend> {
        inner: Arc<B>,
        fail_puts: AtomicBool,
        fail_queries: AtomicBool,
        /// Successful pages served before queries start failing.
        queries_before_failure: AtomicUsize,
    }

    impl<B: StorageBackend> FailingBackend<B> {
        pub fn new(inner: Arc<B>) -> Self {
            Self {
                inner,
                fail_puts: AtomicBool::new(false),
                fail_queries: AtomicBool::new(false),
                queries_before_failure: AtomicUsize::new(0),
            }
        }

        pub fn fail_puts(&self, fail: bool) {
            self.fail_puts.store(fail, Ordering::SeqCst);
        }

        pub fn fail_queries(&self, fail: bool) {
            self.fail_queries.store(fail, Ordering::SeqCst);
        }

        /// Serve `pages` queries normally, then fail every later one.
        pub fn fail_queries_after(&self, pages: usize) {
            self.queries_before_failure.store(pages, Ordering::SeqCst);
            self.fail_queries(true);
        }

        fn unavailable() -> BackendError {
            BackendError::Unavailable {
                reason: "injected fault".to_string(),
            }
        }
    }

    impl<B: StorageBackend> StorageBackend for FailingBackend<B> {
        fn create_table(&self, schema: &TableSchema) -> BackendResult<()> {
            self.inner.create_table(schema)
        }

        fn delete_table(&self, name: &str) -> BackendResult<()> {
            self.inner.delete_table(name)
        }

        fn list_tables(&self) -> BackendResult<Vec<String>> {
            self.inner.list_tables()
        }

        fn conditional_put(
            &self,
            table: &str,
            item: Item,
            precondition: Precondition,
        ) -> BackendResult<PutOutcome> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(Self::unavailable());
            }
            self.inner.conditional_put(table, item, precondition)
        }

        fn query_range(&self, query: &RangeQuery) -> BackendResult<Page> {
            if self.fail_queries.load(Ordering::SeqCst) {
                let allowed = self
                    .queries_before_failure
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if !allowed {
                    return Err(Self::unavailable());
                }
            }
            self.inner.query_range(query)
        }
    }

    /// Counts backend calls.
    #[derive(Debug)]
    pub struct CountingBackend<B: StorageBackend> {
        inner: Arc<B>,
        puts: AtomicUsize,
        queries: AtomicUsize,
    }

    impl<B: StorageBackend> CountingBackend<B> {
        pub fn new(inner: Arc<B>) -> Self {
            Self {
                inner,
                puts: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
            }
        }

        pub fn puts(&self) -> usize {
            self.puts.load(Ordering::SeqCst)
        }

        /// Number of `query_range` calls, i.e. pages fetched.
        pub fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }

        pub fn reset(&self) {
            self.puts.store(0, Ordering::SeqCst);
            self.queries.store(0, Ordering::SeqCst);
        }
    }

    impl<B: StorageBackend> StorageBackend for CountingBackend<B> {
        fn create_table(&self, schema: &TableSchema) -> BackendResult<()> {
            self.inner.create_table(schema)
        }

        fn delete_table(&self, name: &str) -> BackendResult<()> {
            self.inner.delete_table(name)
        }

        fn list_tables(&self) -> BackendResult<Vec<String>> {
            self.inner.list_tables()
        }

        fn conditional_put(
            &self,
            table: &str,
            item: Item,
            precondition: Precondition,
        ) -> BackendResult<PutOutcome> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.conditional_put(table, item, precondition)
        }

        fn query_range(&self, query: &RangeQuery) -> BackendResult<Page> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.inner.query_range(query)
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for commit-log invariants.

    use super::*;

    /// Assert commit sequences are exactly `1..=n`.
    #[track_caller]
    pub fn assert_contiguous_sequences(commits: &[Commit]) {
        let sequences: Vec<i64> = commits.iter().map(|c| c.commit_sequence).collect();
        let expected: Vec<i64> = (1..=commits.len() as i64).collect();
        assert_eq!(sequences, expected, "commit sequences are not contiguous from 1");
    }

    /// Assert each commit's revision is the running total of events.
    #[track_caller]
    pub fn assert_running_revisions(commits: &[Commit]) {
        let mut total = 0i64;
        for commit in commits {
            total += commit.events.len() as i64;
            assert_eq!(
                commit.stream_revision, total,
                "commit {} has revision {}, expected running total {}",
                commit.commit_sequence, commit.stream_revision, total
            );
        }
    }

    /// Assert revisions strictly increase.
    #[track_caller]
    pub fn assert_ascending_revisions(commits: &[Commit]) {
        for pair in commits.windows(2) {
            assert!(
                pair[0].stream_revision < pair[1].stream_revision,
                "revisions out of order: {} then {}",
                pair[0].stream_revision,
                pair[1].stream_revision
            );
        }
    }

    /// Assert stamps never decrease.
    #[track_caller]
    pub fn assert_ascending_stamps(commits: &[Commit]) {
        for pair in commits.windows(2) {
            assert!(
                pair[0].commit_stamp <= pair[1].commit_stamp,
                "stamps out of order: {} then {}",
                pair[0].commit_stamp,
                pair[1].commit_stamp
            );
        }
    }

    /// Assert an append wrote a commit and return it with the advanced stream.
    #[track_caller]
    pub fn assert_committed(outcome: EventStoreResult<AppendOutcome>) -> (Commit, EventStream) {
        match outcome {
            Ok(AppendOutcome::Committed { commit, stream }) => (commit, stream),
            other => panic!("Expected Committed, got: {:?}", other),
        }
    }

    /// Assert an append hit a conflict and return the refreshed stream.
    #[track_caller]
    pub fn assert_conflict(outcome: EventStoreResult<AppendOutcome>) -> EventStream {
        match outcome {
            Ok(AppendOutcome::Conflict { stream }) => stream,
            other => panic!("Expected Conflict, got: {:?}", other),
        }
    }

    /// Assert an append was recognised as a retry and return the stream.
    #[track_caller]
    pub fn assert_duplicate(outcome: EventStoreResult<AppendOutcome>) -> EventStream {
        match outcome {
            Ok(AppendOutcome::Duplicate { stream }) => stream,
            other => panic!("Expected Duplicate, got: {:?}", other),
        }
    }

    /// Assert an error is a backend failure during `operation`.
    #[track_caller]
    pub fn assert_backend_failure<T: std::fmt::Debug>(
        result: &EventStoreResult<T>,
        operation: Operation,
    ) {
        match result {
            Err(EventStoreError::Backend { operation: op, .. }) => {
                assert_eq!(*op, operation, "Wrong operation in backend failure");
            }
            other => panic!("Expected Backend error during {}, got: {:?}", operation, other),
        }
    }

    /// Collect an iterator of commits, panicking on the first error.
    #[track_caller]
    pub fn collect_commits<I: IntoIterator<Item = EventStoreResult<Commit>>>(iter: I) -> Vec<Commit> {
        match iter.into_iter().collect::<EventStoreResult<Vec<_>>>() {
            Ok(commits) => commits,
            Err(e) => panic!("Expected commits, got error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_topics_accept_fixtures() {
        let topics = test_topics();
        for event in [order_placed("ABC-0001", 1200), item_added("widget", 2)] {
            let encoded = topics.encode(&event).unwrap();
            assert_eq!(topics.decode(&encoded).unwrap(), event);
        }
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(epoch());
        clock.advance_secs(30);
        assert_eq!(clock.now(), epoch() + chrono::Duration::seconds(30));
        clock.set(epoch());
        assert_eq!(clock.now(), epoch());
    }

    #[test]
    fn test_memory_store_is_initialized() {
        let (backend, _store) = memory_store();
        assert_eq!(backend.list_tables().unwrap().len(), 2);
    }
}

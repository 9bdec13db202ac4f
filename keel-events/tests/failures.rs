//! Backend faults surface as BackendFailure and are never retried.

use std::sync::Arc;

use keel_core::{BackendError, EventStoreError, Headers, Operation, StoreConfig};
use keel_events::{EventStore, EventStream, Snapshot};
use keel_storage::InMemoryBackend;
use keel_test_utils::assertions::*;
use keel_test_utils::backends::{CountingBackend, FailingBackend};
use keel_test_utils::fixtures::*;
use uuid::Uuid;

fn failing_store() -> (
    Arc<FailingBackend<InMemoryBackend>>,
    EventStore<FailingBackend<InMemoryBackend>>,
) {
    let backend = Arc::new(FailingBackend::new(Arc::new(InMemoryBackend::new())));
    let config = StoreConfig {
        page_size: 2,
        ..StoreConfig::default()
    };
    let store = EventStore::new(Arc::clone(&backend), &config, test_topics());
    store.initialize().unwrap();
    (backend, store)
}

#[test]
fn test_put_failure_is_backend_failure() {
    let (backend, store) = failing_store();
    backend.fail_puts(true);

    let result = store
        .commits()
        .append(pending_stream("b", "s", numbered_events(1, 1)), Uuid::new_v4());
    assert_backend_failure(&result, Operation::Append);
    let err = result.unwrap_err();
    assert!(matches!(err.backend_source(), Some(BackendError::Unavailable { .. })));
    assert!(err.to_string().contains("b/s"));

    backend.fail_puts(false);
    assert_committed(
        store
            .commits()
            .append(pending_stream("b", "s", numbered_events(1, 1)), Uuid::new_v4()),
    );
}

#[test]
fn test_failure_during_conflict_check_is_reported() {
    let (backend, store) = failing_store();
    store
        .commits()
        .append(pending_stream("b", "s", numbered_events(1, 1)), Uuid::new_v4())
        .unwrap();

    backend.fail_queries(true);
    let result = store
        .commits()
        .append(pending_stream("b", "s", numbered_events(9, 1)), Uuid::new_v4());
    assert_backend_failure(&result, Operation::DetectDuplicate);
}

#[test]
fn test_failure_mid_scan_ends_iteration() {
    let (backend, store) = failing_store();
    let mut stream = EventStream::new("b", "s");
    for i in 0..5 {
        stream.add_all(numbered_events(i, 1));
        stream = store
            .commits()
            .append(stream, Uuid::new_v4())
            .unwrap()
            .into_stream();
    }

    // Page size 2: the first page succeeds, the second fails.
    backend.fail_queries_after(1);
    let results: Vec<_> = store.commits().get("b", "s", 0, i64::MAX).collect();
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok() && results[1].is_ok());
    assert!(matches!(
        results[2],
        Err(EventStoreError::Backend {
            operation: Operation::GetCommits,
            ..
        })
    ));
}

#[test]
fn test_snapshot_failures() {
    let (backend, store) = failing_store();
    backend.fail_puts(true);
    let err = store
        .snapshots()
        .add(&Snapshot::new("b", "s", 1, vec![1]), &Headers::new())
        .unwrap_err();
    assert!(matches!(
        err,
        EventStoreError::Backend {
            operation: Operation::AddSnapshot,
            ..
        }
    ));

    backend.fail_queries(true);
    assert_backend_failure(&store.snapshots().latest("b", "s"), Operation::GetSnapshot);
}

#[test]
fn test_get_to_stops_without_fetching_further_pages() {
    let clock = Arc::new(ManualClock::new(epoch()));
    let backend = Arc::new(CountingBackend::new(Arc::new(InMemoryBackend::new())));
    let config = StoreConfig {
        page_size: 2,
        ..StoreConfig::default()
    };
    let store = EventStore::new(Arc::clone(&backend), &config, test_topics())
        .with_clock(clock.clone());
    store.initialize().unwrap();

    let mut stream = EventStream::new("b", "s");
    for i in 0..10 {
        clock.advance_secs(60);
        stream.add_all(numbered_events(i, 1));
        stream = store
            .commits()
            .append(stream, Uuid::new_v4())
            .unwrap()
            .into_stream();
    }

    backend.reset();
    let ceiling = epoch() + chrono::Duration::seconds(180);
    let commits = collect_commits(store.commits().get_to("b", "s", ceiling));
    assert_eq!(commits.len(), 3);
    // Pages of two: [1, 2] and [3, 4]; the stamp of 4 ends the scan.
    assert_eq!(backend.queries(), 2);
}

#[test]
fn test_iteration_is_lazy() {
    let backend = Arc::new(CountingBackend::new(Arc::new(InMemoryBackend::new())));
    let config = StoreConfig {
        page_size: 1,
        ..StoreConfig::default()
    };
    let store = EventStore::new(Arc::clone(&backend), &config, test_topics());
    store.initialize().unwrap();

    let mut stream = EventStream::new("b", "s");
    for i in 0..4 {
        stream.add_all(numbered_events(i, 1));
        stream = store
            .commits()
            .append(stream, Uuid::new_v4())
            .unwrap()
            .into_stream();
    }

    backend.reset();
    let mut iter = store.commits().get("b", "s", 0, i64::MAX);
    assert_eq!(backend.queries(), 0);
    iter.next().unwrap().unwrap();
    assert_eq!(backend.queries(), 1);
}

//! Concurrent writers against one stream.

use std::sync::{Arc, Barrier};
use std::thread;

use keel_events::{AppendOutcome, EventStore, EventStream};
use keel_storage::StorageBackend;
use keel_test_utils::assertions::*;
use keel_test_utils::fixtures::*;
use keel_test_utils::init_test_tracing;
use uuid::Uuid;

const WRITERS: usize = 8;

/// Every writer appends at the same sequence; returns their outcomes.
fn race<B: StorageBackend + ?Sized>(
    store: &EventStore<B>,
    base: &EventStream,
    commit_ids: &[Uuid],
) -> Vec<AppendOutcome> {
    let barrier = Barrier::new(commit_ids.len());
    thread::scope(|scope| {
        let handles: Vec<_> = commit_ids
            .iter()
            .enumerate()
            .map(|(i, commit_id)| {
                let barrier = &barrier;
                let mut stream = base.clone();
                stream.add_all(numbered_events(i as u64 * 10, 2));
                scope.spawn(move || {
                    barrier.wait();
                    store.commits().append(stream, *commit_id).unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    })
}

#[test]
fn test_exactly_one_writer_wins_a_sequence() {
    init_test_tracing();
    let (_, store) = memory_store();
    let base = EventStream::new("b", "contended");
    let ids: Vec<Uuid> = (0..WRITERS).map(|_| Uuid::new_v4()).collect();

    let outcomes = race(&store, &base, &ids);
    assert_eq!(outcomes.iter().filter(|o| o.is_committed()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_conflict()).count(), WRITERS - 1);

    for outcome in &outcomes {
        assert_eq!(outcome.stream().commit_sequence(), 1);
        assert_eq!(outcome.stream().stream_revision(), 2);
    }
    let commits = collect_commits(store.commits().get("b", "contended", 0, i64::MAX));
    assert_eq!(commits.len(), 1);
}

#[test]
fn test_same_commit_id_races_store_one_record() {
    init_test_tracing();
    let (_, store) = memory_store();
    let base = EventStream::new("b", "retried");
    let id = Uuid::new_v4();

    let mut stream_a = base.clone();
    let mut stream_b = base;
    stream_a.add_all(numbered_events(0, 2));
    stream_b.add_all(numbered_events(0, 2));

    let barrier = Barrier::new(2);
    let outcomes: Vec<AppendOutcome> = thread::scope(|scope| {
        let a = scope.spawn(|| {
            barrier.wait();
            store.commits().append(stream_a, id).unwrap()
        });
        let b = scope.spawn(|| {
            barrier.wait();
            store.commits().append(stream_b, id).unwrap()
        });
        vec![a.join().unwrap(), b.join().unwrap()]
    });

    assert!(outcomes.iter().all(AppendOutcome::is_success));
    assert_eq!(outcomes.iter().filter(|o| o.is_committed()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_duplicate()).count(), 1);

    let commits = collect_commits(store.commits().get("b", "retried", 0, i64::MAX));
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].commit_id, id);
}

#[test]
fn test_retry_loop_converges_without_gaps() {
    init_test_tracing();
    let (_, store) = memory_store();
    let per_writer = 5;

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let store = &store;
            scope.spawn(move || {
                let mut stream = EventStream::new("b", "busy");
                for n in 0..per_writer {
                    stream.add_all(numbered_events((writer * 100 + n) as u64, 1));
                    loop {
                        match store.commits().append(stream, Uuid::new_v4()).unwrap() {
                            AppendOutcome::Conflict { stream: refreshed } => stream = refreshed,
                            outcome => {
                                stream = outcome.into_stream();
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    let commits = collect_commits(store.commits().get("b", "busy", 0, i64::MAX));
    assert_eq!(commits.len(), WRITERS * per_writer);
    assert_contiguous_sequences(&commits);
    assert_running_revisions(&commits);
}

#[test]
fn test_lmdb_exactly_one_writer_wins() {
    init_test_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let backend = Arc::new(keel_storage::LmdbBackend::open(dir.path(), 32, 8).unwrap());
    let store = EventStore::new(backend, &keel_core::StoreConfig::default(), test_topics());
    store.initialize().unwrap();

    let base = EventStream::new("b", "contended");
    let ids: Vec<Uuid> = (0..WRITERS).map(|_| Uuid::new_v4()).collect();
    let outcomes = race(&store, &base, &ids);

    assert_eq!(outcomes.iter().filter(|o| o.is_committed()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_conflict()).count(), WRITERS - 1);
}

use keel_core::{EventMessage, EventStream, StoreConfig, TopicRegistry};
use keel_events::EventStore;
use keel_storage::InMemoryBackend;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn bench_store() -> EventStore<InMemoryBackend> {
    let mut topics = TopicRegistry::new();
    topics.register_opaque("bench.event");
    let store = EventStore::new(
        Arc::new(InMemoryBackend::new()),
        &StoreConfig::default(),
        topics,
    );
    store.initialize().expect("initialize tables");
    store
}

fn batch(n: usize) -> Vec<EventMessage> {
    (0..n)
        .map(|i| EventMessage::new("bench.event", json!({ "n": i, "payload": "x".repeat(64) })))
        .collect()
}

fn bench_append(c: &mut Criterion) {
    let store = bench_store();
    let mut stream = EventStream::new("bench", "append");

    c.bench_function("commits/append_10", |b| {
        b.iter_batched(
            || batch(10),
            |events| {
                let mut pending = std::mem::replace(&mut stream, EventStream::new("", ""));
                pending.add_all(events);
                let outcome = store
                    .commits()
                    .append(pending, Uuid::now_v7())
                    .expect("append");
                stream = outcome.into_stream();
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_replay(c: &mut Criterion) {
    let store = bench_store();
    let mut stream = EventStream::new("bench", "replay");
    for _ in 0..500 {
        stream.add_all(batch(4));
        stream = store
            .commits()
            .append(stream, Uuid::now_v7())
            .expect("append")
            .into_stream();
    }

    c.bench_function("commits/load_500", |b| {
        b.iter(|| {
            let (_, loaded) = store.load_stream("bench", "replay").expect("load");
            black_box(loaded.stream_revision());
        });
    });
}

criterion_group!(benches, bench_append, bench_replay);
criterion_main!(benches);

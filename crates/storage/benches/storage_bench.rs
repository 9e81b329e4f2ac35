use std::time::Duration;

use bytes::Bytes;
use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use tempfile::{TempDir, tempdir};

use vanish_storage::{EngineOptions, FsyncPolicy, TtlStore};

fn open_store() -> (TempDir, TtlStore) {
    let dir = tempdir().unwrap();
    let store = TtlStore::open(
        dir.path(),
        EngineOptions {
            fsync: FsyncPolicy::No,
            ..EngineOptions::default()
        },
    )
    .unwrap();
    (dir, store)
}

fn bench_put_get_sequential(c: &mut Criterion) {
    c.bench_function("put_get_sequential_10k", |b| {
        b.iter_batched(
            open_store,
            |(_dir, store)| {
                let value = Bytes::from(vec![0xab; 1024]);
                for i in 0..10_000 {
                    let key = format!("key:{i}");
                    store.put(key.as_bytes(), value.clone(), None).unwrap();
                    black_box(store.get(key.as_bytes()).unwrap());
                }
            },
            BatchSize::PerIteration,
        )
    });
}

fn bench_put_with_ttl(c: &mut Criterion) {
    c.bench_function("put_with_ttl_10k", |b| {
        b.iter_batched(
            open_store,
            |(_dir, store)| {
                let value = Bytes::from_static(b"value");
                for i in 0..10_000u64 {
                    let key = format!("key:{i}");
                    store
                        .put(key.as_bytes(), value.clone(), Some(Duration::from_secs(60 + i)))
                        .unwrap();
                }
            },
            BatchSize::PerIteration,
        )
    });
}

fn bench_concurrent_puts(c: &mut Criterion) {
    c.bench_function("put_concurrent_4_threads_10k", |b| {
        b.iter_batched(
            open_store,
            |(_dir, store)| {
                std::thread::scope(|s| {
                    for t in 0..4 {
                        let store = store.clone();
                        s.spawn(move || {
                            for i in 0..2_500 {
                                let key = format!("t{t}:{i}");
                                store
                                    .put(key.as_bytes(), Bytes::from_static(b"v"), None)
                                    .unwrap();
                            }
                        });
                    }
                });
            },
            BatchSize::PerIteration,
        )
    });
}

// Varre 1k vencidas com 50k chaves vivas no store: o custo não deve
// depender das vivas.
fn bench_sweep_due_among_live(c: &mut Criterion) {
    c.bench_function("sweep_1k_due_50k_live", |b| {
        b.iter_batched(
            || {
                let (dir, store) = open_store();
                for i in 0..50_000 {
                    let key = format!("live:{i}");
                    store
                        .put_at(key.as_bytes(), Bytes::from_static(b"v"), None, 0)
                        .unwrap();
                }
                for i in 0..1_000 {
                    let key = format!("due:{i}");
                    store
                        .put_at(
                            key.as_bytes(),
                            Bytes::from_static(b"v"),
                            Some(Duration::from_secs(1)),
                            0,
                        )
                        .unwrap();
                }
                (dir, store)
            },
            |(_dir, store)| {
                let stats = store.sweep_once(10_000).unwrap();
                black_box(stats.reaped);
            },
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(
    benches,
    bench_put_get_sequential,
    bench_put_with_ttl,
    bench_concurrent_puts,
    bench_sweep_due_among_live,
);
criterion_main!(benches);

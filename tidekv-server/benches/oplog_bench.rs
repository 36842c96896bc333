use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tidekv_server::oplog::{FsyncMode, OplogConfig, OplogDraft, OplogStore};
use tokio::runtime::Runtime;

fn open_store(rt: &Runtime, dir: &std::path::Path, fsync_mode: FsyncMode) -> OplogStore {
    rt.block_on(OplogStore::open(OplogConfig {
        path: dir.to_path_buf(),
        fsync_mode,
        max_segments: 0,
        ..Default::default()
    }))
    .unwrap()
}

/// Benchmark: appends under each durability policy
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("oplog_append");
    group.throughput(Throughput::Elements(1));
    let rt = Runtime::new().unwrap();

    for (name, mode) in [
        ("always", FsyncMode::Always),
        ("periodic", FsyncMode::Periodic),
        ("never", FsyncMode::Never),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&rt, dir.path(), mode);
        let store = &store;
        let mut counter = 0u64;

        group.bench_function(BenchmarkId::new("fsync", name), |b| {
            b.to_async(&rt).iter(move || {
                counter += 1;
                let draft = OplogDraft::set(format!("key_{}", counter), "value", 0);
                async move { black_box(store.append(draft).await.unwrap()) }
            });
        });
    }

    group.finish();
}

/// Benchmark: range reads of varying page sizes
fn bench_get_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("oplog_get_range");
    let rt = Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&rt, dir.path(), FsyncMode::Never);

    rt.block_on(async {
        for i in 0..20_000u64 {
            store
                .append(OplogDraft::set(format!("key_{}", i), "value", 0))
                .await
                .unwrap();
        }
    });

    for limit in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(limit as u64));
        group.bench_with_input(BenchmarkId::new("limit", limit), &limit, |b, &limit| {
            b.iter(|| black_box(store.get_range(5_000, Some(limit)).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_get_range);
criterion_main!(benches);

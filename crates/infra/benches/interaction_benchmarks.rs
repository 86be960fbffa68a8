use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use glyphmart_core::{ActorId, ActorKey, Counters, Subject, SubjectId};
use glyphmart_infra::cache::{CacheKey, ReadCache};
use glyphmart_infra::config::CacheConfig;
use glyphmart_infra::store::{InMemoryStore, SubjectStore};
use glyphmart_infra::{BatchFetcher, DriftAuditor, InteractionService, RetryPolicy};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn seeded_store(rt: &Runtime, subjects: usize) -> (Arc<InMemoryStore>, Vec<SubjectId>) {
    let store = Arc::new(InMemoryStore::new());
    let owner = ActorId::parse("bench-owner").unwrap();
    let ids: Vec<SubjectId> = (0..subjects).map(|i| SubjectId::parse(format!("s{i:05}")).unwrap()).collect();
    rt.block_on(async {
        for id in &ids {
            let s = Subject::new(id.clone(), owner.clone(), "bench", Utc::now()).unwrap();
            store.put_subject(&s).await.unwrap();
        }
    });
    (store, ids)
}

/// Benchmark: cost of a new view vs. a duplicate (existence test only).
fn bench_record_view(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_view");
    let rt = runtime();

    group.bench_function("new_actor", |b| {
        let (store, ids) = seeded_store(&rt, 1);
        let cache = Arc::new(ReadCache::init(CacheConfig::default()));
        let service = InteractionService::new(store, cache, RetryPolicy::no_retry());
        let mut n: u64 = 0;
        b.iter(|| {
            n += 1;
            let actor = ActorKey::anonymous(&format!("10.0.{}.{}", n / 256, n % 256)).unwrap();
            rt.block_on(service.record_view(&ids[0], &actor)).unwrap();
        });
    });

    group.bench_function("duplicate", |b| {
        let (store, ids) = seeded_store(&rt, 1);
        let cache = Arc::new(ReadCache::init(CacheConfig::default()));
        let service = InteractionService::new(store, cache, RetryPolicy::no_retry());
        let actor = ActorKey::anonymous("10.0.0.1").unwrap();
        rt.block_on(service.record_view(&ids[0], &actor)).unwrap();
        b.iter(|| {
            let recorded = rt.block_on(service.record_view(&ids[0], &actor)).unwrap();
            black_box(recorded);
        });
    });

    group.finish();
}

/// Benchmark: cache hit vs. miss-and-load.
fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_cache");
    let rt = runtime();
    let cache = ReadCache::init(CacheConfig::default());
    let id = SubjectId::parse("hot").unwrap();
    let key = CacheKey::counts(&id);
    cache.put(&key, &Counters::new(10, 20, 30)).unwrap();

    group.bench_function("hit", |b| {
        b.iter(|| black_box(cache.get::<Counters>(&key)));
    });

    group.bench_function("miss_and_load", |b| {
        let mut n: u64 = 0;
        b.iter(|| {
            n += 1;
            let key = CacheKey::counts(&SubjectId::parse(format!("cold{n}")).unwrap());
            let loaded: Result<Counters, String> =
                rt.block_on(cache.get_or_load(&key, || async { Ok(Counters::new(1, 2, 3)) }));
            black_box(loaded.unwrap());
        });
    });

    group.finish();
}

/// Benchmark: grouped multi-get over chunk-limited stores.
fn bench_batch_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_fetch");
    let rt = runtime();

    for keys in [10usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*keys as u64));
        group.bench_with_input(BenchmarkId::from_parameter(keys), keys, |b, &keys| {
            let (store, ids) = seeded_store(&rt, keys);
            let fetcher = BatchFetcher::new(store, 10);
            b.iter(|| {
                let found = rt.block_on(fetcher.request_many(ids.iter().cloned())).unwrap();
                black_box(found.len());
            });
        });
    }

    group.finish();
}

/// Benchmark: full audit pass over N consistent subjects.
fn bench_audit(c: &mut Criterion) {
    let mut group = c.benchmark_group("audit_everything");
    let rt = runtime();

    for subjects in [50usize, 500].iter() {
        group.throughput(Throughput::Elements(*subjects as u64));
        group.bench_with_input(BenchmarkId::from_parameter(subjects), subjects, |b, &subjects| {
            let (store, _) = seeded_store(&rt, subjects);
            let cache = Arc::new(ReadCache::init(CacheConfig::default()));
            let auditor = DriftAuditor::new(store, cache, 50);
            b.iter(|| {
                let summary = rt.block_on(auditor.audit_everything()).unwrap();
                black_box(summary.checked);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_record_view, bench_cache, bench_batch_fetch, bench_audit);
criterion_main!(benches);

//! Throughput benchmarks across eviction policies.
//!
//! Each group runs the same workload under every policy so criterion can
//! generate side-by-side HTML reports.
//!
//! Run with:
//!     cargo bench --bench cache_bench

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weir::{Cache, Config, PolicyKind};

/// Logical capacity in weight units (one unit per entry here).
const CAP: u64 = 16 * 1024;

/// Operations per criterion iteration.
const OPS: u64 = 1_000;

const POLICIES: [PolicyKind; 4] = [
    PolicyKind::Lru,
    PolicyKind::Fifo,
    PolicyKind::Lfu,
    PolicyKind::TinyLfu,
];

fn policy_label(policy: PolicyKind) -> &'static str {
    match policy {
        PolicyKind::Lru => "lru",
        PolicyKind::Fifo => "fifo",
        PolicyKind::Lfu => "lfu",
        PolicyKind::TinyLfu => "tiny-lfu",
    }
}

fn cache_with(policy: PolicyKind) -> Cache {
    Cache::new(Config {
        shard_count: 16,
        max_weight_per_shard: CAP / 16,
        policy,
        ..Default::default()
    })
    .unwrap()
}

fn keys(n: u64) -> Vec<Bytes> {
    (0..n)
        .map(|i| Bytes::from(format!("key-{i:08}")))
        .collect()
}

// All keys resident: pure read throughput, no eviction.
fn bench_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_hit");
    group.throughput(Throughput::Elements(OPS));

    for policy in POLICIES {
        let cache = cache_with(policy);
        let keys = keys(OPS);
        for k in &keys {
            cache.put(k.clone(), Bytes::from_static(b"value"), 1, "bench", None)
                .unwrap();
        }
        group.bench_function(BenchmarkId::from_parameter(policy_label(policy)), |b| {
            b.iter(|| {
                for k in &keys {
                    black_box(cache.get(black_box(k), "bench").unwrap());
                }
            })
        });
    }
    group.finish();
}

// Always-new keys: every batch must evict to stay within budget.
fn bench_insert_evicting(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_evicting");
    group.throughput(Throughput::Elements(OPS));

    for policy in POLICIES {
        let cache = cache_with(policy);
        let mut next = 0u64;
        group.bench_function(BenchmarkId::from_parameter(policy_label(policy)), |b| {
            b.iter(|| {
                for _ in 0..OPS {
                    let k = Bytes::from(format!("key-{next:016}"));
                    let _ = cache.put(black_box(k), Bytes::from_static(b"value"), 1, "bench", None);
                    next = next.wrapping_add(1);
                }
            })
        });
    }
    group.finish();
}

// 80 % reads / 20 % writes over a working set of twice the capacity.
fn bench_mixed_80r_20w(c: &mut Criterion) {
    const STEP: u64 = 7_919; // prime

    let mut group = c.benchmark_group("mixed_80r_20w");
    group.throughput(Throughput::Elements(OPS));

    for policy in POLICIES {
        let cache = cache_with(policy);
        let working_set = keys(CAP * 2);
        for k in working_set.iter().take(CAP as usize) {
            cache.put(k.clone(), Bytes::from_static(b"value"), 1, "bench", None)
                .unwrap();
        }
        let mut cursor = 0u64;
        group.bench_function(BenchmarkId::from_parameter(policy_label(policy)), |b| {
            b.iter(|| {
                for i in 0..OPS {
                    let k = &working_set[(cursor % (CAP * 2)) as usize];
                    if i % 5 == 0 {
                        let _ = cache.put(
                            k.clone(),
                            Bytes::from_static(b"value"),
                            1,
                            "bench",
                            None,
                        );
                    } else {
                        black_box(cache.get(black_box(k), "bench").unwrap());
                    }
                    cursor = cursor.wrapping_add(STEP);
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_get_hit, bench_insert_evicting, bench_mixed_80r_20w);
criterion_main!(benches);

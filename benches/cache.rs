use std::sync::Arc;
use std::time::Duration;

use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BenchmarkId;
use criterion::Criterion;
use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use ringlimit::context::RequestContext;
use ringlimit::ratelimit::{
    now_ms, KeyCodec, LimitConfig, MemoryStore, RateLimitCache, RateLimitKey, RateLimitRequest,
    RateLimitState, RequestState,
};

const CACHE_SIZE: usize = 50_000;
const KEY_COUNT: usize = 10_000;
const BURST: usize = 256;

fn keys() -> Vec<RateLimitKey> {
    (0..KEY_COUNT)
        .map(|i| KeyCodec::encode("bench", &[("user", format!("user-{i}"))]))
        .collect()
}

/// A cache whose loader already knows every key, as after a warm restart.
fn prefilled_cache(keys: &[RateLimitKey], config: LimitConfig) -> Arc<RateLimitCache> {
    let store = Arc::new(MemoryStore::new());
    let now = now_ms();
    for key in keys {
        store.insert(
            key.clone(),
            RateLimitState {
                algorithm: config.algorithm,
                limit: config.limit,
                duration_ms: config.duration_ms,
                remaining: config.limit,
                anchor_ms: now,
                updated_at_ms: now,
            },
        );
    }
    Arc::new(RateLimitCache::new(CACHE_SIZE).with_loader(store))
}

fn bench_cache(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()
        .unwrap();

    let keys = Arc::new(keys());
    let config = LimitConfig::new(u64::MAX / 2, Duration::from_secs(60));
    let cache = prefilled_cache(&keys, config);
    let ctx = RequestContext::background();

    let mut group = c.benchmark_group("cache");

    // hits == 0 reads state without consuming; hits == 1 takes the write path
    for (id, hits) in [("read", 0u64), ("write", 1u64)] {
        group.bench_with_input(BenchmarkId::new("parallel", id), &hits, |b, &hits| {
            let mut next = 0usize;
            b.to_async(&rt).iter(|| {
                let start = next;
                next = next.wrapping_add(BURST);
                let cache = cache.clone();
                let keys = keys.clone();
                let ctx = ctx.clone();
                async move {
                    let mut burst = FuturesUnordered::new();
                    for i in 0..BURST {
                        let key = keys[(start + i) % keys.len()].clone();
                        let request = RateLimitRequest::new(key, config).with_hits(hits);
                        let cache = cache.clone();
                        let ctx = ctx.clone();
                        burst.push(async move {
                            cache.get_rate_limit(&ctx, &request, RequestState::default()).await
                        });
                    }
                    while let Some(result) = burst.next().await {
                        let _ = black_box(result);
                    }
                }
            });
        });
    }

    group.bench_function("single_key_contention", |b| {
        let key = keys[0].clone();
        b.to_async(&rt).iter(|| {
            let cache = cache.clone();
            let key = key.clone();
            let ctx = ctx.clone();
            async move {
                let mut burst = FuturesUnordered::new();
                for _ in 0..BURST {
                    let request = RateLimitRequest::new(key.clone(), config);
                    let cache = cache.clone();
                    let ctx = ctx.clone();
                    burst.push(async move {
                        cache.get_rate_limit(&ctx, &request, RequestState::default()).await
                    });
                }
                while let Some(result) = burst.next().await {
                    let _ = black_box(result);
                }
            }
        });
    });

    group.finish();
}

fn bench_key_encoding(c: &mut Criterion) {
    let entries = [("api_key", "a1b2c3d4"), ("path", "/v1/orders"), ("method", "POST")];
    let mut buf = Vec::new();

    c.bench_function("key_encode_into", |b| {
        b.iter(|| {
            KeyCodec::encode_into(&mut buf, black_box("payments"), black_box(&entries));
            black_box(buf.len())
        })
    });
}

criterion_group!(benches, bench_cache, bench_key_encoding);
criterion_main!(benches);

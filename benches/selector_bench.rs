//! # 调度与限流热路径基准测试

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use model_gateway::cache::{CounterStore, MemoryCounterStore};
use model_gateway::scheduler::{CircuitState, SchedulingStrategy, UpstreamSelector, WeightedUpstream};
use model_gateway::store::{UpstreamAuth, UpstreamConfig};
use model_gateway::utils::system_clock;
use tokio::runtime::Runtime;

fn candidates(count: usize) -> Vec<WeightedUpstream> {
    (0..count)
        .map(|i| WeightedUpstream {
            upstream: Arc::new(UpstreamConfig {
                id: format!("upstream-{i}"),
                adapter: "openai".to_string(),
                base_url: format!("https://u{i}.example.com"),
                auth: UpstreamAuth::None,
                headers: Default::default(),
                timeout_ms: None,
                extras: serde_json::Value::Null,
            }),
            weight: u32::try_from(i % 4).unwrap_or(1),
            circuit_state: if i % 5 == 0 {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            upstream_model: "gpt-4".to_string(),
            model_override: None,
            timeout_ms: None,
        })
        .collect()
}

fn selector_benchmark(c: &mut Criterion) {
    let pool = candidates(16);
    let weighted = UpstreamSelector::new(SchedulingStrategy::WeightedRandom);
    let round_robin = UpstreamSelector::new(SchedulingStrategy::RoundRobin);

    c.bench_function("select_weighted_random_16", |b| {
        b.iter(|| weighted.select(black_box("bench"), black_box(&pool)))
    });
    c.bench_function("select_round_robin_16", |b| {
        b.iter(|| round_robin.select(black_box("bench"), black_box(&pool)))
    });
}

fn counter_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = MemoryCounterStore::new(system_clock());
    let mut now = 0u64;

    c.bench_function("memory_window_acquire", |b| {
        b.iter(|| {
            now += 1;
            rt.block_on(store.window_acquire(black_box("rl:key:chat"), now, 1_000, 1_000_000))
        })
    });
}

criterion_group!(benches, selector_benchmark, counter_benchmark);
criterion_main!(benches);

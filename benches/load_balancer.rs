//! Benchmarks for fleetguard components.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fleetguard::balancer::LoadBalancer;
use fleetguard::breaker::{CircuitBreaker, CircuitBreakerOptions};
use fleetguard::config::{InstanceConfig, MetricKey, ScalingAction, ScalingRule, StrategyKind};
use fleetguard::metrics::MetricsCollector;
use fleetguard::scaling::ScalingMetrics;
use fleetguard::util::RequestId;
use std::time::Duration;

fn create_balancer(strategy: StrategyKind, num_instances: u16) -> LoadBalancer {
    let balancer = LoadBalancer::new("bench", strategy);
    for i in 0..num_instances {
        balancer.register_instance(
            InstanceConfig::new(format!("i{i}"), "127.0.0.1", 9000 + i).with_weight(u32::from(i % 4) + 1),
        );
    }
    balancer
}

fn benchmark_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_and_release");
    group.throughput(Throughput::Elements(1));

    for (label, strategy) in [
        ("round_robin", StrategyKind::RoundRobin),
        ("weighted_round_robin", StrategyKind::WeightedRoundRobin),
        ("least_connections", StrategyKind::LeastConnections),
        ("fastest_response", StrategyKind::FastestResponse),
    ] {
        let balancer = create_balancer(strategy, 10);

        group.bench_function(label, |b| {
            b.iter(|| {
                let lease = balancer.acquire(None);
                black_box(lease.is_some());
            })
        });
    }

    group.finish();
}

fn benchmark_response_time_feedback(c: &mut Criterion) {
    let balancer = create_balancer(StrategyKind::FastestResponse, 10);

    c.bench_function("update_instance_metrics", |b| {
        b.iter(|| {
            balancer.update_instance_metrics(
                black_box("i3"),
                black_box(Duration::from_millis(12)),
                true,
            );
        })
    });
}

fn benchmark_breaker(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerOptions::default());

    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("execute_success", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(breaker.execute(|| async { Ok::<_, ()>(1) }).await.ok());
            })
        })
    });

    group.bench_function("stats", |b| {
        b.iter(|| {
            black_box(breaker.stats());
        })
    });

    group.finish();
}

fn benchmark_scaling(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let _guard = runtime.enter();

    let balancer = create_balancer(StrategyKind::RoundRobin, 3).with_scaling_rules(vec![ScalingRule {
        name: "cpu-high".to_string(),
        metric: MetricKey::CpuUsage,
        threshold: 80.0,
        action: ScalingAction::ScaleUp,
        cooldown: Duration::from_secs(3600),
        min_instances: 1,
        max_instances: 10,
    }]);
    let sample = ScalingMetrics::new().with(MetricKey::CpuUsage, 95.0);

    c.bench_function("record_metrics", |b| {
        b.iter(|| {
            black_box(balancer.record_metrics(sample.clone()));
        })
    });
}

fn benchmark_metrics(c: &mut Criterion) {
    let collector = MetricsCollector::new();

    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("record_request", |b| {
        b.iter(|| {
            collector.record_request(black_box("api"), black_box(Duration::from_millis(10)));
        })
    });

    group.bench_function("set_instance_health", |b| {
        b.iter(|| {
            collector.set_instance_health(black_box("api"), black_box("api-1"), true);
        })
    });

    group.finish();
}

fn benchmark_request_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_id");

    group.bench_function("generate", |b| {
        b.iter(|| {
            black_box(RequestId::generate());
        })
    });

    group.bench_function("sequential", |b| {
        b.iter(|| {
            black_box(RequestId::sequential());
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_strategies,
    benchmark_response_time_feedback,
    benchmark_breaker,
    benchmark_scaling,
    benchmark_metrics,
    benchmark_request_id,
);

criterion_main!(benches);

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;

use predictor_orchestrator::router::{select, unit_interval};
use predictor_orchestrator::{
    CapabilityRef, DeploymentLedger, InProcessPipeline, PredictorRegistry, RequestId, RoutingMode,
    TrafficRouter,
};

fn ledger_with(active: usize) -> Arc<DeploymentLedger> {
    let registry = Arc::new(PredictorRegistry::new());
    let ledger = Arc::new(DeploymentLedger::new(registry.clone()));
    for i in 0..active {
        let p = registry.register("bench", CapabilityRef(format!("cap-{i}"))).unwrap();
        ledger.stage(&p.id, 1.0 / (i + 1) as f64).unwrap();
        ledger.activate(&p.id).unwrap();
    }
    ledger
}

fn router_with(active: usize) -> TrafficRouter {
    TrafficRouter::new(ledger_with(active), Arc::new(InProcessPipeline::new()), RoutingMode::Hashed)
}

fn bench_route(c: &mut Criterion) {
    let ids: Vec<RequestId> = (0..1024).map(|i| RequestId(format!("req-{i}"))).collect();
    let mut group = c.benchmark_group("route");
    for active in [1usize, 2, 8] {
        let router = router_with(active);
        group.bench_with_input(BenchmarkId::from_parameter(active), &active, |b, _| {
            let mut n = 0usize;
            b.iter(|| {
                n = (n + 1) % ids.len();
                black_box(router.decide("bench", &ids[n]).unwrap());
            })
        });
    }
    group.finish();
}

fn bench_select(c: &mut Criterion) {
    let set = ledger_with(8).active_set("bench");
    c.bench_function("hash_and_select_8", |b| {
        b.iter(|| {
            let u = unit_interval(black_box("req-42"));
            black_box(select(&set, u));
        })
    });
}

criterion_group!(benches, bench_route, bench_select);
criterion_main!(benches);

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use worldline::{
    ArrangementStore, BeamConfig, Branch, CountTranslator, Diff, DiffLog, EngineConfig, Event,
    OverlayEngine, OverlayStore, RelationName, RelationSpec, RuleBasedPredictor, RuntimeConfig,
    ScenarioId, SubscriptionSpec,
};

fn demand_engine() -> OverlayEngine<RuleBasedPredictor> {
    let predictor = RuleBasedPredictor::new("demand").rule(
        "orders",
        vec![
            Branch {
                attenuation: 0.7,
                scale: 0.5,
            },
            Branch {
                attenuation: 0.5,
                scale: 1.0,
            },
            Branch {
                attenuation: 0.3,
                scale: 2.0,
            },
        ],
    );
    let config = EngineConfig {
        beam: BeamConfig {
            beam_width: 4,
            max_depth: 3,
            ..BeamConfig::default()
        },
        runtime: RuntimeConfig {
            predictor_workers: 2,
            ..RuntimeConfig::default()
        },
        ..EngineConfig::default()
    };
    let mut engine = OverlayEngine::new(config, predictor).unwrap();
    engine
        .register_relation(RelationSpec::new("orders", "retail"))
        .unwrap();
    engine
        .register_translator(CountTranslator::new("retail").count("order", "orders", 1))
        .unwrap();
    engine
        .subscribe(SubscriptionSpec::new("count(orders, X) >= 1000000", 3, 0.2))
        .unwrap();
    engine
}

fn bench_ingest_and_settle(c: &mut Criterion) {
    let mut group = c.benchmark_group("waves");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ingest_and_settle_depth_3", |b| {
        b.iter_custom(|iters| {
            let mut engine = demand_engine();
            let start = Instant::now();
            for epoch in 0..iters {
                let event = Event::new("retail", "order", epoch, "pos-1").with_key("X");
                engine.ingest(event).unwrap();
                engine.run_until_idle(Duration::from_secs(10)).unwrap();
            }
            start.elapsed()
        })
    });
    group.finish();
}

fn bench_composed_read(c: &mut Criterion) {
    let orders = RelationName::new("orders");
    let store = ArrangementStore::new(16, Arc::new(DiffLog::new()));
    store
        .register_relation(RelationSpec::new("orders", "retail"))
        .unwrap();
    let base: Vec<Diff> = (0..10_000)
        .map(|i| Diff::count("orders", format!("sku-{i}"), 1))
        .collect();
    store.apply(&orders, &base).unwrap();

    // Three-deep lineage, each level touching a handful of keys.
    let overlays = OverlayStore::new(4);
    let mut parent = ScenarioId::BASE;
    for level in 1..=3u64 {
        let id = ScenarioId::from_raw(level);
        overlays.create(id, parent).unwrap();
        let diffs: Vec<Diff> = (0..16)
            .map(|i| Diff::count("orders", format!("sku-{}", i * level), 1))
            .collect();
        overlays.append(id, &diffs).unwrap();
        parent = id;
    }
    let view = overlays.view(parent).unwrap();

    c.bench_function("composed_read/depth_3", |b| {
        b.iter(|| black_box(store.composed_read(&orders, "sku-32", &view).unwrap()));
    });
}

fn bench_parallel_apply(c: &mut Criterion) {
    let orders = RelationName::new("orders");
    let diffs: Vec<Diff> = (0..10_000)
        .map(|i| Diff::count("orders", format!("sku-{}", i % 2_048), 1))
        .collect();

    let mut group = c.benchmark_group("arrangement_apply");
    group.throughput(Throughput::Elements(diffs.len() as u64));
    for workers in [1usize, 4] {
        group.bench_function(format!("workers_{workers}"), |b| {
            let store = ArrangementStore::new(16, Arc::new(DiffLog::new()));
            store
                .register_relation(RelationSpec::new("orders", "retail"))
                .unwrap();
            b.iter(|| store.apply_parallel(&orders, &diffs, workers).unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    waves,
    bench_ingest_and_settle,
    bench_composed_read,
    bench_parallel_apply
);
criterion_main!(waves);

use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;

use worldline::{
    BeamConfig, Branch, CandidateSink, ConfigError, CountTranslator, Diff, EngineConfig, Event,
    OverlayEngine, PredictionRequest, Predictor, RelationName, RelationSpec, RuleBasedPredictor,
    RuntimeConfig, ScenarioId, ScenarioState, SubscriptionSpec, TriggerMode, Weight, WorldError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(k: usize, max_depth: u32, timeout_ms: u64) -> EngineConfig {
    init_tracing();
    EngineConfig {
        beam: BeamConfig {
            beam_width: k,
            max_depth,
            ..BeamConfig::default()
        },
        runtime: RuntimeConfig {
            predictor_workers: 2,
            wave_timeout_ms: timeout_ms,
            arrangement_shards: 4,
            ..RuntimeConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn retail<P: Predictor>(engine: &OverlayEngine<P>) {
    engine
        .register_relation(RelationSpec::new("orders", "retail"))
        .unwrap();
    engine
        .register_relation(RelationSpec::new("returns", "retail"))
        .unwrap();
    engine
        .register_translator(
            CountTranslator::new("retail")
                .count("order", "orders", 1)
                .count("cancel", "orders", -1)
                .count("return", "returns", 1),
        )
        .unwrap();
}

fn orders(n: usize, epoch: u64) -> Vec<Event> {
    (0..n)
        .map(|_| Event::new("retail", "order", epoch, "pos-1").with_key("X"))
        .collect()
}

fn rel(name: &str) -> RelationName {
    RelationName::new(name)
}

struct Quiet;

impl Predictor for Quiet {
    fn name(&self) -> &str {
        "quiet"
    }

    fn propose(&self, _request: &PredictionRequest, sink: CandidateSink) {
        sink.complete();
    }
}

#[test]
fn sku_surge_fires_on_surviving_branch_only() {
    let predictor = RuleBasedPredictor::new("demand").rule(
        "orders",
        vec![
            Branch {
                attenuation: 0.6,
                scale: 0.3,
            },
            Branch {
                attenuation: 0.4,
                scale: 0.1,
            },
        ],
    );
    let mut engine = OverlayEngine::new(config(1, 2, 2_000), predictor).unwrap();
    retail(&engine);
    let sub = engine
        .subscribe(SubscriptionSpec::new("count(orders, X) >= 12", 2, 0.5))
        .unwrap();
    let stream = engine.alert_stream();

    let base_alerts = engine.ingest_batch(orders(10, 1)).unwrap();
    assert!(base_alerts.is_empty());

    let alerts = engine.run_until_idle(Duration::from_secs(10)).unwrap();
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.subscription_id, sub.id());
    assert_eq!(alert.depth, 1);
    assert!((alert.weight.value() - 0.6).abs() < 1e-9);
    assert_eq!(alert.explanation.lineage, vec![alert.scenario_id]);
    assert_eq!(
        alert.explanation.triggering_diff,
        Some(Diff::count("orders", "X", 3))
    );

    // Survivor composes base 10 with its own +3; the base is untouched.
    let survivor = alert.scenario_id;
    assert_eq!(
        engine
            .composed_read(survivor, &rel("orders"), "X")
            .unwrap()
            .count(),
        13
    );
    assert_eq!(engine.store().read(&rel("orders"), "X").count(), 10);

    // The 0.4 branch was ranked out and never became readable.
    let pruned: Vec<_> = engine
        .scenarios()
        .iter()
        .filter(|r| r.depth == 1 && r.state == ScenarioState::Pruned)
        .collect();
    assert_eq!(pruned.len(), 1);
    assert!((pruned[0].weight.value() - 0.4).abs() < 1e-9);
    assert!(engine.composed_read(pruned[0].id, &rel("orders"), "X").is_err());

    // Pull and push delivery agree.
    let logged: Vec<_> = engine.alerts_from(0).collect();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].scenario_id, survivor);
    assert_eq!(stream.try_recv().map(|a| a.scenario_id), Some(survivor));
}

#[test]
fn equivalent_branches_merge_into_heavier() {
    let predictor = RuleBasedPredictor::new("dup").rule(
        "orders",
        vec![
            Branch {
                attenuation: 0.3,
                scale: 1.0,
            },
            Branch {
                attenuation: 0.45,
                scale: 1.0,
            },
        ],
    );
    let mut engine = OverlayEngine::new(config(4, 1, 2_000), predictor).unwrap();
    retail(&engine);
    engine.ingest_batch(orders(2, 1)).unwrap();
    engine.run_until_idle(Duration::from_secs(10)).unwrap();

    let active = engine.active_scenarios();
    assert_eq!(active.len(), 1);
    let survivor = active[0].id;
    assert!((active[0].weight.value() - 0.45).abs() < 1e-9);

    let merged: Vec<_> = engine
        .scenarios()
        .iter()
        .filter(|r| r.state == ScenarioState::Merged { into: survivor })
        .collect();
    assert_eq!(merged.len(), 1);
    assert!((merged[0].weight.value() - 0.3).abs() < 1e-9);

    // Reads through a merged id land on the survivor.
    assert_eq!(
        engine
            .composed_read(merged[0].id, &rel("orders"), "X")
            .unwrap()
            .count(),
        4
    );
    assert_eq!(engine.metrics().snapshot().scenario_merged, 1);
}

#[test]
fn equivalent_grandchildren_merge_through_composed_lineage() {
    let predictor = RuleBasedPredictor::new("dup").rule(
        "orders",
        vec![
            Branch {
                attenuation: 0.45,
                scale: 1.0,
            },
            Branch {
                attenuation: 0.3,
                scale: 1.0,
            },
        ],
    );
    let mut engine = OverlayEngine::new(config(4, 2, 2_000), predictor).unwrap();
    retail(&engine);
    engine.ingest_batch(orders(2, 1)).unwrap();
    engine.run_until_idle(Duration::from_secs(10)).unwrap();

    let active = engine.active_scenarios();
    assert_eq!(active.len(), 2);
    let parent = active.iter().find(|s| s.depth == 1).unwrap().id;
    let leaf = active.iter().find(|s| s.depth == 2).unwrap();
    assert_eq!(leaf.lineage, vec![parent, leaf.id]);
    assert!((leaf.weight.value() - 0.45 * 0.45).abs() < 1e-9);

    let merged: Vec<_> = engine
        .scenarios()
        .iter()
        .filter(|r| r.depth == 2 && matches!(r.state, ScenarioState::Merged { .. }))
        .collect();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].state, ScenarioState::Merged { into: leaf.id });
    assert_eq!(merged[0].parent, Some(parent));

    // Base 2, plus 2 at each depth.
    let read = |id| {
        engine
            .composed_read(id, &rel("orders"), "X")
            .unwrap()
            .count()
    };
    assert_eq!(read(leaf.id), 6);
    assert_eq!(read(merged[0].id), read(leaf.id));
    assert_eq!(engine.metrics().snapshot().scenario_merged, 2);
}

#[test]
fn retiring_a_branch_expires_its_descendants() {
    let predictor = RuleBasedPredictor::new("demand").rule(
        "orders",
        vec![Branch {
            attenuation: 0.8,
            scale: 1.0,
        }],
    );
    let mut engine = OverlayEngine::new(config(1, 2, 2_000), predictor).unwrap();
    retail(&engine);
    engine
        .subscribe(SubscriptionSpec::new("count(orders, X) >= 4", 2, 0.1))
        .unwrap();
    engine.ingest_batch(orders(1, 1)).unwrap();
    assert!(engine
        .run_until_idle(Duration::from_secs(10))
        .unwrap()
        .is_empty());

    let active = engine.active_scenarios();
    let parent = active.iter().find(|s| s.depth == 1).unwrap().id;
    let child = active.iter().find(|s| s.depth == 2).unwrap().id;
    assert_eq!(engine.composed_read(child, &rel("orders"), "X").unwrap().count(), 3);

    assert_eq!(engine.retire_scenario(parent).unwrap(), vec![parent, child]);
    assert_eq!(engine.scenario(child).unwrap().state, ScenarioState::Expired);
    assert!(engine.composed_read(child, &rel("orders"), "X").is_err());
    assert!(engine.active_scenarios().is_empty());
    assert_eq!(engine.metrics().snapshot().scenario_expired, 1);

    // The orphan would now read 4; only the fresh lineage may alert.
    let mut alerts = engine.ingest_batch(orders(1, 2)).unwrap();
    alerts.extend(engine.run_until_idle(Duration::from_secs(10)).unwrap());
    assert_eq!(alerts.len(), 1);
    assert_ne!(alerts[0].scenario_id, child);
    assert!(!alerts[0].explanation.lineage.contains(&parent));
    assert_eq!(engine.alerts_from(0).count(), 1);
}

struct Stalling;

impl Predictor for Stalling {
    fn name(&self) -> &str {
        "stalling"
    }

    fn propose(&self, request: &PredictionRequest, sink: CandidateSink) {
        let weight = request.parent_weight.attenuate(0.5);
        sink.emit(weight, vec![Diff::count("orders", "X", 1)]);
        sink.abandon();
    }
}

#[test]
fn stalled_predictor_closes_wave_on_timeout() {
    let mut engine = OverlayEngine::new(config(2, 1, 50), Stalling).unwrap();
    retail(&engine);
    engine.ingest_batch(orders(1, 1)).unwrap();
    engine.run_until_idle(Duration::from_secs(10)).unwrap();

    let snapshot = engine.metrics().snapshot();
    assert_eq!(snapshot.waves_closed, 1);
    assert_eq!(snapshot.wave_timeouts, 1);
    // Partial output is still ranked.
    assert_eq!(engine.active_scenarios().len(), 1);
}

struct Slow;

impl Predictor for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn propose(&self, request: &PredictionRequest, sink: CandidateSink) {
        thread::sleep(Duration::from_millis(150));
        sink.emit(
            request.parent_weight.attenuate(0.5),
            vec![Diff::count("orders", "X", 1)],
        );
        sink.complete();
    }
}

#[test]
fn late_candidates_are_discarded_and_counted() {
    let mut engine = OverlayEngine::new(config(2, 1, 20), Slow).unwrap();
    retail(&engine);
    engine.ingest_batch(orders(1, 1)).unwrap();
    engine.run_until_idle(Duration::from_secs(10)).unwrap();
    assert!(engine.active_scenarios().is_empty());

    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.metrics().snapshot().late_candidates == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
        engine.step().unwrap();
    }
    assert_eq!(engine.metrics().snapshot().late_candidates, 1);
    assert!(engine.active_scenarios().is_empty());
}

#[test]
fn epoch_regression_is_rejected() {
    let mut engine = OverlayEngine::new(config(1, 1, 200), Quiet).unwrap();
    retail(&engine);
    engine.ingest_batch(orders(1, 7)).unwrap();
    let err = engine.ingest_batch(orders(1, 3)).unwrap_err();
    assert!(matches!(
        err,
        WorldError::Runtime(worldline::RuntimeError::EpochRegression {
            epoch: 3,
            last: 7,
            ..
        })
    ));
    assert!(!err.is_recoverable());
}

#[test]
fn level_mode_refires_after_rearming() {
    let mut engine = OverlayEngine::new(config(1, 1, 200), Quiet).unwrap();
    retail(&engine);
    engine
        .subscribe(
            SubscriptionSpec::new("count(orders, X) >= 2", 0, 1.0).with_mode(TriggerMode::Level),
        )
        .unwrap();
    engine
        .subscribe(SubscriptionSpec::new("count(orders, X) >= 2", 0, 1.0))
        .unwrap();

    let cancel = || Event::new("retail", "cancel", 3, "pos-1").with_key("X");

    assert_eq!(engine.ingest_batch(orders(2, 1)).unwrap().len(), 2);
    assert!(engine.ingest(cancel()).unwrap().is_empty());
    let again = engine.ingest_batch(orders(1, 4)).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].scenario_id, ScenarioId::BASE);
    assert_eq!(again[0].depth, 0);
    assert_eq!(again[0].weight, Weight::ONE);
    engine.run_until_idle(Duration::from_secs(10)).unwrap();
}

#[test]
fn idle_scenarios_expire_and_are_collected() {
    let predictor = RuleBasedPredictor::new("demand").rule(
        "orders",
        vec![Branch {
            attenuation: 0.8,
            scale: 1.0,
        }],
    );
    let mut cfg = config(2, 1, 2_000);
    cfg.beam.ttl_epochs = 1;
    let mut engine = OverlayEngine::new(cfg, predictor).unwrap();
    retail(&engine);
    engine.ingest_batch(orders(1, 1)).unwrap();
    engine.run_until_idle(Duration::from_secs(10)).unwrap();
    let id = engine.active_scenarios()[0].id;

    // A change the predictor ignores advances time without touching the scenario.
    engine
        .ingest(Event::new("retail", "return", 5, "pos-1").with_key("X"))
        .unwrap();
    engine.run_until_idle(Duration::from_secs(10)).unwrap();

    assert_eq!(engine.scenario(id).unwrap().state, ScenarioState::Expired);
    assert!(engine.active_scenarios().is_empty());
    assert!(engine.metrics().snapshot().overlays_collected >= 1);
}

#[test]
fn configuration_errors_surface_at_registration() {
    let mut engine = OverlayEngine::new(config(1, 1, 200), Quiet).unwrap();
    retail(&engine);

    let err = engine
        .subscribe(SubscriptionSpec::new("count(stock, X) > 1", 1, 0.5))
        .unwrap_err();
    assert!(matches!(
        err,
        WorldError::Config(ConfigError::UnknownRelation { .. })
    ));

    let err = engine
        .subscribe(
            SubscriptionSpec::new("count(orders, X) > 1", 1, 0.5).with_domain_filter("^billing$"),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        WorldError::Config(ConfigError::DomainFiltered { .. })
    ));

    let err = engine
        .subscribe(SubscriptionSpec::new("count(orders X) > 1", 1, 0.5))
        .unwrap_err();
    assert!(matches!(
        err,
        WorldError::Config(ConfigError::MalformedPredicate { .. })
    ));

    assert!(matches!(
        engine.register_relation(RelationSpec::new("orders", "retail")),
        Err(ConfigError::DuplicateRelation { .. })
    ));

    let err = engine
        .register_translator(CountTranslator::new("refunds").count("refund", "refunds", 1))
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::UnknownRelation { ref relation } if relation == "refunds"
    ));
}

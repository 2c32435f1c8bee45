//! The overlay engine: wires ingestion, views, predictors, scenarios, and subscriptions.
//!
//! The engine is driven by the caller. [`OverlayEngine::ingest`] applies events to
//! the base world and opens prediction waves; [`OverlayEngine::step`] closes waves,
//! admits scenarios, evaluates subscriptions, and reclaims retired overlays. Only
//! predictors run on their own threads.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::arrangement::ArrangementStore;
use crate::config::EngineConfig;
use crate::diff::{compact, Accum, Diff};
use crate::diff_log::DiffLog;
use crate::error::{ConfigError, RuntimeError, WorldResult};
use crate::frontier::{CloseReason, ClosedWave, FrontierCoordinator, FrontierRejection, WaveId, WaveKey};
use crate::metrics::MetricsRegistry;
use crate::overlay::{ComposedReader, OverlayStore, OverlayView};
use crate::predictor::{PredictionRequest, Predictor, PredictorMsg, PredictorPool};
use crate::scenario::{ScenarioManager, ScenarioRecord, ScenarioState, WaveOutcome};
use crate::subscription::{Alert, AlertCursor, AlertLog, AlertStream, EvalTarget, SubscriptionEngine, SubscriptionHandle, SubscriptionSpec};
use crate::types::{Depth, Epoch, Event, RelationName, RelationSpec, ScenarioId, Weight};
use crate::views::{EventTranslator, TranslatorRegistry, ViewBuilder, ViewRegistry};

/// Evaluator name the subscription engine reports progress under.
const SUBSCRIPTION_EVALUATOR: &str = "subscriptions";

/// Upper bound on a single idle wait in [`OverlayEngine::run_until_idle`].
const IDLE_POLL: Duration = Duration::from_millis(10);

/// What one call to [`OverlayEngine::step`] did.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    /// Outcome of every wave closed, in close order.
    pub outcomes: Vec<WaveOutcome>,
    /// Alerts emitted.
    pub alerts: Vec<Alert>,
    /// Scenarios pruned by capacity pressure.
    pub pressured: Vec<ScenarioId>,
    /// Scenarios expired by TTL.
    pub expired: Vec<ScenarioId>,
    /// Overlays deleted past the watermark.
    pub collected: Vec<ScenarioId>,
}

impl StepReport {
    /// Returns true if the step closed no wave and changed no scenario.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.pressured.is_empty() && self.expired.is_empty() && self.collected.is_empty()
    }
}

/// Summary of a live scenario.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub id: ScenarioId,
    pub depth: Depth,
    pub weight: Weight,
    pub lineage: Vec<ScenarioId>,
    pub overlay_entries: usize,
}

struct World {
    id: ScenarioId,
    depth: Depth,
    weight: Weight,
    lineage: Vec<ScenarioId>,
    view: OverlayView,
}

impl World {
    fn target<'a>(&self, reader: &'a ComposedReader<'a>) -> EvalTarget<'a> {
        EvalTarget {
            scenario: self.id,
            depth: self.depth,
            weight: self.weight,
            lineage: self.lineage.clone(),
            reader,
        }
    }
}

/// Single-process branching-futures engine over one predictor.
pub struct OverlayEngine<P: Predictor> {
    config: EngineConfig,
    predictor: Arc<P>,
    store: Arc<ArrangementStore>,
    overlays: OverlayStore,
    views: ViewRegistry,
    translators: TranslatorRegistry,
    scenarios: ScenarioManager,
    frontier: FrontierCoordinator,
    subscriptions: SubscriptionEngine,
    pool: PredictorPool,
    pending: Vec<PredictorMsg>,
    source_epochs: HashMap<String, Epoch>,
    epoch: Epoch,
    metrics: MetricsRegistry,
}

impl<P: Predictor> fmt::Debug for OverlayEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayEngine")
            .field("predictor", &self.predictor.name())
            .field("epoch", &self.epoch)
            .field("active", &self.scenarios.active_count())
            .field("open_waves", &self.frontier.open_waves())
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl<P: Predictor> OverlayEngine<P> {
    /// Validate `config` and start the predictor pool.
    pub fn new(config: EngineConfig, predictor: P) -> WorldResult<Self> {
        config.validate()?;
        let runtime = &config.runtime;

        let log = Arc::new(DiffLog::new());
        let store = Arc::new(ArrangementStore::new(runtime.arrangement_shards, log));
        let overlays = OverlayStore::new(runtime.arrangement_shards);
        let views = ViewRegistry::new(runtime.apply_workers);
        let scenarios = ScenarioManager::new(config.beam.clone(), config.capacity);
        let mut frontier = FrontierCoordinator::new(runtime.wave_timeout());
        frontier.register_evaluator(SUBSCRIPTION_EVALUATOR);
        let subscriptions = SubscriptionEngine::new(Arc::new(AlertLog::new(runtime.alert_stream_capacity)));

        let predictor = Arc::new(predictor);
        let pool = PredictorPool::start(
            Arc::clone(&predictor),
            runtime.predictor_workers,
            runtime.request_queue_capacity,
            runtime.candidate_queue_capacity,
        )?;

        tracing::info!(
            predictor = predictor.name(),
            max_depth = config.beam.max_depth,
            beam_width = config.beam.beam_width,
            workers = runtime.predictor_workers,
            "overlay engine started"
        );

        Ok(Self {
            config,
            predictor,
            store,
            overlays,
            views,
            translators: TranslatorRegistry::new(),
            scenarios,
            frontier,
            subscriptions,
            pool,
            pending: Vec::new(),
            source_epochs: HashMap::new(),
            epoch: 0,
            metrics: MetricsRegistry::new(),
        })
    }

    /// Configuration in force.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The pooled predictor.
    #[must_use]
    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    /// Shared base arrangements.
    #[must_use]
    pub fn store(&self) -> &Arc<ArrangementStore> {
        &self.store
    }

    /// Append-only log of every base batch.
    #[must_use]
    pub fn diff_log(&self) -> &Arc<DiffLog> {
        self.store.log()
    }

    /// Engine metrics.
    #[must_use]
    pub const fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Highest epoch ingested so far.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    // ---- registration -------------------------------------------------------

    /// Declare a relation. Only allowed before the first event is applied.
    pub fn register_relation(&self, spec: RelationSpec) -> Result<(), ConfigError> {
        self.store.register_relation(spec)
    }

    /// Register a named key function for arrangements and projections.
    pub fn register_key_fn(
        &self,
        name: impl Into<String>,
        f: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Result<(), ConfigError> {
        self.store.register_key_fn(name, f)
    }

    /// Register a derived view.
    pub fn register_view(&self, view: impl ViewBuilder + 'static) -> Result<(), ConfigError> {
        self.views.register(&self.store, Arc::new(view))
    }

    /// Register the translator for one event domain. The relations it writes must
    /// already be registered.
    pub fn register_translator(&self, translator: impl EventTranslator + 'static) -> Result<(), ConfigError> {
        self.translators.register(&self.store, Arc::new(translator))
    }

    /// Register a subscription and evaluate it against every live world.
    pub fn subscribe(&mut self, spec: SubscriptionSpec) -> WorldResult<SubscriptionHandle> {
        let handle = self.subscriptions.register(spec, &self.store)?;

        let worlds = self.live_worlds();
        let readers: Vec<ComposedReader<'_>> = worlds.iter().map(|w| ComposedReader::new(&self.store, &w.view)).collect();
        let targets: Vec<EvalTarget<'_>> = worlds.iter().zip(&readers).map(|(w, r)| w.target(r)).collect();
        let alerts = self.subscriptions.evaluate_subscription(handle, &targets, self.epoch);
        self.metrics.inc_scenario_alerts(alerts.len() as u64);
        Ok(handle)
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.unregister(handle)
    }

    // ---- reads --------------------------------------------------------------

    /// Restartable cursor over every alert from `offset`.
    #[must_use]
    pub fn alerts_from(&self, offset: usize) -> AlertCursor {
        self.subscriptions.log().cursor(offset)
    }

    /// Push stream of alerts emitted from now on.
    #[must_use]
    pub fn alert_stream(&self) -> AlertStream {
        self.subscriptions.log().stream()
    }

    /// Read (relation, key) in the world of `scenario` (base ⊕ its lineage).
    ///
    /// Merged scenarios read through their survivor. Pruned and expired scenarios
    /// are not readable.
    pub fn composed_read(&self, scenario: ScenarioId, relation: &RelationName, key: &str) -> WorldResult<Accum> {
        let resolved = self
            .scenarios
            .resolve(scenario)
            .filter(|id| self.scenarios.is_live(*id))
            .ok_or(RuntimeError::ScenarioNotFound { id: scenario })?;
        let view = self.overlays.view(resolved)?;
        Ok(self.store.composed_read(relation, key, &view)?)
    }

    /// Record of any scenario ever allocated.
    #[must_use]
    pub fn scenario(&self, id: ScenarioId) -> Option<&ScenarioRecord> {
        self.scenarios.get(id)
    }

    /// Every scenario record in id order.
    #[must_use]
    pub fn scenarios(&self) -> &[ScenarioRecord] {
        self.scenarios.records()
    }

    /// Active scenarios in id order.
    #[must_use]
    pub fn active_scenarios(&self) -> Vec<ScenarioSummary> {
        self.scenarios
            .active_ids()
            .into_iter()
            .filter_map(|id| {
                let record = self.scenarios.get(id)?;
                Some(ScenarioSummary {
                    id,
                    depth: record.depth,
                    weight: record.weight,
                    lineage: self.scenarios.lineage(id),
                    overlay_entries: self.overlays.get(id).map_or(0, |o| o.len()),
                })
            })
            .collect()
    }

    /// Returns true if no wave is open and no predictor message is buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.frontier.is_idle() && self.pending.is_empty()
    }

    /// Explicitly retire an Active scenario and expire its Active descendants.
    ///
    /// Returns every id that left the Active state, `id` first.
    pub fn retire_scenario(&mut self, id: ScenarioId) -> WorldResult<Vec<ScenarioId>> {
        let retired = self.scenarios.retire(id)?;
        self.metrics.inc_scenario_pruned(1);
        self.metrics.inc_scenario_expired(retired.len().saturating_sub(1) as u64);
        let seq = self.frontier.last_close_seq();
        self.retire_overlays(&retired, seq);
        self.update_gauges();
        Ok(retired)
    }

    // ---- ingestion ----------------------------------------------------------

    /// Ingest one event. Returns the alerts it triggered on existing worlds.
    pub fn ingest(&mut self, event: Event) -> WorldResult<Vec<Alert>> {
        self.ingest_batch(vec![event])
    }

    /// Ingest a batch of events as one base change.
    ///
    /// Epoch regressions and untranslatable events reject the whole batch before
    /// anything is applied.
    pub fn ingest_batch(&mut self, events: Vec<Event>) -> WorldResult<Vec<Alert>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut epochs = self.source_epochs.clone();
        for event in &events {
            if let Some(&last) = epochs.get(&event.source) {
                if event.epoch < last {
                    return Err(RuntimeError::EpochRegression {
                        origin: event.source.clone(),
                        epoch: event.epoch,
                        last,
                    }
                    .into());
                }
            }
            epochs.insert(event.source.clone(), event.epoch);
        }

        let mut translated = Vec::with_capacity(events.len());
        for event in &events {
            let diffs = self.translators.translate(event)?;
            if let Some(diff) = diffs.iter().find(|d| !self.store.contains(&d.relation)) {
                return Err(ConfigError::UnknownRelation {
                    relation: diff.relation.to_string(),
                }
                .into());
            }
            translated.push(diffs);
        }
        self.source_epochs = epochs;

        let mut applied = Vec::new();
        for (event, diffs) in events.iter().zip(translated) {
            applied.extend(self.views.apply(&self.store, diffs, event.epoch, &event.source)?);
        }
        let epoch = events.iter().map(|e| e.epoch).max().unwrap_or(self.epoch);
        self.epoch = self.epoch.max(epoch);
        self.metrics.inc_base_events(events.len() as u64);
        self.metrics.inc_base_diffs(applied.len() as u64);

        let changed = compact(&applied);
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(events = events.len(), diffs = changed.len(), epoch, "base updated");

        let worlds = self.live_worlds();
        let readers: Vec<ComposedReader<'_>> = worlds.iter().map(|w| ComposedReader::new(&self.store, &w.view)).collect();
        let targets: Vec<EvalTarget<'_>> = worlds.iter().zip(&readers).map(|(w, r)| w.target(r)).collect();
        let alerts = self.subscriptions.on_base_diffs(&changed, &targets, epoch);
        self.metrics.inc_scenario_alerts(alerts.len() as u64);
        drop(targets);
        drop(readers);

        let max_depth = self.config.beam.max_depth;
        for world in worlds.into_iter().filter(|w| w.depth < max_depth) {
            self.request_children(world.id, world.depth, world.weight, world.view, changed.clone(), epoch)?;
        }
        Ok(alerts)
    }

    fn live_worlds(&self) -> Vec<World> {
        let base = World {
            id: ScenarioId::BASE,
            depth: 0,
            weight: Weight::ONE,
            lineage: Vec::new(),
            view: OverlayView::base(),
        };
        std::iter::once(base)
            .chain(self.scenarios.active_ids().into_iter().filter_map(|id| self.world(id)))
            .collect()
    }

    fn world(&self, id: ScenarioId) -> Option<World> {
        if !self.scenarios.is_live(id) {
            return None;
        }
        let (depth, weight) = self.scenarios.depth_weight(id)?;
        let view = self.overlays.view(id).ok()?;
        Some(World {
            id,
            depth,
            weight,
            lineage: self.scenarios.lineage(id),
            view,
        })
    }

    fn request_children(
        &mut self,
        parent: ScenarioId,
        depth: Depth,
        weight: Weight,
        view: OverlayView,
        deltas: Vec<Diff>,
        epoch: Epoch,
    ) -> WorldResult<Option<WaveId>> {
        if deltas.is_empty() {
            return Ok(None);
        }
        let key = WaveKey {
            parent,
            depth: depth + 1,
        };
        let producers = [self.pool.producer().to_string()];
        let wave = self.frontier.open_wave(key, epoch, &producers, Instant::now());
        let request = PredictionRequest {
            wave,
            parent,
            parent_weight: weight,
            depth: key.depth,
            epoch,
            deltas,
            view,
            store: Arc::clone(&self.store),
        };
        let pending = &mut self.pending;
        self.pool.submit(request, |msg| pending.push(msg))?;
        Ok(Some(wave))
    }

    // ---- stepping -----------------------------------------------------------

    /// Drain predictor output, close ready waves, and act on them.
    pub fn step(&mut self) -> WorldResult<StepReport> {
        let mut report = StepReport::default();

        let mut messages = std::mem::take(&mut self.pending);
        messages.extend(self.pool.drain());
        for msg in messages {
            self.accept(msg);
        }

        for wave in self.frontier.poll_closable(Instant::now()) {
            self.close_wave(wave, &mut report)?;
        }

        let expired = self.scenarios.expire_stale(self.epoch);
        if !expired.is_empty() {
            self.metrics.inc_scenario_expired(expired.len() as u64);
            let seq = self.frontier.last_close_seq();
            self.retire_overlays(&expired, seq);
            report.expired = expired;
        }

        report.collected = self.overlays.collect(self.frontier.watermark());
        self.metrics.inc_overlays_collected(report.collected.len() as u64);
        self.update_gauges();
        Ok(report)
    }

    fn accept(&mut self, msg: PredictorMsg) {
        match msg {
            PredictorMsg::Candidate(candidate) => {
                self.metrics.inc_predicted_candidates(1);
                let wave = candidate.wave;
                if let Err(rejection) = self.frontier.push_candidate(candidate) {
                    self.metrics.inc_late_candidates(1);
                    match rejection {
                        FrontierRejection::Late => tracing::debug!(wave, "late candidate discarded"),
                        FrontierRejection::UnknownWave => tracing::warn!(wave, "candidate for unknown wave"),
                    }
                }
            }
            PredictorMsg::Done { wave, producer } => {
                let _ = self.frontier.register_done(wave, &producer);
            }
        }
    }

    fn close_wave(&mut self, wave: ClosedWave, report: &mut StepReport) -> WorldResult<()> {
        let timed_out = wave.reason == CloseReason::Timeout;
        self.metrics.record_wave(wave.latency, timed_out);
        if timed_out {
            let err = RuntimeError::PredictorTimeout {
                wave: wave.id,
                waited_ms: u64::try_from(wave.latency.as_millis()).unwrap_or(u64::MAX),
            };
            tracing::warn!(error = %err, missing = ?wave.missing, "wave degraded");
        }

        let mut derived: HashMap<ScenarioId, Vec<Diff>> = HashMap::new();
        let outcome = {
            let store = &self.store;
            let views = &self.views;
            let overlays = &self.overlays;
            let epoch = wave.epoch;
            self.scenarios.admit_wave(&wave, epoch, overlays, |id, candidate| {
                let applied = views.derive_overlay(store, overlays, id, candidate.diffs.clone(), epoch)?;
                derived.insert(id, applied);
                Ok(())
            })?
        };

        self.metrics.inc_rejected_candidates(outcome.rejected.len() as u64);
        self.metrics
            .inc_scenario_created((outcome.admitted.len() + outcome.merged.len()) as u64);
        self.metrics.inc_scenario_pruned(outcome.pruned.len() as u64);
        self.metrics.inc_scenario_merged(outcome.merged.len() as u64);
        self.metrics.inc_scenario_expired(outcome.expired.len() as u64);
        self.metrics.inc_overlay_dropped(outcome.dropped.len() as u64);
        self.retire_overlays(&outcome.retired, wave.close_seq);

        // Evaluate admitted scenarios in rank order, then branch them.
        let max_depth = self.config.beam.max_depth;
        for &id in &outcome.admitted {
            let Some(world) = self.world(id) else {
                continue;
            };
            let diffs = derived.remove(&id).unwrap_or_default();
            {
                let reader = ComposedReader::new(&self.store, &world.view);
                let target = world.target(&reader);
                let alerts = self.subscriptions.on_overlay_diffs(&target, &diffs, wave.epoch, wave.id);
                self.metrics.inc_scenario_alerts(alerts.len() as u64);
                report.alerts.extend(alerts);
            }

            if world.depth < max_depth {
                self.request_children(id, world.depth, world.weight, world.view, compact(&diffs), wave.epoch)?;
            }
        }
        self.frontier.observe(SUBSCRIPTION_EVALUATOR, wave.close_seq);

        let pressured = self.scenarios.apply_pressure(&self.overlays)?;
        if self.scenarios.pressure_waves() > 0 {
            self.metrics.inc_pressure_waves(1);
        }
        if !pressured.is_empty() {
            let expired = pressured
                .iter()
                .filter(|id| self.scenarios.get(**id).is_some_and(|r| r.state == ScenarioState::Expired))
                .count();
            self.metrics.inc_scenario_pruned((pressured.len() - expired) as u64);
            self.metrics.inc_scenario_expired(expired as u64);
            self.retire_overlays(&pressured, wave.close_seq);
            report.pressured.extend(pressured);
        }

        report.outcomes.push(outcome);
        Ok(())
    }

    fn retire_overlays(&mut self, ids: &[ScenarioId], seq: u64) {
        if ids.is_empty() {
            return;
        }
        for &id in ids {
            self.overlays.retire(id, seq);
            let cancelled = self.frontier.cancel_parent(id);
            if cancelled.waves > 0 {
                self.metrics.inc_cancelled_candidates(cancelled.candidates as u64);
                tracing::debug!(
                    scenario = %id,
                    waves = cancelled.waves,
                    candidates = cancelled.candidates,
                    "open waves cancelled"
                );
            }
        }
        self.subscriptions.cancel(ids);
    }

    fn update_gauges(&self) {
        self.metrics.set_gauges(
            self.scenarios.active_count() as u64,
            self.store.total_entries() as u64,
            self.overlays.total_entries() as u64,
        );
    }

    /// Step until no wave is open, waiting on predictors in between.
    ///
    /// Returns every alert emitted, or `RuntimeError::Timeout` if still busy after
    /// `timeout`.
    pub fn run_until_idle(&mut self, timeout: Duration) -> WorldResult<Vec<Alert>> {
        let deadline = Instant::now() + timeout;
        let mut alerts = Vec::new();
        loop {
            alerts.extend(self.step()?.alerts);
            if self.is_idle() {
                return Ok(alerts);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RuntimeError::Timeout {
                    duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
                .into());
            }
            let wait = self
                .frontier
                .next_deadline()
                .map_or(IDLE_POLL, |d| d.saturating_duration_since(now))
                .min(deadline - now)
                .min(IDLE_POLL);
            if let Some(msg) = self.pool.recv_timeout(wait) {
                self.pending.push(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BeamConfig, RuntimeConfig};
    use crate::predictor::{Branch, CandidateSink};
    use crate::views::CountTranslator;

    struct Silent;

    impl Predictor for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        fn propose(&self, _request: &PredictionRequest, sink: CandidateSink) {
            sink.complete();
        }
    }

    fn config(k: usize, depth: Depth) -> EngineConfig {
        EngineConfig {
            beam: BeamConfig {
                beam_width: k,
                max_depth: depth,
                ..BeamConfig::default()
            },
            runtime: RuntimeConfig {
                predictor_workers: 1,
                wave_timeout_ms: 200,
                arrangement_shards: 4,
                ..RuntimeConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn setup<P: Predictor>(engine: &OverlayEngine<P>) {
        engine.register_relation(RelationSpec::new("orders", "retail")).unwrap();
        engine
            .register_translator(CountTranslator::new("retail").count("order", "orders", 1))
            .unwrap();
    }

    fn order(epoch: Epoch, source: &str) -> Event {
        Event::new("retail", "order", epoch, source).with_key("X")
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config(1, 2);
        cfg.beam.beam_width = 0;
        let err = OverlayEngine::new(cfg, Silent).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn epoch_regression_rejects_batch() {
        let mut engine = OverlayEngine::new(config(1, 1), Silent).unwrap();
        setup(&engine);
        engine.ingest(order(5, "pos-1")).unwrap();

        let err = engine
            .ingest_batch(vec![order(6, "pos-1"), order(4, "pos-1")])
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::WorldError::Runtime(RuntimeError::EpochRegression { epoch: 4, last: 6, .. })
        ));
        assert_eq!(engine.store().read(&"orders".into(), "X").count(), 1);

        // Other sources keep their own clock.
        engine.ingest(order(1, "pos-2")).unwrap();
        assert_eq!(engine.store().read(&"orders".into(), "X").count(), 2);
    }

    #[test]
    fn unknown_domain_applies_nothing() {
        let mut engine = OverlayEngine::new(config(1, 1), Silent).unwrap();
        setup(&engine);
        let err = engine
            .ingest_batch(vec![order(1, "a"), Event::new("billing", "invoice", 1, "a")])
            .unwrap_err();
        assert!(err.is_config());
        assert!(engine.diff_log().is_empty());
    }

    struct Misdeclared;

    impl EventTranslator for Misdeclared {
        fn domain(&self) -> &str {
            "billing"
        }

        fn outputs(&self) -> Vec<RelationName> {
            vec!["orders".into()]
        }

        fn translate(&self, event: &Event) -> Vec<Diff> {
            vec![Diff::count("invoices", event.key.clone().unwrap_or_default(), 1)]
        }
    }

    #[test]
    fn undeclared_output_relation_rejects_batch_before_applying() {
        let mut engine = OverlayEngine::new(config(1, 1), Silent).unwrap();
        setup(&engine);
        engine.register_translator(Misdeclared).unwrap();

        let invoice = Event::new("billing", "invoice", 2, "a").with_key("X");
        let err = engine.ingest_batch(vec![order(1, "a"), invoice]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::WorldError::Config(ConfigError::UnknownRelation { ref relation }) if relation == "invoices"
        ));
        assert!(engine.diff_log().is_empty());
        assert_eq!(engine.store().read(&"orders".into(), "X").count(), 0);

        // The source clock did not advance, so the valid event can be retried.
        engine.ingest(order(1, "a")).unwrap();
        assert_eq!(engine.store().read(&"orders".into(), "X").count(), 1);
        engine.run_until_idle(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn silent_predictor_leaves_engine_idle() {
        let mut engine = OverlayEngine::new(config(2, 2), Silent).unwrap();
        setup(&engine);
        engine.ingest(order(1, "a")).unwrap();
        engine.run_until_idle(Duration::from_secs(5)).unwrap();
        assert!(engine.active_scenarios().is_empty());
        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.waves_closed, 1);
        assert_eq!(snapshot.base_events, 1);
    }

    #[test]
    fn retired_scenario_is_unreadable() {
        let predictor = crate::predictor::RuleBasedPredictor::new("rules").rule(
            "orders",
            vec![Branch {
                attenuation: 0.5,
                scale: 1.0,
            }],
        );
        let mut engine = OverlayEngine::new(config(1, 1), predictor).unwrap();
        setup(&engine);
        engine.ingest(order(1, "a")).unwrap();
        engine.run_until_idle(Duration::from_secs(5)).unwrap();

        let id = engine.active_scenarios()[0].id;
        assert_eq!(engine.composed_read(id, &"orders".into(), "X").unwrap().count(), 2);

        assert_eq!(engine.retire_scenario(id).unwrap(), vec![id]);
        assert_eq!(engine.scenario(id).unwrap().state, ScenarioState::Pruned);
        assert!(engine.composed_read(id, &"orders".into(), "X").is_err());
        engine.step().unwrap();
        assert_eq!(engine.metrics().snapshot().overlays_collected, 1);
    }
}

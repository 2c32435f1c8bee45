//! Subscriptions, incremental evaluation, and alert delivery.
//!
//! A subscription asks: does predicate P hold in some world of depth ≤ D and
//! weight ≥ p_min? The base world takes part as `ScenarioId::BASE` at depth 0 with
//! weight 1. Only subscriptions whose dependency set intersects the changed cells
//! are re-evaluated.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arrangement::ArrangementStore;
use crate::diff::Diff;
use crate::error::{ConfigError, RuntimeError, WorldError, WorldResult};
use crate::frontier::WaveId;
use crate::predicate::Predicate;
use crate::sync;
use crate::types::{Depth, Epoch, ScenarioId, Weight};
use crate::views::ViewReader;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// When a subscription fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Once per (subscription, scenario); suppressed below an ancestor that fired.
    #[default]
    Edge,
    /// On every false → true transition.
    Level,
}

/// Declarative subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Predicate source text.
    pub predicate: String,
    /// Deepest scenario considered.
    pub max_depth: Depth,
    /// Lightest scenario considered.
    pub min_weight: f64,
    /// Regex every referenced relation's domain must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_filter: Option<String>,
    /// Firing mode.
    #[serde(default)]
    pub mode: TriggerMode,
}

impl SubscriptionSpec {
    /// Edge-mode subscription over every depth up to `max_depth` and weight ≥ `min_weight`.
    #[must_use]
    pub fn new(predicate: impl Into<String>, max_depth: Depth, min_weight: f64) -> Self {
        Self {
            predicate: predicate.into(),
            max_depth,
            min_weight,
            domain_filter: None,
            mode: TriggerMode::Edge,
        }
    }

    /// Restrict referenced relations to domains matching `pattern`.
    #[must_use]
    pub fn with_domain_filter(mut self, pattern: impl Into<String>) -> Self {
        self.domain_filter = Some(pattern.into());
        self
    }

    /// Set the firing mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: TriggerMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Handle returned by registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
}

impl SubscriptionHandle {
    /// The subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// Why an alert fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    /// Scenario ids from the root down to the alerting scenario. Empty for the base world.
    pub lineage: Vec<ScenarioId>,
    /// First changed diff the predicate depends on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggering_diff: Option<Diff>,
}

/// A fired subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub subscription_id: SubscriptionId,
    pub scenario_id: ScenarioId,
    pub depth: Depth,
    pub weight: Weight,
    pub epoch: Epoch,
    /// Wave whose admission triggered the alert; None for base ingestion.
    pub wave: Option<WaveId>,
    pub emitted_at: DateTime<Utc>,
    pub explanation: Explanation,
}

struct StreamSlot {
    tx: Sender<Alert>,
    dropped: Arc<AtomicU64>,
}

/// Append-only alert log with push fan-out.
pub struct AlertLog {
    alerts: RwLock<Vec<Arc<Alert>>>,
    streams: Mutex<Vec<StreamSlot>>,
    stream_capacity: usize,
    dropped: AtomicU64,
}

impl fmt::Debug for AlertLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertLog")
            .field("len", &self.len())
            .field("streams", &sync::lock(&self.streams).len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl AlertLog {
    /// Log whose push streams buffer `stream_capacity` alerts each.
    #[must_use]
    pub fn new(stream_capacity: usize) -> Self {
        Self {
            alerts: RwLock::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            stream_capacity: stream_capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an alert and offer it to every stream. Full streams drop it.
    pub fn publish(&self, alert: Alert) {
        let alert = Arc::new(alert);
        sync::write(&self.alerts).push(Arc::clone(&alert));

        let mut streams = sync::lock(&self.streams);
        streams.retain(|slot| match slot.tx.try_send(alert.as_ref().clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                slot.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of alerts ever published.
    #[must_use]
    pub fn len(&self) -> usize {
        sync::read(&self.alerts).len()
    }

    /// Returns true if nothing was published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Alerts dropped across all slow streams.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Alert at `offset`.
    #[must_use]
    pub fn get(&self, offset: usize) -> Option<Arc<Alert>> {
        sync::read(&self.alerts).get(offset).cloned()
    }

    /// Restartable pull cursor starting at `offset`.
    #[must_use]
    pub fn cursor(self: &Arc<Self>, offset: usize) -> AlertCursor {
        AlertCursor {
            log: Arc::clone(self),
            next: offset,
        }
    }

    /// Push stream of alerts published from now on.
    #[must_use]
    pub fn stream(&self) -> AlertStream {
        let (tx, rx) = crossbeam_channel::bounded(self.stream_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        sync::lock(&self.streams).push(StreamSlot {
            tx,
            dropped: Arc::clone(&dropped),
        });
        AlertStream { rx, dropped }
    }
}

/// Pull cursor over the alert log. Reaching the end is not terminal.
#[derive(Debug, Clone)]
pub struct AlertCursor {
    log: Arc<AlertLog>,
    next: usize,
}

impl AlertCursor {
    /// Offset of the next alert.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.next
    }

    /// Restart from `offset`.
    pub fn seek(&mut self, offset: usize) {
        self.next = offset;
    }
}

impl Iterator for AlertCursor {
    type Item = Alert;

    fn next(&mut self) -> Option<Alert> {
        let alert = self.log.get(self.next)?;
        self.next += 1;
        Some(alert.as_ref().clone())
    }
}

/// Push stream of alerts.
///
/// A consumer that falls behind loses alerts rather than blocking the engine; the
/// loss is counted. Dropping the stream unregisters it on the next publish.
#[derive(Debug)]
pub struct AlertStream {
    rx: Receiver<Alert>,
    dropped: Arc<AtomicU64>,
}

impl AlertStream {
    /// Receive the next alert (blocking).
    pub fn recv(&self) -> WorldResult<Alert> {
        self.rx.recv().map_err(|_| {
            WorldError::Runtime(RuntimeError::Disconnected {
                path: "alert_stream".to_string(),
            })
        })
    }

    /// Receive the next alert with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> WorldResult<Alert> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => WorldError::Runtime(RuntimeError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => WorldError::Runtime(RuntimeError::Disconnected {
                path: "alert_stream".to_string(),
            }),
        })
    }

    /// Next buffered alert, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<Alert> {
        self.rx.try_recv().ok()
    }

    /// Alerts this stream lost to a full buffer.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One world to evaluate: a scenario (or BASE) and a reader over its composed state.
pub struct EvalTarget<'a> {
    /// Scenario evaluated.
    pub scenario: ScenarioId,
    /// Its depth.
    pub depth: Depth,
    /// Its weight.
    pub weight: Weight,
    /// Root-to-scenario ids, excluding BASE.
    pub lineage: Vec<ScenarioId>,
    /// Composed state.
    pub reader: &'a dyn ViewReader,
}

impl EvalTarget<'_> {
    fn in_range(&self, sub: &Registered) -> bool {
        self.depth <= sub.spec.max_depth && self.weight.value() >= sub.min_weight.value()
    }
}

struct Registered {
    id: SubscriptionId,
    spec: SubscriptionSpec,
    predicate: Predicate,
    min_weight: Weight,
}

#[derive(Debug, Clone, Copy, Default)]
struct EvalState {
    last_truth: bool,
    fired: bool,
}

/// Registered subscriptions and their per-scenario evaluator state.
pub struct SubscriptionEngine {
    subs: Vec<Registered>,
    state: HashMap<(SubscriptionId, ScenarioId), EvalState>,
    log: Arc<AlertLog>,
}

impl fmt::Debug for SubscriptionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEngine")
            .field("subscriptions", &self.subs.len())
            .field("evaluator_states", &self.state.len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionEngine {
    /// Engine publishing into `log`.
    #[must_use]
    pub fn new(log: Arc<AlertLog>) -> Self {
        Self {
            subs: Vec::new(),
            state: HashMap::new(),
            log,
        }
    }

    /// The alert log.
    #[must_use]
    pub fn log(&self) -> &Arc<AlertLog> {
        &self.log
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Deepest `max_depth` among registered subscriptions.
    #[must_use]
    pub fn max_depth(&self) -> Option<Depth> {
        self.subs.iter().map(|s| s.spec.max_depth).max()
    }

    /// Validate, compile, and register a subscription.
    pub fn register(&mut self, spec: SubscriptionSpec, store: &ArrangementStore) -> Result<SubscriptionHandle, ConfigError> {
        let min_weight = Weight::new(spec.min_weight)?;
        let predicate = Predicate::parse(&spec.predicate)?;

        let filter = spec
            .domain_filter
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::InvalidDomainFilter {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        for relation in predicate.relations() {
            let relation_spec = store.relation_spec(&relation).ok_or_else(|| ConfigError::UnknownRelation {
                relation: relation.to_string(),
            })?;
            if let Some(re) = &filter {
                if !re.is_match(&relation_spec.domain) {
                    return Err(ConfigError::DomainFiltered {
                        relation: relation.to_string(),
                        domain: relation_spec.domain,
                    });
                }
            }
        }

        let id = SubscriptionId::new();
        tracing::info!(subscription = %id, predicate = %predicate, max_depth = spec.max_depth, "subscription registered");
        self.subs.push(Registered {
            id,
            spec,
            predicate,
            min_weight,
        });
        Ok(SubscriptionHandle { id })
    }

    /// Remove a subscription and its evaluator state. Returns false if unknown.
    pub fn unregister(&mut self, handle: SubscriptionHandle) -> bool {
        let before = self.subs.len();
        self.subs.retain(|s| s.id != handle.id);
        self.state.retain(|(sub, _), _| *sub != handle.id);
        before != self.subs.len()
    }

    /// Drop evaluator state of retired scenarios.
    pub fn cancel(&mut self, scenarios: &[ScenarioId]) {
        if scenarios.is_empty() {
            return;
        }
        let retired: HashSet<ScenarioId> = scenarios.iter().copied().collect();
        self.state.retain(|(_, scenario), _| !retired.contains(scenario));
    }

    /// Evaluate one subscription against every target, e.g. right after registration.
    pub fn evaluate_subscription(&mut self, handle: SubscriptionHandle, targets: &[EvalTarget<'_>], epoch: Epoch) -> Vec<Alert> {
        let Some(idx) = self.subs.iter().position(|s| s.id == handle.id) else {
            return Vec::new();
        };
        let mut alerts = Vec::new();
        for target in targets {
            if let Some(alert) = self.evaluate(idx, target, None, epoch, None) {
                alerts.push(alert);
            }
        }
        self.publish(alerts)
    }

    /// Re-evaluate after base diffs, for the base world and every given scenario.
    pub fn on_base_diffs(&mut self, changed: &[Diff], targets: &[EvalTarget<'_>], epoch: Epoch) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for idx in 0..self.subs.len() {
            let Some(trigger) = self.first_dependent(idx, changed) else {
                continue;
            };
            for target in targets {
                if let Some(alert) = self.evaluate(idx, target, Some(trigger.clone()), epoch, None) {
                    alerts.push(alert);
                }
            }
        }
        self.publish(alerts)
    }

    /// Re-evaluate one scenario after diffs were appended to its overlay.
    pub fn on_overlay_diffs(&mut self, target: &EvalTarget<'_>, diffs: &[Diff], epoch: Epoch, wave: WaveId) -> Vec<Alert> {
        let mut alerts = Vec::new();
        for idx in 0..self.subs.len() {
            let Some(trigger) = self.first_dependent(idx, diffs) else {
                continue;
            };
            if let Some(alert) = self.evaluate(idx, target, Some(trigger), epoch, Some(wave)) {
                alerts.push(alert);
            }
        }
        self.publish(alerts)
    }

    fn publish(&self, alerts: Vec<Alert>) -> Vec<Alert> {
        for alert in &alerts {
            self.log.publish(alert.clone());
        }
        alerts
    }

    fn first_dependent(&self, idx: usize, diffs: &[Diff]) -> Option<Diff> {
        let predicate = &self.subs[idx].predicate;
        diffs
            .iter()
            .find(|d| predicate.depends_on(&d.relation, &d.key))
            .cloned()
    }

    fn fired(&self, sub: SubscriptionId, scenario: ScenarioId) -> bool {
        self.state.get(&(sub, scenario)).is_some_and(|s| s.fired)
    }

    fn evaluate(
        &mut self,
        idx: usize,
        target: &EvalTarget<'_>,
        trigger: Option<Diff>,
        epoch: Epoch,
        wave: Option<WaveId>,
    ) -> Option<Alert> {
        let sub = &self.subs[idx];
        if !target.in_range(sub) {
            return None;
        }
        let sub_id = sub.id;
        let mode = sub.spec.mode;
        let truth = sub.predicate.eval(target.reader);

        let fire = match mode {
            TriggerMode::Edge => {
                truth
                    && !self.fired(sub_id, target.scenario)
                    && (target.scenario.is_base() || !self.fired(sub_id, ScenarioId::BASE))
                    && !target
                        .lineage
                        .iter()
                        .filter(|id| **id != target.scenario)
                        .any(|id| self.fired(sub_id, *id))
            }
            TriggerMode::Level => truth && !self.state.get(&(sub_id, target.scenario)).is_some_and(|s| s.last_truth),
        };

        let state = self.state.entry((sub_id, target.scenario)).or_default();
        state.last_truth = truth;
        if !fire {
            return None;
        }
        state.fired = true;

        tracing::info!(
            subscription = %sub_id,
            scenario = %target.scenario,
            depth = target.depth,
            weight = %target.weight,
            "alert"
        );
        Some(Alert {
            subscription_id: sub_id,
            scenario_id: target.scenario,
            depth: target.depth,
            weight: target.weight,
            epoch,
            wave,
            emitted_at: Utc::now(),
            explanation: Explanation {
                lineage: target.lineage.clone(),
                triggering_diff: trigger,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{Accum, Delta};
    use crate::diff_log::DiffLog;
    use crate::types::{RelationName, RelationSpec};

    struct Count(i64);

    impl ViewReader for Count {
        fn read(&self, _relation: &RelationName, _key: &str) -> Accum {
            Accum::from_delta(Delta::count(self.0))
        }

        fn entries(&self, _relation: &RelationName) -> Vec<(String, Accum)> {
            Vec::new()
        }
    }

    fn store() -> ArrangementStore {
        let store = ArrangementStore::new(2, Arc::new(DiffLog::new()));
        store.register_relation(RelationSpec::new("orders", "retail")).unwrap();
        store.register_relation(RelationSpec::new("line_rate", "mfg")).unwrap();
        store
    }

    fn target<'a>(scenario: u64, depth: Depth, weight: f64, lineage: Vec<u64>, reader: &'a dyn ViewReader) -> EvalTarget<'a> {
        EvalTarget {
            scenario: ScenarioId::from_raw(scenario),
            depth,
            weight: Weight::new(weight).unwrap(),
            lineage: lineage.into_iter().map(ScenarioId::from_raw).collect(),
            reader,
        }
    }

    fn engine() -> SubscriptionEngine {
        SubscriptionEngine::new(Arc::new(AlertLog::new(8)))
    }

    #[test]
    fn register_validates_relations_weight_and_domain() {
        let s = store();
        let mut e = engine();
        assert!(e.register(SubscriptionSpec::new("count(orders, X) > 1", 2, 0.5), &s).is_ok());
        assert!(matches!(
            e.register(SubscriptionSpec::new("count(nope, X) > 1", 2, 0.5), &s),
            Err(ConfigError::UnknownRelation { .. })
        ));
        assert!(matches!(
            e.register(SubscriptionSpec::new("count(orders, X) > 1", 2, 1.5), &s),
            Err(ConfigError::InvalidWeight { .. })
        ));
        assert!(matches!(
            e.register(SubscriptionSpec::new("count(orders X) > 1", 2, 0.5), &s),
            Err(ConfigError::MalformedPredicate { .. })
        ));
        assert!(matches!(
            e.register(
                SubscriptionSpec::new("count(line_rate, L1) > 1", 2, 0.5).with_domain_filter("^retail$"),
                &s
            ),
            Err(ConfigError::DomainFiltered { .. })
        ));
        assert!(matches!(
            e.register(SubscriptionSpec::new("true", 2, 0.5).with_domain_filter("("), &s),
            Err(ConfigError::InvalidDomainFilter { .. })
        ));
        assert_eq!(e.len(), 1);
    }

    #[test]
    fn fires_only_within_depth_and_weight() {
        let s = store();
        let mut e = engine();
        e.register(SubscriptionSpec::new("count(orders, X) >= 12", 2, 0.5), &s)
            .unwrap();
        let high = Count(13);
        let change = [Diff::count("orders", "X", 3)];

        let light = target(1, 1, 0.4, vec![1], &high);
        assert!(e.on_overlay_diffs(&light, &change, 0, 1).is_empty());

        let deep = target(2, 3, 0.9, vec![3, 4, 2], &high);
        assert!(e.on_overlay_diffs(&deep, &change, 0, 1).is_empty());

        let good = target(5, 1, 0.6, vec![5], &high);
        let alerts = e.on_overlay_diffs(&good, &change, 0, 1);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].scenario_id, ScenarioId::from_raw(5));
        assert_eq!(alerts[0].explanation.triggering_diff, Some(change[0].clone()));
        assert_eq!(e.log().len(), 1);
    }

    #[test]
    fn unrelated_diffs_do_not_reevaluate() {
        let s = store();
        let mut e = engine();
        e.register(SubscriptionSpec::new("count(orders, X) >= 1", 2, 0.1), &s)
            .unwrap();
        let reader = Count(5);
        let t = target(1, 1, 0.9, vec![1], &reader);
        assert!(e.on_overlay_diffs(&t, &[Diff::count("orders", "Y", 1)], 0, 1).is_empty());
    }

    #[test]
    fn edge_fires_once_and_is_suppressed_below_firing_ancestor() {
        let s = store();
        let mut e = engine();
        e.register(SubscriptionSpec::new("count(orders, X) >= 1", 3, 0.1), &s)
            .unwrap();
        let reader = Count(5);
        let change = [Diff::count("orders", "X", 1)];

        let parent = target(1, 1, 0.9, vec![1], &reader);
        assert_eq!(e.on_overlay_diffs(&parent, &change, 0, 1).len(), 1);
        assert!(e.on_overlay_diffs(&parent, &change, 0, 2).is_empty());

        let child = target(2, 2, 0.5, vec![1, 2], &reader);
        assert!(e.on_overlay_diffs(&child, &change, 0, 3).is_empty());

        e.cancel(&[ScenarioId::from_raw(1)]);
        assert_eq!(e.on_overlay_diffs(&child, &change, 0, 4).len(), 1);
    }

    #[test]
    fn base_firing_suppresses_scenarios_in_edge_mode() {
        let s = store();
        let mut e = engine();
        e.register(SubscriptionSpec::new("count(orders, X) >= 1", 3, 0.1), &s)
            .unwrap();
        let reader = Count(5);
        let change = [Diff::count("orders", "X", 1)];
        let targets = [
            EvalTarget {
                scenario: ScenarioId::BASE,
                depth: 0,
                weight: Weight::ONE,
                lineage: Vec::new(),
                reader: &reader,
            },
            target(1, 1, 0.9, vec![1], &reader),
        ];
        let alerts = e.on_base_diffs(&change, &targets, 0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].scenario_id, ScenarioId::BASE);
        assert_eq!(alerts[0].wave, None);
    }

    #[test]
    fn level_mode_rearms() {
        let s = store();
        let mut e = engine();
        e.register(
            SubscriptionSpec::new("count(orders, X) >= 10", 2, 0.1).with_mode(TriggerMode::Level),
            &s,
        )
        .unwrap();
        let change = [Diff::count("orders", "X", 1)];
        let high = Count(12);
        let low = Count(3);

        assert_eq!(e.on_overlay_diffs(&target(1, 1, 0.9, vec![1], &high), &change, 0, 1).len(), 1);
        assert!(e.on_overlay_diffs(&target(1, 1, 0.9, vec![1], &high), &change, 1, 2).is_empty());
        assert!(e.on_overlay_diffs(&target(1, 1, 0.9, vec![1], &low), &change, 2, 3).is_empty());
        assert_eq!(e.on_overlay_diffs(&target(1, 1, 0.9, vec![1], &high), &change, 3, 4).len(), 1);
    }

    #[test]
    fn unregister_stops_alerts() {
        let s = store();
        let mut e = engine();
        let h = e
            .register(SubscriptionSpec::new("count(orders, X) >= 1", 2, 0.1), &s)
            .unwrap();
        assert!(e.unregister(h));
        assert!(!e.unregister(h));
        let reader = Count(5);
        let t = target(1, 1, 0.9, vec![1], &reader);
        assert!(e.on_overlay_diffs(&t, &[Diff::count("orders", "X", 1)], 0, 1).is_empty());
    }

    #[test]
    fn cursor_and_stream_deliver_in_order() {
        let log = Arc::new(AlertLog::new(1));
        let stream = log.stream();
        let mut e = SubscriptionEngine::new(Arc::clone(&log));
        let s = store();
        e.register(SubscriptionSpec::new("count(orders, X) >= 1", 2, 0.1), &s)
            .unwrap();
        let reader = Count(5);
        let change = [Diff::count("orders", "X", 1)];
        e.on_overlay_diffs(&target(1, 1, 0.9, vec![1], &reader), &change, 0, 1);
        e.on_overlay_diffs(&target(2, 1, 0.8, vec![2], &reader), &change, 0, 1);

        let pulled: Vec<ScenarioId> = log.cursor(0).map(|a| a.scenario_id).collect();
        assert_eq!(pulled, vec![ScenarioId::from_raw(1), ScenarioId::from_raw(2)]);
        assert_eq!(log.cursor(1).count(), 1);

        // Capacity 1: the second alert was dropped, not blocked.
        assert_eq!(stream.try_recv().map(|a| a.scenario_id), Some(ScenarioId::from_raw(1)));
        assert!(stream.try_recv().is_none());
        assert_eq!(stream.dropped(), 1);
        assert_eq!(log.dropped(), 1);
    }

    #[test]
    fn stream_recv_timeout_reports_timeout() {
        let log = AlertLog::new(4);
        let stream = log.stream();
        let err = stream.recv_timeout(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, WorldError::Runtime(RuntimeError::Timeout { .. })));
    }
}

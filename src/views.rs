//! Derived views, the view registry, and event translators.
//!
//! Views are registered once by name and shared by every scenario. The same
//! `ViewBuilder` logic derives base diffs (against the arrangement store) and
//! overlay diffs (against a composed reader), so a scenario never needs its own
//! copy of a view.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use crate::arrangement::{ArrangementStore, KeyFn};
use crate::diff::{compact, Accum, Diff};
use crate::error::{ConfigError, WorldResult};
use crate::overlay::{ComposedReader, OverlayStore};
use crate::sync;
use crate::types::{Epoch, Event, RelationName, ScenarioId};

/// Read access used by views while deriving diffs.
pub trait ViewReader {
    /// Current value at (relation, key).
    fn read(&self, relation: &RelationName, key: &str) -> Accum;

    /// Non-zero cells of a relation, sorted by key.
    fn entries(&self, relation: &RelationName) -> Vec<(String, Accum)>;
}

impl ViewReader for ArrangementStore {
    fn read(&self, relation: &RelationName, key: &str) -> Accum {
        ArrangementStore::read(self, relation, key)
    }

    fn entries(&self, relation: &RelationName) -> Vec<(String, Accum)> {
        ArrangementStore::entries(self, relation)
    }
}

impl ViewReader for ComposedReader<'_> {
    fn read(&self, relation: &RelationName, key: &str) -> Accum {
        ComposedReader::read(self, relation, key)
    }

    fn entries(&self, relation: &RelationName) -> Vec<(String, Accum)> {
        ComposedReader::entries(self, relation)
    }
}

/// Which world a view is deriving for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    /// Deriving base diffs; may update internal view state.
    Base,
    /// Deriving overlay diffs for one scenario; must not update shared state.
    Overlay(ScenarioId),
}

/// Context handed to `ViewBuilder::on_diffs`.
///
/// The reader already reflects the input diffs but not yet the view's output.
pub struct ViewContext<'a> {
    /// Epoch of the batch being propagated.
    pub epoch: Epoch,
    /// World being derived for.
    pub mode: ViewMode,
    /// Read access to that world.
    pub reader: &'a dyn ViewReader,
}

/// A derived relation maintained from one or more input relations.
pub trait ViewBuilder: Send + Sync {
    /// Unique view name.
    fn name(&self) -> &str;

    /// Relations this view consumes.
    fn inputs(&self) -> Vec<RelationName>;

    /// Relation this view produces.
    fn output(&self) -> RelationName;

    /// Derive output diffs for a batch of input diffs.
    fn on_diffs(&self, input: &RelationName, diffs: &[Diff], ctx: &ViewContext<'_>) -> Vec<Diff>;
}

/// Registry of derived views and the apply path into the arrangement store.
pub struct ViewRegistry {
    views: RwLock<Vec<Arc<dyn ViewBuilder>>>,
    apply_workers: usize,
}

impl fmt::Debug for ViewRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewRegistry")
            .field("views", &self.names())
            .field("apply_workers", &self.apply_workers)
            .finish()
    }
}

impl Default for ViewRegistry {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ViewRegistry {
    /// Create a registry applying base diffs with `apply_workers` threads.
    #[must_use]
    pub fn new(apply_workers: usize) -> Self {
        Self {
            views: RwLock::new(Vec::new()),
            apply_workers: apply_workers.max(1),
        }
    }

    /// Registered view names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        sync::read(&self.views).iter().map(|v| v.name().to_string()).collect()
    }

    /// Register a view. Inputs and output must be relations of `store`.
    pub fn register(&self, store: &ArrangementStore, view: Arc<dyn ViewBuilder>) -> Result<(), ConfigError> {
        let mut views = sync::write(&self.views);
        if views.iter().any(|v| v.name() == view.name()) {
            return Err(ConfigError::DuplicateView {
                name: view.name().to_string(),
            });
        }

        let output = view.output();
        for relation in view.inputs().iter().chain(std::iter::once(&output)) {
            if !store.contains(relation) {
                return Err(ConfigError::UnknownRelation {
                    relation: relation.to_string(),
                });
            }
        }

        // Adding inputs -> output closes a cycle iff some input is reachable from output.
        let inputs: HashSet<RelationName> = view.inputs().into_iter().collect();
        let mut seen = HashSet::new();
        let mut stack = vec![output.clone()];
        while let Some(rel) = stack.pop() {
            if inputs.contains(&rel) {
                return Err(ConfigError::ViewCycle {
                    view: view.name().to_string(),
                    relation: rel.to_string(),
                });
            }
            if !seen.insert(rel.clone()) {
                continue;
            }
            for v in views.iter().filter(|v| v.inputs().contains(&rel)) {
                stack.push(v.output());
            }
        }

        tracing::debug!(view = view.name(), output = %output, "view registered");
        views.push(view);
        Ok(())
    }

    fn downstream(&self, relation: &RelationName) -> Vec<Arc<dyn ViewBuilder>> {
        sync::read(&self.views)
            .iter()
            .filter(|v| v.inputs().contains(relation))
            .cloned()
            .collect()
    }

    fn propagate(
        &self,
        reader: &dyn ViewReader,
        seed: Vec<(RelationName, Vec<Diff>, String)>,
        epoch: Epoch,
        mode: ViewMode,
        mut sink: impl FnMut(&RelationName, &[Diff], &str) -> WorldResult<()>,
    ) -> WorldResult<Vec<Diff>> {
        let mut queue: VecDeque<(RelationName, Vec<Diff>, String)> = seed.into();
        let mut applied = Vec::new();

        while let Some((relation, diffs, source)) = queue.pop_front() {
            if diffs.is_empty() {
                continue;
            }
            sink(&relation, &diffs, &source)?;

            let ctx = ViewContext { epoch, mode, reader };
            for view in self.downstream(&relation) {
                let derived = compact(&view.on_diffs(&relation, &diffs, &ctx));
                if !derived.is_empty() {
                    queue.push_back((view.output(), derived, format!("view:{}", view.name())));
                }
            }
            applied.extend(diffs);
        }

        Ok(applied)
    }

    fn seed(diffs: Vec<Diff>, source: &str) -> Vec<(RelationName, Vec<Diff>, String)> {
        let mut grouped: BTreeMap<RelationName, Vec<Diff>> = BTreeMap::new();
        for d in diffs {
            grouped.entry(d.relation.clone()).or_default().push(d);
        }
        grouped
            .into_iter()
            .map(|(relation, diffs)| (relation, diffs, source.to_string()))
            .collect()
    }

    /// Apply base diffs (any relations) and propagate through downstream views.
    ///
    /// Every applied batch, input or derived, is appended to the store's diff log.
    /// Returns all applied diffs in application order.
    pub fn apply(
        &self,
        store: &ArrangementStore,
        diffs: Vec<Diff>,
        epoch: Epoch,
        source: &str,
    ) -> WorldResult<Vec<Diff>> {
        let workers = self.apply_workers;
        self.propagate(store, Self::seed(diffs, source), epoch, ViewMode::Base, |relation, batch, src| {
            if workers > 1 {
                store.apply_parallel(relation, batch, workers)?;
            } else {
                store.apply(relation, batch)?;
            }
            store.log().append(epoch, src, batch.to_vec());
            Ok(())
        })
    }

    /// Append diffs to a scenario's overlay and propagate them through downstream
    /// views against the composed world. The base is never mutated.
    ///
    /// Returns all appended diffs, input and derived.
    pub fn derive_overlay(
        &self,
        store: &ArrangementStore,
        overlays: &OverlayStore,
        scenario: ScenarioId,
        diffs: Vec<Diff>,
        epoch: Epoch,
    ) -> WorldResult<Vec<Diff>> {
        let view = overlays.view(scenario)?;
        let reader = ComposedReader::new(store, &view);
        self.propagate(
            &reader,
            Self::seed(diffs, "overlay"),
            epoch,
            ViewMode::Overlay(scenario),
            |_, batch, _| Ok(overlays.append(scenario, batch)?),
        )
    }
}

/// Turns a domain event into base diffs.
pub trait EventTranslator: Send + Sync {
    /// Domain this translator handles.
    fn domain(&self) -> &str;

    /// Relations this translator writes. Each must be registered before the
    /// translator is.
    fn outputs(&self) -> Vec<RelationName>;

    /// Diffs for one event.
    fn translate(&self, event: &Event) -> Vec<Diff>;
}

/// Translators keyed by event domain.
#[derive(Default)]
pub struct TranslatorRegistry {
    by_domain: RwLock<HashMap<String, Arc<dyn EventTranslator>>>,
}

impl fmt::Debug for TranslatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let domains: Vec<String> = sync::read(&self.by_domain).keys().cloned().collect();
        f.debug_struct("TranslatorRegistry").field("domains", &domains).finish()
    }
}

impl TranslatorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a translator for its domain. Every relation it writes must exist in `store`.
    pub fn register(&self, store: &ArrangementStore, translator: Arc<dyn EventTranslator>) -> Result<(), ConfigError> {
        if let Some(relation) = translator.outputs().into_iter().find(|r| !store.contains(r)) {
            return Err(ConfigError::UnknownRelation {
                relation: relation.to_string(),
            });
        }
        let mut map = sync::write(&self.by_domain);
        let domain = translator.domain().to_string();
        if map.contains_key(&domain) {
            return Err(ConfigError::DuplicateTranslator { domain });
        }
        map.insert(domain, translator);
        Ok(())
    }

    /// Translate an event with the translator registered for its domain.
    pub fn translate(&self, event: &Event) -> Result<Vec<Diff>, ConfigError> {
        let translator = sync::read(&self.by_domain)
            .get(&event.domain)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDomain {
                domain: event.domain.clone(),
            })?;
        Ok(translator.translate(event))
    }
}

#[derive(Debug, Clone)]
enum KindRule {
    Count { relation: RelationName, sign: i64 },
    Sum { relation: RelationName, field: String },
}

/// Table-driven translator: each event kind maps to count or value diffs keyed by
/// the event key.
#[derive(Debug, Clone)]
pub struct CountTranslator {
    domain: String,
    rules: Vec<(String, KindRule)>,
}

impl CountTranslator {
    /// Translator for `domain` with no rules.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            rules: Vec::new(),
        }
    }

    /// Events of `kind` add `sign` to the event key's count in `relation`.
    #[must_use]
    pub fn count(mut self, kind: impl Into<String>, relation: impl Into<RelationName>, sign: i64) -> Self {
        self.rules.push((
            kind.into(),
            KindRule::Count {
                relation: relation.into(),
                sign,
            },
        ));
        self
    }

    /// Events of `kind` add numeric payload field `field` to the event key's value in `relation`.
    #[must_use]
    pub fn sum(mut self, kind: impl Into<String>, relation: impl Into<RelationName>, field: impl Into<String>) -> Self {
        self.rules.push((
            kind.into(),
            KindRule::Sum {
                relation: relation.into(),
                field: field.into(),
            },
        ));
        self
    }
}

impl EventTranslator for CountTranslator {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn outputs(&self) -> Vec<RelationName> {
        let mut out: Vec<RelationName> = Vec::new();
        for (_, rule) in &self.rules {
            let relation = match rule {
                KindRule::Count { relation, .. } | KindRule::Sum { relation, .. } => relation,
            };
            if !out.contains(relation) {
                out.push(relation.clone());
            }
        }
        out
    }

    fn translate(&self, event: &Event) -> Vec<Diff> {
        let Some(key) = event.key.as_deref() else {
            tracing::debug!(domain = %event.domain, kind = %event.kind, "event without key skipped");
            return Vec::new();
        };

        self.rules
            .iter()
            .filter(|(kind, _)| kind == &event.kind)
            .filter_map(|(_, rule)| match rule {
                KindRule::Count { relation, sign } => Some(Diff::count(relation.clone(), key, *sign)),
                KindRule::Sum { relation, field } => event
                    .payload
                    .get(field)
                    .and_then(serde_json::Value::as_f64)
                    .map(|v| Diff::value(relation.clone(), key, v)),
            })
            .collect()
    }
}

/// Re-keys an input relation through a key function and forwards deltas.
pub struct ProjectionView {
    name: String,
    input: RelationName,
    output: RelationName,
    key_fn: KeyFn,
}

impl ProjectionView {
    /// Project `input` into `output` through `key_fn`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        input: impl Into<RelationName>,
        output: impl Into<RelationName>,
        key_fn: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            key_fn: Arc::new(key_fn),
        }
    }
}

impl ViewBuilder for ProjectionView {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<RelationName> {
        vec![self.input.clone()]
    }

    fn output(&self) -> RelationName {
        self.output.clone()
    }

    fn on_diffs(&self, _input: &RelationName, diffs: &[Diff], _ctx: &ViewContext<'_>) -> Vec<Diff> {
        diffs
            .iter()
            .map(|d| Diff::new(self.output.clone(), (self.key_fn)(&d.key), d.delta))
            .collect()
    }
}

/// Membership relation of the top-K keys of an input relation by count.
///
/// Ties are broken by key. Members carry count 1 in the output relation. Membership
/// is recomputed from the reader, so overlay derivation sees per-scenario rankings.
pub struct TopKView {
    name: String,
    input: RelationName,
    output: RelationName,
    k: usize,
}

impl TopKView {
    /// Top `k` keys of `input` by count, as members of `output`.
    #[must_use]
    pub fn new(name: impl Into<String>, input: impl Into<RelationName>, output: impl Into<RelationName>, k: usize) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            k,
        }
    }

    /// Top `k` keys of `entries`, highest count first, ties by key.
    #[must_use]
    pub fn rank(entries: Vec<(String, Accum)>, k: usize) -> Vec<String> {
        let mut ranked: Vec<(String, i64)> = entries
            .into_iter()
            .filter(|(_, a)| a.count() > 0)
            .map(|(key, a)| (key, a.count()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.into_iter().take(k).map(|(key, _)| key).collect()
    }
}

impl ViewBuilder for TopKView {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<RelationName> {
        vec![self.input.clone()]
    }

    fn output(&self) -> RelationName {
        self.output.clone()
    }

    fn on_diffs(&self, _input: &RelationName, _diffs: &[Diff], ctx: &ViewContext<'_>) -> Vec<Diff> {
        let desired: HashSet<String> = Self::rank(ctx.reader.entries(&self.input), self.k)
            .into_iter()
            .collect();
        let current: HashSet<String> = ctx
            .reader
            .entries(&self.output)
            .into_iter()
            .filter(|(_, a)| a.count() > 0)
            .map(|(k, _)| k)
            .collect();

        let mut out: Vec<Diff> = desired
            .difference(&current)
            .map(|k| Diff::count(self.output.clone(), k.clone(), 1))
            .collect();
        out.extend(
            current
                .difference(&desired)
                .map(|k| Diff::count(self.output.clone(), k.clone(), -1)),
        );
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

/// Sums input deltas over the last `width` epochs.
///
/// Contributions older than the window are retracted when a later batch arrives.
/// Overlay derivation forwards deltas without bucketing: scenarios are short-lived
/// relative to the window.
pub struct WindowView {
    name: String,
    input: RelationName,
    output: RelationName,
    width: Epoch,
    buckets: Mutex<BTreeMap<Epoch, Vec<Diff>>>,
}

impl WindowView {
    /// Window of `width` epochs over `input`, written to `output`.
    #[must_use]
    pub fn new(name: impl Into<String>, input: impl Into<RelationName>, output: impl Into<RelationName>, width: Epoch) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            width: width.max(1),
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    fn forward(&self, diffs: &[Diff]) -> Vec<Diff> {
        diffs
            .iter()
            .map(|d| Diff::new(self.output.clone(), d.key.clone(), d.delta))
            .collect()
    }
}

impl ViewBuilder for WindowView {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<RelationName> {
        vec![self.input.clone()]
    }

    fn output(&self) -> RelationName {
        self.output.clone()
    }

    fn on_diffs(&self, _input: &RelationName, diffs: &[Diff], ctx: &ViewContext<'_>) -> Vec<Diff> {
        let forwarded = self.forward(diffs);
        if ctx.mode != ViewMode::Base {
            return forwarded;
        }

        let mut buckets = sync::lock(&self.buckets);
        let mut out = Vec::new();
        if let Some(cutoff) = ctx.epoch.checked_sub(self.width) {
            let live = buckets.split_off(&(cutoff + 1));
            let expired = std::mem::replace(&mut *buckets, live);
            for (_, batch) in expired {
                out.extend(batch.iter().map(Diff::negated));
            }
        }
        buckets.entry(ctx.epoch).or_default().extend(forwarded.iter().cloned());
        out.extend(forwarded);
        out
    }
}

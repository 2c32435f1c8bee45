//! Scenario overlays.
//!
//! Key invariants:
//! - Overlay writes never reach the base arrangements.
//! - Reads compose base ⊕ every ancestor overlay ⊕ the scenario's own overlay.
//! - An overlay is append-only until it is retired; retired overlays reject writes.
//! - Retired overlays are only deleted once every evaluator has observed the wave
//!   that retired them. Readers still holding an `Arc` are unaffected by deletion.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use crate::arrangement::ArrangementStore;
use crate::diff::{Accum, Diff};
use crate::error::RuntimeError;
use crate::sync;
use crate::types::{RelationName, ScenarioId};

#[derive(Debug, Default)]
struct OverlayState {
    cells: BTreeMap<(RelationName, String), Accum>,
    diffs: Vec<Diff>,
    retired_at: Option<u64>,
}

/// Per-scenario diff set layered over its parent.
pub struct Overlay {
    id: ScenarioId,
    parent: Option<Arc<Overlay>>,
    state: RwLock<OverlayState>,
}

impl fmt::Debug for Overlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Overlay")
            .field("id", &self.id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Overlay {
    fn new(id: ScenarioId, parent: Option<Arc<Overlay>>) -> Self {
        Self {
            id,
            parent,
            state: RwLock::new(OverlayState::default()),
        }
    }

    /// Scenario this overlay belongs to.
    #[must_use]
    pub const fn id(&self) -> ScenarioId {
        self.id
    }

    /// Parent overlay, if the parent is a scenario rather than the base world.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Overlay>> {
        self.parent.as_ref()
    }

    fn append(&self, diffs: &[Diff]) -> Result<(), RuntimeError> {
        let mut state = sync::write(&self.state);
        if state.retired_at.is_some() {
            return Err(RuntimeError::OverlayConsistency {
                scenario: self.id,
                state: "retired".to_string(),
            });
        }
        for d in diffs {
            let cell = (d.relation.clone(), d.key.clone());
            let acc = state.cells.entry(cell.clone()).or_default();
            acc.add_delta(d.delta);
            if acc.is_zero() {
                state.cells.remove(&cell);
            }
            state.diffs.push(d.clone());
        }
        Ok(())
    }

    /// This overlay's own contribution at (relation, key), ignoring ancestors.
    #[must_use]
    pub fn own(&self, relation: &RelationName, key: &str) -> Accum {
        sync::read(&self.state)
            .cells
            .get(&(relation.clone(), key.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// This overlay's own non-zero cells.
    #[must_use]
    pub fn cells(&self) -> Vec<(RelationName, String, Accum)> {
        sync::read(&self.state)
            .cells
            .iter()
            .map(|((r, k), a)| (r.clone(), k.clone(), *a))
            .collect()
    }

    /// Every diff appended to this overlay, in order. Provenance only.
    #[must_use]
    pub fn diffs(&self) -> Vec<Diff> {
        sync::read(&self.state).diffs.clone()
    }

    /// Number of non-zero cells held by this overlay alone.
    #[must_use]
    pub fn len(&self) -> usize {
        sync::read(&self.state).cells.len()
    }

    /// Returns true if this overlay holds no non-zero cell.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the overlay has been retired.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        sync::read(&self.state).retired_at.is_some()
    }

    fn retire(&self, seq: u64) {
        let mut state = sync::write(&self.state);
        if state.retired_at.is_none() {
            state.retired_at = Some(seq);
        }
    }
}

/// Lineage-ordered chain of overlays, root first.
///
/// An empty chain is the base world.
#[derive(Debug, Clone, Default)]
pub struct OverlayView {
    chain: Vec<Arc<Overlay>>,
}

impl OverlayView {
    /// View of the base world.
    #[must_use]
    pub fn base() -> Self {
        Self::default()
    }

    /// View ending at `leaf`.
    #[must_use]
    pub fn of(leaf: Arc<Overlay>) -> Self {
        let mut chain = vec![Arc::clone(&leaf)];
        let mut cursor = leaf.parent.clone();
        while let Some(p) = cursor {
            cursor = p.parent.clone();
            chain.push(p);
        }
        chain.reverse();
        Self { chain }
    }

    /// Scenario at the end of the chain, or BASE.
    #[must_use]
    pub fn scenario(&self) -> ScenarioId {
        self.chain.last().map_or(ScenarioId::BASE, |o| o.id)
    }

    /// Scenario ids along the chain, root first.
    #[must_use]
    pub fn lineage(&self) -> Vec<ScenarioId> {
        self.chain.iter().map(|o| o.id).collect()
    }

    /// Overlays along the chain, root first.
    #[must_use]
    pub fn overlays(&self) -> &[Arc<Overlay>] {
        &self.chain
    }

    /// Summed overlay contribution at (relation, key).
    #[must_use]
    pub fn lookup(&self, relation: &RelationName, key: &str) -> Accum {
        self.chain
            .iter()
            .fold(Accum::ZERO, |acc, o| acc + o.own(relation, key))
    }

    /// Summed overlay contribution over every key of `relation` accepted by `pred`.
    #[must_use]
    pub fn sum_where(&self, relation: &RelationName, pred: impl Fn(&str) -> bool) -> Accum {
        let mut total = Accum::ZERO;
        for overlay in &self.chain {
            let state = sync::read(&overlay.state);
            for ((r, k), a) in &state.cells {
                if r == relation && pred(k) {
                    total += *a;
                }
            }
        }
        total
    }

    /// Composed overlay delta per (relation, key), zero cells dropped.
    #[must_use]
    pub fn composed_delta(&self) -> BTreeMap<(RelationName, String), Accum> {
        let mut out: BTreeMap<(RelationName, String), Accum> = BTreeMap::new();
        for overlay in &self.chain {
            let state = sync::read(&overlay.state);
            for (cell, a) in &state.cells {
                *out.entry(cell.clone()).or_default() += *a;
            }
        }
        out.retain(|_, a| !a.is_zero());
        out
    }

    /// Composed overlay delta restricted to one relation.
    #[must_use]
    pub fn relation_delta(&self, relation: &RelationName) -> BTreeMap<String, Accum> {
        let mut out: BTreeMap<String, Accum> = BTreeMap::new();
        for overlay in &self.chain {
            let state = sync::read(&overlay.state);
            for ((r, k), a) in &state.cells {
                if r == relation {
                    *out.entry(k.clone()).or_default() += *a;
                }
            }
        }
        out.retain(|_, a| !a.is_zero());
        out
    }
}

/// Read access to `base ⊕ overlay` without materializing either.
#[derive(Debug, Clone, Copy)]
pub struct ComposedReader<'a> {
    store: &'a ArrangementStore,
    view: &'a OverlayView,
}

impl<'a> ComposedReader<'a> {
    /// Compose `store` with `view`.
    #[must_use]
    pub const fn new(store: &'a ArrangementStore, view: &'a OverlayView) -> Self {
        Self { store, view }
    }

    /// The overlay chain being composed.
    #[must_use]
    pub const fn view(&self) -> &'a OverlayView {
        self.view
    }

    /// Composed value at (relation, key).
    #[must_use]
    pub fn read(&self, relation: &RelationName, key: &str) -> Accum {
        self.store.read(relation, key) + self.view.lookup(relation, key)
    }

    /// Composed non-zero cells of a relation, sorted by key.
    #[must_use]
    pub fn entries(&self, relation: &RelationName) -> Vec<(String, Accum)> {
        let mut merged: BTreeMap<String, Accum> = self.store.entries(relation).into_iter().collect();
        for (k, a) in self.view.relation_delta(relation) {
            *merged.entry(k).or_default() += a;
        }
        merged.into_iter().filter(|(_, a)| !a.is_zero()).collect()
    }
}

struct Tombstone {
    id: ScenarioId,
    seq: u64,
}

/// Sharded store of scenario overlays.
pub struct OverlayStore {
    shards: Vec<RwLock<HashMap<ScenarioId, Arc<Overlay>>>>,
    tombstones: Mutex<Vec<Tombstone>>,
}

impl fmt::Debug for OverlayStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayStore")
            .field("shards", &self.shards.len())
            .field("overlays", &self.len())
            .finish_non_exhaustive()
    }
}

impl OverlayStore {
    /// Create a store with `shards` shards.
    #[must_use]
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            tombstones: Mutex::new(Vec::new()),
        }
    }

    fn shard(&self, id: ScenarioId) -> &RwLock<HashMap<ScenarioId, Arc<Overlay>>> {
        #[allow(clippy::cast_possible_truncation)]
        let idx = (id.get() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    fn missing(id: ScenarioId) -> RuntimeError {
        RuntimeError::OverlayConsistency {
            scenario: id,
            state: "missing".to_string(),
        }
    }

    /// Create an empty overlay for `id` layered over `parent`.
    ///
    /// A BASE parent means the overlay sits directly on the base world.
    pub fn create(&self, id: ScenarioId, parent: ScenarioId) -> Result<Arc<Overlay>, RuntimeError> {
        let parent_overlay = if parent.is_base() {
            None
        } else {
            Some(self.get(parent).ok_or_else(|| Self::missing(parent))?)
        };
        let overlay = Arc::new(Overlay::new(id, parent_overlay));
        sync::write(self.shard(id)).insert(id, Arc::clone(&overlay));
        Ok(overlay)
    }

    /// Append diffs to the overlay of `id`.
    pub fn append(&self, id: ScenarioId, diffs: &[Diff]) -> Result<(), RuntimeError> {
        let overlay = self.get(id).ok_or_else(|| Self::missing(id))?;
        overlay.append(diffs)
    }

    /// Overlay of `id`, if still stored.
    #[must_use]
    pub fn get(&self, id: ScenarioId) -> Option<Arc<Overlay>> {
        sync::read(self.shard(id)).get(&id).cloned()
    }

    /// Lineage view of `id`. BASE yields the empty view.
    pub fn view(&self, id: ScenarioId) -> Result<OverlayView, RuntimeError> {
        if id.is_base() {
            return Ok(OverlayView::base());
        }
        self.get(id).map(OverlayView::of).ok_or_else(|| Self::missing(id))
    }

    /// Tombstone the overlay of `id` at close sequence `seq`.
    pub fn retire(&self, id: ScenarioId, seq: u64) {
        if let Some(overlay) = self.get(id) {
            overlay.retire(seq);
            sync::lock(&self.tombstones).push(Tombstone { id, seq });
        }
    }

    /// Delete tombstoned overlays whose retirement sequence is covered by `watermark`.
    pub fn collect(&self, watermark: u64) -> Vec<ScenarioId> {
        let mut tombstones = sync::lock(&self.tombstones);
        let mut removed = Vec::new();
        tombstones.retain(|t| {
            if t.seq <= watermark {
                removed.push(t.id);
                false
            } else {
                true
            }
        });
        drop(tombstones);

        for id in &removed {
            sync::write(self.shard(*id)).remove(id);
        }
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), watermark, "overlays collected");
        }
        removed
    }

    /// Number of tombstones awaiting collection.
    #[must_use]
    pub fn pending_tombstones(&self) -> usize {
        sync::lock(&self.tombstones).len()
    }

    /// Dedup signature of `id`: a hash of its lineage-composed entries on `relations`.
    ///
    /// An empty relation list hashes every relation.
    pub fn signature(&self, id: ScenarioId, relations: &[RelationName]) -> Result<blake3::Hash, RuntimeError> {
        let view = self.view(id)?;
        let mut hasher = blake3::Hasher::new();
        for ((relation, key), acc) in view.composed_delta() {
            if !relations.is_empty() && !relations.contains(&relation) {
                continue;
            }
            hasher.update(relation.as_str().as_bytes());
            hasher.update(&[0]);
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
            hasher.update(&acc.count.to_le_bytes());
            hasher.update(&acc.value_micros.to_le_bytes());
        }
        Ok(hasher.finalize())
    }

    /// Number of stored overlays, retired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| sync::read(s).len()).sum()
    }

    /// Returns true if no overlay is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cells held by live (non-retired) overlays. Used for capacity accounting.
    #[must_use]
    pub fn total_entries(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                sync::read(s)
                    .values()
                    .filter(|o| !o.is_retired())
                    .map(|o| o.len())
                    .sum::<usize>()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff_log::DiffLog;
    use crate::types::RelationSpec;

    fn sid(n: u64) -> ScenarioId {
        ScenarioId::from_raw(n)
    }

    fn base_with_orders() -> ArrangementStore {
        let store = ArrangementStore::new(2, Arc::new(DiffLog::new()));
        store.register_relation(RelationSpec::new("orders", "retail")).unwrap();
        store
            .apply(&RelationName::from("orders"), &[Diff::count("orders", "X", 10)])
            .unwrap();
        store
    }

    #[test]
    fn composed_read_layers_lineage_without_mutating_base() {
        let base = base_with_orders();
        let overlays = OverlayStore::new(4);
        overlays.create(sid(1), ScenarioId::BASE).unwrap();
        overlays.append(sid(1), &[Diff::count("orders", "X", 3)]).unwrap();
        overlays.create(sid(2), sid(1)).unwrap();
        overlays.append(sid(2), &[Diff::count("orders", "X", 2)]).unwrap();

        let orders = RelationName::from("orders");
        let view = overlays.view(sid(2)).unwrap();
        assert_eq!(view.lineage(), vec![sid(1), sid(2)]);
        assert_eq!(ComposedReader::new(&base, &view).read(&orders, "X").count(), 15);
        assert_eq!(base.composed_read(&orders, "X", &view).unwrap().count(), 15);

        let parent_view = overlays.view(sid(1)).unwrap();
        assert_eq!(ComposedReader::new(&base, &parent_view).read(&orders, "X").count(), 13);
        assert_eq!(base.read(&orders, "X").count(), 10);
    }

    #[test]
    fn composed_entries_drop_cancelled_cells() {
        let base = base_with_orders();
        let overlays = OverlayStore::new(1);
        overlays.create(sid(1), ScenarioId::BASE).unwrap();
        overlays
            .append(sid(1), &[Diff::count("orders", "X", -10), Diff::count("orders", "Y", 1)])
            .unwrap();

        let view = overlays.view(sid(1)).unwrap();
        let entries = ComposedReader::new(&base, &view).entries(&RelationName::from("orders"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "Y");
    }

    #[test]
    fn retired_overlay_rejects_writes() {
        let overlays = OverlayStore::new(2);
        overlays.create(sid(1), ScenarioId::BASE).unwrap();
        overlays.retire(sid(1), 3);
        let err = overlays.append(sid(1), &[Diff::count("orders", "X", 1)]).unwrap_err();
        assert!(matches!(err, RuntimeError::OverlayConsistency { .. }));

        let err = overlays.append(sid(9), &[]).unwrap_err();
        assert!(matches!(err, RuntimeError::OverlayConsistency { .. }));
    }

    #[test]
    fn collect_waits_for_watermark() {
        let overlays = OverlayStore::new(2);
        let held = overlays.create(sid(1), ScenarioId::BASE).unwrap();
        overlays.append(sid(1), &[Diff::count("orders", "X", 1)]).unwrap();
        overlays.retire(sid(1), 5);

        assert!(overlays.collect(4).is_empty());
        assert!(overlays.get(sid(1)).is_some());

        assert_eq!(overlays.collect(5), vec![sid(1)]);
        assert!(overlays.get(sid(1)).is_none());
        // Readers keep their snapshot.
        assert_eq!(held.own(&RelationName::from("orders"), "X").count(), 1);
    }

    #[test]
    fn child_keeps_parent_contribution_after_parent_collected() {
        let overlays = OverlayStore::new(2);
        overlays.create(sid(1), ScenarioId::BASE).unwrap();
        overlays.append(sid(1), &[Diff::count("orders", "X", 3)]).unwrap();
        overlays.create(sid(2), sid(1)).unwrap();
        overlays.retire(sid(1), 1);
        overlays.collect(1);

        let view = overlays.view(sid(2)).unwrap();
        assert_eq!(view.lookup(&RelationName::from("orders"), "X").count(), 3);
    }

    #[test]
    fn signature_equal_for_equivalent_states() {
        let overlays = OverlayStore::new(2);
        overlays.create(sid(1), ScenarioId::BASE).unwrap();
        overlays.create(sid(2), ScenarioId::BASE).unwrap();
        overlays
            .append(sid(1), &[Diff::count("orders", "X", 1), Diff::count("orders", "X", 1)])
            .unwrap();
        overlays.append(sid(2), &[Diff::count("orders", "X", 2)]).unwrap();
        overlays.append(sid(2), &[Diff::count("noise", "Z", 1)]).unwrap();

        let rels = vec![RelationName::from("orders")];
        assert_eq!(
            overlays.signature(sid(1), &rels).unwrap(),
            overlays.signature(sid(2), &rels).unwrap()
        );
        assert_ne!(
            overlays.signature(sid(1), &[]).unwrap(),
            overlays.signature(sid(2), &[]).unwrap()
        );
    }

    #[test]
    fn total_entries_skips_retired() {
        let overlays = OverlayStore::new(2);
        overlays.create(sid(1), ScenarioId::BASE).unwrap();
        overlays.create(sid(2), ScenarioId::BASE).unwrap();
        overlays.append(sid(1), &[Diff::count("orders", "X", 1)]).unwrap();
        overlays.append(sid(2), &[Diff::count("orders", "Y", 1)]).unwrap();
        assert_eq!(overlays.total_entries(), 2);
        overlays.retire(sid(2), 0);
        assert_eq!(overlays.total_entries(), 1);
        assert_eq!(overlays.pending_tombstones(), 1);
    }
}

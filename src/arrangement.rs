//! Arrangement store: shared, indexed, incrementally maintained relations.
//!
//! Key invariants:
//! - Relations are registered before the first diff is applied.
//! - Every (relation, key function) pair maps to exactly one `Arrangement`; all
//!   consumers share it by `Arc` identity.
//! - Diff application is linearizable per key (one `RwLock` per shard) and
//!   unordered across unrelated keys.
//! - Composition with an overlay never mutates the base.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use crate::diff::{Accum, Delta, Diff};
use crate::diff_log::{DiffCursor, DiffLog};
use crate::error::{ConfigError, WorldError, WorldResult};
use crate::overlay::OverlayView;
use crate::sync;
use crate::types::{RelationName, RelationSpec};

/// A named function that maps relation keys to arrangement keys.
pub type KeyFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Name of the pre-registered identity key function.
pub const IDENTITY_KEY_FN: &str = "identity";

/// Shard index for a key.
pub(crate) fn shard_for(key: &str, shards: usize) -> usize {
    let hash = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    let h = u64::from_le_bytes(prefix);
    #[allow(clippy::cast_possible_truncation)]
    let idx = (h % shards.max(1) as u64) as usize;
    idx
}

/// One indexed materialization of a relation under a key function.
pub struct Arrangement {
    relation: RelationName,
    key_fn_name: String,
    key_fn: KeyFn,
    shards: Vec<RwLock<HashMap<String, Accum>>>,
}

impl fmt::Debug for Arrangement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arrangement")
            .field("relation", &self.relation)
            .field("key_fn", &self.key_fn_name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Arrangement {
    fn new(relation: RelationName, key_fn_name: String, key_fn: KeyFn, shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            relation,
            key_fn_name,
            key_fn,
            shards,
        }
    }

    /// The relation this arrangement indexes.
    #[must_use]
    pub fn relation(&self) -> &RelationName {
        &self.relation
    }

    /// Name of the key function.
    #[must_use]
    pub fn key_fn_name(&self) -> &str {
        &self.key_fn_name
    }

    /// Map a relation key to this arrangement's key.
    #[must_use]
    pub fn arrange_key(&self, key: &str) -> String {
        (self.key_fn)(key)
    }

    /// Current accumulated value at an arrangement key.
    #[must_use]
    pub fn read(&self, key: &str) -> Accum {
        let shard = &self.shards[shard_for(key, self.shards.len())];
        sync::read(shard).get(key).copied().unwrap_or_default()
    }

    /// Number of non-zero cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| sync::read(s).len()).sum()
    }

    /// Returns true if every cell is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All non-zero cells, sorted by key.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Accum)> {
        let mut out: Vec<(String, Accum)> = self
            .shards
            .iter()
            .flat_map(|s| {
                sync::read(s)
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn apply_cell(cells: &mut HashMap<String, Accum>, key: String, delta: Delta) {
        let acc = cells.entry(key.clone()).or_default();
        acc.add_delta(delta);
        if acc.is_zero() {
            cells.remove(&key);
        }
    }

    fn apply(&self, diffs: &[Diff]) {
        for d in diffs {
            let key = self.arrange_key(&d.key);
            let shard = &self.shards[shard_for(&key, self.shards.len())];
            let mut guard = sync::write(shard);
            Self::apply_cell(&mut guard, key, d.delta);
        }
    }

    /// Partition diffs by the shard their arranged key lands in.
    fn partition(&self, diffs: &[Diff]) -> Vec<Vec<(String, Delta)>> {
        let mut parts: Vec<Vec<(String, Delta)>> = vec![Vec::new(); self.shards.len()];
        for d in diffs {
            let key = self.arrange_key(&d.key);
            parts[shard_for(&key, self.shards.len())].push((key, d.delta));
        }
        parts
    }

    fn apply_shard(&self, shard: usize, cells: Vec<(String, Delta)>) {
        if cells.is_empty() {
            return;
        }
        let mut guard = sync::write(&self.shards[shard]);
        for (key, delta) in cells {
            Self::apply_cell(&mut guard, key, delta);
        }
    }
}

struct RelationEntry {
    spec: RelationSpec,
    arrangements: RwLock<BTreeMap<String, Arc<Arrangement>>>,
}

impl RelationEntry {
    fn all(&self) -> Vec<Arc<Arrangement>> {
        sync::read(&self.arrangements).values().cloned().collect()
    }

    fn primary(&self) -> Option<Arc<Arrangement>> {
        sync::read(&self.arrangements).get(IDENTITY_KEY_FN).cloned()
    }
}

/// Summary of one `apply` call.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub relation: RelationName,
    pub applied: usize,
    pub arrangements: usize,
    pub entries_after: usize,
}

/// Process-wide store of base-world arrangements.
///
/// Constructed once, relations registered before the first diff, torn down with the
/// engine. All access goes through this interface.
pub struct ArrangementStore {
    shard_count: usize,
    relations: RwLock<BTreeMap<RelationName, RelationEntry>>,
    key_fns: RwLock<HashMap<String, KeyFn>>,
    sealed: AtomicBool,
    log: Arc<DiffLog>,
}

impl fmt::Debug for ArrangementStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrangementStore")
            .field("shard_count", &self.shard_count)
            .field("relations", &self.relation_names())
            .field("sealed", &self.sealed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ArrangementStore {
    /// Create a store with `shard_count` shards per arrangement, backed by `log`.
    #[must_use]
    pub fn new(shard_count: usize, log: Arc<DiffLog>) -> Self {
        let identity: KeyFn = Arc::new(|k: &str| k.to_string());
        let mut key_fns = HashMap::new();
        key_fns.insert(IDENTITY_KEY_FN.to_string(), identity);
        Self {
            shard_count: shard_count.max(1),
            relations: RwLock::new(BTreeMap::new()),
            key_fns: RwLock::new(key_fns),
            sealed: AtomicBool::new(false),
            log,
        }
    }

    /// The diff log backing `subscribe`.
    #[must_use]
    pub fn log(&self) -> &Arc<DiffLog> {
        &self.log
    }

    /// Declare a relation. Must happen before the first diff is applied.
    pub fn register_relation(&self, spec: RelationSpec) -> Result<(), ConfigError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(ConfigError::RegistrationClosed {
                relation: spec.name.to_string(),
            });
        }

        let mut relations = sync::write(&self.relations);
        if relations.contains_key(&spec.name) {
            return Err(ConfigError::DuplicateRelation {
                relation: spec.name.to_string(),
            });
        }

        let identity = self.key_fn(IDENTITY_KEY_FN)?;
        let primary = Arc::new(Arrangement::new(
            spec.name.clone(),
            IDENTITY_KEY_FN.to_string(),
            identity,
            self.shard_count,
        ));
        let mut arrangements = BTreeMap::new();
        arrangements.insert(IDENTITY_KEY_FN.to_string(), primary);

        tracing::debug!(relation = %spec.name, domain = %spec.domain, "relation registered");
        relations.insert(
            spec.name.clone(),
            RelationEntry {
                spec,
                arrangements: RwLock::new(arrangements),
            },
        );
        Ok(())
    }

    /// Register a named key function.
    pub fn register_key_fn(
        &self,
        name: impl Into<String>,
        f: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        let mut fns = sync::write(&self.key_fns);
        if fns.contains_key(&name) {
            return Err(ConfigError::DuplicateKeyFn { name });
        }
        fns.insert(name, Arc::new(f));
        Ok(())
    }

    fn key_fn(&self, name: &str) -> Result<KeyFn, ConfigError> {
        sync::read(&self.key_fns)
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownKeyFn {
                name: name.to_string(),
            })
    }

    /// Returns true if the relation is registered.
    #[must_use]
    pub fn contains(&self, relation: &RelationName) -> bool {
        sync::read(&self.relations).contains_key(relation)
    }

    /// Declared spec of a relation.
    #[must_use]
    pub fn relation_spec(&self, relation: &RelationName) -> Option<RelationSpec> {
        sync::read(&self.relations).get(relation).map(|e| e.spec.clone())
    }

    /// All registered relation names, sorted.
    #[must_use]
    pub fn relation_names(&self) -> Vec<RelationName> {
        sync::read(&self.relations).keys().cloned().collect()
    }

    /// Shared arrangement of `relation` under `key_fn`.
    ///
    /// The same pair always yields the same `Arc`. An arrangement created after
    /// diffs were applied is backfilled from the primary index.
    pub fn arrange(&self, relation: &RelationName, key_fn: &str) -> Result<Arc<Arrangement>, ConfigError> {
        let relations = sync::read(&self.relations);
        let entry = relations.get(relation).ok_or_else(|| ConfigError::UnknownRelation {
            relation: relation.to_string(),
        })?;

        if let Some(existing) = sync::read(&entry.arrangements).get(key_fn) {
            return Ok(Arc::clone(existing));
        }

        let f = self.key_fn(key_fn)?;
        let mut arrangements = sync::write(&entry.arrangements);
        // Another consumer may have raced us between the read and write lock.
        if let Some(existing) = arrangements.get(key_fn) {
            return Ok(Arc::clone(existing));
        }

        let arrangement = Arc::new(Arrangement::new(
            relation.clone(),
            key_fn.to_string(),
            f,
            self.shard_count,
        ));
        if let Some(primary) = arrangements.get(IDENTITY_KEY_FN) {
            let backfill: Vec<Diff> = primary
                .entries()
                .into_iter()
                .flat_map(|(key, acc)| {
                    acc.as_deltas()
                        .into_iter()
                        .map(move |delta| Diff::new(relation.clone(), key.clone(), delta))
                        .collect::<Vec<_>>()
                })
                .collect();
            arrangement.apply(&backfill);
        }
        arrangements.insert(key_fn.to_string(), Arc::clone(&arrangement));
        Ok(arrangement)
    }

    fn entry_arrangements(&self, relation: &RelationName) -> Result<Vec<Arc<Arrangement>>, ConfigError> {
        sync::read(&self.relations)
            .get(relation)
            .map(RelationEntry::all)
            .ok_or_else(|| ConfigError::UnknownRelation {
                relation: relation.to_string(),
            })
    }

    fn primary(&self, relation: &RelationName) -> Option<Arc<Arrangement>> {
        sync::read(&self.relations).get(relation).and_then(RelationEntry::primary)
    }

    fn check_batch(relation: &RelationName, diffs: &[Diff]) -> Result<(), ConfigError> {
        if let Some(bad) = diffs.iter().find(|d| &d.relation != relation) {
            return Err(ConfigError::RelationMismatch {
                expected: relation.to_string(),
                actual: bad.relation.to_string(),
            });
        }
        Ok(())
    }

    /// Apply a batch of diffs to every arrangement of `relation`.
    pub fn apply(&self, relation: &RelationName, diffs: &[Diff]) -> WorldResult<ApplyReport> {
        Self::check_batch(relation, diffs)?;
        let arrangements = self.entry_arrangements(relation)?;
        self.sealed.store(true, Ordering::Release);

        for arrangement in &arrangements {
            arrangement.apply(diffs);
        }

        Ok(self.report(relation, diffs.len(), &arrangements))
    }

    /// Apply a batch using up to `workers` threads, each owning a disjoint set of shards.
    pub fn apply_parallel(&self, relation: &RelationName, diffs: &[Diff], workers: usize) -> WorldResult<ApplyReport> {
        let workers = workers.clamp(1, self.shard_count);
        if workers == 1 {
            return self.apply(relation, diffs);
        }
        Self::check_batch(relation, diffs)?;
        let arrangements = self.entry_arrangements(relation)?;
        self.sealed.store(true, Ordering::Release);

        for arrangement in &arrangements {
            let parts = arrangement.partition(diffs);
            let mut per_worker: Vec<Vec<(usize, Vec<(String, Delta)>)>> = vec![Vec::new(); workers];
            for (shard, cells) in parts.into_iter().enumerate() {
                per_worker[shard % workers].push((shard, cells));
            }

            let result = thread::scope(|scope| {
                let handles: Vec<_> = per_worker
                    .into_iter()
                    .map(|assigned| {
                        let arrangement = Arc::clone(arrangement);
                        scope.spawn(move || {
                            for (shard, cells) in assigned {
                                arrangement.apply_shard(shard, cells);
                            }
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join()).collect::<Result<Vec<_>, _>>()
            });
            if result.is_err() {
                return Err(WorldError::internal("arrangement apply worker panicked"));
            }
        }

        Ok(self.report(relation, diffs.len(), &arrangements))
    }

    fn report(&self, relation: &RelationName, applied: usize, arrangements: &[Arc<Arrangement>]) -> ApplyReport {
        let entries_after = self.primary(relation).map_or(0, |p| p.len());
        ApplyReport {
            relation: relation.clone(),
            applied,
            arrangements: arrangements.len(),
            entries_after,
        }
    }

    /// Current base value of (relation, key). Unknown relations read as zero.
    #[must_use]
    pub fn read(&self, relation: &RelationName, key: &str) -> Accum {
        self.primary(relation).map(|p| p.read(key)).unwrap_or_default()
    }

    /// All non-zero base cells of a relation, sorted by key.
    #[must_use]
    pub fn entries(&self, relation: &RelationName) -> Vec<(String, Accum)> {
        self.primary(relation).map(|p| p.entries()).unwrap_or_default()
    }

    /// Number of non-zero base cells of a relation.
    #[must_use]
    pub fn len(&self, relation: &RelationName) -> usize {
        self.primary(relation).map_or(0, |p| p.len())
    }

    /// Total non-zero cells across all primary arrangements.
    #[must_use]
    pub fn total_entries(&self) -> usize {
        sync::read(&self.relations)
            .values()
            .filter_map(RelationEntry::primary)
            .map(|p| p.len())
            .sum()
    }

    /// `base ⊕ overlay` at (relation, key). Neither side is mutated.
    pub fn composed_read(&self, relation: &RelationName, key: &str, overlay: &OverlayView) -> Result<Accum, ConfigError> {
        let primary = self.primary(relation).ok_or_else(|| ConfigError::UnknownRelation {
            relation: relation.to_string(),
        })?;
        Ok(primary.read(key) + overlay.lookup(relation, key))
    }

    /// `base ⊕ overlay` at an arrangement key of a keyed arrangement.
    ///
    /// Cost is proportional to the overlay's size on that relation, not to the relation.
    #[must_use]
    pub fn composed_read_arranged(&self, arrangement: &Arrangement, key: &str, overlay: &OverlayView) -> Accum {
        let delta = overlay.sum_where(arrangement.relation(), |k| arrangement.arrange_key(k) == key);
        arrangement.read(key) + delta
    }

    /// Lazy, restartable sequence of diffs applied to `relation`, starting at log offset `from`.
    pub fn subscribe(&self, relation: &RelationName, from: u64) -> Result<DiffCursor, ConfigError> {
        if !self.contains(relation) {
            return Err(ConfigError::UnknownRelation {
                relation: relation.to_string(),
            });
        }
        Ok(self.log.cursor_for(relation.clone(), from))
    }
}

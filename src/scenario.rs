//! Scenario lifecycle: admission, beam pruning, merging, expiry, capacity pressure.
//!
//! Key invariants:
//! - Every admitted scenario has depth exactly parent depth + 1 and depth ≤ D.
//! - A child's weight never exceeds its parent's weight.
//! - At most K scenarios are Active per wave and per depth.
//! - Merged, Pruned, and Expired are terminal.
//! - No Active scenario has a terminal ancestor: retiring a scenario expires its
//!   Active descendants.
//! - Ids are allocated from 1 upward and never reused.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::{BeamConfig, CapacityConfig, MergePolicy};
use crate::error::{RuntimeError, WorldError, WorldResult};
use crate::frontier::{Candidate, ClosedWave, WaveId};
use crate::overlay::OverlayStore;
use crate::types::{Depth, Epoch, ScenarioId, Weight};

/// Lifecycle state of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScenarioState {
    /// Live: evaluated, branched, and readable.
    Active,
    /// Folded into an equivalent survivor.
    Merged {
        /// The survivor.
        into: ScenarioId,
    },
    /// Lost a beam or capacity ranking.
    Pruned,
    /// Idle for longer than the configured TTL.
    Expired,
}

impl ScenarioState {
    /// Returns true for every state other than `Active`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    fn label(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Merged { .. } => "merged",
            Self::Pruned => "pruned",
            Self::Expired => "expired",
        }
    }
}

/// Arena entry for one scenario.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub id: ScenarioId,
    /// None when the parent is the base world.
    pub parent: Option<ScenarioId>,
    pub depth: Depth,
    pub weight: Weight,
    pub created_at_epoch: Epoch,
    pub last_active_epoch: Epoch,
    pub state: ScenarioState,
    pub wave: WaveId,
}

/// Why a candidate was refused at proposal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// Parent id was never allocated.
    UnknownParent {
        /// Proposed parent.
        parent: ScenarioId,
    },
    /// Parent is no longer Active.
    InactiveParent {
        /// Proposed parent.
        parent: ScenarioId,
        /// Its terminal state.
        state: ScenarioState,
    },
    /// Depth is not parent depth + 1.
    DepthMismatch {
        /// Parent depth + 1.
        expected: Depth,
        /// Proposed depth.
        actual: Depth,
    },
    /// Depth beyond D.
    Depth {
        /// Proposed depth.
        depth: Depth,
        /// Configured D.
        max: Depth,
    },
    /// Child weight above parent weight: a predictor contract violation.
    WeightIncrease {
        /// Parent weight.
        parent: f64,
        /// Proposed weight.
        child: f64,
    },
    /// Below the weight floor: the expected pruning outcome.
    BelowFloor {
        /// Proposed weight.
        weight: f64,
        /// Configured floor.
        floor: f64,
    },
}

/// Result of admitting one closed wave.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaveOutcome {
    /// Wave that was admitted.
    pub wave: WaveId,
    /// Newly Active scenarios, highest weight first.
    pub admitted: Vec<ScenarioId>,
    /// Scenarios pruned by this wave (new candidates and displaced Active ones).
    pub pruned: Vec<ScenarioId>,
    /// (loser, survivor) pairs.
    pub merged: Vec<(ScenarioId, ScenarioId)>,
    /// Candidates refused before ranking.
    pub rejected: Vec<(u64, Rejection)>,
    /// Candidates whose overlay could not be materialized.
    pub dropped: Vec<ScenarioId>,
    /// Active descendants of scenarios retired by this wave, expired with them.
    pub expired: Vec<ScenarioId>,
    /// Scenarios whose overlays must be tombstoned.
    pub retired: Vec<ScenarioId>,
}

/// Exclusive owner of scenario lifecycle.
#[derive(Debug)]
pub struct ScenarioManager {
    beam: BeamConfig,
    capacity: CapacityConfig,
    records: Vec<ScenarioRecord>,
    signatures: HashMap<ScenarioId, blake3::Hash>,
    effective_k: usize,
    pressure_waves: u32,
}

impl ScenarioManager {
    /// Manager with the given bounds. Configs must already be validated.
    #[must_use]
    pub fn new(beam: BeamConfig, capacity: CapacityConfig) -> Self {
        let effective_k = beam.beam_width;
        Self {
            beam,
            capacity,
            records: Vec::new(),
            signatures: HashMap::new(),
            effective_k,
            pressure_waves: 0,
        }
    }

    /// Beam bounds in force.
    #[must_use]
    pub const fn beam(&self) -> &BeamConfig {
        &self.beam
    }

    /// Current beam width, reduced while under capacity pressure.
    #[must_use]
    pub const fn effective_k(&self) -> usize {
        self.effective_k
    }

    /// Consecutive pressured waves so far.
    #[must_use]
    pub const fn pressure_waves(&self) -> u32 {
        self.pressure_waves
    }

    fn index(id: ScenarioId) -> Option<usize> {
        usize::try_from(id.get()).ok()?.checked_sub(1)
    }

    /// Record for `id`.
    #[must_use]
    pub fn get(&self, id: ScenarioId) -> Option<&ScenarioRecord> {
        self.records.get(Self::index(id)?)
    }

    fn get_mut(&mut self, id: ScenarioId) -> Option<&mut ScenarioRecord> {
        let idx = Self::index(id)?;
        self.records.get_mut(idx)
    }

    /// Follow Merged links to the survivor.
    #[must_use]
    pub fn resolve(&self, id: ScenarioId) -> Option<ScenarioId> {
        if id.is_base() {
            return Some(id);
        }
        let mut current = id;
        // Merge chains are acyclic: a survivor is always Active when chosen.
        for _ in 0..=self.records.len() {
            match self.get(current)?.state {
                ScenarioState::Merged { into } => current = into,
                _ => return Some(current),
            }
        }
        None
    }

    /// Ids from the root scenario down to `id`. Empty for BASE.
    #[must_use]
    pub fn lineage(&self, id: ScenarioId) -> Vec<ScenarioId> {
        let mut out = Vec::new();
        let mut cursor = Some(id).filter(|i| !i.is_base());
        while let Some(current) = cursor {
            out.push(current);
            cursor = self.get(current).and_then(|r| r.parent);
        }
        out.reverse();
        out
    }

    /// (depth, weight) of `id`, with BASE at depth 0 and weight 1.
    #[must_use]
    pub fn depth_weight(&self, id: ScenarioId) -> Option<(Depth, Weight)> {
        if id.is_base() {
            return Some((0, Weight::ONE));
        }
        self.get(id).map(|r| (r.depth, r.weight))
    }

    /// Returns true if `id` is BASE or an Active scenario.
    #[must_use]
    pub fn is_live(&self, id: ScenarioId) -> bool {
        id.is_base() || self.get(id).is_some_and(|r| r.state == ScenarioState::Active)
    }

    /// Active scenario ids in id order.
    #[must_use]
    pub fn active_ids(&self) -> Vec<ScenarioId> {
        self.records
            .iter()
            .filter(|r| r.state == ScenarioState::Active)
            .map(|r| r.id)
            .collect()
    }

    /// Number of Active scenarios.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.state == ScenarioState::Active).count()
    }

    /// Active scenarios at `depth`.
    #[must_use]
    pub fn active_at_depth(&self, depth: Depth) -> Vec<ScenarioId> {
        self.records
            .iter()
            .filter(|r| r.state == ScenarioState::Active && r.depth == depth)
            .map(|r| r.id)
            .collect()
    }

    /// Every record, in id order.
    #[must_use]
    pub fn records(&self) -> &[ScenarioRecord] {
        &self.records
    }

    /// Validate a proposed child of `parent` at `depth` with `weight`.
    pub fn check_candidate(&self, parent: ScenarioId, depth: Depth, weight: Weight) -> Result<(), Rejection> {
        let (parent_depth, parent_weight) = if parent.is_base() {
            (0, Weight::ONE)
        } else {
            let resolved = self.resolve(parent).ok_or(Rejection::UnknownParent { parent })?;
            let record = self.get(resolved).ok_or(Rejection::UnknownParent { parent })?;
            if record.state != ScenarioState::Active {
                return Err(Rejection::InactiveParent {
                    parent,
                    state: record.state,
                });
            }
            (record.depth, record.weight)
        };

        if depth != parent_depth + 1 {
            return Err(Rejection::DepthMismatch {
                expected: parent_depth + 1,
                actual: depth,
            });
        }
        if depth > self.beam.max_depth {
            return Err(Rejection::Depth {
                depth,
                max: self.beam.max_depth,
            });
        }
        if weight.value() > parent_weight.value() {
            return Err(Rejection::WeightIncrease {
                parent: parent_weight.value(),
                child: weight.value(),
            });
        }
        if weight.value() < self.beam.weight_floor {
            return Err(Rejection::BelowFloor {
                weight: weight.value(),
                floor: self.beam.weight_floor,
            });
        }
        Ok(())
    }

    fn allocate(&mut self, parent: ScenarioId, depth: Depth, weight: Weight, epoch: Epoch, wave: WaveId, state: ScenarioState) -> ScenarioId {
        let id = ScenarioId::from_raw(self.records.len() as u64 + 1);
        self.records.push(ScenarioRecord {
            id,
            parent: Some(parent).filter(|p| !p.is_base()),
            depth,
            weight,
            created_at_epoch: epoch,
            last_active_epoch: epoch,
            state,
            wave,
        });
        id
    }

    fn set_state(&mut self, id: ScenarioId, state: ScenarioState) {
        if let Some(r) = self.get_mut(id) {
            r.state = state;
        }
        if state.is_terminal() {
            self.signatures.remove(&id);
        }
    }

    /// Expire every Active descendant of `roots`. Returns the ids expired.
    fn expire_descendants(&mut self, roots: &[ScenarioId]) -> Vec<ScenarioId> {
        if roots.is_empty() {
            return Vec::new();
        }
        let mut dead: HashSet<ScenarioId> = roots.iter().copied().collect();
        let mut expired = Vec::new();
        // A child is always allocated after its parent, so one pass in id order
        // reaches every ancestor before its descendants.
        for idx in 0..self.records.len() {
            let record = &self.records[idx];
            let Some(parent) = record.parent else {
                continue;
            };
            if !dead.contains(&parent) {
                continue;
            }
            let id = record.id;
            let active = record.state == ScenarioState::Active;
            dead.insert(id);
            if active {
                self.set_state(id, ScenarioState::Expired);
                expired.push(id);
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "descendants of retired scenarios expired");
        }
        expired
    }

    /// Mark a scenario as recently active.
    pub fn touch(&mut self, id: ScenarioId, epoch: Epoch) {
        if let Some(r) = self.get_mut(id) {
            r.last_active_epoch = r.last_active_epoch.max(epoch);
        }
    }

    /// Rank, admit, prune, and merge the candidates of a closed wave.
    ///
    /// `materialize` fills the overlay of each surviving candidate after the overlay
    /// store has created it. A candidate whose overlay cannot be materialized because
    /// of an overlay consistency race is dropped and reported; other errors abort.
    pub fn admit_wave(
        &mut self,
        wave: &ClosedWave,
        epoch: Epoch,
        overlays: &OverlayStore,
        mut materialize: impl FnMut(ScenarioId, &Candidate) -> WorldResult<()>,
    ) -> WorldResult<WaveOutcome> {
        let mut outcome = WaveOutcome {
            wave: wave.id,
            ..WaveOutcome::default()
        };
        let k = self.effective_k;

        let mut valid: Vec<(ScenarioId, &Candidate)> = Vec::new();
        for c in &wave.candidates {
            match self.check_candidate(c.parent, c.depth, c.weight) {
                Ok(()) => {
                    let parent = self.resolve(c.parent).unwrap_or(c.parent);
                    valid.push((parent, c));
                }
                Err(rejection) => {
                    match &rejection {
                        Rejection::BelowFloor { .. } => {
                            tracing::debug!(wave = wave.id, producer = %c.producer, ?rejection, "candidate below floor");
                        }
                        _ => {
                            tracing::warn!(wave = wave.id, producer = %c.producer, ?rejection, "candidate rejected");
                        }
                    }
                    outcome.rejected.push((c.seq, rejection));
                }
            }
        }

        valid.sort_by(|a, b| {
            b.1.weight
                .value()
                .total_cmp(&a.1.weight.value())
                .then_with(|| a.1.seq.cmp(&b.1.seq))
        });

        let mut fresh: Vec<(ScenarioId, &Candidate)> = Vec::new();
        for (rank, (parent, c)) in valid.into_iter().enumerate() {
            if rank < k {
                let id = self.allocate(parent, c.depth, c.weight, epoch, wave.id, ScenarioState::Active);
                fresh.push((id, c));
            } else {
                let id = self.allocate(parent, c.depth, c.weight, epoch, wave.id, ScenarioState::Pruned);
                outcome.pruned.push(id);
            }
        }

        // Per-depth cap across everything Active at this depth.
        let depth = wave.key.depth;
        let mut at_depth: Vec<(ScenarioId, f64)> = self
            .active_at_depth(depth)
            .into_iter()
            .filter_map(|id| self.get(id).map(|r| (id, r.weight.value())))
            .collect();
        at_depth.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (id, _) in at_depth.into_iter().skip(k) {
            self.set_state(id, ScenarioState::Pruned);
            outcome.pruned.push(id);
            if !fresh.iter().any(|(f, _)| *f == id) {
                outcome.retired.push(id);
            }
        }
        fresh.retain(|(id, _)| self.is_live(*id));

        for (id, c) in fresh {
            let parent = self.get(id).and_then(|r| r.parent).unwrap_or(ScenarioId::BASE);
            let result = overlays
                .create(id, parent)
                .map_err(WorldError::from)
                .and_then(|_| materialize(id, c));
            match result {
                Ok(()) => {
                    outcome.admitted.push(id);
                    self.touch(parent, epoch);
                }
                Err(WorldError::Runtime(e @ RuntimeError::OverlayConsistency { .. })) => {
                    tracing::warn!(scenario = %id, error = %e, "candidate overlay dropped");
                    self.set_state(id, ScenarioState::Pruned);
                    outcome.dropped.push(id);
                    outcome.retired.push(id);
                }
                Err(e) => return Err(e),
            }
        }

        self.merge_depth(depth, overlays, &mut outcome)?;

        // Children of merge losers are expired, not re-parented: their overlays were
        // derived from the loser's world.
        let orphans = self.expire_descendants(&outcome.retired);
        outcome.retired.extend_from_slice(&orphans);
        outcome.expired = orphans;

        tracing::info!(
            wave = wave.id,
            admitted = outcome.admitted.len(),
            pruned = outcome.pruned.len(),
            merged = outcome.merged.len(),
            rejected = outcome.rejected.len(),
            "wave admitted"
        );
        Ok(outcome)
    }

    fn merge_depth(&mut self, depth: Depth, overlays: &OverlayStore, outcome: &mut WaveOutcome) -> WorldResult<()> {
        let relations = self.beam.signature_relations.clone();
        let mut groups: HashMap<blake3::Hash, Vec<ScenarioId>> = HashMap::new();
        for id in self.active_at_depth(depth) {
            let sig = match self.signatures.get(&id) {
                Some(sig) => *sig,
                None => {
                    let sig = overlays.signature(id, &relations)?;
                    self.signatures.insert(id, sig);
                    sig
                }
            };
            groups.entry(sig).or_default().push(id);
        }

        let mut groups: Vec<Vec<ScenarioId>> = groups.into_values().filter(|g| g.len() > 1).collect();
        groups.sort();
        for group in groups {
            let mut members: Vec<(ScenarioId, Weight)> = group
                .into_iter()
                .filter_map(|id| self.get(id).map(|r| (id, r.weight)))
                .collect();
            members.sort_by(|a, b| b.1.value().total_cmp(&a.1.value()).then_with(|| a.0.cmp(&b.0)));
            let Some(&(survivor, survivor_weight)) = members.first() else {
                continue;
            };

            let combined = match self.beam.merge_policy {
                MergePolicy::Max => survivor_weight,
                MergePolicy::Sum => Weight::saturating(members.iter().map(|(_, w)| w.value()).sum()),
            };
            if let Some(r) = self.get_mut(survivor) {
                r.weight = combined;
            }

            for &(loser, _) in &members[1..] {
                self.set_state(loser, ScenarioState::Merged { into: survivor });
                outcome.merged.push((loser, survivor));
                outcome.retired.push(loser);
                outcome.admitted.retain(|id| *id != loser);
                tracing::debug!(loser = %loser, survivor = %survivor, "scenarios merged");
            }
        }
        Ok(())
    }

    /// Expire Active scenarios idle for more than the TTL, with their Active
    /// descendants. Returns the expired ids.
    pub fn expire_stale(&mut self, epoch: Epoch) -> Vec<ScenarioId> {
        let ttl = self.beam.ttl_epochs;
        let mut stale: Vec<ScenarioId> = self
            .records
            .iter()
            .filter(|r| r.state == ScenarioState::Active && r.last_active_epoch.saturating_add(ttl) < epoch)
            .map(|r| r.id)
            .collect();
        for id in &stale {
            self.set_state(*id, ScenarioState::Expired);
        }
        let orphans = self.expire_descendants(&stale);
        stale.extend(orphans);
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), epoch, "scenarios expired");
        }
        stale
    }

    /// Explicitly retire an Active scenario. Its Active descendants expire.
    ///
    /// Returns every id that left the Active state, `id` first.
    pub fn retire(&mut self, id: ScenarioId) -> Result<Vec<ScenarioId>, RuntimeError> {
        let record = self.get(id).ok_or(RuntimeError::ScenarioNotFound { id })?;
        if record.state != ScenarioState::Active {
            return Err(RuntimeError::OverlayConsistency {
                scenario: id,
                state: record.state.label().to_string(),
            });
        }
        self.set_state(id, ScenarioState::Pruned);
        let mut retired = vec![id];
        retired.extend(self.expire_descendants(&[id]));
        Ok(retired)
    }

    /// Enforce capacity ceilings after a wave.
    ///
    /// While over a ceiling the beam width is halved and the deepest, lowest-weight
    /// Active scenarios are pruned until back under it. Too many consecutive
    /// pressured waves is fatal. Returns the ids pruned, followed by any Active
    /// descendants expired with them.
    pub fn apply_pressure(&mut self, overlays: &OverlayStore) -> Result<Vec<ScenarioId>, RuntimeError> {
        let mut active = self.active_count();
        let mut entries = overlays.total_entries();
        let over_active = active > self.capacity.max_active_scenarios;
        let over_entries = entries > self.capacity.max_overlay_entries;

        if !over_active && !over_entries {
            if self.pressure_waves > 0 {
                tracing::info!(k = self.beam.beam_width, "capacity pressure relieved");
            }
            self.pressure_waves = 0;
            self.effective_k = self.beam.beam_width;
            return Ok(Vec::new());
        }

        self.pressure_waves += 1;
        if self.pressure_waves > self.capacity.max_pressure_waves {
            let (limit_type, max_value, actual_value) = if over_active {
                ("active_scenarios", self.capacity.max_active_scenarios, active)
            } else {
                ("overlay_entries", self.capacity.max_overlay_entries, entries)
            };
            return Err(RuntimeError::CapacityExceeded {
                limit_type: limit_type.to_string(),
                max_value: max_value as u64,
                actual_value: actual_value as u64,
                waves: self.pressure_waves,
            });
        }
        self.effective_k = (self.effective_k / 2).max(1);

        let mut victims: Vec<&ScenarioRecord> = self
            .records
            .iter()
            .filter(|r| r.state == ScenarioState::Active)
            .collect();
        victims.sort_by(|a, b| {
            b.depth
                .cmp(&a.depth)
                .then_with(|| a.weight.value().total_cmp(&b.weight.value()))
                .then_with(|| b.id.cmp(&a.id))
        });
        let victims: Vec<ScenarioId> = victims.into_iter().map(|r| r.id).collect();

        let mut pruned = Vec::new();
        let mut orphans = Vec::new();
        for id in victims {
            if active <= self.capacity.max_active_scenarios && entries <= self.capacity.max_overlay_entries {
                break;
            }
            if !self.is_live(id) {
                continue;
            }
            self.set_state(id, ScenarioState::Pruned);
            pruned.push(id);
            let expired = self.expire_descendants(&[id]);
            for gone in std::iter::once(id).chain(expired.iter().copied()) {
                entries = entries.saturating_sub(overlays.get(gone).map_or(0, |o| o.len()));
                active = active.saturating_sub(1);
            }
            orphans.extend(expired);
        }

        tracing::warn!(
            waves = self.pressure_waves,
            k = self.effective_k,
            pruned = pruned.len(),
            expired = orphans.len(),
            "capacity pressure"
        );
        pruned.extend(orphans);
        Ok(pruned)
    }
}

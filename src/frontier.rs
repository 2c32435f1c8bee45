//! Frontier coordination: per-wave barriers over predictor output.
//!
//! A wave is the set of candidates proposed for one (parent, depth). It opens with a
//! known set of producers and closes once every producer has signalled completion or
//! its deadline passes. Candidates are only ranked after their wave has closed, so the
//! beam decision never depends on arrival order.
//!
//! Each closed wave receives a close sequence number. Evaluators report the last
//! sequence they have fully processed; the minimum across evaluators is the
//! watermark that gates overlay deletion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::diff::Diff;
use crate::types::{Depth, Epoch, ScenarioId, Weight};

/// Identifier of a wave. Allocated monotonically.
pub type WaveId = u64;

/// What a wave is proposing children for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaveKey {
    /// Scenario being branched (BASE for the base world).
    pub parent: ScenarioId,
    /// Depth of the proposed children.
    pub depth: Depth,
}

/// A proposed child scenario.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub wave: WaveId,
    pub parent: ScenarioId,
    pub depth: Depth,
    pub weight: Weight,
    pub diffs: Vec<Diff>,
    pub producer: String,
    /// Arrival order within the frontier; ranking tie-breaker.
    pub seq: u64,
}

/// Why a wave closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Every producer signalled completion.
    Complete,
    /// The deadline passed with producers outstanding.
    Timeout,
}

/// A wave that has closed and is ready for ranking.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct ClosedWave {
    pub id: WaveId,
    pub key: WaveKey,
    pub epoch: Epoch,
    pub candidates: Vec<Candidate>,
    pub reason: CloseReason,
    pub close_seq: u64,
    pub latency: Duration,
    /// Producers that never completed (non-empty only on timeout).
    pub missing: Vec<String>,
}

/// Why a candidate or completion signal was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontierRejection {
    /// The wave has already closed.
    Late,
    /// No such wave was ever opened.
    UnknownWave,
}

/// Waves and buffered candidates discarded by `cancel_parent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cancelled {
    /// Open waves dropped.
    pub waves: usize,
    /// Candidates those waves had buffered.
    pub candidates: usize,
}

#[derive(Debug)]
struct OpenWave {
    key: WaveKey,
    epoch: Epoch,
    pending: HashSet<String>,
    candidates: Vec<Candidate>,
    opened_at: Instant,
    deadline: Instant,
}

/// Tracks open waves and evaluator progress.
#[derive(Debug)]
pub struct FrontierCoordinator {
    timeout: Duration,
    next_wave: WaveId,
    next_candidate: u64,
    last_close_seq: u64,
    open: BTreeMap<WaveId, OpenWave>,
    evaluators: HashMap<String, u64>,
}

impl FrontierCoordinator {
    /// Coordinator whose waves time out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_wave: 1,
            next_candidate: 0,
            last_close_seq: 0,
            open: BTreeMap::new(),
            evaluators: HashMap::new(),
        }
    }

    /// Open a wave expecting completion from each of `producers`.
    pub fn open_wave(&mut self, key: WaveKey, epoch: Epoch, producers: &[String], now: Instant) -> WaveId {
        let id = self.next_wave;
        self.next_wave += 1;
        self.open.insert(
            id,
            OpenWave {
                key,
                epoch,
                pending: producers.iter().cloned().collect(),
                candidates: Vec::new(),
                opened_at: now,
                deadline: now + self.timeout,
            },
        );
        tracing::debug!(wave = id, parent = %key.parent, depth = key.depth, "wave opened");
        id
    }

    fn rejection(&self, wave: WaveId) -> FrontierRejection {
        if wave < self.next_wave && wave > 0 {
            FrontierRejection::Late
        } else {
            FrontierRejection::UnknownWave
        }
    }

    /// Buffer a candidate into its wave. The candidate's `seq` is assigned here.
    pub fn push_candidate(&mut self, mut candidate: Candidate) -> Result<(), FrontierRejection> {
        let rejection = self.rejection(candidate.wave);
        let wave = self.open.get_mut(&candidate.wave).ok_or(rejection)?;
        candidate.seq = self.next_candidate;
        self.next_candidate += 1;
        wave.candidates.push(candidate);
        Ok(())
    }

    /// Record that `producer` has finished proposing for `wave`.
    pub fn register_done(&mut self, wave: WaveId, producer: &str) -> Result<(), FrontierRejection> {
        let rejection = self.rejection(wave);
        let open = self.open.get_mut(&wave).ok_or(rejection)?;
        open.pending.remove(producer);
        Ok(())
    }

    /// Close every wave that is complete or past its deadline, in wave order.
    pub fn poll_closable(&mut self, now: Instant) -> Vec<ClosedWave> {
        let ready: Vec<WaveId> = self
            .open
            .iter()
            .filter(|(_, w)| w.pending.is_empty() || now >= w.deadline)
            .map(|(id, _)| *id)
            .collect();

        let mut closed = Vec::with_capacity(ready.len());
        for id in ready {
            let Some(wave) = self.open.remove(&id) else {
                continue;
            };
            self.last_close_seq += 1;
            let reason = if wave.pending.is_empty() {
                CloseReason::Complete
            } else {
                CloseReason::Timeout
            };
            let mut missing: Vec<String> = wave.pending.into_iter().collect();
            missing.sort();
            if reason == CloseReason::Timeout {
                tracing::warn!(
                    wave = id,
                    parent = %wave.key.parent,
                    candidates = wave.candidates.len(),
                    missing = ?missing,
                    "wave closed on timeout"
                );
            }
            closed.push(ClosedWave {
                id,
                key: wave.key,
                epoch: wave.epoch,
                candidates: wave.candidates,
                reason,
                close_seq: self.last_close_seq,
                latency: now.saturating_duration_since(wave.opened_at),
                missing,
            });
        }
        closed
    }

    /// Abandon every open wave for `parent` (the parent was retired), discarding
    /// the candidates they had buffered.
    pub fn cancel_parent(&mut self, parent: ScenarioId) -> Cancelled {
        let mut cancelled = Cancelled::default();
        self.open.retain(|_, w| {
            if w.key.parent != parent {
                return true;
            }
            cancelled.waves += 1;
            cancelled.candidates += w.candidates.len();
            false
        });
        cancelled
    }

    /// Number of open waves.
    #[must_use]
    pub fn open_waves(&self) -> usize {
        self.open.len()
    }

    /// Returns true if no wave is open.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.open.is_empty()
    }

    /// Earliest deadline among open waves.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open.values().map(|w| w.deadline).min()
    }

    /// Close sequence of the most recently closed wave (0 before any close).
    #[must_use]
    pub const fn last_close_seq(&self) -> u64 {
        self.last_close_seq
    }

    /// Register an evaluator. It starts caught up with the current close sequence.
    pub fn register_evaluator(&mut self, name: impl Into<String>) {
        self.evaluators.insert(name.into(), self.last_close_seq);
    }

    /// Remove an evaluator from the watermark.
    pub fn unregister_evaluator(&mut self, name: &str) {
        self.evaluators.remove(name);
    }

    /// Record that `name` has processed every wave up to `seq`. Never moves backwards.
    pub fn observe(&mut self, name: &str, seq: u64) {
        if let Some(observed) = self.evaluators.get_mut(name) {
            *observed = (*observed).max(seq);
        }
    }

    /// Minimum observed close sequence across evaluators.
    ///
    /// With no evaluators registered, every closed wave is quiescent.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.evaluators
            .values()
            .copied()
            .min()
            .unwrap_or(self.last_close_seq)
    }
}

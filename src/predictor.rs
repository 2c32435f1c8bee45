//! Predictor capability and the thread pool that runs predictors.
//!
//! Predictors see the deltas that just changed a world plus a read-only view of that
//! world, and propose weighted child scenarios as diff sets. Each proposal round is
//! a wave; a predictor signals it is finished with the wave through its sink, and
//! dropping the sink signals completion too unless the predictor abandoned it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};

use crate::arrangement::ArrangementStore;
use crate::diff::{to_micros, Delta, Diff};
use crate::error::{RuntimeError, WorldError, WorldResult};
use crate::frontier::{Candidate, WaveId};
use crate::overlay::{ComposedReader, OverlayView};
use crate::types::{Depth, Epoch, RelationName, ScenarioId, Weight};

/// Input to one proposal round.
#[derive(Clone)]
pub struct PredictionRequest {
    /// Wave the proposals belong to.
    pub wave: WaveId,
    /// Scenario being branched (BASE for the base world).
    pub parent: ScenarioId,
    /// Weight of the parent.
    pub parent_weight: Weight,
    /// Depth of the proposed children.
    pub depth: Depth,
    /// Epoch of the triggering change.
    pub epoch: Epoch,
    /// Diffs that just changed the parent world.
    pub deltas: Vec<Diff>,
    /// Parent's overlay chain.
    pub view: OverlayView,
    /// Shared base arrangements.
    pub store: Arc<ArrangementStore>,
}

impl fmt::Debug for PredictionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictionRequest")
            .field("wave", &self.wave)
            .field("parent", &self.parent)
            .field("parent_weight", &self.parent_weight)
            .field("depth", &self.depth)
            .field("epoch", &self.epoch)
            .field("deltas", &self.deltas.len())
            .finish_non_exhaustive()
    }
}

impl PredictionRequest {
    /// Reader over the parent world (base ⊕ parent lineage).
    #[must_use]
    pub fn reader(&self) -> ComposedReader<'_> {
        ComposedReader::new(&self.store, &self.view)
    }
}

/// Message from predictor workers back to the engine.
#[derive(Debug, Clone)]
pub enum PredictorMsg {
    /// A proposed child.
    Candidate(Candidate),
    /// A producer finished a wave.
    Done {
        /// Wave finished.
        wave: WaveId,
        /// Producer name.
        producer: String,
    },
}

/// Where a predictor delivers candidates for one wave.
pub struct CandidateSink {
    wave: WaveId,
    parent: ScenarioId,
    depth: Depth,
    producer: String,
    tx: Sender<PredictorMsg>,
    finished: bool,
}

impl fmt::Debug for CandidateSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateSink")
            .field("wave", &self.wave)
            .field("producer", &self.producer)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl CandidateSink {
    /// Sink for `request`, delivering to `tx` under the name `producer`.
    #[must_use]
    pub fn new(request: &PredictionRequest, producer: impl Into<String>, tx: Sender<PredictorMsg>) -> Self {
        Self {
            wave: request.wave,
            parent: request.parent,
            depth: request.depth,
            producer: producer.into(),
            tx,
            finished: false,
        }
    }

    /// Propose a child. Blocks while the candidate queue is full.
    ///
    /// Returns false once the engine has gone away.
    pub fn emit(&self, weight: Weight, diffs: Vec<Diff>) -> bool {
        self.tx
            .send(PredictorMsg::Candidate(Candidate {
                wave: self.wave,
                parent: self.parent,
                depth: self.depth,
                weight,
                diffs,
                producer: self.producer.clone(),
                seq: 0,
            }))
            .is_ok()
    }

    /// Signal that this producer is finished with the wave.
    pub fn complete(mut self) {
        self.finish();
    }

    /// Give up on the wave without signalling completion. The wave then closes on
    /// its deadline.
    pub fn abandon(mut self) {
        self.finished = true;
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.tx.send(PredictorMsg::Done {
                wave: self.wave,
                producer: self.producer.clone(),
            });
        }
    }
}

impl Drop for CandidateSink {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Proposes child scenarios.
pub trait Predictor: Send + Sync + 'static {
    /// Producer name used for wave completion.
    fn name(&self) -> &str;

    /// Propose children for `request` through `sink`.
    fn propose(&self, request: &PredictionRequest, sink: CandidateSink);
}

impl<P: Predictor + ?Sized> Predictor for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn propose(&self, request: &PredictionRequest, sink: CandidateSink) {
        (**self).propose(request, sink);
    }
}

/// Bounded, thread-based pool running one predictor.
pub struct PredictorPool {
    tx: Option<Sender<PredictionRequest>>,
    out_rx: Receiver<PredictorMsg>,
    workers: Vec<JoinHandle<()>>,
    producer: String,
}

impl fmt::Debug for PredictorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictorPool")
            .field("producer", &self.producer)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

const SUBMIT_POLL: Duration = Duration::from_millis(5);

impl PredictorPool {
    /// Start `workers` threads running `predictor`.
    pub fn start<P: Predictor>(
        predictor: Arc<P>,
        workers: usize,
        request_capacity: usize,
        candidate_capacity: usize,
    ) -> WorldResult<Self> {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<PredictionRequest>(request_capacity.max(1));
        let (out_tx, out_rx) = bounded::<PredictorMsg>(candidate_capacity.max(1));
        let producer = predictor.name().to_string();

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx = rx.clone();
            let out_tx = out_tx.clone();
            let predictor = Arc::clone(&predictor);
            let producer = producer.clone();
            let handle = thread::Builder::new()
                .name(format!("worldline-predictor-{idx}"))
                .spawn(move || {
                    while let Ok(request) = rx.recv() {
                        let sink = CandidateSink::new(&request, producer.as_str(), out_tx.clone());
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| predictor.propose(&request, sink)));
                        if outcome.is_err() {
                            tracing::warn!(wave = request.wave, producer = %producer, "predictor panicked");
                        }
                    }
                })
                .map_err(|e| WorldError::internal(format!("failed to spawn predictor worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            out_rx,
            workers: handles,
            producer,
        })
    }

    /// Producer name of the pooled predictor.
    #[must_use]
    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Submit a request, waiting while the request queue is full.
    ///
    /// Messages that arrive while waiting are handed to `drain`, so workers blocked on
    /// a full candidate queue can make progress.
    pub fn submit(&self, request: PredictionRequest, mut drain: impl FnMut(PredictorMsg)) -> WorldResult<()> {
        let tx = self.tx.as_ref().ok_or_else(Self::disconnected)?;
        let mut pending = request;
        loop {
            match tx.send_timeout(pending, SUBMIT_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    pending = back;
                    for msg in self.out_rx.try_iter() {
                        drain(msg);
                    }
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(Self::disconnected()),
            }
        }
    }

    fn disconnected() -> WorldError {
        WorldError::Runtime(RuntimeError::Disconnected {
            path: "predictor_pool".to_string(),
        })
    }

    /// Every message available right now.
    #[must_use]
    pub fn drain(&self) -> Vec<PredictorMsg> {
        self.out_rx.try_iter().collect()
    }

    /// Wait up to `timeout` for the next message.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PredictorMsg> {
        self.out_rx.recv_timeout(timeout).ok()
    }
}

impl Drop for PredictorPool {
    fn drop(&mut self) {
        // Close the request queue; workers finish their current request and exit.
        drop(self.tx.take());
        while self.workers.iter().any(|h| !h.is_finished()) {
            let _ = self.out_rx.recv_timeout(Duration::from_millis(1));
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// One branch of a rule: child weight factor and delta scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Branch {
    /// Child weight = parent weight × attenuation.
    pub attenuation: f64,
    /// Each matching delta is scaled by this.
    pub scale: f64,
}

#[derive(Debug, Clone)]
struct Rule {
    relation: RelationName,
    branches: Vec<Branch>,
}

/// Declarative predictor: a change to a watched relation branches into the
/// configured children, each repeating the change at a different scale.
#[derive(Debug, Clone)]
pub struct RuleBasedPredictor {
    name: String,
    rules: Vec<Rule>,
}

impl RuleBasedPredictor {
    /// Predictor with no rules.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    /// Branch on changes to `relation`.
    #[must_use]
    pub fn rule(mut self, relation: impl Into<RelationName>, branches: Vec<Branch>) -> Self {
        self.rules.push(Rule {
            relation: relation.into(),
            branches,
        });
        self
    }
}

impl Predictor for RuleBasedPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&self, request: &PredictionRequest, sink: CandidateSink) {
        for rule in &self.rules {
            let matching: Vec<&Diff> = request.deltas.iter().filter(|d| d.relation == rule.relation).collect();
            if matching.is_empty() {
                continue;
            }
            for branch in &rule.branches {
                let diffs: Vec<Diff> = matching
                    .iter()
                    .map(|d| Diff::new(d.relation.clone(), d.key.clone(), d.delta.scale(branch.scale)))
                    .filter(|d| !d.delta.is_zero())
                    .collect();
                if diffs.is_empty() {
                    continue;
                }
                if !sink.emit(request.parent_weight.attenuate(branch.attenuation), diffs) {
                    return;
                }
            }
        }
        sink.complete();
    }
}

/// Growth predictor: repeats observed deltas scaled by a multiplier, lifted to a
/// minimum magnitude, as a single child at a fixed branch factor.
#[derive(Debug, Clone)]
pub struct ScaledDeltaPredictor {
    name: String,
    relations: Vec<RelationName>,
    branch_prob: f64,
    multiplier: f64,
    min_delta: f64,
}

impl Default for ScaledDeltaPredictor {
    fn default() -> Self {
        Self {
            name: "scaled-delta".to_string(),
            relations: Vec::new(),
            branch_prob: 0.5,
            multiplier: 0.3,
            min_delta: 30.0,
        }
    }
}

impl ScaledDeltaPredictor {
    /// Restrict to changes of `relations`. Empty watches everything.
    #[must_use]
    pub fn watching(mut self, relations: Vec<RelationName>) -> Self {
        self.relations = relations;
        self
    }

    /// Child weight factor.
    #[must_use]
    pub const fn with_branch_prob(mut self, branch_prob: f64) -> Self {
        self.branch_prob = branch_prob;
        self
    }

    /// Delta multiplier.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Minimum predicted delta magnitude.
    #[must_use]
    pub const fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    fn predict(&self, delta: Delta) -> Delta {
        match delta.scale(self.multiplier) {
            Delta::Count(n) => {
                #[allow(clippy::cast_possible_truncation)]
                let floor = self.min_delta.round() as i64;
                Delta::Count(n.max(floor))
            }
            Delta::Value(m) => Delta::Value(m.max(to_micros(self.min_delta))),
        }
    }
}

impl Predictor for ScaledDeltaPredictor {
    fn name(&self) -> &str {
        &self.name
    }

    fn propose(&self, request: &PredictionRequest, sink: CandidateSink) {
        let diffs: Vec<Diff> = request
            .deltas
            .iter()
            .filter(|d| self.relations.is_empty() || self.relations.contains(&d.relation))
            .filter(|d| !matches!(d.delta, Delta::Count(n) if n <= 0) && !matches!(d.delta, Delta::Value(m) if m <= 0))
            .map(|d| Diff::new(d.relation.clone(), d.key.clone(), self.predict(d.delta)))
            .collect();
        if !diffs.is_empty() {
            sink.emit(request.parent_weight.attenuate(self.branch_prob), diffs);
        }
        sink.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff_log::DiffLog;

    fn request(deltas: Vec<Diff>, parent_weight: f64) -> PredictionRequest {
        PredictionRequest {
            wave: 7,
            parent: ScenarioId::BASE,
            parent_weight: Weight::new(parent_weight).unwrap(),
            depth: 1,
            epoch: 0,
            deltas,
            view: OverlayView::base(),
            store: Arc::new(ArrangementStore::new(1, Arc::new(DiffLog::new()))),
        }
    }

    fn collect(predictor: &dyn Predictor, req: &PredictionRequest) -> Vec<PredictorMsg> {
        let (tx, rx) = bounded(64);
        predictor.propose(req, CandidateSink::new(req, predictor.name(), tx));
        rx.try_iter().collect()
    }

    fn candidates(msgs: &[PredictorMsg]) -> Vec<&Candidate> {
        msgs.iter()
            .filter_map(|m| match m {
                PredictorMsg::Candidate(c) => Some(c),
                PredictorMsg::Done { .. } => None,
            })
            .collect()
    }

    #[test]
    fn rule_based_branches_with_attenuated_weights() {
        let p = RuleBasedPredictor::new("rules").rule(
            "orders",
            vec![
                Branch { attenuation: 0.6, scale: 0.3 },
                Branch { attenuation: 0.4, scale: 0.1 },
            ],
        );
        let msgs = collect(&p, &request(vec![Diff::count("orders", "X", 10), Diff::count("stock", "X", -1)], 1.0));
        let cands = candidates(&msgs);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].diffs, vec![Diff::count("orders", "X", 3)]);
        assert!((cands[0].weight.value() - 0.6).abs() < 1e-12);
        assert_eq!(cands[1].diffs, vec![Diff::count("orders", "X", 1)]);
        assert!(matches!(msgs.last(), Some(PredictorMsg::Done { wave: 7, .. })));
    }

    #[test]
    fn scaled_delta_lifts_to_minimum() {
        let p = ScaledDeltaPredictor::default().with_min_delta(30.0);
        let msgs = collect(&p, &request(vec![Diff::value("spend", "c1", 50.0), Diff::value("spend", "c2", 500.0)], 0.8));
        let cands = candidates(&msgs);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].diffs, vec![Diff::value("spend", "c1", 30.0), Diff::value("spend", "c2", 150.0)]);
        assert!((cands[0].weight.value() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn dropped_sink_completes_but_abandoned_does_not() {
        let req = request(Vec::new(), 1.0);
        let (tx, rx) = bounded(4);
        drop(CandidateSink::new(&req, "p", tx.clone()));
        assert!(matches!(rx.try_recv(), Ok(PredictorMsg::Done { .. })));

        CandidateSink::new(&req, "p", tx).abandon();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pool_runs_requests_and_reports_completion() {
        let p = Arc::new(RuleBasedPredictor::new("rules").rule(
            "orders",
            vec![Branch { attenuation: 0.5, scale: 1.0 }],
        ));
        let pool = PredictorPool::start(p, 2, 1, 1).unwrap();
        let mut seen = Vec::new();
        for wave in 0..4 {
            let mut req = request(vec![Diff::count("orders", "X", 1)], 1.0);
            req.wave = wave;
            pool.submit(req, |m| seen.push(m)).unwrap();
        }

        let mut done = 0;
        let mut cands = 0;
        let mut pending = seen.into_iter();
        loop {
            let msg = match pending.next() {
                Some(m) => m,
                None if done < 4 => match pool.recv_timeout(Duration::from_secs(5)) {
                    Some(m) => m,
                    None => break,
                },
                None => break,
            };
            match msg {
                PredictorMsg::Candidate(_) => cands += 1,
                PredictorMsg::Done { .. } => done += 1,
            }
        }
        assert_eq!(done, 4);
        assert_eq!(cands, 4);
    }
}

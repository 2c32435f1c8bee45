//! # worldline - Branching futures over a shared base world
//!
//! worldline maintains an incrementally updated base world over a stream of domain
//! events and predicts depth-bounded branching futures as lightweight per-scenario
//! overlays instead of full world copies. Subscriptions ask whether a predicate
//! becomes true in some branch within a depth and weight bound, and alerts carry the
//! lineage that led there.
//!
//! ## Core Concepts
//!
//! - **Base world**: shared arrangements of relations, updated through views
//! - **Scenario**: a weighted branch whose overlay holds only its own diffs
//! - **Wave**: one round of predictor proposals for a (parent, depth), ranked once closed
//! - **Subscription**: a predicate with a depth bound D and a weight floor p_min
//!
//! ## Usage
//!
//! ```rust,ignore
//! use worldline::{Branch, CountTranslator, EngineConfig, Event, OverlayEngine, RelationSpec};
//! use worldline::{RuleBasedPredictor, SubscriptionSpec};
//!
//! let predictor = RuleBasedPredictor::new("demand").rule(
//!     "orders",
//!     vec![Branch { attenuation: 0.6, scale: 0.3 }, Branch { attenuation: 0.4, scale: 0.1 }],
//! );
//! let mut engine = OverlayEngine::new(EngineConfig::default(), predictor)?;
//! engine.register_relation(RelationSpec::new("orders", "retail"))?;
//! engine.register_translator(CountTranslator::new("retail").count("order", "orders", 1))?;
//! engine.subscribe(SubscriptionSpec::new("count(orders, X) >= 12", 2, 0.5))?;
//!
//! engine.ingest(Event::new("retail", "order", 1, "pos-1").with_key("X"))?;
//! let alerts = engine.run_until_idle(std::time::Duration::from_secs(1))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod sync;

// Core types
pub mod config;
pub mod diff;
pub mod error;
pub mod types;

// Base world
pub mod arrangement;
pub mod diff_log;
pub mod views;

// Scenarios
pub mod frontier;
pub mod overlay;
pub mod predictor;
pub mod scenario;

// Subscriptions
pub mod predicate;
pub mod subscription;

// Wiring
pub mod engine;
pub mod metrics;

// Re-export primary types at crate root for convenience
pub use arrangement::{ApplyReport, Arrangement, ArrangementStore, KeyFn, IDENTITY_KEY_FN};
pub use config::{BeamConfig, CapacityConfig, EngineConfig, MergePolicy, RuntimeConfig};
pub use diff::{Accum, Delta, Diff};
pub use diff_log::{DiffCursor, DiffLog, LogEntry};
pub use engine::{OverlayEngine, ScenarioSummary, StepReport};
pub use error::{ConfigError, RuntimeError, WorldError, WorldResult};
pub use frontier::{
    Cancelled, Candidate, CloseReason, ClosedWave, FrontierCoordinator, WaveId, WaveKey,
};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use overlay::{ComposedReader, Overlay, OverlayStore, OverlayView};
pub use predicate::Predicate;
pub use predictor::{
    Branch, CandidateSink, PredictionRequest, Predictor, PredictorMsg, PredictorPool,
    RuleBasedPredictor, ScaledDeltaPredictor,
};
pub use scenario::{Rejection, ScenarioManager, ScenarioRecord, ScenarioState, WaveOutcome};
pub use subscription::{
    Alert, AlertCursor, AlertLog, AlertStream, Explanation, SubscriptionEngine, SubscriptionHandle,
    SubscriptionId, SubscriptionSpec, TriggerMode,
};
pub use types::{Depth, Epoch, Event, RelationName, RelationSpec, ScenarioId, Weight};
pub use views::{
    CountTranslator, EventTranslator, ProjectionView, TopKView, TranslatorRegistry, ViewBuilder,
    ViewContext, ViewMode, ViewReader, ViewRegistry, WindowView,
};

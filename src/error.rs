//! Error types for worldline.
//!
//! Errors are strongly typed using thiserror and split by when they can occur:
//! configuration errors are raised before any dataflow starts, runtime errors
//! describe degradations observed while waves are being processed.

use thiserror::Error;

use crate::types::{Epoch, ScenarioId};

/// Setup-time errors. These are fatal and reported before processing begins.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Unknown relation: {relation}")]
    UnknownRelation { relation: String },

    #[error("Relation '{relation}' is already registered")]
    DuplicateRelation { relation: String },

    #[error("Relation '{relation}' cannot be registered after the first diff was applied")]
    RegistrationClosed { relation: String },

    #[error("Diff for relation '{actual}' submitted to relation '{expected}'")]
    RelationMismatch { expected: String, actual: String },

    #[error("Unknown key function: {name}")]
    UnknownKeyFn { name: String },

    #[error("Key function '{name}' is already registered")]
    DuplicateKeyFn { name: String },

    #[error("No translator registered for domain '{domain}'")]
    UnknownDomain { domain: String },

    #[error("Translator for domain '{domain}' is already registered")]
    DuplicateTranslator { domain: String },

    #[error("View '{name}' is already registered")]
    DuplicateView { name: String },

    #[error("View '{view}' would introduce a cycle through relation '{relation}'")]
    ViewCycle { view: String, relation: String },

    #[error("Malformed predicate at offset {position}: {reason}")]
    MalformedPredicate { position: usize, reason: String },

    #[error("Invalid domain filter '{pattern}': {reason}")]
    InvalidDomainFilter { pattern: String, reason: String },

    #[error("Relation '{relation}' (domain '{domain}') is excluded by the subscription domain filter")]
    DomainFiltered { relation: String, domain: String },

    #[error("Weight {value} is out of range [0.0, 1.0]")]
    InvalidWeight { value: f64 },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Degradations and contract violations observed while the engine runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Predictor timed out on wave {wave} after {waited_ms}ms")]
    PredictorTimeout { wave: u64, waited_ms: u64 },

    #[error("Overlay consistency violation: scenario {scenario} is {state}")]
    OverlayConsistency { scenario: ScenarioId, state: String },

    #[error("Capacity exceeded: {limit_type} (max: {max_value}, actual: {actual_value}) after {waves} pressure waves")]
    CapacityExceeded {
        limit_type: String,
        max_value: u64,
        actual_value: u64,
        waves: u32,
    },

    #[error("Epoch regression from '{origin}': {epoch} < {last}")]
    EpochRegression { origin: String, epoch: Epoch, last: Epoch },

    #[error("Scenario not found: {id}")]
    ScenarioNotFound { id: ScenarioId },

    #[error("Channel disconnected: {path}")]
    Disconnected { path: String },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

/// Top-level error type for worldline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorldError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WorldError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a runtime error.
    #[must_use]
    pub const fn is_runtime(&self) -> bool {
        matches!(self, Self::Runtime(_))
    }

    /// Returns true if the engine can keep running after this error.
    ///
    /// Timeouts and overlay races are absorbed by the engine; capacity and
    /// configuration failures are not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Internal { .. } => false,
            Self::Runtime(e) => matches!(
                e,
                RuntimeError::PredictorTimeout { .. }
                    | RuntimeError::OverlayConsistency { .. }
                    | RuntimeError::Timeout { .. }
            ),
        }
    }
}

/// Result type alias for worldline operations.
pub type WorldResult<T> = Result<T, WorldError>;

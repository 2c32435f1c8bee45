//! Core identifiers and the event record.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Logical event time. Not wall-clock.
pub type Epoch = u64;

/// Branching depth. 0 is the base world.
pub type Depth = u32;

/// Identity of a scenario.
///
/// Identifiers are allocated from 1 upward and never reused, even after the
/// scenario is retired. [`ScenarioId::BASE`] stands for the base world, which has
/// no scenario record of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(u64);

impl ScenarioId {
    /// The base world.
    pub const BASE: Self = Self(0);

    /// Wrap a raw identifier.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true for the base world.
    #[must_use]
    pub const fn is_base(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_base() {
            write!(f, "base")
        } else {
            write!(f, "s{}", self.0)
        }
    }
}

/// Heuristic scenario weight in `[0.0, 1.0]`.
///
/// Weights are scores, not calibrated probabilities. The engine never renormalizes them.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Weight(f64);

impl Weight {
    /// Full weight, used for the base world.
    pub const ONE: Self = Self(1.0);

    /// Validate and wrap a weight.
    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::InvalidWeight { value });
        }
        Ok(Self(value))
    }

    /// Wrap a weight, clamping into range. Non-finite values become 0.
    #[must_use]
    pub fn saturating(value: f64) -> Self {
        if value.is_finite() {
            Self(value.clamp(0.0, 1.0))
        } else {
            Self(0.0)
        }
    }

    /// The underlying score.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    /// Child weight derived from this one. Never exceeds `self`.
    #[must_use]
    pub fn attenuate(self, factor: f64) -> Self {
        Self(Self::saturating(self.0 * factor).0.min(self.0))
    }
}

impl TryFrom<f64> for Weight {
    type Error = ConfigError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Weight> for f64 {
    fn from(w: Weight) -> Self {
        w.0
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// Name of a relation in the arrangement store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationName(String);

impl RelationName {
    /// Create a relation name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RelationName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RelationName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declaration of a relation: its name and the domain it belongs to.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub name: RelationName,
    pub domain: String,
}

impl RelationSpec {
    /// Declare a relation.
    #[must_use]
    pub fn new(name: impl Into<RelationName>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
        }
    }
}

/// A domain event, immutable once appended.
///
/// `epoch` must be non-decreasing per `source`; there is no global ordering requirement.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub domain: String,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub epoch: Epoch,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Event {
    /// Create an event with a null payload and no key.
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        kind: impl Into<String>,
        epoch: Epoch,
        source: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            kind: kind.into(),
            payload: serde_json::Value::Null,
            epoch,
            source: source.into(),
            key: None,
        }
    }

    /// Attach a key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

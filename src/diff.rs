//! Signed deltas and their accumulation.
//!
//! Key invariant: accumulation per (relation, key) is associative and commutative,
//! so applying the diffs of one batch in any order yields the same materialized
//! state. Numeric value deltas are therefore stored as fixed-point micro-units and
//! all arithmetic is wrapping integer arithmetic.

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::types::RelationName;

/// Fixed-point scale for numeric value deltas (micro-units).
pub const VALUE_SCALE: i128 = 1_000_000;

/// A signed change to one (relation, key) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "amount", rename_all = "snake_case")]
pub enum Delta {
    /// Signed multiplicity.
    Count(i64),
    /// Numeric value delta in micro-units.
    Value(i128),
}

impl Delta {
    /// A multiplicity delta.
    #[must_use]
    pub const fn count(n: i64) -> Self {
        Self::Count(n)
    }

    /// A numeric value delta, rounded to micro-units. Non-finite input becomes zero.
    #[must_use]
    pub fn value(v: f64) -> Self {
        Self::Value(to_micros(v))
    }

    /// A numeric value delta from raw micro-units.
    #[must_use]
    pub const fn from_micros(micros: i128) -> Self {
        Self::Value(micros)
    }

    /// The inverse delta.
    #[must_use]
    pub const fn negate(self) -> Self {
        match self {
            Self::Count(n) => Self::Count(n.wrapping_neg()),
            Self::Value(m) => Self::Value(m.wrapping_neg()),
        }
    }

    /// Scale the delta by a factor, rounding to the nearest representable amount.
    #[must_use]
    pub fn scale(self, factor: f64) -> Self {
        match self {
            #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
            Self::Count(n) => Self::Count((n as f64 * factor).round() as i64),
            #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
            Self::Value(m) => Self::Value((m as f64 * factor).round() as i128),
        }
    }

    /// Returns true if applying this delta changes nothing.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        match self {
            Self::Count(n) => n == 0,
            Self::Value(m) => m == 0,
        }
    }
}

/// Convert a float to micro-units. Non-finite input becomes zero.
pub(crate) fn to_micros(v: f64) -> i128 {
    if !v.is_finite() {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let micros = (v * VALUE_SCALE as f64).round() as i128;
    micros
}

/// Accumulated state of one (relation, key) cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accum {
    /// Accumulated multiplicity.
    pub count: i64,
    /// Accumulated numeric value in micro-units.
    pub value_micros: i128,
}

impl Accum {
    /// The empty accumulation.
    pub const ZERO: Self = Self {
        count: 0,
        value_micros: 0,
    };

    /// Accumulation of a single delta.
    #[must_use]
    pub fn from_delta(delta: Delta) -> Self {
        let mut acc = Self::ZERO;
        acc.add_delta(delta);
        acc
    }

    /// Fold a delta into this accumulation.
    pub fn add_delta(&mut self, delta: Delta) {
        match delta {
            Delta::Count(n) => self.count = self.count.wrapping_add(n),
            Delta::Value(m) => self.value_micros = self.value_micros.wrapping_add(m),
        }
    }

    /// Returns true if nothing is accumulated.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.count == 0 && self.value_micros == 0
    }

    /// Accumulated multiplicity.
    #[must_use]
    pub const fn count(&self) -> i64 {
        self.count
    }

    /// Accumulated value as a float.
    #[must_use]
    pub fn value(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let v = self.value_micros as f64 / VALUE_SCALE as f64;
        v
    }

    /// The deltas that reproduce this accumulation from zero.
    #[must_use]
    pub fn as_deltas(&self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(2);
        if self.count != 0 {
            out.push(Delta::Count(self.count));
        }
        if self.value_micros != 0 {
            out.push(Delta::Value(self.value_micros));
        }
        out
    }
}

impl Add for Accum {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            count: self.count.wrapping_add(rhs.count),
            value_micros: self.value_micros.wrapping_add(rhs.value_micros),
        }
    }
}

impl AddAssign for Accum {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// A signed delta to a named relation at a key.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diff {
    pub relation: RelationName,
    pub key: String,
    pub delta: Delta,
}

impl Diff {
    /// Create a diff.
    #[must_use]
    pub fn new(relation: impl Into<RelationName>, key: impl Into<String>, delta: Delta) -> Self {
        Self {
            relation: relation.into(),
            key: key.into(),
            delta,
        }
    }

    /// A multiplicity diff.
    #[must_use]
    pub fn count(relation: impl Into<RelationName>, key: impl Into<String>, n: i64) -> Self {
        Self::new(relation, key, Delta::Count(n))
    }

    /// A numeric value diff.
    #[must_use]
    pub fn value(relation: impl Into<RelationName>, key: impl Into<String>, v: f64) -> Self {
        Self::new(relation, key, Delta::value(v))
    }

    /// The retraction of this diff.
    #[must_use]
    pub fn negated(&self) -> Self {
        Self {
            relation: self.relation.clone(),
            key: self.key.clone(),
            delta: self.delta.negate(),
        }
    }
}

/// Consolidate diffs into one accumulation per (relation, key). Zero cells are dropped.
#[must_use]
pub fn consolidate<'a>(diffs: impl IntoIterator<Item = &'a Diff>) -> BTreeMap<(RelationName, String), Accum> {
    let mut out: BTreeMap<(RelationName, String), Accum> = BTreeMap::new();
    for d in diffs {
        out.entry((d.relation.clone(), d.key.clone()))
            .or_default()
            .add_delta(d.delta);
    }
    out.retain(|_, acc| !acc.is_zero());
    out
}

/// Collapse diffs to at most one count and one value diff per (relation, key).
#[must_use]
pub fn compact(diffs: &[Diff]) -> Vec<Diff> {
    consolidate(diffs)
        .into_iter()
        .flat_map(|((relation, key), acc)| {
            acc.as_deltas()
                .into_iter()
                .map(move |delta| Diff::new(relation.clone(), key.clone(), delta))
                .collect::<Vec<_>>()
        })
        .collect()
}

//! Engine configuration.
//!
//! Defaults follow the beam settings the engine was tuned with: depth 5, beam
//! width 32, weight floor 0.1.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{Depth, Epoch, RelationName};

fn invalid(reason: &str) -> ConfigError {
    ConfigError::InvalidConfig {
        reason: reason.to_string(),
    }
}

/// How the weights of two equivalent scenarios combine when they merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Survivor keeps the larger weight.
    #[default]
    Max,
    /// Survivor takes the sum, clamped to 1.0. Only meaningful for disjoint branches.
    Sum,
}

/// Beam search bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    /// Maximum scenario depth D.
    pub max_depth: Depth,
    /// Beam width K: survivors per wave and per depth.
    pub beam_width: usize,
    /// Candidates below this weight are never admitted.
    pub weight_floor: f64,
    /// Weight combination for merged scenarios.
    pub merge_policy: MergePolicy,
    /// Relations whose composed state decides scenario equivalence. Empty means all.
    pub signature_relations: Vec<RelationName>,
    /// Active scenarios idle for more than this many epochs expire.
    pub ttl_epochs: Epoch,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            beam_width: 32,
            weight_floor: 0.1,
            merge_policy: MergePolicy::Max,
            signature_relations: Vec::new(),
            ttl_epochs: 4,
        }
    }
}

impl BeamConfig {
    /// Validate beam bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.beam_width == 0 {
            return Err(invalid("beam_width must be > 0"));
        }
        if !self.weight_floor.is_finite() || !(0.0..=1.0).contains(&self.weight_floor) {
            return Err(ConfigError::InvalidWeight {
                value: self.weight_floor,
            });
        }
        Ok(())
    }
}

/// Resource ceilings and the pressure policy applied when they are crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Ceiling on Active scenarios.
    pub max_active_scenarios: usize,
    /// Ceiling on cells held by live overlays.
    pub max_overlay_entries: usize,
    /// Consecutive pressured waves tolerated before giving up.
    pub max_pressure_waves: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_active_scenarios: 4096,
            max_overlay_entries: 1 << 20,
            max_pressure_waves: 8,
        }
    }
}

impl CapacityConfig {
    /// Validate ceilings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_scenarios == 0 {
            return Err(invalid("max_active_scenarios must be > 0"));
        }
        if self.max_overlay_entries == 0 {
            return Err(invalid("max_overlay_entries must be > 0"));
        }
        Ok(())
    }
}

/// Threads, queues, and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Predictor worker threads.
    pub predictor_workers: usize,
    /// Bounded prediction request queue.
    pub request_queue_capacity: usize,
    /// Bounded candidate queue back to the engine.
    pub candidate_queue_capacity: usize,
    /// Per-wave deadline before a wave closes with partial candidates.
    pub wave_timeout_ms: u64,
    /// Shards per arrangement and in the overlay store.
    pub arrangement_shards: usize,
    /// Buffer of each push alert stream.
    pub alert_stream_capacity: usize,
    /// Threads used to apply a base batch.
    pub apply_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            predictor_workers: 2,
            request_queue_capacity: 256,
            candidate_queue_capacity: 1024,
            wave_timeout_ms: 500,
            arrangement_shards: 16,
            alert_stream_capacity: 1024,
            apply_workers: 1,
        }
    }
}

impl RuntimeConfig {
    /// Per-wave deadline.
    #[must_use]
    pub const fn wave_timeout(&self) -> Duration {
        Duration::from_millis(self.wave_timeout_ms)
    }

    /// Validate runtime settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.predictor_workers == 0 {
            return Err(invalid("predictor_workers must be > 0"));
        }
        if self.request_queue_capacity == 0 || self.candidate_queue_capacity == 0 {
            return Err(invalid("queue capacities must be > 0"));
        }
        if self.wave_timeout_ms == 0 {
            return Err(invalid("wave_timeout_ms must be > 0"));
        }
        if self.arrangement_shards == 0 {
            return Err(invalid("arrangement_shards must be > 0"));
        }
        if self.alert_stream_capacity == 0 {
            return Err(invalid("alert_stream_capacity must be > 0"));
        }
        if self.apply_workers == 0 {
            return Err(invalid("apply_workers must be > 0"));
        }
        Ok(())
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Beam search bounds.
    pub beam: BeamConfig,
    /// Resource ceilings.
    pub capacity: CapacityConfig,
    /// Threads, queues, and timeouts.
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    /// Validate every section.
    ///
    /// This must be called before constructing an engine; `OverlayEngine::new` does so.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.beam.validate()?;
        self.capacity.validate()?;
        self.runtime.validate()
    }

    /// Parse and validate a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s).map_err(|e| ConfigError::InvalidConfig {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

//! Engine counters and gauges.
//!
//! All values are relaxed atomics; a snapshot is a consistent-enough view for
//! reporting, not a transactional read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
struct MetricsInner {
    base_events: AtomicU64,
    base_diffs: AtomicU64,
    predicted_candidates: AtomicU64,
    rejected_candidates: AtomicU64,
    late_candidates: AtomicU64,
    cancelled_candidates: AtomicU64,
    waves_closed: AtomicU64,
    wave_timeouts: AtomicU64,
    wave_latency_us_total: AtomicU64,
    wave_latency_us_max: AtomicU64,
    scenario_alerts: AtomicU64,
    scenario_created: AtomicU64,
    scenario_pruned: AtomicU64,
    scenario_merged: AtomicU64,
    scenario_expired: AtomicU64,
    overlay_dropped: AtomicU64,
    overlays_collected: AtomicU64,
    pressure_waves: AtomicU64,
    scenario_active: AtomicU64,
    scenario_active_peak: AtomicU64,
    arrangement_entries: AtomicU64,
    overlay_entries: AtomicU64,
}

/// Shared metrics registry. Cloning shares the counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

macro_rules! counter {
    ($($(#[$doc:meta])* $fn:ident => $field:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $fn(&self, delta: u64) {
                self.inner.$field.fetch_add(delta, Ordering::Relaxed);
            }
        )*
    };
}

impl MetricsRegistry {
    /// Create a registry with every value at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        /// Events ingested.
        inc_base_events => base_events;
        /// Diffs applied to the base (input and derived).
        inc_base_diffs => base_diffs;
        /// Candidates received from predictors.
        inc_predicted_candidates => predicted_candidates;
        /// Candidates refused at proposal time.
        inc_rejected_candidates => rejected_candidates;
        /// Candidates that arrived after their wave closed.
        inc_late_candidates => late_candidates;
        /// Buffered candidates discarded with a wave whose parent was retired.
        inc_cancelled_candidates => cancelled_candidates;
        /// Alerts emitted.
        inc_scenario_alerts => scenario_alerts;
        /// Scenarios admitted.
        inc_scenario_created => scenario_created;
        /// Scenarios pruned by beam or capacity.
        inc_scenario_pruned => scenario_pruned;
        /// Scenarios merged into a survivor.
        inc_scenario_merged => scenario_merged;
        /// Scenarios expired by TTL.
        inc_scenario_expired => scenario_expired;
        /// Overlay writes dropped on consistency violations.
        inc_overlay_dropped => overlay_dropped;
        /// Retired overlays deleted.
        inc_overlays_collected => overlays_collected;
        /// Waves that ran under capacity pressure.
        inc_pressure_waves => pressure_waves;
    }

    /// Record a closed wave.
    pub fn record_wave(&self, latency: Duration, timed_out: bool) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.inner.waves_closed.fetch_add(1, Ordering::Relaxed);
        self.inner.wave_latency_us_total.fetch_add(us, Ordering::Relaxed);
        self.inner.wave_latency_us_max.fetch_max(us, Ordering::Relaxed);
        if timed_out {
            self.inner.wave_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Update size gauges.
    pub fn set_gauges(&self, active: u64, arrangement_entries: u64, overlay_entries: u64) {
        self.inner.scenario_active.store(active, Ordering::Relaxed);
        self.inner.scenario_active_peak.fetch_max(active, Ordering::Relaxed);
        self.inner.arrangement_entries.store(arrangement_entries, Ordering::Relaxed);
        self.inner.overlay_entries.store(overlay_entries, Ordering::Relaxed);
    }

    /// Point-in-time copy of every value.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let i = &self.inner;
        MetricsSnapshot {
            base_events: load(&i.base_events),
            base_diffs: load(&i.base_diffs),
            predicted_candidates: load(&i.predicted_candidates),
            rejected_candidates: load(&i.rejected_candidates),
            late_candidates: load(&i.late_candidates),
            cancelled_candidates: load(&i.cancelled_candidates),
            waves_closed: load(&i.waves_closed),
            wave_timeouts: load(&i.wave_timeouts),
            wave_latency_us_total: load(&i.wave_latency_us_total),
            wave_latency_us_max: load(&i.wave_latency_us_max),
            scenario_alerts: load(&i.scenario_alerts),
            scenario_created: load(&i.scenario_created),
            scenario_pruned: load(&i.scenario_pruned),
            scenario_merged: load(&i.scenario_merged),
            scenario_expired: load(&i.scenario_expired),
            overlay_dropped: load(&i.overlay_dropped),
            overlays_collected: load(&i.overlays_collected),
            pressure_waves: load(&i.pressure_waves),
            scenario_active: load(&i.scenario_active),
            scenario_active_peak: load(&i.scenario_active_peak),
            arrangement_entries: load(&i.arrangement_entries),
            overlay_entries: load(&i.overlay_entries),
        }
    }
}

/// Serializable copy of the registry.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub base_events: u64,
    pub base_diffs: u64,
    pub predicted_candidates: u64,
    pub rejected_candidates: u64,
    pub late_candidates: u64,
    pub cancelled_candidates: u64,
    pub waves_closed: u64,
    pub wave_timeouts: u64,
    pub wave_latency_us_total: u64,
    pub wave_latency_us_max: u64,
    pub scenario_alerts: u64,
    pub scenario_created: u64,
    pub scenario_pruned: u64,
    pub scenario_merged: u64,
    pub scenario_expired: u64,
    pub overlay_dropped: u64,
    pub overlays_collected: u64,
    pub pressure_waves: u64,
    pub scenario_active: u64,
    pub scenario_active_peak: u64,
    pub arrangement_entries: u64,
    pub overlay_entries: u64,
}

impl MetricsSnapshot {
    /// Mean wave latency in microseconds.
    #[must_use]
    pub fn mean_wave_latency_us(&self) -> u64 {
        self.wave_latency_us_total
            .checked_div(self.waves_closed)
            .unwrap_or(0)
    }

    /// One JSON object per line, tagged with `label` and the elapsed run time.
    pub fn to_json_line(&self, label: &str, elapsed: Duration) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Line<'a> {
            label: &'a str,
            elapsed_ms: u128,
            #[serde(flatten)]
            snapshot: &'a MetricsSnapshot,
        }
        serde_json::to_string(&Line {
            label,
            elapsed_ms: elapsed.as_millis(),
            snapshot: self,
        })
    }
}

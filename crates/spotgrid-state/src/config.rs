//! Engine configuration with explicit versioning.
//!
//! One `EngineConfig` struct carries every tunable the engine exposes,
//! persisted in the store under a monotonically increasing `version`.
//! Agents cache the config and receive the current copy alongside a
//! heartbeat response whenever their acknowledged version is stale —
//! there is no ambient global mutable state.

use serde::{Deserialize, Serialize};

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Monotonically increasing config version. Bumped on every change.
    pub version: u64,
    pub ingest: IngestSettings,
    pub pricing: PricingSettings,
    pub decision: DecisionSettings,
    pub failover: FailoverSettings,
}

impl EngineConfig {
    /// Bump the version after a change, so cached copies go stale.
    pub fn bump(&mut self) {
        self.version += 1;
    }
}

/// Ingestion validator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestSettings {
    /// Prices above this are clamped down.
    pub max_price: f64,
    /// Prices below this are clamped up.
    pub min_price: f64,
    /// Samples timestamped further than this into the future are rejected.
    pub future_window_secs: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_price: 100.0,
            min_price: 0.0001,
            future_window_secs: 120,
        }
    }
}

/// Pricing consolidator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingSettings {
    /// Canonical bucket width in seconds.
    pub bucket_secs: u64,
    /// Gaps wider than this many buckets are reported, never interpolated.
    pub max_gap_buckets: u64,
    /// Relative spread beyond which multi-source samples count as divergent.
    pub divergence_tolerance: f64,
    /// Interpolated confidence never decays below this.
    pub confidence_floor: f64,
    /// Interval between periodic consolidation runs, in seconds.
    pub interval_secs: u64,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            bucket_secs: 300,
            max_gap_buckets: 6,
            divergence_tolerance: 0.02,
            confidence_floor: 0.5,
            interval_secs: 3600,
        }
    }
}

/// Decision gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionSettings {
    /// Which decision provider to load ("threshold", "none", ...).
    /// A runtime value, not a compile-time dependency.
    pub provider: String,
    /// Provider call budget; past this the fallback rule answers.
    pub timeout_ms: u64,
    /// Fallback rule: switch when discounted < ratio × stable.
    pub switch_ratio: f64,
    /// Fallback rule: minimum seconds in the current pool before switching.
    pub min_dwell_secs: u64,
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            provider: "threshold".to_string(),
            timeout_ms: 2000,
            switch_ratio: 0.7,
            min_dwell_secs: 3600,
        }
    }
}

/// Failover orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FailoverSettings {
    /// Hard budget from termination notice to completed promotion.
    pub promotion_budget_ms: u64,
    /// Commands unacknowledged past this are expired, not retried.
    pub command_expiry_secs: u64,
    /// Zombie reaper scan interval.
    pub reaper_interval_secs: u64,
    /// Command expiry sweeper interval.
    pub sweep_interval_secs: u64,
    /// Pool used when no boot-time observation is cached and for
    /// best-effort fresh launches.
    pub fallback_stable_pool: String,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            promotion_budget_ms: 15_000,
            command_expiry_secs: 300,
            reaper_interval_secs: 60,
            sweep_interval_secs: 30,
            fallback_stable_pool: "on-demand/default".to_string(),
        }
    }
}

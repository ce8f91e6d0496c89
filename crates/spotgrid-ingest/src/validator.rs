//! Report validation and normalization.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use spotgrid_state::{IngestSettings, RawPriceSample, ReporterRole, StateStore};

use crate::error::{IngestError, IngestResult};

/// A raw pricing report as submitted by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceReport {
    pub agent_id: String,
    pub pool_id: String,
    pub price: f64,
    pub source_role: ReporterRole,
    pub captured_at: u64,
}

/// A liveness report. Carries the agent's last observed instance version
/// for optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub agent_id: String,
    pub status: String,
    pub current_pool: String,
    pub version: u64,
    /// The engine config version the agent currently caches.
    #[serde(default)]
    pub config_version: u64,
}

/// A validated heartbeat with the status string parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidHeartbeat {
    pub agent_id: String,
    pub healthy: bool,
    pub current_pool: String,
    pub version: u64,
    pub config_version: u64,
}

/// An interruption signal as submitted by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoticeReport {
    pub agent_id: String,
    pub instance_id: String,
}

/// Which interruption signal arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// Soft warning, minutes of lead time.
    Rebalance,
    /// Hard warning with a provider deadline, ~2 minutes.
    Termination,
}

/// A validated interruption notice.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidNotice {
    pub agent_id: String,
    pub instance_id: String,
    pub kind: NoticeKind,
}

/// Normalizes and sanity-checks inbound telemetry.
pub struct IngestValidator {
    cfg: IngestSettings,
}

impl IngestValidator {
    pub fn new(cfg: IngestSettings) -> Self {
        Self { cfg }
    }

    /// Validate a price report and append it to the raw tier.
    ///
    /// The price is clamped into the configured sane range; samples
    /// timestamped beyond the future window are rejected. Never touches
    /// the canonical tier.
    pub fn ingest_price(
        &self,
        store: &StateStore,
        report: PriceReport,
        now: u64,
    ) -> IngestResult<RawPriceSample> {
        let sample = self.validate_price(report, now)?;
        store.append_raw_sample(&sample)?;
        debug!(
            pool_id = %sample.pool_id,
            price = sample.price,
            source = ?sample.source,
            "raw sample accepted"
        );
        Ok(sample)
    }

    /// Schema and range checks for a price report, without storage.
    pub fn validate_price(&self, report: PriceReport, now: u64) -> IngestResult<RawPriceSample> {
        if report.agent_id.is_empty() {
            return Err(IngestError::MissingField("agent_id"));
        }
        if report.pool_id.is_empty() {
            return Err(IngestError::MissingField("pool_id"));
        }
        if !report.price.is_finite() || report.price <= 0.0 {
            warn!(agent_id = %report.agent_id, price = report.price, "price report rejected");
            return Err(IngestError::BadPrice(report.price));
        }
        if report.captured_at > now + self.cfg.future_window_secs {
            warn!(
                agent_id = %report.agent_id,
                captured_at = report.captured_at,
                "price report from the future rejected"
            );
            return Err(IngestError::FutureTimestamp {
                captured_at: report.captured_at,
                ahead: report.captured_at - now,
                window: self.cfg.future_window_secs,
            });
        }

        let clamped = report.price.clamp(self.cfg.min_price, self.cfg.max_price);
        if clamped != report.price {
            debug!(
                agent_id = %report.agent_id,
                raw = report.price,
                clamped,
                "price clamped into sane range"
            );
        }

        Ok(RawPriceSample {
            pool_id: report.pool_id,
            captured_at: report.captured_at,
            price: clamped,
            source: report.source_role,
            agent_id: report.agent_id,
        })
    }

    /// Normalize a heartbeat report. No storage side effects.
    pub fn validate_heartbeat(&self, report: HeartbeatReport) -> IngestResult<ValidHeartbeat> {
        if report.agent_id.is_empty() {
            return Err(IngestError::MissingField("agent_id"));
        }
        if report.current_pool.is_empty() {
            return Err(IngestError::MissingField("current_pool"));
        }
        let healthy = match report.status.as_str() {
            "running" | "healthy" => true,
            "degraded" | "draining" => false,
            other => return Err(IngestError::UnknownStatus(other.to_string())),
        };
        Ok(ValidHeartbeat {
            agent_id: report.agent_id,
            healthy,
            current_pool: report.current_pool,
            version: report.version,
            config_version: report.config_version,
        })
    }

    /// Normalize an interruption notice. No storage side effects.
    pub fn validate_notice(
        &self,
        report: NoticeReport,
        kind: NoticeKind,
    ) -> IngestResult<ValidNotice> {
        if report.agent_id.is_empty() {
            return Err(IngestError::MissingField("agent_id"));
        }
        if report.instance_id.is_empty() {
            return Err(IngestError::MissingField("instance_id"));
        }
        Ok(ValidNotice {
            agent_id: report.agent_id,
            instance_id: report.instance_id,
            kind,
        })
    }
}

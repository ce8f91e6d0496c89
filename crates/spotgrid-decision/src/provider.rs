//! Decision providers and the deterministic threshold rule.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use spotgrid_state::{DecisionSettings, InstanceRecord, PoolId, PricePoint};

/// Everything a provider may consider. The gateway assembles this from
/// the canonical pricing tier and the instance's current state.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub instance: InstanceRecord,
    /// Recent canonical points for the candidate discounted pool,
    /// oldest first.
    pub prices: Vec<PricePoint>,
    /// Current stable (on-demand) price for the comparable pool.
    pub stable_price: f64,
    pub now: u64,
}

impl DecisionContext {
    /// The freshest canonical point, if any pricing exists.
    pub fn latest_point(&self) -> Option<&PricePoint> {
        self.prices.last()
    }
}

/// What the engine should do with an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Switch,
    Stay,
    EmergencyReplicate,
}

impl RecommendedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RecommendedAction::Switch => "switch",
            RecommendedAction::Stay => "stay",
            RecommendedAction::EmergencyReplicate => "emergency_replicate",
        }
    }
}

/// An opaque recommendation: an action, a target, and a confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: RecommendedAction,
    pub target_pool: Option<PoolId>,
    pub confidence: f64,
    pub est_savings_per_hour: f64,
}

impl Recommendation {
    pub fn stay() -> Self {
        Self {
            action: RecommendedAction::Stay,
            target_pool: None,
            confidence: 1.0,
            est_savings_per_hour: 0.0,
        }
    }
}

/// A pluggable decision source. Selected by configuration at runtime,
/// never a compile-time dependency; the gateway survives any provider
/// being absent, slow, or broken.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, ctx: &DecisionContext) -> anyhow::Result<Recommendation>;
}

/// The deterministic fallback: switch when the discounted price is below
/// `switch_ratio × stable_price` and the instance has dwelled in its
/// current pool long enough.
#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub switch_ratio: f64,
    pub min_dwell_secs: u64,
}

impl ThresholdRule {
    pub fn from_settings(cfg: &DecisionSettings) -> Self {
        Self {
            switch_ratio: cfg.switch_ratio,
            min_dwell_secs: cfg.min_dwell_secs,
        }
    }

    /// Evaluate the rule. Infallible and synchronous: this is what the
    /// hard paths rely on when the provider is unavailable.
    pub fn evaluate(&self, ctx: &DecisionContext) -> Recommendation {
        let Some(point) = ctx.latest_point() else {
            // No consolidated pricing yet: nothing to act on.
            return Recommendation::stay();
        };

        let dwell = ctx.instance.pool_dwell_seconds(ctx.now);
        let cheap_enough = point.price < self.switch_ratio * ctx.stable_price;

        if cheap_enough && dwell >= self.min_dwell_secs {
            Recommendation {
                action: RecommendedAction::Switch,
                target_pool: Some(point.pool_id.clone()),
                confidence: point.confidence,
                est_savings_per_hour: ctx.stable_price - point.price,
            }
        } else {
            Recommendation {
                action: RecommendedAction::Stay,
                target_pool: None,
                confidence: point.confidence,
                est_savings_per_hour: 0.0,
            }
        }
    }
}

/// The threshold rule packaged as a provider, for deployments that run
/// without an external model.
pub struct ThresholdProvider {
    rule: ThresholdRule,
}

impl ThresholdProvider {
    pub fn new(rule: ThresholdRule) -> Self {
        Self { rule }
    }
}

#[async_trait]
impl DecisionProvider for ThresholdProvider {
    fn name(&self) -> &str {
        "threshold"
    }

    async fn decide(&self, ctx: &DecisionContext) -> anyhow::Result<Recommendation> {
        Ok(self.rule.evaluate(ctx))
    }
}

/// Resolve a provider from its configured name. Unknown names disable
/// the provider (the gateway then always uses the fallback rule).
pub fn load_provider(cfg: &DecisionSettings) -> Option<Arc<dyn DecisionProvider>> {
    match cfg.provider.as_str() {
        "threshold" => Some(Arc::new(ThresholdProvider::new(ThresholdRule::from_settings(
            cfg,
        )))),
        "none" => None,
        other => {
            warn!(provider = %other, "unknown decision provider, falling back to rule");
            None
        }
    }
}

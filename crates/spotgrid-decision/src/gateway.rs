//! The decision gateway — time-boxed provider calls with a guaranteed
//! deterministic fallback.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use spotgrid_state::{DecisionAudit, DecisionSettings, StateResult, StateStore};

use crate::provider::{
    DecisionContext, DecisionProvider, Recommendation, ThresholdRule, load_provider,
};

/// Obtains recommendations from the configured provider, guaranteeing an
/// answer within the configured budget. Never mutates engine state; the
/// only side effect is one [`DecisionAudit`] entry per call.
pub struct DecisionGateway {
    store: StateStore,
    provider: Option<Arc<dyn DecisionProvider>>,
    fallback: ThresholdRule,
    timeout: Duration,
}

impl DecisionGateway {
    /// Build a gateway with the provider named in the settings.
    pub fn new(store: StateStore, cfg: &DecisionSettings) -> Self {
        Self {
            store,
            provider: load_provider(cfg),
            fallback: ThresholdRule::from_settings(cfg),
            timeout: Duration::from_millis(cfg.timeout_ms),
        }
    }

    /// Replace the provider (tests inject fakes here).
    pub fn with_provider(mut self, provider: Arc<dyn DecisionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Decide for one instance. A provider timeout or error is not a
    /// failure — the deterministic rule answers instead.
    pub async fn decide(&self, ctx: &DecisionContext) -> StateResult<Recommendation> {
        let (rec, provider_name, fell_back) = match &self.provider {
            Some(provider) => {
                match tokio::time::timeout(self.timeout, provider.decide(ctx)).await {
                    Ok(Ok(rec)) => (rec, provider.name().to_string(), false),
                    Ok(Err(e)) => {
                        debug!(provider = provider.name(), error = %e, "provider failed, using fallback");
                        (self.fallback.evaluate(ctx), "fallback".to_string(), true)
                    }
                    Err(_) => {
                        debug!(provider = provider.name(), "provider timed out, using fallback");
                        (self.fallback.evaluate(ctx), "fallback".to_string(), true)
                    }
                }
            }
            None => (self.fallback.evaluate(ctx), "fallback".to_string(), true),
        };

        self.store.append_decision_audit(&DecisionAudit {
            id: Uuid::new_v4().to_string(),
            agent_id: ctx.instance.agent_id.clone(),
            provider: provider_name,
            action: rec.action.as_str().to_string(),
            target_pool: rec.target_pool.clone(),
            confidence: rec.confidence,
            est_savings_per_hour: rec.est_savings_per_hour,
            fell_back,
            created_at: ctx.now,
        })?;

        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RecommendedAction;
    use async_trait::async_trait;
    use spotgrid_state::{
        CapacityMode, InstanceRecord, InstanceRole, LifecycleStatus, PricePoint,
    };

    struct SlowProvider;

    #[async_trait]
    impl DecisionProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        async fn decide(&self, _ctx: &DecisionContext) -> anyhow::Result<Recommendation> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("the gateway must never wait this long")
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl DecisionProvider for BrokenProvider {
        fn name(&self) -> &str {
            "broken"
        }

        async fn decide(&self, _ctx: &DecisionContext) -> anyhow::Result<Recommendation> {
            anyhow::bail!("model not loaded")
        }
    }

    fn test_ctx() -> DecisionContext {
        let now = 100_000;
        DecisionContext {
            instance: InstanceRecord {
                logical_id: "lg-1".to_string(),
                provider_id: "i-lg-1".to_string(),
                agent_id: "agent-1".to_string(),
                role: InstanceRole::Primary,
                status: LifecycleStatus::Running,
                mode: CapacityMode::Stable,
                pool_id: "on-demand/us-east-1a".to_string(),
                version: 1,
                launch_requested_at: 0,
                launch_confirmed_at: Some(10),
                termination_requested_at: None,
                termination_confirmed_at: None,
                last_heartbeat_at: Some(now),
                updated_at: now,
                pool_entered_at: now - 7200,
            },
            prices: vec![PricePoint {
                pool_id: "m5.large/us-east-1a".to_string(),
                bucket: 99_900,
                price: 0.051,
                confidence: 0.8,
                is_interpolated: false,
                source_count: 2,
            }],
            stable_price: 0.20,
            now,
        }
    }

    fn gateway_with_timeout(store: StateStore, timeout_ms: u64) -> DecisionGateway {
        let cfg = DecisionSettings {
            provider: "none".to_string(),
            timeout_ms,
            ..DecisionSettings::default()
        };
        DecisionGateway::new(store, &cfg)
    }

    #[tokio::test]
    async fn no_provider_uses_the_fallback_rule() {
        let store = StateStore::open_in_memory().unwrap();
        let gateway = gateway_with_timeout(store, 2000);

        let rec = gateway.decide(&test_ctx()).await.unwrap();
        assert_eq!(rec.action, RecommendedAction::Switch);
        assert!(rec.confidence >= 0.8);
    }

    #[tokio::test]
    async fn slow_provider_is_time_boxed() {
        let store = StateStore::open_in_memory().unwrap();
        let gateway =
            gateway_with_timeout(store, 50).with_provider(Arc::new(SlowProvider));

        let started = std::time::Instant::now();
        let rec = gateway.decide(&test_ctx()).await.unwrap();

        // Fallback answered well under the provider's sleep.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(rec.action, RecommendedAction::Switch);
    }

    #[tokio::test]
    async fn broken_provider_falls_back_transparently() {
        let store = StateStore::open_in_memory().unwrap();
        let gateway =
            gateway_with_timeout(store, 2000).with_provider(Arc::new(BrokenProvider));

        let rec = gateway.decide(&test_ctx()).await.unwrap();
        assert_eq!(rec.action, RecommendedAction::Switch);
    }

    #[tokio::test]
    async fn every_decision_is_audited() {
        let store = StateStore::open_in_memory().unwrap();
        let gateway = gateway_with_timeout(store.clone(), 2000)
            .with_provider(Arc::new(BrokenProvider));

        gateway.decide(&test_ctx()).await.unwrap();

        let audits = store.list_decision_audit("agent-1", 10).unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].provider, "fallback");
        assert!(audits[0].fell_back);
        assert_eq!(audits[0].action, "switch");

        // The gateway mutated no engine state.
        assert!(store.list_instances().unwrap().is_empty());
    }
}

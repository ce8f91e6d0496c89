//! spotgrid-decision — the decision gateway.
//!
//! Given consolidated pricing and current instance state, obtains a
//! switch/stay/emergency-replicate recommendation from a pluggable
//! [`DecisionProvider`]. The provider call is time-boxed; on timeout,
//! error, or no provider loaded the gateway falls back to the
//! deterministic [`ThresholdRule`], so the engine never stalls on
//! provider availability. A provider being unavailable is expected
//! behavior, not an error path.
//!
//! The gateway never mutates engine state — it is a pure function of its
//! inputs except for one decision audit entry per call.

pub mod gateway;
pub mod provider;

pub use gateway::DecisionGateway;
pub use provider::{
    DecisionContext, DecisionProvider, Recommendation, RecommendedAction, ThresholdProvider,
    ThresholdRule, load_provider,
};

//! spotgrid-pricing — the pricing data consolidation pipeline.
//!
//! Turns the noisy, duplicated, gap-ridden raw sample tier into the
//! canonical price series that drives switching and failover decisions:
//! overlapping primary/replica samples are deduplicated into one point
//! per (pool, bucket), bounded gaps are linearly interpolated with
//! decaying confidence, and oversized gaps are reported rather than
//! fabricated.
//!
//! Runs as a periodic background job plus an on-demand catch-up mode;
//! every run is tracked as a [`ConsolidationJob`](spotgrid_state::ConsolidationJob)
//! with a per-bucket checkpoint so a crashed run resumes where it
//! stopped, not from the start.

pub mod consolidator;

pub use consolidator::{Consolidator, RunReport, UnfilledGap};

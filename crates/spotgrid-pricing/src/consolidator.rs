//! Consolidation job — raw tier in, canonical tier out.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use spotgrid_state::{
    ConsolidationJob, JobStatus, PricePoint, PricingSettings, RawPriceSample, StateResult,
    StateStore,
};

/// A gap too wide to interpolate safely. Reported, never filled.
#[derive(Debug, Clone, PartialEq)]
pub struct UnfilledGap {
    pub pool_id: String,
    /// First missing bucket.
    pub from_bucket: u64,
    /// First bucket after the gap (exclusive).
    pub to_bucket: u64,
    pub buckets: u64,
}

/// Outcome of one consolidation run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job: ConsolidationJob,
    pub gaps: Vec<UnfilledGap>,
}

/// The pricing consolidator. Exclusively owns the canonical tier.
pub struct Consolidator {
    store: StateStore,
    cfg: PricingSettings,
}

impl Consolidator {
    pub fn new(store: StateStore, cfg: PricingSettings) -> Self {
        Self { store, cfg }
    }

    /// Align a timestamp down to its bucket start.
    fn align(&self, ts: u64) -> u64 {
        ts - ts % self.cfg.bucket_secs
    }

    /// Consolidate all pools over `[from, to)` (aligned to bucket
    /// boundaries). Idempotent: rerunning over the same inputs produces
    /// the same canonical output. The job checkpoint advances after each
    /// bucket's writes, so a crashed run resumes from `last_bucket`.
    pub fn run_range(&self, from: u64, to: u64, now: u64) -> StateResult<RunReport> {
        let from = self.align(from);
        let to = self.align(to);

        let mut job = ConsolidationJob {
            id: Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: None,
            status: JobStatus::Running,
            last_bucket: None,
            buckets_written: 0,
            samples_read: 0,
            gaps_unfilled: 0,
        };
        self.store.put_job(&job)?;

        if from >= to {
            job.status = JobStatus::Completed;
            job.finished_at = Some(now);
            self.store.put_job(&job)?;
            debug!(from, to, "empty consolidation range");
            return Ok(RunReport { job, gaps: Vec::new() });
        }

        // Plan every pool's points up front, then write in bucket order
        // so the checkpoint is meaningful across pools.
        let mut by_bucket: BTreeMap<u64, Vec<PricePoint>> = BTreeMap::new();
        let mut gaps = Vec::new();
        for pool_id in self.store.raw_sample_pools()? {
            let samples = self.store.list_raw_samples(&pool_id, from, to)?;
            job.samples_read += samples.len() as u64;
            let (points, pool_gaps) = consolidate_series(&self.cfg, &pool_id, &samples, from, to);
            for point in points {
                by_bucket.entry(point.bucket).or_default().push(point);
            }
            gaps.extend(pool_gaps);
        }

        for (bucket, points) in &by_bucket {
            for point in points {
                self.store.upsert_price_point(point)?;
                job.buckets_written += 1;
            }
            job.last_bucket = Some(*bucket);
            self.store.put_job(&job)?;
        }

        for gap in &gaps {
            warn!(
                pool_id = %gap.pool_id,
                from_bucket = gap.from_bucket,
                buckets = gap.buckets,
                "gap exceeds safe interpolation width, left unfilled"
            );
        }

        job.gaps_unfilled = gaps.len() as u64;
        job.status = JobStatus::Completed;
        job.finished_at = Some(now);
        self.store.put_job(&job)?;

        info!(
            job_id = %job.id,
            buckets = job.buckets_written,
            samples = job.samples_read,
            gaps = job.gaps_unfilled,
            "consolidation run completed"
        );
        Ok(RunReport { job, gaps })
    }

    /// Consolidate everything that accumulated since the last run.
    ///
    /// Resumes from the previous job's checkpoint — a crashed run
    /// continues at `last_bucket + width`, and a fresh store starts at
    /// the earliest raw sample. The bucket containing `now` is left for
    /// the next run (it is still filling).
    pub fn run_catch_up(&self, now: u64) -> StateResult<RunReport> {
        let from = match self.store.latest_job()? {
            Some(job) => match job.last_bucket {
                Some(bucket) => bucket + self.cfg.bucket_secs,
                None => self.earliest_sample_at()?.unwrap_or(now),
            },
            None => self.earliest_sample_at()?.unwrap_or(now),
        };
        let to = self.align(now);
        self.run_range(from, to, now)
    }

    fn earliest_sample_at(&self) -> StateResult<Option<u64>> {
        let mut earliest: Option<u64> = None;
        for pool_id in self.store.raw_sample_pools()? {
            if let Some(ts) = self.store.earliest_raw_sample_at(&pool_id)? {
                earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
            }
        }
        Ok(earliest)
    }

    /// Run the periodic consolidation loop.
    pub async fn run_periodic(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "consolidator started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let now = epoch_secs();
                    if let Err(e) = self.run_catch_up(now) {
                        error!(error = %e, "consolidation run failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("consolidator shutting down");
                    break;
                }
            }
        }
    }
}

/// Consolidate one pool's samples over `[from, to)` into canonical
/// points. Pure function of its inputs.
pub fn consolidate_series(
    cfg: &PricingSettings,
    pool_id: &str,
    samples: &[RawPriceSample],
    from: u64,
    to: u64,
) -> (Vec<PricePoint>, Vec<UnfilledGap>) {
    let w = cfg.bucket_secs;

    // Group samples into their buckets.
    let mut grouped: BTreeMap<u64, Vec<&RawPriceSample>> = BTreeMap::new();
    for sample in samples {
        let bucket = sample.captured_at - sample.captured_at % w;
        if bucket >= from && bucket < to {
            grouped.entry(bucket).or_default().push(sample);
        }
    }

    // Measured points: single source keeps its value at full confidence;
    // multiple sources average, dropping to 0.8 when they diverge.
    let mut points = Vec::new();
    for (&bucket, bucket_samples) in &grouped {
        let n = bucket_samples.len();
        let mean = bucket_samples.iter().map(|s| s.price).sum::<f64>() / n as f64;
        let min = bucket_samples.iter().map(|s| s.price).fold(f64::MAX, f64::min);
        let max = bucket_samples.iter().map(|s| s.price).fold(f64::MIN, f64::max);
        let spread = if mean > 0.0 { (max - min) / mean } else { 0.0 };

        let confidence = if n >= 2 && spread > cfg.divergence_tolerance {
            debug!(%pool_id, bucket, spread, "divergent multi-source bucket averaged");
            0.8
        } else {
            1.0
        };

        points.push(PricePoint {
            pool_id: pool_id.to_string(),
            bucket,
            price: mean,
            confidence,
            is_interpolated: false,
            source_count: n as u32,
        });
    }

    // Interpolation: fill empty buckets bounded by measured neighbours
    // no more than max_gap_buckets apart. Confidence decays with the
    // distance to the nearest measured point, floored.
    let mut gaps = Vec::new();
    let measured: Vec<(u64, f64)> = points.iter().map(|p| (p.bucket, p.price)).collect();
    for pair in measured.windows(2) {
        let (b1, p1) = pair[0];
        let (b2, p2) = pair[1];
        let gap_buckets = (b2 - b1) / w - 1;
        if gap_buckets == 0 {
            continue;
        }
        if gap_buckets > cfg.max_gap_buckets {
            gaps.push(UnfilledGap {
                pool_id: pool_id.to_string(),
                from_bucket: b1 + w,
                to_bucket: b2,
                buckets: gap_buckets,
            });
            continue;
        }
        for i in 1..=gap_buckets {
            let frac = i as f64 / (gap_buckets + 1) as f64;
            let dist = i.min(gap_buckets + 1 - i);
            let confidence =
                (0.9 - 0.1 * (dist - 1) as f64).max(cfg.confidence_floor);
            points.push(PricePoint {
                pool_id: pool_id.to_string(),
                bucket: b1 + i * w,
                price: p1 + (p2 - p1) * frac,
                confidence,
                is_interpolated: true,
                source_count: 0,
            });
        }
    }

    points.sort_by_key(|p| p.bucket);
    (points, gaps)
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

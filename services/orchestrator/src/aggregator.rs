//! Metrics Aggregator
//!
//! Per (predictor, metric) running statistics fed from `prediction-results`. Ingest is
//! idempotent on (request_id, predictor_id) for as long as the key stays in the recent-id
//! cache; a later copy of a result only contributes its feedback outcome, once.
//!
//! Lifetime figures use Welford's update; windowed figures merge fixed-width time buckets
//! with the parallel variance combination.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use serving_core::SERVING_METRICS;

use crate::error::{Result, ServingError};
use crate::model::{Outcome, PredictionResult, PredictorId, RequestId};
use crate::pipeline::{Payload, Subscription};
use crate::store::RecordStore;

pub const METRIC_SCORE: &str = "score";
pub const METRIC_LATENCY: &str = "latency_ms";
pub const METRIC_COST: &str = "cost";
pub const METRIC_FEEDBACK: &str = "feedback";
pub const METRIC_TIMEOUT_RATE: &str = "timeout_rate";
pub const METRIC_ERROR_RATE: &str = "error_rate";
pub const METRICS: [&str; 6] = [
    METRIC_SCORE,
    METRIC_LATENCY,
    METRIC_COST,
    METRIC_FEEDBACK,
    METRIC_TIMEOUT_RATE,
    METRIC_ERROR_RATE,
];

/// Cap on |z| when both samples have zero variance but different means.
const Z_CAP: f64 = 1e6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// How long a (request, predictor) key is remembered for deduplication.
    pub retention_secs: u64,
    pub dedup_capacity: usize,
    pub min_samples: u64,
    pub bucket_secs: u64,
    pub max_buckets: usize,
    pub persist_interval_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 3600,
            dedup_capacity: 1_000_000,
            min_samples: 30,
            bucket_secs: 60,
            max_buckets: 24 * 60,
            persist_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.count += 1;
        self.sum += x;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Combine two disjoint samples (Chan et al.).
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.m2 += other.m2 + delta * delta * self.count as f64 * other.count as f64 / n;
        self.mean += delta * other.count as f64 / n;
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Sample variance; zero below two observations.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count as f64 - 1.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub predictor_id: PredictorId,
    pub metric: String,
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last_update: DateTime<Utc>,
}

impl MetricSnapshot {
    fn from_stats(
        predictor_id: &PredictorId,
        metric: &str,
        s: &RunningStats,
        last_update: DateTime<Utc>,
    ) -> Self {
        Self {
            predictor_id: predictor_id.clone(),
            metric: metric.to_string(),
            count: s.count,
            mean: s.mean,
            m2: s.m2,
            sum: s.sum,
            min: s.min,
            max: s.max,
            last_update,
        }
    }

    fn stats(&self) -> RunningStats {
        RunningStats {
            count: self.count,
            mean: self.mean,
            m2: self.m2,
            sum: self.sum,
            min: self.min,
            max: self.max,
        }
    }

    pub fn variance(&self) -> f64 { self.stats().variance() }
    pub fn std_dev(&self) -> f64 { self.variance().sqrt() }
}

/// Two-sample z-test of `b` against `a`; `difference` is `mean_b - mean_a`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonResult {
    pub predictor_a: PredictorId,
    pub predictor_b: PredictorId,
    pub metric: String,
    pub count_a: u64,
    pub count_b: u64,
    pub mean_a: f64,
    pub mean_b: f64,
    pub difference: f64,
    pub z_score: f64,
    pub p_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
}

impl ComparisonResult {
    pub fn is_significant(&self, z_critical: f64) -> bool { self.z_score.abs() >= z_critical }

    /// Whether `b` beats `a` in the given direction, ignoring significance.
    pub fn favours_b(&self, higher_is_better: bool) -> bool {
        if higher_is_better {
            self.difference > 0.0
        } else {
            self.difference < 0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// Duplicate key, but it carried feedback not seen before.
    FeedbackApplied,
    Duplicate,
}

#[derive(Debug, Clone, Default)]
struct Series {
    lifetime: RunningStats,
    /// (bucket start, unix seconds) ascending.
    buckets: VecDeque<(i64, RunningStats)>,
    last_update: Option<DateTime<Utc>>,
}

impl Series {
    fn push(&mut self, x: f64, at: DateTime<Utc>, bucket_secs: i64, max_buckets: usize) {
        self.lifetime.push(x);
        self.last_update = Some(at);
        let start = at.timestamp().div_euclid(bucket_secs) * bucket_secs;
        match self.buckets.back().map(|(s, _)| *s) {
            Some(last) if last == start => {
                if let Some((_, b)) = self.buckets.back_mut() {
                    b.push(x);
                }
            }
            Some(last) if last > start => {
                // out-of-order clock: fold into the matching bucket if still held
                if let Some((_, b)) = self.buckets.iter_mut().find(|(s, _)| *s == start) {
                    b.push(x);
                }
            }
            _ => {
                let mut b = RunningStats::default();
                b.push(x);
                self.buckets.push_back((start, b));
                while self.buckets.len() > max_buckets {
                    self.buckets.pop_front();
                }
            }
        }
    }

    fn snapshot(&self, predictor_id: &PredictorId, metric: &str) -> Option<MetricSnapshot> {
        let t = self.last_update?;
        Some(MetricSnapshot::from_stats(predictor_id, metric, &self.lifetime, t))
    }

    fn since(&self, cutoff: i64) -> RunningStats {
        let mut acc = RunningStats::default();
        for (_, b) in self.buckets.iter().filter(|(s, _)| *s >= cutoff) {
            acc.merge(b);
        }
        acc
    }
}

#[derive(Debug, Clone, Copy)]
struct SeenEntry {
    feedback_applied: bool,
}

type DedupKey = (RequestId, PredictorId);

#[derive(Default)]
struct AggregatorInner {
    seen: HashMap<DedupKey, SeenEntry>,
    order: VecDeque<(DateTime<Utc>, DedupKey)>,
    series: HashMap<PredictorId, HashMap<&'static str, Series>>,
}

pub struct MetricsAggregator {
    inner: RwLock<AggregatorInner>,
    cfg: AggregatorConfig,
}

impl MetricsAggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self { inner: RwLock::new(AggregatorInner::default()), cfg }
    }

    pub fn config(&self) -> &AggregatorConfig { &self.cfg }

    pub fn ingest(&self, r: &PredictionResult) -> IngestOutcome { self.ingest_at(r, Utc::now()) }

    pub(crate) fn ingest_at(&self, r: &PredictionResult, now: DateTime<Utc>) -> IngestOutcome {
        let bucket_secs = self.cfg.bucket_secs.max(1) as i64;
        let max_buckets = self.cfg.max_buckets.max(1);
        let mut g = self.inner.write();
        self.evict(&mut g, now);
        let key = (r.request_id.clone(), r.predictor_id.clone());
        let feedback = match r.outcome {
            Some(Outcome::Feedback { value }) => Some(value),
            _ => None,
        };

        if let Some(entry) = g.seen.get_mut(&key) {
            if let (Some(v), false) = (feedback, entry.feedback_applied) {
                entry.feedback_applied = true;
                series_mut(&mut g, &r.predictor_id, METRIC_FEEDBACK)
                    .push(v, now, bucket_secs, max_buckets);
                SERVING_METRICS.aggregator.feedback_total.add(1, &[]);
                debug!(request=%r.request_id, predictor=%r.predictor_id, "late feedback applied");
                return IngestOutcome::FeedbackApplied;
            }
            SERVING_METRICS.aggregator.duplicates_total.add(1, &[]);
            debug!(request=%r.request_id, predictor=%r.predictor_id, "duplicate result ignored");
            return IngestOutcome::Duplicate;
        }

        g.seen.insert(key.clone(), SeenEntry { feedback_applied: feedback.is_some() });
        g.order.push_back((now, key));

        let timed_out = matches!(r.outcome, Some(Outcome::Timeout));
        let errored = matches!(r.outcome, Some(Outcome::Error));
        let mut samples: Vec<(&'static str, f64)> = Vec::with_capacity(6);
        if let Some(s) = r.score {
            samples.push((METRIC_SCORE, s));
        }
        if !timed_out {
            samples.push((METRIC_LATENCY, r.latency_ms));
        }
        if let Some(c) = r.cost {
            samples.push((METRIC_COST, c));
        }
        if let Some(v) = feedback {
            samples.push((METRIC_FEEDBACK, v));
        }
        samples.push((METRIC_TIMEOUT_RATE, if timed_out { 1.0 } else { 0.0 }));
        samples.push((METRIC_ERROR_RATE, if errored { 1.0 } else { 0.0 }));
        for (metric, x) in samples {
            series_mut(&mut g, &r.predictor_id, metric).push(x, now, bucket_secs, max_buckets);
        }
        SERVING_METRICS.aggregator.ingested_total.add(1, &[]);
        IngestOutcome::Applied
    }

    fn evict(&self, g: &mut AggregatorInner, now: DateTime<Utc>) {
        let retention = self.cfg.retention_secs.min(u32::MAX as u64) as i64;
        let cutoff = now - ChronoDuration::seconds(retention);
        let mut evicted = 0u64;
        while let Some((at, _)) = g.order.front() {
            if *at > cutoff && g.order.len() <= self.cfg.dedup_capacity {
                break;
            }
            if let Some((_, key)) = g.order.pop_front() {
                g.seen.remove(&key);
                evicted += 1;
            }
        }
        if evicted > 0 {
            SERVING_METRICS.aggregator.evicted_ids_total.add(evicted, &[]);
        }
    }

    /// Number of keys currently held for deduplication.
    pub fn tracked_ids(&self) -> usize { self.inner.read().seen.len() }

    pub fn snapshot(&self, predictor_id: &PredictorId, metric: &str) -> Result<MetricSnapshot> {
        let g = self.inner.read();
        g.series
            .get(predictor_id)
            .and_then(|m| m.get(metric))
            .and_then(|s| s.snapshot(predictor_id, metric))
            .ok_or_else(|| {
                ServingError::not_found("metric snapshot", format!("{predictor_id}/{metric}"))
            })
    }

    /// Every metric of one predictor, read under a single lock.
    pub fn snapshots(&self, predictor_id: &PredictorId) -> Vec<MetricSnapshot> {
        let g = self.inner.read();
        let mut out: Vec<MetricSnapshot> = g
            .series
            .get(predictor_id)
            .into_iter()
            .flatten()
            .filter_map(|(metric, s)| s.snapshot(predictor_id, metric))
            .collect();
        out.sort_by(|a, b| a.metric.cmp(&b.metric));
        out
    }

    pub fn all_snapshots(&self) -> Vec<MetricSnapshot> {
        let g = self.inner.read();
        g.series
            .iter()
            .flat_map(|(id, m)| m.iter().filter_map(move |(metric, s)| s.snapshot(id, metric)))
            .collect()
    }

    pub fn compare(
        &self,
        a: &PredictorId,
        b: &PredictorId,
        metric: &str,
    ) -> Result<ComparisonResult> {
        self.compare_inner(a, b, metric, None, Utc::now())
    }

    /// Comparison restricted to buckets that started within `window`.
    pub fn compare_window(
        &self,
        a: &PredictorId,
        b: &PredictorId,
        metric: &str,
        window: Duration,
    ) -> Result<ComparisonResult> {
        self.compare_inner(a, b, metric, Some(window), Utc::now())
    }

    #[instrument(skip(self), level = "debug")]
    pub(crate) fn compare_inner(
        &self,
        a: &PredictorId,
        b: &PredictorId,
        metric: &str,
        window: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<ComparisonResult> {
        let metric =
            canonical_metric(metric).ok_or_else(|| ServingError::not_found("metric", metric))?;
        let (sa, sb) = {
            let g = self.inner.read();
            let pick = |id: &PredictorId| -> RunningStats {
                let Some(series) = g.series.get(id).and_then(|m| m.get(metric)) else {
                    return RunningStats::default();
                };
                match window {
                    Some(w) => {
                        let span = i64::try_from(w.as_secs()).unwrap_or(i64::MAX);
                        series.since(now.timestamp().saturating_sub(span))
                    }
                    None => series.lifetime,
                }
            };
            (pick(a), pick(b))
        };
        for (id, s) in [(a, &sa), (b, &sb)] {
            if s.count < self.cfg.min_samples {
                let attrs = [KeyValue::new("metric", metric)];
                SERVING_METRICS.aggregator.insufficient_samples_total.add(1, &attrs);
                return Err(ServingError::InsufficientSamples {
                    predictor_id: id.clone(),
                    metric: metric.to_string(),
                    count: s.count,
                    required: self.cfg.min_samples,
                });
            }
        }
        let (z, p) = z_test(&sa, &sb);
        Ok(ComparisonResult {
            predictor_a: a.clone(),
            predictor_b: b.clone(),
            metric: metric.to_string(),
            count_a: sa.count,
            count_b: sb.count,
            mean_a: sa.mean,
            mean_b: sb.mean,
            difference: sb.mean - sa.mean,
            z_score: z,
            p_value: p,
            window_secs: window.map(|w| w.as_secs()),
        })
    }

    /// Seed lifetime statistics from persisted snapshots. Windows start empty.
    pub fn restore(&self, snapshots: Vec<MetricSnapshot>) -> usize {
        let mut g = self.inner.write();
        let mut n = 0;
        for snap in snapshots {
            let Some(metric) = canonical_metric(&snap.metric) else {
                warn!(metric=%snap.metric, "skipping snapshot of unknown metric");
                continue;
            };
            let series = series_mut(&mut g, &snap.predictor_id, metric);
            series.lifetime = snap.stats();
            series.last_update = Some(snap.last_update);
            n += 1;
        }
        n
    }

    /// Consume `prediction-results` until the subscription ends.
    pub async fn run(self: Arc<Self>, mut sub: Subscription) {
        info!("metrics aggregator consuming prediction results");
        while let Some(payload) = sub.next().await {
            match payload {
                Payload::Result(r) => {
                    self.ingest(&r);
                }
                other => debug!(topic = other.topic().as_str(), "ignoring non-result payload"),
            }
        }
        info!("prediction result subscription closed");
    }

    /// Write all snapshots to the store every `persist_interval_secs`.
    pub async fn persist_loop(self: Arc<Self>, store: Arc<RecordStore>) {
        let period = Duration::from_secs(self.cfg.persist_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = store.put_metric_snapshots(&self.all_snapshots()) {
                warn!(error=%e, "metric snapshot persistence failed");
            }
        }
    }
}

fn series_mut<'a>(
    g: &'a mut AggregatorInner,
    id: &PredictorId,
    metric: &'static str,
) -> &'a mut Series {
    g.series.entry(id.clone()).or_default().entry(metric).or_default()
}

fn canonical_metric(name: &str) -> Option<&'static str> {
    METRICS.iter().copied().find(|m| *m == name)
}

/// Two-sided z statistic and p-value for the mean difference `b - a`.
fn z_test(a: &RunningStats, b: &RunningStats) -> (f64, f64) {
    let se = (a.variance() / a.count as f64 + b.variance() / b.count as f64).sqrt();
    let diff = b.mean - a.mean;
    if se <= f64::EPSILON {
        return if diff.abs() <= f64::EPSILON {
            (0.0, 1.0)
        } else {
            (diff.signum() * Z_CAP, 0.0)
        };
    }
    let z = diff / se;
    (z, erfc(z.abs() / std::f64::consts::SQRT_2).clamp(0.0, 1.0))
}

/// Complementary error function, Chebyshev fit with fractional error below 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let tail = -0.186_288_06
        + t * (0.278_868_07
            + t * (-1.135_203_98 + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))));
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68 + t * (0.374_091_96 + t * (0.096_784_18 + t * tail)));
    let ans = t * poly.exp();
    if x >= 0.0 { ans } else { 2.0 - ans }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(min_samples: u64) -> MetricsAggregator {
        MetricsAggregator::new(AggregatorConfig { min_samples, ..Default::default() })
    }

    fn result(req: &str, pred: &str, score: f64) -> PredictionResult {
        PredictionResult::scored(req.into(), pred.into(), score, 10.0)
    }

    #[test]
    fn welford_matches_two_pass() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut s = RunningStats::default();
        xs.iter().for_each(|&x| s.push(x));
        assert_eq!(s.count, 8);
        assert!((s.mean - 5.0).abs() < 1e-12);
        assert!((s.variance() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!((s.min, s.max, s.sum), (2.0, 9.0, 40.0));
    }

    #[test]
    fn merge_equals_sequential() {
        let mut left = RunningStats::default();
        let mut right = RunningStats::default();
        let mut all = RunningStats::default();
        for i in 0..50 {
            let x = (i as f64).sin() * 10.0;
            all.push(x);
            if i < 20 {
                left.push(x)
            } else {
                right.push(x)
            }
        }
        left.merge(&right);
        assert_eq!(left.count, all.count);
        assert!((left.mean - all.mean).abs() < 1e-9);
        assert!((left.variance() - all.variance()).abs() < 1e-9);
        assert_eq!((left.min, left.max), (all.min, all.max));
    }

    #[test]
    fn duplicate_with_different_score_is_ignored() {
        let a = agg(1);
        assert_eq!(a.ingest(&result("r1", "p1", 0.9)), IngestOutcome::Applied);
        let before = a.snapshot(&"p1".into(), METRIC_SCORE).unwrap();
        assert_eq!(a.ingest(&result("r1", "p1", 0.1)), IngestOutcome::Duplicate);
        let after = a.snapshot(&"p1".into(), METRIC_SCORE).unwrap();
        assert_eq!(before, after);
        assert_eq!(after.count, 1);
        assert_eq!(after.mean, 0.9);
    }

    #[test]
    fn redelivery_changes_nothing() {
        let a = agg(1);
        let r = result("r1", "p1", 0.4).with_outcome(Outcome::Feedback { value: 1.0 });
        a.ingest(&r);
        let before = a.snapshots(&"p1".into());
        assert_eq!(a.ingest(&r), IngestOutcome::Duplicate);
        assert_eq!(a.snapshots(&"p1".into()), before);
    }

    #[test]
    fn same_request_on_other_predictor_is_distinct() {
        let a = agg(1);
        a.ingest(&result("r1", "p1", 0.9));
        assert_eq!(a.ingest(&result("r1", "p2", 0.9)), IngestOutcome::Applied);
    }

    #[test]
    fn late_feedback_applied_once() {
        let a = agg(1);
        a.ingest(&result("r1", "p1", 0.9));
        let fb = result("r1", "p1", 0.9).with_outcome(Outcome::Feedback { value: 1.0 });
        assert_eq!(a.ingest(&fb), IngestOutcome::FeedbackApplied);
        assert_eq!(a.ingest(&fb), IngestOutcome::Duplicate);
        assert_eq!(a.snapshot(&"p1".into(), METRIC_FEEDBACK).unwrap().count, 1);
        assert_eq!(a.snapshot(&"p1".into(), METRIC_SCORE).unwrap().count, 1);
    }

    #[test]
    fn timeouts_and_errors_are_rates() {
        let a = agg(1);
        a.ingest(&result("r1", "p1", 0.5));
        a.ingest(&PredictionResult::timed_out("r2".into(), "p1".into(), 5000.0));
        a.ingest(&PredictionResult::failed("r3".into(), "p1".into(), 12.0));
        a.ingest(&result("r4", "p1", 0.7));
        let id: PredictorId = "p1".into();
        assert_eq!(a.snapshot(&id, METRIC_TIMEOUT_RATE).unwrap().mean, 0.25);
        assert_eq!(a.snapshot(&id, METRIC_ERROR_RATE).unwrap().mean, 0.25);
        assert_eq!(a.snapshot(&id, METRIC_SCORE).unwrap().count, 2);
        // the timeout's wait is not a latency sample
        assert_eq!(a.snapshot(&id, METRIC_LATENCY).unwrap().count, 3);
    }

    #[test]
    fn keys_expire_after_retention() {
        let cfg = AggregatorConfig { retention_secs: 60, min_samples: 1, ..Default::default() };
        let a = MetricsAggregator::new(cfg);
        let t0 = Utc::now();
        let r = result("r1", "p1", 0.9);
        a.ingest_at(&r, t0);
        assert_eq!(a.ingest_at(&r, t0 + ChronoDuration::seconds(30)), IngestOutcome::Duplicate);
        assert_eq!(a.ingest_at(&r, t0 + ChronoDuration::seconds(61)), IngestOutcome::Applied);
        assert_eq!(a.tracked_ids(), 1);
    }

    #[test]
    fn dedup_cache_is_bounded() {
        let cfg = AggregatorConfig { dedup_capacity: 10, min_samples: 1, ..Default::default() };
        let a = MetricsAggregator::new(cfg);
        for i in 0..50 {
            a.ingest(&result(&format!("r{i}"), "p1", 0.5));
        }
        assert!(a.tracked_ids() <= 11);
    }

    #[test]
    fn compare_below_minimum_is_insufficient() {
        let a = agg(30);
        for i in 0..29 {
            a.ingest(&result(&format!("a{i}"), "pa", 0.5));
            a.ingest(&result(&format!("b{i}"), "pb", 0.6));
        }
        let err = a.compare(&"pa".into(), &"pb".into(), METRIC_SCORE).unwrap_err();
        assert!(matches!(err, ServingError::InsufficientSamples { count: 29, required: 30, .. }));
        let err = a.compare(&"pa".into(), &"ghost".into(), METRIC_SCORE).unwrap_err();
        assert!(matches!(err, ServingError::InsufficientSamples { count: 0, .. }));
    }

    #[test]
    fn compare_detects_real_difference() {
        let a = agg(30);
        for i in 0..200 {
            let jitter = ((i % 10) as f64 - 4.5) * 0.01;
            a.ingest(&result(&format!("a{i}"), "pa", 0.50 + jitter));
            a.ingest(&result(&format!("b{i}"), "pb", 0.60 + jitter));
        }
        let c = a.compare(&"pa".into(), &"pb".into(), METRIC_SCORE).unwrap();
        assert!(c.difference > 0.09 && c.difference < 0.11);
        assert!(c.is_significant(1.96));
        assert!(c.p_value < 0.001);
        assert!(c.favours_b(true));
        assert!(!c.favours_b(false));
    }

    #[test]
    fn compare_identical_samples_not_significant() {
        let a = agg(5);
        for i in 0..10 {
            a.ingest(&result(&format!("a{i}"), "pa", 0.5));
            a.ingest(&result(&format!("b{i}"), "pb", 0.5));
        }
        let c = a.compare(&"pa".into(), &"pb".into(), METRIC_SCORE).unwrap();
        assert_eq!((c.z_score, c.p_value), (0.0, 1.0));
        assert!(!c.is_significant(1.96));
    }

    #[test]
    fn compare_unknown_metric_is_not_found() {
        let a = agg(1);
        assert!(matches!(
            a.compare(&"a".into(), &"b".into(), "accuracy"),
            Err(ServingError::NotFound { .. })
        ));
    }

    #[test]
    fn windowed_compare_uses_recent_buckets() {
        let a = agg(3);
        let old = Utc::now() - ChronoDuration::hours(2);
        let now = Utc::now();
        for i in 0..5 {
            a.ingest_at(&result(&format!("old-a{i}"), "pa", 0.1), old);
            a.ingest_at(&result(&format!("old-b{i}"), "pb", 0.1), old);
        }
        for i in 0..5 {
            a.ingest_at(&result(&format!("a{i}"), "pa", 0.5 + i as f64 * 0.01), now);
            a.ingest_at(&result(&format!("b{i}"), "pb", 0.9 + i as f64 * 0.01), now);
        }
        let window = Some(Duration::from_secs(600));
        let c = a.compare_inner(&"pa".into(), &"pb".into(), METRIC_SCORE, window, now).unwrap();
        assert_eq!((c.count_a, c.count_b), (5, 5));
        assert!((c.mean_a - 0.52).abs() < 1e-9);
        let lifetime = a.compare(&"pa".into(), &"pb".into(), METRIC_SCORE).unwrap();
        assert_eq!(lifetime.count_a, 10);
    }

    #[test]
    fn erfc_reference_values() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-6);
        assert!((erfc(1.0) - 0.157_299_2).abs() < 1e-6);
        assert!((erfc(-1.0) - 1.842_700_8).abs() < 1e-6);
        // two-sided p at z = 1.96
        assert!((erfc(1.96 / std::f64::consts::SQRT_2) - 0.05).abs() < 1e-3);
    }

    #[test]
    fn restore_seeds_lifetime_stats() {
        let a = agg(1);
        for i in 0..4 {
            a.ingest(&result(&format!("r{i}"), "p1", i as f64));
        }
        let snaps = a.all_snapshots();
        let b = agg(1);
        assert_eq!(b.restore(snaps), a.all_snapshots().len());
        let id: PredictorId = "p1".into();
        assert_eq!(b.snapshot(&id, METRIC_SCORE).unwrap(), a.snapshot(&id, METRIC_SCORE).unwrap());
    }

    #[tokio::test]
    async fn run_consumes_subscription() {
        use crate::pipeline::{EventPipeline, InProcessPipeline, Topic};
        let pipeline = InProcessPipeline::new();
        let a = Arc::new(agg(1));
        let sub = pipeline.subscribe(Topic::PredictionResults).await.unwrap();
        let task = tokio::spawn(a.clone().run(sub));
        pipeline.publish(Topic::PredictionResults, result("r1", "p1", 0.3).into());
        pipeline.publish(Topic::PredictionResults, result("r1", "p1", 0.3).into());
        for _ in 0..50 {
            if a.snapshot(&"p1".into(), METRIC_SCORE).is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.snapshot(&"p1".into(), METRIC_SCORE).unwrap().count, 1);
        task.abort();
    }

    #[test]
    fn oversized_window_covers_everything() {
        let a = agg(2);
        for i in 0..3 {
            a.ingest(&result(&format!("ra{i}"), "pa", 0.2 + i as f64 * 0.01));
            a.ingest(&result(&format!("rb{i}"), "pb", 0.6 + i as f64 * 0.01));
        }
        let (pa, pb): (PredictorId, PredictorId) = ("pa".into(), "pb".into());
        let huge = a.compare_window(&pa, &pb, METRIC_SCORE, Duration::from_secs(1 << 63)).unwrap();
        let lifetime = a.compare(&pa, &pb, METRIC_SCORE).unwrap();
        assert_eq!((huge.count_a, huge.count_b), (3, 3));
        assert!((huge.z_score - lifetime.z_score).abs() < 1e-9);
        let max = a.compare_window(&pa, &pb, METRIC_SCORE, Duration::MAX).unwrap();
        assert_eq!(max.count_b, 3);
    }
}

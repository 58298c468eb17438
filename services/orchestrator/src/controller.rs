//! Lifecycle Controller
//!
//! Periodically compares every mature challenger against its content type's champion
//! (largest traffic weight, lowest version on ties) and applies the policy:
//! significantly worse → retire the challenger; significantly better → give it all the
//! traffic and pause the champion. A predictor is touched at most once per cycle. Ledger
//! failures are logged and the pair is simply re-evaluated next cycle.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use serving_core::SERVING_METRICS;

use crate::aggregator::{ComparisonResult, MetricsAggregator, METRIC_FEEDBACK};
use crate::error::ServingError;
use crate::ledger::{ActiveEntry, DeploymentLedger};
use crate::model::PredictorId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub metric: String,
    pub higher_is_better: bool,
    /// |z| at or above this is significant (1.96 ≈ p < 0.05 two-sided).
    pub z_critical: f64,
    /// Minimum time a challenger must have been ACTIVE before it is judged.
    pub maturity_secs: u64,
    /// Compare only the most recent window instead of lifetime statistics.
    pub window_secs: Option<u64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 60,
            metric: METRIC_FEEDBACK.to_string(),
            higher_is_better: true,
            z_critical: 1.96,
            maturity_secs: 3600,
            window_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerAction {
    /// Challenger takes all traffic, the champion is paused.
    Promote,
    /// Challenger is retired.
    Rollback,
}

impl ControllerAction {
    fn as_str(self) -> &'static str {
        match self {
            ControllerAction::Promote => "promote",
            ControllerAction::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedTransition {
    pub content_type: String,
    pub challenger: PredictorId,
    pub champion: PredictorId,
    pub action: ControllerAction,
    pub z_score: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub compared: usize,
    /// Pairs skipped for lack of samples or maturity.
    pub deferred: usize,
    pub applied: Vec<AppliedTransition>,
    pub failures: Vec<String>,
}

pub struct LifecycleController {
    ledger: Arc<DeploymentLedger>,
    aggregator: Arc<MetricsAggregator>,
    cfg: ControllerConfig,
}

impl LifecycleController {
    pub fn new(
        ledger: Arc<DeploymentLedger>,
        aggregator: Arc<MetricsAggregator>,
        cfg: ControllerConfig,
    ) -> Self {
        Self { ledger, aggregator, cfg }
    }

    pub fn config(&self) -> &ControllerConfig { &self.cfg }

    pub fn run_cycle(&self) -> CycleReport { self.run_cycle_at(Utc::now()) }

    pub(crate) fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();
        let mut touched: HashSet<PredictorId> = HashSet::new();
        for content_type in self.ledger.content_types() {
            self.evaluate(&content_type, now, &mut touched, &mut report);
        }
        SERVING_METRICS.lifecycle.cycles_total.add(1, &[]);
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        SERVING_METRICS.lifecycle.cycle_latency_ms.record(ms, &[]);
        if !report.applied.is_empty() || !report.failures.is_empty() {
            info!(
                applied = report.applied.len(),
                failures = report.failures.len(),
                compared = report.compared,
                "lifecycle cycle finished"
            );
        }
        report
    }

    fn evaluate(
        &self,
        content_type: &str,
        now: DateTime<Utc>,
        touched: &mut HashSet<PredictorId>,
        report: &mut CycleReport,
    ) {
        let set = self.ledger.active_set(content_type);
        let Some(champion) = champion(&set.entries) else { return };
        let maturity = ChronoDuration::seconds(self.cfg.maturity_secs.min(u32::MAX as u64) as i64);
        for challenger in set.entries.iter().filter(|e| e.predictor_id != champion.predictor_id) {
            if touched.contains(&challenger.predictor_id)
                || touched.contains(&champion.predictor_id)
            {
                continue;
            }
            let mature = self
                .ledger
                .get(&challenger.predictor_id)
                .ok()
                .and_then(|d| d.activated_at)
                .map(|at| now - at >= maturity)
                .unwrap_or(false);
            if !mature {
                report.deferred += 1;
                continue;
            }

            let cmp = match self.compare(&champion.predictor_id, &challenger.predictor_id) {
                Ok(c) => c,
                Err(ServingError::InsufficientSamples { predictor_id, count, required, .. }) => {
                    debug!(
                        content_type,
                        predictor=%predictor_id,
                        count,
                        required,
                        "comparison deferred"
                    );
                    report.deferred += 1;
                    continue;
                }
                Err(e) => {
                    warn!(content_type, error=%e, "comparison failed");
                    report.failures.push(e.to_string());
                    continue;
                }
            };
            report.compared += 1;
            if !cmp.is_significant(self.cfg.z_critical) {
                continue;
            }

            let action = if cmp.favours_b(self.cfg.higher_is_better) {
                ControllerAction::Promote
            } else {
                ControllerAction::Rollback
            };
            let attrs = [KeyValue::new("action", action.as_str())];
            match self.apply(action, &champion.predictor_id, &challenger.predictor_id) {
                Ok(()) => {
                    SERVING_METRICS.lifecycle.transitions_total.add(1, &attrs);
                    info!(
                        content_type,
                        challenger=%challenger.predictor_id,
                        champion=%champion.predictor_id,
                        action = action.as_str(),
                        z = cmp.z_score,
                        p = cmp.p_value,
                        "lifecycle transition applied"
                    );
                    touched.insert(challenger.predictor_id.clone());
                    if action == ControllerAction::Promote {
                        touched.insert(champion.predictor_id.clone());
                    }
                    report.applied.push(AppliedTransition {
                        content_type: content_type.to_string(),
                        challenger: challenger.predictor_id.clone(),
                        champion: champion.predictor_id.clone(),
                        action,
                        z_score: cmp.z_score,
                        p_value: cmp.p_value,
                    });
                }
                Err(e) => {
                    SERVING_METRICS.lifecycle.transition_failures_total.add(1, &attrs);
                    warn!(
                        content_type,
                        challenger=%challenger.predictor_id,
                        action = action.as_str(),
                        error=%e,
                        "lifecycle transition failed - retrying next cycle"
                    );
                    report.failures.push(e.to_string());
                }
            }
        }
    }

    fn compare(
        &self,
        champion: &PredictorId,
        challenger: &PredictorId,
    ) -> Result<ComparisonResult, ServingError> {
        let metric = &self.cfg.metric;
        match self.cfg.window_secs {
            Some(w) => {
                self.aggregator.compare_window(champion, challenger, metric, Duration::from_secs(w))
            }
            None => self.aggregator.compare(champion, challenger, metric),
        }
    }

    fn apply(
        &self,
        action: ControllerAction,
        champion: &PredictorId,
        challenger: &PredictorId,
    ) -> Result<(), ServingError> {
        match action {
            ControllerAction::Rollback => {
                self.ledger.retire(challenger)?;
            }
            ControllerAction::Promote => {
                self.ledger.set_weight(challenger, 1.0)?;
                self.ledger.pause(champion)?;
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let period = Duration::from_secs(self.cfg.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        info!(
            poll_secs = self.cfg.poll_interval_secs,
            metric=%self.cfg.metric,
            "lifecycle controller started"
        );
        loop {
            ticker.tick().await;
            self.run_cycle();
        }
    }
}

/// Largest weight wins; lowest version breaks ties.
fn champion(entries: &[ActiveEntry]) -> Option<&ActiveEntry> {
    entries.iter().max_by(|a, b| {
        a.weight
            .partial_cmp(&b.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.version.cmp(&a.version))
    })
}

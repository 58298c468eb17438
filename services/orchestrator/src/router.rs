//! Traffic Router
//!
//! Maps a request onto one ACTIVE deployment of its content type. In hashed mode the
//! request id is hashed into [0, 1) and walked through the cumulative weight partition,
//! so the same id lands on the same predictor for as long as the ledger epoch is
//! unchanged. Every decision is published on `routing-decisions` before it is returned.

use chrono::Utc;
use opentelemetry::KeyValue;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::{instrument, warn};

use serving_core::SERVING_METRICS;

use crate::error::{Result, ServingError};
use crate::ledger::{ActiveEntry, ActiveSet, DeploymentLedger};
use crate::model::{PredictorId, RequestId, RoutingDecision};
use crate::pipeline::{EventPipeline, Payload, Topic};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Sticky assignment derived from the request id.
    #[default]
    Hashed,
    /// Independent uniform draw per call.
    Random,
}

pub struct TrafficRouter {
    ledger: Arc<DeploymentLedger>,
    pipeline: Arc<dyn EventPipeline>,
    mode: RoutingMode,
}

impl TrafficRouter {
    pub fn new(
        ledger: Arc<DeploymentLedger>,
        pipeline: Arc<dyn EventPipeline>,
        mode: RoutingMode,
    ) -> Self {
        Self { ledger, pipeline, mode }
    }

    pub fn route(&self, content_type: &str, request_id: &RequestId) -> Result<PredictorId> {
        self.decide(content_type, request_id).map(|d| d.predictor_id)
    }

    /// Route under a freshly generated request id.
    pub fn route_new(&self, content_type: &str) -> Result<RoutingDecision> {
        self.decide(content_type, &RequestId::generate())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn decide(&self, content_type: &str, request_id: &RequestId) -> Result<RoutingDecision> {
        let started = Instant::now();
        let set = self.ledger.active_set(content_type);
        let u = match self.mode {
            RoutingMode::Hashed => unit_interval(request_id.as_str()),
            RoutingMode::Random => rand::thread_rng().gen::<f64>(),
        };
        let attrs = [KeyValue::new("content_type", content_type.to_string())];
        let Some(entry) = select(&set, u) else {
            SERVING_METRICS.routing.no_active_total.add(1, &attrs);
            warn!(content_type, request=%request_id, "no active deployment");
            return Err(ServingError::NoActiveDeployment(content_type.to_string()));
        };
        let decision = RoutingDecision {
            request_id: request_id.clone(),
            content_type: content_type.to_string(),
            predictor_id: entry.predictor_id.clone(),
            decision_time: Utc::now(),
        };
        self.pipeline.publish(Topic::RoutingDecisions, Payload::Decision(decision.clone()));
        SERVING_METRICS.routing.decisions_total.add(1, &attrs);
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        SERVING_METRICS.routing.route_latency_ms.record(ms, &[]);
        Ok(decision)
    }
}

/// First 8 bytes of SHA-256(id) as a uniform value in [0, 1).
pub fn unit_interval(id: &str) -> f64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
}

/// Walk the cumulative partition. Zero-weight entries are never chosen; rounding slack at
/// the top end falls to the last positive entry.
pub fn select(set: &ActiveSet, u: f64) -> Option<&ActiveEntry> {
    let total = set.total_weight();
    if set.is_empty() || total <= 0.0 {
        return None;
    }
    let target = u.clamp(0.0, 1.0) * total;
    let mut acc = 0.0;
    for e in set.entries.iter().filter(|e| e.weight > 0.0) {
        acc += e.weight;
        if target < acc {
            return Some(e);
        }
    }
    set.entries.iter().rev().find(|e| e.weight > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::InProcessPipeline;
    use crate::registry::PredictorRegistry;

    struct Fixture {
        registry: Arc<PredictorRegistry>,
        ledger: Arc<DeploymentLedger>,
        pipeline: Arc<InProcessPipeline>,
        router: TrafficRouter,
    }

    fn fixture(mode: RoutingMode) -> Fixture {
        let registry = Arc::new(PredictorRegistry::new());
        let ledger = Arc::new(DeploymentLedger::new(registry.clone()));
        let pipeline = Arc::new(InProcessPipeline::new());
        let router = TrafficRouter::new(ledger.clone(), pipeline.clone(), mode);
        Fixture { registry, ledger, pipeline, router }
    }

    fn deploy(f: &Fixture, cap: &str, w: f64) -> PredictorId {
        let p = f.registry.register("article", cap.into()).unwrap();
        f.ledger.stage(&p.id, w).unwrap();
        f.ledger.activate(&p.id).unwrap();
        p.id
    }

    fn set(weights: &[f64]) -> ActiveSet {
        ActiveSet {
            content_type: "article".into(),
            epoch: 1,
            entries: weights
                .iter()
                .enumerate()
                .map(|(i, &w)| ActiveEntry {
                    predictor_id: PredictorId(format!("p{i}")),
                    version: i as u32 + 1,
                    weight: w,
                })
                .collect(),
        }
    }

    #[test]
    fn unit_interval_is_stable_and_bounded() {
        let a = unit_interval("request-42");
        assert_eq!(a, unit_interval("request-42"));
        assert_ne!(a, unit_interval("request-43"));
        for i in 0..1000 {
            let u = unit_interval(&format!("r{i}"));
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn select_walks_partition() {
        let s = set(&[0.25, 0.0, 0.75]);
        assert_eq!(select(&s, 0.0).unwrap().predictor_id.as_str(), "p0");
        assert_eq!(select(&s, 0.2499).unwrap().predictor_id.as_str(), "p0");
        assert_eq!(select(&s, 0.25).unwrap().predictor_id.as_str(), "p2");
        assert_eq!(select(&s, 0.999_999_9).unwrap().predictor_id.as_str(), "p2");
        assert_eq!(select(&s, 1.0).unwrap().predictor_id.as_str(), "p2");
        assert!(select(&set(&[]), 0.5).is_none());
    }

    #[test]
    fn all_traffic_to_sole_predictor() {
        let f = fixture(RoutingMode::Hashed);
        let v1 = deploy(&f, "a", 1.0);
        for i in 0..1000 {
            assert_eq!(f.router.route("article", &RequestId(format!("req-{i}"))).unwrap(), v1);
        }
    }

    #[test]
    fn split_matches_weights() {
        let f = fixture(RoutingMode::Hashed);
        let _v1 = deploy(&f, "a", 1.0);
        let v2 = deploy(&f, "b", 0.2);
        let weights: Vec<f64> =
            f.ledger.active_set("article").entries.iter().map(|e| e.weight).collect();
        assert!((weights[0] - 0.8).abs() < 1e-12 && (weights[1] - 0.2).abs() < 1e-12);
        let hits = (0..1000)
            .filter(|i| f.router.route("article", &RequestId(format!("req-{i}"))).unwrap() == v2)
            .count();
        let frac = hits as f64 / 1000.0;
        assert!((frac - 0.2).abs() < 0.05, "v2 fraction {frac}");
    }

    #[test]
    fn random_mode_respects_weights() {
        let f = fixture(RoutingMode::Random);
        let _v1 = deploy(&f, "a", 1.0);
        let v2 = deploy(&f, "b", 0.3);
        let hits = (0..4000)
            .filter(|_| f.router.route_new("article").unwrap().predictor_id == v2)
            .count();
        assert!((hits as f64 / 4000.0 - 0.3).abs() < 0.05);
    }

    #[test]
    fn same_request_same_predictor() {
        let f = fixture(RoutingMode::Hashed);
        deploy(&f, "a", 1.0);
        deploy(&f, "b", 0.5);
        deploy(&f, "c", 0.2);
        for i in 0..200 {
            let id = RequestId(format!("sticky-{i}"));
            let first = f.router.route("article", &id).unwrap();
            assert_eq!(first, f.router.route("article", &id).unwrap());
        }
    }

    #[test]
    fn retiring_last_active_blocks_routing() {
        let f = fixture(RoutingMode::Hashed);
        let v1 = deploy(&f, "a", 1.0);
        f.ledger.retire(&v1).unwrap();
        let err = f.router.route("article", &"r1".into()).unwrap_err();
        assert_eq!(err, ServingError::NoActiveDeployment("article".into()));
        assert!(matches!(
            f.router.route("comment", &"r1".into()),
            Err(ServingError::NoActiveDeployment(_))
        ));
    }

    #[tokio::test]
    async fn decision_published_before_return() {
        let f = fixture(RoutingMode::Hashed);
        let v1 = deploy(&f, "a", 1.0);
        let mut sub = f.pipeline.subscribe(Topic::RoutingDecisions).await.unwrap();
        let d = f.router.route_new("article").unwrap();
        match sub.try_next() {
            Some(Payload::Decision(seen)) => {
                assert_eq!(seen, d);
                assert_eq!(seen.predictor_id, v1);
            }
            other => panic!("expected decision, got {other:?}"),
        }
    }
}

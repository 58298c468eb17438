//! Event Pipeline
//!
//! At-least-once, fire-and-forget publish/subscribe over two topics. Nothing is
//! acknowledged and nothing is durable: a subscriber sees what was published while it was
//! subscribed, in per-publisher order. Consumers must deduplicate on `request_id`.

mod local;
mod nats;

pub use local::InProcessPipeline;
pub use nats::NatsPipeline;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use serving_core::resilience::{retry_async, RetryConfig};

use crate::error::Result;
use crate::model::{PredictionResult, RoutingDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    RoutingDecisions,
    PredictionResults,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::RoutingDecisions, Topic::PredictionResults];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::RoutingDecisions => "routing-decisions",
            Topic::PredictionResults => "prediction-results",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Decision(RoutingDecision),
    Result(PredictionResult),
}

impl Payload {
    pub fn topic(&self) -> Topic {
        match self {
            Payload::Decision(_) => Topic::RoutingDecisions,
            Payload::Result(_) => Topic::PredictionResults,
        }
    }

    /// Wire form: the bare record as JSON, the topic names its type.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Payload::Decision(d) => serde_json::to_vec(d),
            Payload::Result(r) => serde_json::to_vec(r),
        }
    }

    pub fn decode(topic: Topic, bytes: &[u8]) -> serde_json::Result<Self> {
        match topic {
            Topic::RoutingDecisions => serde_json::from_slice(bytes).map(Payload::Decision),
            Topic::PredictionResults => serde_json::from_slice(bytes).map(Payload::Result),
        }
    }
}

impl From<RoutingDecision> for Payload {
    fn from(d: RoutingDecision) -> Self { Payload::Decision(d) }
}

impl From<PredictionResult> for Payload {
    fn from(r: PredictionResult) -> Self {
        Payload::Result(r)
    }
}

/// Live feed of one topic. Ends when the pipeline drops the sending side.
pub struct Subscription {
    topic: Topic,
    rx: mpsc::UnboundedReceiver<Payload>,
}

impl Subscription {
    pub(crate) fn new(topic: Topic, rx: mpsc::UnboundedReceiver<Payload>) -> Self {
        Self { topic, rx }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn next(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Non-blocking poll, used by tests and drain loops.
    pub fn try_next(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Payload;
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Payload>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self, subscribers: usize) -> PipelineStats {
        PipelineStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            subscribers,
        }
    }
}

#[async_trait]
pub trait EventPipeline: Send + Sync {
    /// Fire-and-forget. Never blocks beyond local buffering and never reports delivery.
    fn publish(&self, topic: Topic, payload: Payload);

    /// Register interest in `topic`. Once this resolves, every message published on the
    /// topic is delivered to the returned subscription: the in-process backend registers
    /// synchronously, the NATS backend waits for the server to acknowledge the SUB.
    async fn subscribe(&self, topic: Topic) -> Result<Subscription>;

    fn stats(&self) -> PipelineStats;

    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineBackend { InProcess, Nats }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub backend: PipelineBackend,
    pub nats_url: String,
    pub subject_prefix: String,
    pub connect_retries: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: PipelineBackend::InProcess,
            nats_url: "127.0.0.1:4222".into(),
            subject_prefix: "serving".into(),
            connect_retries: 3,
        }
    }
}

/// Build the configured backend. An unreachable NATS server degrades to the in-process
/// pipeline rather than failing startup.
pub async fn connect(cfg: &PipelineConfig) -> Arc<dyn EventPipeline> {
    match cfg.backend {
        PipelineBackend::InProcess => Arc::new(InProcessPipeline::new()),
        PipelineBackend::Nats => {
            let retry = RetryConfig {
                max_retries: cfg.connect_retries,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                jitter: 0.2,
            };
            match retry_async(&retry, |_| async_nats::connect(cfg.nats_url.clone())).await {
                Ok(client) => Arc::new(NatsPipeline::new(client, &cfg.subject_prefix)),
                Err(e) => {
                    warn!(
                        error = %e,
                        url = %cfg.nats_url,
                        "NATS unreachable - using in-process pipeline"
                    );
                    Arc::new(InProcessPipeline::new())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn topic_names() {
        assert_eq!(Topic::RoutingDecisions.as_str(), "routing-decisions");
        assert_eq!(
            serde_json::to_string(&Topic::PredictionResults).unwrap(),
            "\"prediction-results\""
        );
    }

    #[test]
    fn decode_checks_shape_against_topic() {
        let d = RoutingDecision {
            request_id: "r".into(),
            content_type: "article".into(),
            predictor_id: "p".into(),
            decision_time: Utc::now(),
        };
        let bytes = Payload::from(d.clone()).encode().unwrap();
        assert_eq!(Payload::decode(Topic::RoutingDecisions, &bytes).unwrap(), Payload::Decision(d));
        assert!(Payload::decode(Topic::PredictionResults, &bytes).is_err());
    }
}

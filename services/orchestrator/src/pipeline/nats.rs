use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use serving_core::SERVING_METRICS;

use super::{Counters, EventPipeline, Payload, PipelineStats, Subscription, Topic};
use crate::error::{Result, ServingError};

/// NATS-backed pipeline. Publishes funnel through one task so per-publisher order is
/// kept on the wire; each subscription forwards a NATS subscriber into a local channel.
pub struct NatsPipeline {
    client: Client,
    prefix: String,
    outbound: mpsc::UnboundedSender<(Topic, Vec<u8>)>,
    counters: Arc<Counters>,
    subscribers: Arc<AtomicUsize>,
}

impl NatsPipeline {
    /// Must be called inside a tokio runtime.
    pub fn new(client: Client, prefix: &str) -> Self {
        let (outbound, mut rx) = mpsc::unbounded_channel::<(Topic, Vec<u8>)>();
        let publisher = client.clone();
        let subject_prefix = prefix.to_string();
        tokio::spawn(async move {
            while let Some((topic, bytes)) = rx.recv().await {
                let subject = subject(&subject_prefix, topic);
                if let Err(e) = publisher.publish(subject, bytes.into()).await {
                    warn!(error=%e, topic = topic.as_str(), "nats publish failed");
                    let attrs = [KeyValue::new("topic", topic.as_str())];
                    SERVING_METRICS.pipeline.dropped_total.add(1, &attrs);
                }
            }
            debug!("nats publisher stopped");
        });
        Self {
            client,
            prefix: prefix.to_string(),
            outbound,
            counters: Arc::new(Counters::default()),
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn subject(prefix: &str, topic: Topic) -> String {
    if prefix.is_empty() {
        topic.as_str().to_string()
    } else {
        format!("{prefix}.{}", topic.as_str())
    }
}

#[async_trait]
impl EventPipeline for NatsPipeline {
    fn publish(&self, topic: Topic, payload: Payload) {
        if payload.topic() != topic {
            warn!(topic = topic.as_str(), "payload does not belong on topic - dropped");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let bytes = match payload.encode() {
            Ok(b) => b,
            Err(e) => {
                error!(error=%e, "payload encode failed");
                return;
            }
        };
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let attrs = [KeyValue::new("topic", topic.as_str())];
        SERVING_METRICS.pipeline.published_total.add(1, &attrs);
        if self.outbound.send((topic, bytes)).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Resolves once the server has registered the interest; anything published after
    /// that reaches this subscription.
    async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        let subject = subject(&self.prefix, topic);
        let mut sub = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| ServingError::Pipeline(format!("subscribe {subject}: {e}")))?;
        // flush so the SUB reaches the server before the caller starts publishing
        self.client
            .flush()
            .await
            .map_err(|e| ServingError::Pipeline(format!("flush {subject}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let counters = self.counters.clone();
        let subscribers = self.subscribers.clone();
        subscribers.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let attrs = [KeyValue::new("topic", topic.as_str())];
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        match Payload::decode(topic, &msg.payload) {
                            Ok(p) => {
                                if tx.send(p).is_err() {
                                    break;
                                }
                                counters.delivered.fetch_add(1, Ordering::Relaxed);
                                SERVING_METRICS.pipeline.delivered_total.add(1, &attrs);
                            }
                            Err(e) => {
                                warn!(error=%e, subject=%subject, "undecodable payload skipped");
                                SERVING_METRICS.pipeline.decode_errors_total.add(1, &attrs);
                            }
                        }
                    }
                }
            }
            if let Err(e) = sub.unsubscribe().await {
                warn!(error=%e, subject=%subject, "nats unsubscribe failed");
            }
            subscribers.fetch_sub(1, Ordering::Relaxed);
            debug!(subject=%subject, "nats subscription closed");
        });
        Ok(Subscription::new(topic, rx))
    }

    fn stats(&self) -> PipelineStats {
        self.counters.snapshot(self.subscribers.load(Ordering::Relaxed))
    }

    fn backend(&self) -> &'static str {
        "nats"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_carry_prefix() {
        assert_eq!(subject("serving", Topic::RoutingDecisions), "serving.routing-decisions");
        assert_eq!(subject("", Topic::PredictionResults), "prediction-results");
    }

    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn round_trip_through_nats() {
        use crate::model::PredictionResult;
        let url = std::env::var("NATS_URL").unwrap_or_else(|_| "127.0.0.1:4222".into());
        let client = async_nats::connect(url).await.unwrap();
        let p = NatsPipeline::new(client, &format!("test-{}", uuid::Uuid::new_v4()));
        let mut sub = p.subscribe(Topic::PredictionResults).await.unwrap();
        let result = PredictionResult::scored("r1".into(), "p1".into(), 0.9, 4.0);
        p.publish(Topic::PredictionResults, result.into());
        let wait = std::time::Duration::from_secs(5);
        let got = tokio::time::timeout(wait, sub.next()).await.unwrap();
        assert!(matches!(got, Some(Payload::Result(r)) if r.request_id.as_str() == "r1"));
    }

    #[cfg(feature = "integration")]
    #[tokio::test]
    async fn dropped_subscription_is_released() {
        let url = std::env::var("NATS_URL").unwrap_or_else(|_| "127.0.0.1:4222".into());
        let client = async_nats::connect(url).await.unwrap();
        let p = NatsPipeline::new(client, &format!("test-{}", uuid::Uuid::new_v4()));
        let sub = p.subscribe(Topic::RoutingDecisions).await.unwrap();
        assert_eq!(p.stats().subscribers, 1);
        drop(sub);
        for _ in 0..100 {
            if p.stats().subscribers == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(p.stats().subscribers, 0);
    }
}

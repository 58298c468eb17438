use async_trait::async_trait;
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use serving_core::SERVING_METRICS;

use crate::error::Result;

use super::{Counters, EventPipeline, Payload, PipelineStats, Subscription, Topic};

/// Process-local fan-out: one unbounded channel per subscriber.
#[derive(Default)]
pub struct InProcessPipeline {
    subscribers: RwLock<HashMap<Topic, Vec<mpsc::UnboundedSender<Payload>>>>,
    counters: Counters,
}

impl InProcessPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to current subscribers; closed receivers are pruned after the fan-out.
    pub(crate) fn fan_out(&self, topic: Topic, payload: Payload) {
        let attrs = [KeyValue::new("topic", topic.as_str())];
        let mut closed = 0usize;
        {
            let subs = self.subscribers.read();
            for tx in subs.get(&topic).into_iter().flatten() {
                if tx.send(payload.clone()).is_ok() {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    SERVING_METRICS.pipeline.delivered_total.add(1, &attrs);
                } else {
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            self.counters.dropped.fetch_add(closed as u64, Ordering::Relaxed);
            SERVING_METRICS.pipeline.dropped_total.add(closed as u64, &attrs);
            if let Some(list) = self.subscribers.write().get_mut(&topic) {
                list.retain(|tx| !tx.is_closed());
            }
            debug!(topic = topic.as_str(), closed, "pruned closed subscribers");
        }
    }

    pub(crate) fn add_subscriber(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().entry(topic).or_default().push(tx);
        Subscription::new(topic, rx)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().values().map(|v| v.len()).sum()
    }
}

#[async_trait]
impl EventPipeline for InProcessPipeline {
    fn publish(&self, topic: Topic, payload: Payload) {
        if payload.topic() != topic {
            warn!(
                topic = topic.as_str(),
                payload_topic = payload.topic().as_str(),
                "payload does not belong on topic - dropped"
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let attrs = [KeyValue::new("topic", topic.as_str())];
        SERVING_METRICS.pipeline.published_total.add(1, &attrs);
        self.fan_out(topic, payload);
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        Ok(self.add_subscriber(topic))
    }

    fn stats(&self) -> PipelineStats {
        self.counters.snapshot(self.subscriber_count())
    }

    fn backend(&self) -> &'static str {
        "in_process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PredictionResult, RoutingDecision};
    use chrono::Utc;
    use futures::StreamExt;

    fn decision(id: &str) -> Payload {
        Payload::Decision(RoutingDecision {
            request_id: id.into(),
            content_type: "article".into(),
            predictor_id: "p1".into(),
            decision_time: Utc::now(),
        })
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message_in_order() {
        let p = InProcessPipeline::new();
        let mut a = p.subscribe(Topic::RoutingDecisions).await.unwrap();
        let mut b = p.subscribe(Topic::RoutingDecisions).await.unwrap();
        for i in 0..5 {
            p.publish(Topic::RoutingDecisions, decision(&format!("r{i}")));
        }
        for sub in [&mut a, &mut b] {
            for i in 0..5 {
                match sub.next().await {
                    Some(Payload::Decision(d)) => {
                        assert_eq!(d.request_id.as_str(), format!("r{i}"))
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
        assert_eq!(p.stats().delivered, 10);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let p = InProcessPipeline::new();
        let mut results = p.subscribe(Topic::PredictionResults).await.unwrap();
        p.publish(Topic::RoutingDecisions, decision("r1"));
        let result = PredictionResult::scored("r1".into(), "p1".into(), 0.5, 3.0);
        p.publish(Topic::PredictionResults, result.into());
        assert!(matches!(results.next().await, Some(Payload::Result(_))));
        assert!(results.try_next().is_none());
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let p = InProcessPipeline::new();
        p.publish(Topic::RoutingDecisions, decision("r1"));
        assert_eq!(
            p.stats(),
            PipelineStats { published: 1, delivered: 0, dropped: 0, subscribers: 0 }
        );
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let p = InProcessPipeline::new();
        p.publish(Topic::RoutingDecisions, decision("early"));
        let mut sub = p.subscribe(Topic::RoutingDecisions).await.unwrap();
        p.publish(Topic::RoutingDecisions, decision("late"));
        let got = sub.next().await;
        assert!(matches!(got, Some(Payload::Decision(ref d)) if d.request_id.as_str() == "late"));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let p = InProcessPipeline::new();
        let sub = p.add_subscriber(Topic::RoutingDecisions);
        let _keep = p.add_subscriber(Topic::RoutingDecisions);
        drop(sub);
        p.publish(Topic::RoutingDecisions, decision("r1"));
        let s = p.stats();
        assert_eq!((s.delivered, s.dropped, s.subscribers), (1, 1, 1));
    }

    #[test]
    fn mismatched_payload_is_dropped() {
        let p = InProcessPipeline::new();
        let mut sub = p.add_subscriber(Topic::PredictionResults);
        p.publish(Topic::PredictionResults, decision("r1"));
        assert!(sub.try_next().is_none());
        assert_eq!(p.stats().dropped, 1);
    }

    #[tokio::test]
    async fn subscription_is_a_stream() {
        let p = InProcessPipeline::new();
        let sub = p.subscribe(Topic::RoutingDecisions).await.unwrap();
        for i in 0..3 {
            p.publish(Topic::RoutingDecisions, decision(&format!("r{i}")));
        }
        let got: Vec<Payload> = sub.take(3).collect().await;
        assert_eq!(got.len(), 3);
    }
}

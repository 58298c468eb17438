//! In-process inference worker and deadline tracker.
//!
//! The worker consumes `routing-decisions`, scores the article behind each request with
//! the chosen predictor's capability and publishes a `prediction-results` record. The
//! deadline tracker turns decisions that never get a result into `Timeout` outcomes.

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, RwLockReadGuard, Semaphore};
use tracing::{debug, info, instrument, warn};

use serving_core::resilience::CircuitBreaker;
use serving_core::SERVING_METRICS;

use crate::capability::{
    CapabilityError, CapabilitySet, Prediction, PredictionInput, PredictorCapability,
};
use crate::ledger::DeploymentLedger;
use crate::model::{
    Article, ArticlePrediction, CapabilityRef, PredictionResult, PredictorId, RequestId,
    RoutingDecision, StoredPrediction,
};
use crate::pipeline::{EventPipeline, Payload, Subscription, Topic};
use crate::registry::PredictorRegistry;
use crate::store::RecordStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub concurrency: usize,
    /// Budget for one predict call, and for a routed request to produce any result.
    pub deadline_ms: u64,
    pub idle_unload_secs: u64,
    /// Also score the article with the other ACTIVE predictors and store those predictions.
    pub shadow: bool,
    pub breaker_threshold: usize,
    pub breaker_open_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 16,
            deadline_ms: 5_000,
            idle_unload_secs: 300,
            shadow: false,
            breaker_threshold: 5,
            breaker_open_secs: 30,
            sweep_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms.max(1))
    }
}

/// Predict calls hold `gate` for reading; load and unload hold it for writing, so a
/// capability is never unloaded under an in-flight prediction.
struct CapabilityRuntime {
    breaker: Arc<CircuitBreaker>,
    gate: Arc<RwLock<()>>,
    last_used: Instant,
}

pub struct InferenceWorker {
    registry: Arc<PredictorRegistry>,
    ledger: Arc<DeploymentLedger>,
    capabilities: CapabilitySet,
    pipeline: Arc<dyn EventPipeline>,
    store: Arc<RecordStore>,
    cfg: WorkerConfig,
    permits: Arc<Semaphore>,
    runtime: Mutex<HashMap<CapabilityRef, CapabilityRuntime>>,
}

enum Scored {
    Ok(Prediction, f64),
    Failed(CapabilityError, f64),
}

impl InferenceWorker {
    pub fn new(
        registry: Arc<PredictorRegistry>,
        ledger: Arc<DeploymentLedger>,
        capabilities: CapabilitySet,
        pipeline: Arc<dyn EventPipeline>,
        store: Arc<RecordStore>,
        cfg: WorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
        Self {
            registry,
            ledger,
            capabilities,
            pipeline,
            store,
            cfg,
            permits,
            runtime: Mutex::new(HashMap::new()),
        }
    }

    /// Consume routing decisions until the subscription ends; each request runs on its own
    /// task, bounded by `concurrency`.
    pub async fn run(self: Arc<Self>, mut sub: Subscription) {
        info!(
            concurrency = self.cfg.concurrency,
            shadow = self.cfg.shadow,
            "inference worker started"
        );
        while let Some(payload) = sub.next().await {
            let Payload::Decision(decision) = payload else { continue };
            let Ok(permit) = self.permits.clone().acquire_owned().await else { break };
            let worker = self.clone();
            tokio::spawn(async move {
                worker.handle(decision).await;
                drop(permit);
            });
        }
        info!("inference worker stopped");
    }

    /// Score one routed request. Requests with no stored article belong to another worker
    /// and are skipped.
    #[instrument(
        skip(self, decision),
        fields(request=%decision.request_id, predictor=%decision.predictor_id)
    )]
    pub async fn handle(&self, decision: RoutingDecision) -> Option<PredictionResult> {
        let article = match self.store.get_article(decision.request_id.as_str()) {
            Ok(Some(a)) => a,
            Ok(None) => {
                debug!("no article for request - skipping");
                return None;
            }
            Err(e) => {
                warn!(error=%e, "article lookup failed");
                return None;
            }
        };
        let input = PredictionInput {
            request_id: decision.request_id.clone(),
            content_type: decision.content_type.clone(),
            article_id: Some(article.id.clone()),
            text: article.text().to_string(),
        };

        let request_id = decision.request_id.clone();
        let predictor_id = decision.predictor_id.clone();
        let result = match self.score(&decision.predictor_id, &input).await {
            Scored::Ok(p, ms) => {
                let mut r = PredictionResult::scored(request_id, predictor_id, p.score, ms);
                r.label = p.label.clone();
                r.cost = Some(p.cost);
                let attrs = [KeyValue::new("content_type", decision.content_type.clone())];
                SERVING_METRICS.worker.cost_total.add(p.cost, &attrs);
                let mut predictions = BTreeMap::new();
                predictions.insert(decision.predictor_id.clone(), stored(&p));
                if self.cfg.shadow {
                    predictions.extend(self.shadow_predictions(&decision, &input).await);
                }
                self.record_article_predictions(&article, &decision, predictions);
                r
            }
            Scored::Failed(CapabilityError::DeadlineExceeded, ms) => {
                SERVING_METRICS.worker.timeouts_total.add(1, &[]);
                PredictionResult::timed_out(request_id, predictor_id, ms)
            }
            Scored::Failed(e, ms) => {
                warn!(error=%e, "prediction failed");
                PredictionResult::failed(request_id, predictor_id, ms)
            }
        };
        self.pipeline.publish(Topic::PredictionResults, Payload::Result(result.clone()));
        Some(result)
    }

    async fn score(&self, predictor_id: &PredictorId, input: &PredictionInput) -> Scored {
        let started = Instant::now();
        let elapsed_ms = |s: Instant| s.elapsed().as_secs_f64() * 1000.0;
        let (cap_ref, cap) = match self.resolve(predictor_id) {
            Ok(v) => v,
            Err(e) => {
                let err = CapabilityError::Predict(e.to_string());
                return Scored::Failed(err, elapsed_ms(started));
            }
        };
        let attrs = [KeyValue::new("capability", cap_ref.0.clone())];
        // Touch before loading so an idle sweep racing this call sees it as in use.
        let (breaker, gate) = self.touch(&cap_ref);
        let _serving = match self.ensure_loaded(&cap_ref, cap.as_ref(), &gate).await {
            Ok(guard) => guard,
            Err(e) => {
                SERVING_METRICS.worker.prediction_errors_total.add(1, &attrs);
                return Scored::Failed(e, elapsed_ms(started));
            }
        };
        let deadline = self.cfg.deadline();
        let predictor = cap.clone();
        let outcome = breaker
            .call(move || async move {
                match tokio::time::timeout(deadline, predictor.predict(input)).await {
                    Ok(r) => r,
                    Err(_) => Err(CapabilityError::DeadlineExceeded),
                }
            })
            .await;
        let ms = elapsed_ms(started);
        SERVING_METRICS.worker.prediction_latency_ms.record(ms, &attrs);
        match outcome {
            Ok(p) => {
                SERVING_METRICS.worker.predictions_total.add(1, &attrs);
                Scored::Ok(p, ms)
            }
            Err(e) => {
                SERVING_METRICS.worker.prediction_errors_total.add(1, &attrs);
                Scored::Failed(e, ms)
            }
        }
    }

    fn resolve(
        &self,
        predictor_id: &PredictorId,
    ) -> crate::error::Result<(CapabilityRef, Arc<dyn PredictorCapability>)> {
        let predictor = self.registry.get(predictor_id)?;
        let cap = self.capabilities.get(&predictor.capability)?;
        Ok((predictor.capability, cap))
    }

    /// Return a read guard on `gate` with the capability loaded. A missing capability is
    /// loaded under the write side and must pass its health check before it serves.
    async fn ensure_loaded<'g>(
        &self,
        cap_ref: &CapabilityRef,
        cap: &dyn PredictorCapability,
        gate: &'g RwLock<()>,
    ) -> Result<RwLockReadGuard<'g, ()>, CapabilityError> {
        let guard = gate.read().await;
        if cap.is_loaded() {
            return Ok(guard);
        }
        drop(guard);
        let exclusive = gate.write().await;
        if !cap.is_loaded() {
            self.load(cap_ref, cap).await?;
        }
        Ok(exclusive.downgrade())
    }

    async fn load(
        &self,
        cap_ref: &CapabilityRef,
        cap: &dyn PredictorCapability,
    ) -> Result<(), CapabilityError> {
        let started = Instant::now();
        let attrs = [KeyValue::new("capability", cap_ref.0.clone())];
        let loaded = match cap.load().await {
            Ok(()) if cap.health_check().await => Ok(()),
            Ok(()) => {
                cap.unload().await;
                Err(CapabilityError::Load("health check failed".into()))
            }
            Err(e) => Err(e),
        };
        match loaded {
            Ok(()) => {
                let ms = started.elapsed().as_secs_f64() * 1000.0;
                SERVING_METRICS.worker.load_latency_ms.record(ms, &attrs);
                info!(capability=%cap_ref, load_ms = ms, "capability loaded");
                Ok(())
            }
            Err(e) => {
                SERVING_METRICS.worker.load_errors_total.add(1, &attrs);
                warn!(capability=%cap_ref, error=%e, "capability load failed");
                Err(e)
            }
        }
    }

    /// Mark the capability used and hand back its breaker and serving gate.
    fn touch(&self, cap_ref: &CapabilityRef) -> (Arc<CircuitBreaker>, Arc<RwLock<()>>) {
        let mut rt = self.runtime.lock();
        let entry = rt.entry(cap_ref.clone()).or_insert_with(|| CapabilityRuntime {
            breaker: Arc::new(CircuitBreaker::new(
                self.cfg.breaker_threshold,
                Duration::from_secs(self.cfg.breaker_open_secs),
                1,
            )),
            gate: Arc::new(RwLock::new(())),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        (entry.breaker.clone(), entry.gate.clone())
    }

    fn idle_for(&self, cap_ref: &CapabilityRef) -> Option<Duration> {
        self.runtime.lock().get(cap_ref).map(|rt| rt.last_used.elapsed())
    }

    async fn shadow_predictions(
        &self,
        decision: &RoutingDecision,
        input: &PredictionInput,
    ) -> Vec<(PredictorId, StoredPrediction)> {
        let mut out = Vec::new();
        let active = self.ledger.active_set(&decision.content_type);
        for e in active.entries.iter().filter(|e| e.predictor_id != decision.predictor_id) {
            match self.score(&e.predictor_id, input).await {
                Scored::Ok(p, _) => out.push((e.predictor_id.clone(), stored(&p))),
                Scored::Failed(err, _) => {
                    debug!(predictor=%e.predictor_id, error=%err, "shadow prediction failed")
                }
            }
        }
        out
    }

    fn record_article_predictions(
        &self,
        article: &Article,
        decision: &RoutingDecision,
        predictions: BTreeMap<PredictorId, StoredPrediction>,
    ) {
        let now = Utc::now();
        let existing = self
            .store
            .get_article_prediction(&article.id, &decision.content_type)
            .unwrap_or_else(|e| {
                warn!(error=%e, "article prediction lookup failed");
                None
            });
        let mut record = existing.unwrap_or_else(|| ArticlePrediction {
            article_id: article.id.clone(),
            content_type: decision.content_type.clone(),
            selected_predictor_id: None,
            predictions: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        });
        record.predictions.extend(predictions);
        record.selected_predictor_id = Some(decision.predictor_id.clone());
        record.updated_at = now;
        if let Err(e) = self.store.put_article_prediction(&record) {
            warn!(article=%article.id, error=%e, "article prediction write failed");
        }
    }

    /// Unload capabilities idle for longer than `idle_unload_secs`. Returns how many were
    /// unloaded.
    pub async fn unload_idle(&self) -> usize {
        let idle = Duration::from_secs(self.cfg.idle_unload_secs);
        let stale: Vec<(CapabilityRef, Arc<RwLock<()>>)> = self
            .runtime
            .lock()
            .iter()
            .filter(|(_, rt)| rt.last_used.elapsed() >= idle)
            .map(|(r, rt)| (r.clone(), rt.gate.clone()))
            .collect();
        let mut n = 0;
        for (r, gate) in stale {
            let Ok(cap) = self.capabilities.get(&r) else { continue };
            let _exclusive = gate.write().await;
            // Re-checked under the gate: a request may have touched it meanwhile.
            if !cap.is_loaded() || self.idle_for(&r).is_some_and(|d| d < idle) {
                continue;
            }
            cap.unload().await;
            let attrs = [KeyValue::new("capability", r.0.clone())];
            SERVING_METRICS.worker.unloads_total.add(1, &attrs);
            info!(capability=%r, "idle capability unloaded");
            n += 1;
        }
        n
    }

    pub async fn idle_loop(self: Arc<Self>) {
        let period = Duration::from_secs((self.cfg.idle_unload_secs / 4).max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            self.unload_idle().await;
        }
    }
}

fn stored(p: &Prediction) -> StoredPrediction {
    StoredPrediction { score: p.score, label: p.label.clone(), confidence: p.confidence }
}

/// Emits a `Timeout` result for every routed request that has no result past the deadline.
pub struct DeadlineTracker {
    state: Mutex<TrackerState>,
    pipeline: Arc<dyn EventPipeline>,
    deadline: Duration,
}

/// Results can be observed before their decision, since the two topics are read
/// independently; `early` holds those until the decision shows up or the deadline passes.
#[derive(Default)]
struct TrackerState {
    pending: HashMap<(RequestId, PredictorId), Instant>,
    early: HashMap<(RequestId, PredictorId), Instant>,
}

impl DeadlineTracker {
    pub fn new(pipeline: Arc<dyn EventPipeline>, deadline: Duration) -> Self {
        Self { state: Mutex::new(TrackerState::default()), pipeline, deadline }
    }

    pub fn on_decision(&self, d: &RoutingDecision) {
        let key = (d.request_id.clone(), d.predictor_id.clone());
        let mut st = self.state.lock();
        if st.early.remove(&key).is_none() {
            st.pending.entry(key).or_insert_with(Instant::now);
        }
    }

    pub fn on_result(&self, r: &PredictionResult) {
        let key = (r.request_id.clone(), r.predictor_id.clone());
        let mut st = self.state.lock();
        if st.pending.remove(&key).is_none() {
            st.early.insert(key, Instant::now());
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Publish timeouts for expired requests and forget them.
    pub fn sweep(&self) -> usize {
        let expired: Vec<((RequestId, PredictorId), Instant)> = {
            let mut st = self.state.lock();
            let deadline = self.deadline;
            st.early.retain(|_, t| t.elapsed() < deadline);
            let keys: Vec<(RequestId, PredictorId)> = st
                .pending
                .iter()
                .filter(|(_, t)| t.elapsed() >= deadline)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| st.pending.remove(&k).map(|t| (k, t)))
                .collect()
        };
        for ((request_id, predictor_id), since) in &expired {
            let waited = since.elapsed().as_secs_f64() * 1000.0;
            debug!(
                request=%request_id,
                predictor=%predictor_id,
                waited_ms = waited,
                "result deadline missed"
            );
            let timeout =
                PredictionResult::timed_out(request_id.clone(), predictor_id.clone(), waited);
            self.pipeline.publish(Topic::PredictionResults, Payload::Result(timeout));
        }
        if !expired.is_empty() {
            SERVING_METRICS.worker.timeouts_total.add(expired.len() as u64, &[]);
        }
        expired.len()
    }

    pub async fn run(
        self: Arc<Self>,
        mut decisions: Subscription,
        mut results: Subscription,
        sweep_every: Duration,
    ) {
        let mut ticker = tokio::time::interval(sweep_every);
        loop {
            tokio::select! {
                d = decisions.next() => match d {
                    Some(Payload::Decision(d)) => self.on_decision(&d),
                    Some(_) => {}
                    None => break,
                },
                r = results.next() => match r {
                    Some(Payload::Result(r)) => self.on_result(&r),
                    Some(_) => {}
                    None => break,
                },
                _ = ticker.tick() => { self.sweep(); }
            }
        }
        info!("deadline tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FixedScore;
    use crate::model::Outcome;
    use crate::pipeline::InProcessPipeline;

    struct Fixture {
        registry: Arc<PredictorRegistry>,
        ledger: Arc<DeploymentLedger>,
        pipeline: Arc<InProcessPipeline>,
        store: Arc<RecordStore>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(PredictorRegistry::new());
        Fixture {
            ledger: Arc::new(DeploymentLedger::new(registry.clone())),
            registry,
            pipeline: Arc::new(InProcessPipeline::new()),
            store: Arc::new(RecordStore::ephemeral().unwrap()),
        }
    }

    fn worker(f: &Fixture, caps: CapabilitySet, cfg: WorkerConfig) -> InferenceWorker {
        InferenceWorker::new(
            f.registry.clone(),
            f.ledger.clone(),
            caps,
            f.pipeline.clone(),
            f.store.clone(),
            cfg,
        )
    }

    fn deploy(f: &Fixture, cap: &str, w: f64) -> PredictorId {
        let p = f.registry.register("article", cap.into()).unwrap();
        f.ledger.stage(&p.id, w).unwrap();
        f.ledger.activate(&p.id).unwrap();
        p.id
    }

    fn article(id: &str, title: &str) -> Article {
        Article {
            id: id.into(),
            source: None,
            title: Some(title.into()),
            description: None,
            content: None,
            published_at: None,
        }
    }

    fn decision(req: &str, pred: &PredictorId) -> RoutingDecision {
        RoutingDecision {
            request_id: req.into(),
            content_type: "article".into(),
            predictor_id: pred.clone(),
            decision_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn scores_article_and_publishes_result() {
        let f = fixture();
        let w = worker(&f, CapabilitySet::builtin(), WorkerConfig::default());
        let pid = deploy(&f, "lexicon-sentiment", 1.0);
        f.store.put_article(&article("a1", "Strong growth and record gains")).unwrap();
        let mut results = f.pipeline.subscribe(Topic::PredictionResults).await.unwrap();

        let r = w.handle(decision("a1", &pid)).await.unwrap();
        assert_eq!(r.score, Some(1.0));
        assert_eq!(r.label.as_deref(), Some("positive"));
        assert!(r.outcome.is_none());
        assert!(matches!(results.try_next(), Some(Payload::Result(ref seen)) if *seen == r));

        let stored = f.store.get_article_prediction("a1", "article").unwrap().unwrap();
        assert_eq!(stored.selected_predictor_id.as_ref(), Some(&pid));
        assert_eq!(stored.selected().unwrap().score, 1.0);
    }

    #[tokio::test]
    async fn request_without_article_is_skipped() {
        let f = fixture();
        let w = worker(&f, CapabilitySet::builtin(), WorkerConfig::default());
        let pid = deploy(&f, "constant", 1.0);
        assert!(w.handle(decision("unknown", &pid)).await.is_none());
    }

    #[tokio::test]
    async fn slow_predictor_times_out() {
        let f = fixture();
        let slow = FixedScore::new("slow", 0.5).with_delay(Duration::from_millis(200));
        let caps = CapabilitySet::new().with(Arc::new(slow));
        let w = worker(&f, caps, WorkerConfig { deadline_ms: 20, ..Default::default() });
        let pid = deploy(&f, "slow", 1.0);
        f.store.put_article(&article("a1", "text")).unwrap();
        let r = w.handle(decision("a1", &pid)).await.unwrap();
        assert_eq!(r.outcome, Some(Outcome::Timeout));
        assert!(r.score.is_none());
    }

    #[tokio::test]
    async fn breaker_short_circuits_failing_capability() {
        let f = fixture();
        let flaky = Arc::new(FixedScore::new("flaky", 0.5));
        let caps = CapabilitySet::new().with(flaky.clone());
        let cfg =
            WorkerConfig { breaker_threshold: 2, breaker_open_secs: 60, ..Default::default() };
        let w = worker(&f, caps, cfg);
        let pid = deploy(&f, "flaky", 1.0);
        f.store.put_article(&article("a0", "text")).unwrap();
        assert!(w.handle(decision("a0", &pid)).await.unwrap().score.is_some());

        flaky.set_failing(true);
        for i in 0..4 {
            f.store.put_article(&article(&format!("b{i}"), "text")).unwrap();
            let r = w.handle(decision(&format!("b{i}"), &pid)).await.unwrap();
            assert_eq!(r.outcome, Some(Outcome::Error));
        }
        // two real failures opened the breaker, the rest never reached the capability
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn unhealthy_capability_fails_to_load() {
        let f = fixture();
        let sick = Arc::new(FixedScore::new("sick", 0.5));
        sick.set_failing(true);
        let w = worker(&f, CapabilitySet::new().with(sick.clone()), WorkerConfig::default());
        let pid = deploy(&f, "sick", 1.0);
        f.store.put_article(&article("a1", "text")).unwrap();

        let r = w.handle(decision("a1", &pid)).await.unwrap();
        assert_eq!(r.outcome, Some(Outcome::Error));
        assert!(!sick.is_loaded());
        assert_eq!(sick.calls(), 0);
        assert!(f.store.get_article_prediction("a1", "article").unwrap().is_none());

        sick.set_failing(false);
        assert_eq!(w.handle(decision("a1", &pid)).await.unwrap().score, Some(0.5));
        assert!(sick.is_loaded());
    }

    #[tokio::test]
    async fn shadow_scoring_stores_sibling_predictions() {
        let f = fixture();
        let caps = CapabilitySet::new()
            .with(Arc::new(FixedScore::new("champion", 0.2)))
            .with(Arc::new(FixedScore::new("challenger", 0.9)));
        let w = worker(&f, caps, WorkerConfig { shadow: true, ..Default::default() });
        let champion = deploy(&f, "champion", 1.0);
        let challenger = deploy(&f, "challenger", 0.5);
        f.store.put_article(&article("a1", "text")).unwrap();
        let r = w.handle(decision("a1", &champion)).await.unwrap();
        assert_eq!(r.score, Some(0.2));
        let stored = f.store.get_article_prediction("a1", "article").unwrap().unwrap();
        assert_eq!(stored.predictions.len(), 2);
        assert_eq!(stored.predictions[&challenger].score, 0.9);
        assert_eq!(stored.selected_predictor_id, Some(champion));
    }

    #[tokio::test]
    async fn idle_capabilities_are_unloaded() {
        let f = fixture();
        let cap = Arc::new(FixedScore::new("fixed", 0.5));
        let cfg = WorkerConfig { idle_unload_secs: 0, ..Default::default() };
        let w = worker(&f, CapabilitySet::new().with(cap.clone()), cfg);
        let pid = deploy(&f, "fixed", 1.0);
        f.store.put_article(&article("a1", "text")).unwrap();
        w.handle(decision("a1", &pid)).await.unwrap();
        assert!(cap.is_loaded());
        assert_eq!(w.unload_idle().await, 1);
        assert!(!cap.is_loaded());
        // lazily reloaded on next use
        assert!(w.handle(decision("a1", &pid)).await.unwrap().score.is_some());
    }

    #[tokio::test]
    async fn idle_unload_waits_for_in_flight_prediction() {
        let f = fixture();
        let cap = Arc::new(FixedScore::new("slow", 0.5).with_delay(Duration::from_millis(100)));
        let cfg = WorkerConfig { idle_unload_secs: 0, ..Default::default() };
        let w = Arc::new(worker(&f, CapabilitySet::new().with(cap.clone()), cfg));
        let pid = deploy(&f, "slow", 1.0);
        f.store.put_article(&article("a1", "text")).unwrap();

        let in_flight = tokio::spawn({
            let w = w.clone();
            let pid = pid.clone();
            async move { w.handle(decision("a1", &pid)).await }
        });
        while cap.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // the sweep blocks until the prediction releases the capability
        assert_eq!(w.unload_idle().await, 1);
        let r = in_flight.await.unwrap().unwrap();
        assert_eq!(r.score, Some(0.5));
        assert!(!cap.is_loaded());
    }

    #[tokio::test]
    async fn deadline_tracker_emits_timeouts() {
        let pipeline = Arc::new(InProcessPipeline::new());
        let tracker = DeadlineTracker::new(pipeline.clone(), Duration::from_millis(10));
        let mut results = pipeline.subscribe(Topic::PredictionResults).await.unwrap();
        let p: PredictorId = "p1".into();
        tracker.on_decision(&decision("answered", &p));
        tracker.on_decision(&decision("silent", &p));
        tracker.on_result(&PredictionResult::scored("answered".into(), p.clone(), 0.5, 1.0));
        assert_eq!(tracker.sweep(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.sweep(), 1);
        assert_eq!(tracker.pending(), 0);
        match results.try_next() {
            Some(Payload::Result(r)) => {
                assert_eq!(r.request_id.as_str(), "silent");
                assert_eq!(r.outcome, Some(Outcome::Timeout));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn result_seen_before_its_decision_is_not_timed_out() {
        let pipeline = Arc::new(InProcessPipeline::new());
        let tracker = DeadlineTracker::new(pipeline, Duration::from_secs(60));
        let p: PredictorId = "p1".into();
        tracker.on_result(&PredictionResult::scored("fast".into(), p.clone(), 0.5, 1.0));
        tracker.on_decision(&decision("fast", &p));
        assert_eq!(tracker.pending(), 0);
    }
}

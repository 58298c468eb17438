//! Wires the components together, owns the background tasks and the shutdown sequence.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregator::MetricsAggregator;
use crate::capability::CapabilitySet;
use crate::config::OrchestratorConfig;
use crate::controller::LifecycleController;
use crate::error::ServingError;
use crate::ledger::DeploymentLedger;
use crate::model::{Article, CapabilityRef, RoutingDecision};
use crate::pipeline::{self, EventPipeline, Topic};
use crate::registry::PredictorRegistry;
use crate::router::TrafficRouter;
use crate::store::RecordStore;
use crate::worker::{DeadlineTracker, InferenceWorker};

pub struct Orchestrator {
    pub registry: Arc<PredictorRegistry>,
    pub ledger: Arc<DeploymentLedger>,
    pub router: Arc<TrafficRouter>,
    pub pipeline: Arc<dyn EventPipeline>,
    pub aggregator: Arc<MetricsAggregator>,
    pub controller: Arc<LifecycleController>,
    pub worker: Arc<InferenceWorker>,
    pub deadlines: Arc<DeadlineTracker>,
    pub store: Arc<RecordStore>,
    pub capabilities: CapabilitySet,
    cfg: OrchestratorConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Open the store, connect the pipeline and restore persisted state.
    pub async fn build(cfg: OrchestratorConfig, capabilities: CapabilitySet) -> Result<Arc<Self>> {
        let store = RecordStore::open(cfg.data_dir.as_deref().map(Path::new))
            .context("open record store")?;
        let store = Arc::new(store);
        let pipeline = pipeline::connect(&cfg.pipeline).await;
        info!(
            backend = pipeline.backend(),
            persistent = store.is_persistent(),
            "orchestrator components ready"
        );
        let orch = Self::assemble(cfg, capabilities, pipeline, store);
        orch.restore().context("restore persisted state")?;
        orch.bootstrap().context("bootstrap predictors")?;
        Ok(orch)
    }

    /// Build from ready-made parts without restoring anything.
    pub fn assemble(
        cfg: OrchestratorConfig,
        capabilities: CapabilitySet,
        pipeline: Arc<dyn EventPipeline>,
        store: Arc<RecordStore>,
    ) -> Arc<Self> {
        let registry = Arc::new(
            PredictorRegistry::with_known_capabilities(capabilities.refs())
                .with_store(store.clone()),
        );
        let ledger = Arc::new(DeploymentLedger::new(registry.clone()).with_store(store.clone()));
        let router =
            Arc::new(TrafficRouter::new(ledger.clone(), pipeline.clone(), cfg.routing_mode));
        let aggregator = Arc::new(MetricsAggregator::new(cfg.aggregator.clone()));
        let controller = Arc::new(LifecycleController::new(
            ledger.clone(),
            aggregator.clone(),
            cfg.controller.clone(),
        ));
        let worker = Arc::new(InferenceWorker::new(
            registry.clone(),
            ledger.clone(),
            capabilities.clone(),
            pipeline.clone(),
            store.clone(),
            cfg.worker.clone(),
        ));
        let deadlines = Arc::new(DeadlineTracker::new(pipeline.clone(), cfg.worker.deadline()));
        Arc::new(Self {
            registry,
            ledger,
            router,
            pipeline,
            aggregator,
            controller,
            worker,
            deadlines,
            store,
            capabilities,
            cfg,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.cfg
    }

    fn restore(&self) -> Result<(), ServingError> {
        let predictors = self.registry.restore()?;
        let deployments = self.ledger.restore()?;
        let snapshots = self.aggregator.restore(self.store.load_metric_snapshots()?);
        if predictors + deployments + snapshots > 0 {
            info!(predictors, deployments, snapshots, "state restored");
        }
        Ok(())
    }

    /// Register and activate configured predictors for content types that have none.
    pub fn bootstrap(&self) -> Result<(), ServingError> {
        for entry in &self.cfg.bootstrap {
            if !self.registry.list(&entry.content_type).is_empty() {
                continue;
            }
            let capability = CapabilityRef(entry.capability.clone());
            let p = self.registry.register(&entry.content_type, capability)?;
            self.ledger.stage(&p.id, entry.weight)?;
            self.ledger.activate(&p.id)?;
            info!(
                content_type = %entry.content_type,
                capability = %entry.capability,
                predictor = %p.id,
                "bootstrap predictor active"
            );
        }
        Ok(())
    }

    /// Subscribe every consumer, then spawn the background loops. All subscriptions are
    /// registered before this resolves, so nothing routed afterwards is missed.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServingError> {
        let results = self.pipeline.subscribe(Topic::PredictionResults).await?;
        let tracked_decisions = self.pipeline.subscribe(Topic::RoutingDecisions).await?;
        let tracked_results = self.pipeline.subscribe(Topic::PredictionResults).await?;
        let work = match self.cfg.worker.enabled {
            true => Some(self.pipeline.subscribe(Topic::RoutingDecisions).await?),
            false => None,
        };

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.aggregator.clone().run(results)));
        tasks.push(tokio::spawn(self.deadlines.clone().run(
            tracked_decisions,
            tracked_results,
            Duration::from_millis(self.cfg.worker.sweep_interval_ms.max(10)),
        )));
        if let Some(work) = work {
            tasks.push(tokio::spawn(self.worker.clone().run(work)));
            tasks.push(tokio::spawn(self.worker.clone().idle_loop()));
        }
        if self.cfg.controller.enabled {
            tasks.push(tokio::spawn(self.controller.clone().run()));
        }
        if self.store.is_persistent() {
            tasks.push(tokio::spawn(self.aggregator.clone().persist_loop(self.store.clone())));
        }
        info!(tasks = tasks.len(), "orchestrator started");
        Ok(())
    }

    /// Store the article and route it; the article id doubles as the request id, so a
    /// resubmitted article keeps its predictor and its result is deduplicated.
    pub fn submit_article(
        &self,
        content_type: &str,
        article: &Article,
    ) -> Result<RoutingDecision, ServingError> {
        self.store.put_article(article)?;
        self.router.decide(content_type, &article.id.as_str().into())
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for t in &tasks {
            t.abort();
        }
        if let Err(e) = self.store.put_metric_snapshots(&self.aggregator.all_snapshots()) {
            warn!(error=%e, "final snapshot persistence failed");
        }
        if let Err(e) = self.store.flush().await {
            warn!(error=%e, "record store flush failed");
        }
        info!("orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapPredictor;
    use crate::model::DeploymentState;
    use crate::pipeline::InProcessPipeline;

    #[tokio::test]
    async fn bootstrap_activates_configured_predictors_once() {
        let cfg = OrchestratorConfig {
            bootstrap: vec![BootstrapPredictor {
                content_type: "article".into(),
                capability: "lexicon-sentiment".into(),
                weight: 1.0,
            }],
            ..Default::default()
        };
        let orch = Orchestrator::assemble(
            cfg,
            CapabilitySet::builtin(),
            Arc::new(InProcessPipeline::new()),
            Arc::new(RecordStore::ephemeral().unwrap()),
        );
        orch.bootstrap().unwrap();
        orch.bootstrap().unwrap();
        let deployments = orch.ledger.list("article");
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].state, DeploymentState::Active);
    }

    #[tokio::test]
    async fn build_restores_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OrchestratorConfig {
            data_dir: Some(dir.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        let id = {
            let orch = Orchestrator::build(cfg.clone(), CapabilitySet::builtin()).await.unwrap();
            let p = orch.registry.register("article", "keyword-topic".into()).unwrap();
            orch.ledger.stage(&p.id, 1.0).unwrap();
            orch.ledger.activate(&p.id).unwrap();
            orch.shutdown().await;
            p.id
        };
        let orch = Orchestrator::build(cfg, CapabilitySet::builtin()).await.unwrap();
        assert_eq!(orch.ledger.get(&id).unwrap().state, DeploymentState::Active);
        assert_eq!(orch.router.route("article", &"r1".into()).unwrap(), id);
    }
}

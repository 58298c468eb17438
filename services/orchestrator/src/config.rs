//! Engine tunables, read from the same layered sources as the service config
//! (YAML file, remote YAML, `SERVING__*` environment). Every field has a default.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::controller::ControllerConfig;
use crate::pipeline::PipelineConfig;
use crate::router::RoutingMode;
use crate::worker::WorkerConfig;

/// Predictor registered and activated at startup when its content type has none yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapPredictor {
    pub content_type: String,
    pub capability: String,
    #[serde(default = "full_weight")]
    pub weight: f64,
}

fn full_weight() -> f64 { 1.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Record store directory; unset runs ephemeral.
    pub data_dir: Option<String>,
    pub operator_port: u16,
    pub routing_mode: RoutingMode,
    pub pipeline: PipelineConfig,
    pub aggregator: AggregatorConfig,
    pub controller: ControllerConfig,
    pub worker: WorkerConfig,
    pub bootstrap: Vec<BootstrapPredictor>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            operator_port: 8080,
            routing_mode: RoutingMode::Hashed,
            pipeline: PipelineConfig::default(),
            aggregator: AggregatorConfig::default(),
            controller: ControllerConfig::default(),
            worker: WorkerConfig::default(),
            bootstrap: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub async fn load() -> Result<Self> {
        let mut cfg: OrchestratorConfig =
            serving_core::config_builder().await?.build()?.try_deserialize()?;
        if cfg.data_dir.is_none() {
            cfg.data_dir = std::env::var("SERVING_DATA_DIR").ok().filter(|d| !d.is_empty());
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBackend;

    #[test]
    fn defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.aggregator.retention_secs, 86_400);
        assert_eq!(cfg.aggregator.min_samples, 30);
        assert_eq!(cfg.routing_mode, RoutingMode::Hashed);
        assert_eq!(cfg.pipeline.backend, PipelineBackend::InProcess);
        assert!(cfg.bootstrap.is_empty());
    }

    #[test]
    fn partial_documents_keep_defaults() {
        let cfg: OrchestratorConfig = serde_json::from_str(r#"{
            "routing_mode": "random",
            "pipeline": {"backend": "nats", "subject_prefix": "prod"},
            "aggregator": {"min_samples": 5},
            "controller": {"metric": "score", "window_secs": 600},
            "bootstrap": [{"content_type": "article", "capability": "lexicon-sentiment"}]
        }"#).unwrap();
        assert_eq!(cfg.routing_mode, RoutingMode::Random);
        assert_eq!(cfg.pipeline.backend, PipelineBackend::Nats);
        assert_eq!(cfg.pipeline.nats_url, "127.0.0.1:4222");
        assert_eq!(cfg.aggregator.min_samples, 5);
        assert_eq!(cfg.aggregator.retention_secs, 86_400);
        assert_eq!(cfg.controller.window_secs, Some(600));
        assert!(cfg.controller.higher_is_better);
        assert_eq!(cfg.bootstrap[0].weight, 1.0);
        assert_eq!(cfg.operator_port, 8080);
    }
}

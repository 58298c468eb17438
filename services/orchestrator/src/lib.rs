//! Predictor lifecycle and traffic-routing engine.
//!
//! Predictors are registered per content type, deployed through a weighted ledger,
//! selected per request by the router, and compared on the outcomes flowing back over
//! the event pipeline. The lifecycle controller promotes or rolls back challengers.

pub mod aggregator;
pub mod capability;
pub mod config;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod model;
pub mod operator;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod store;
pub mod worker;

pub use aggregator::{ComparisonResult, MetricSnapshot, MetricsAggregator};
pub use capability::{CapabilitySet, PredictorCapability};
pub use config::OrchestratorConfig;
pub use controller::LifecycleController;
pub use error::{Result, ServingError};
pub use ledger::{ActiveSet, DeploymentLedger};
pub use model::*;
pub use orchestrator::Orchestrator;
pub use pipeline::{EventPipeline, InProcessPipeline, Payload, Topic};
pub use registry::PredictorRegistry;
pub use router::{RoutingMode, TrafficRouter};
pub use store::RecordStore;

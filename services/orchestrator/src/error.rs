//! Error taxonomy for registry, ledger, routing and comparison operations.
//!
//! Every variant except `Storage`/`Pipeline` is a precondition failure: the operation
//! returned it without mutating any state. A missing result is never an error here; it
//! becomes a `Timeout` outcome instead.

use thiserror::Error;

use crate::model::{DeploymentState, PredictorId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServingError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("capability '{capability}' is already bound to active predictor {predictor_id}")]
    DuplicateCapability { capability: String, predictor_id: PredictorId },

    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("predictor {predictor_id}: cannot {action} from {from:?}")]
    InvalidTransition {
        predictor_id: PredictorId,
        from: Option<DeploymentState>,
        action: &'static str,
    },

    #[error("traffic weight {0} outside [0, 1]")]
    InvalidWeight(f64),

    #[error("no active deployment for content type '{0}'")]
    NoActiveDeployment(String),

    #[error("predictor {predictor_id} has {count} samples of '{metric}', {required} required")]
    InsufficientSamples { predictor_id: PredictorId, metric: String, count: u64, required: u64 },

    #[error("storage: {0}")]
    Storage(String),

    #[error("pipeline: {0}")]
    Pipeline(String),
}

impl ServingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ServingError::NotFound { entity, id: id.to_string() }
    }

    /// Short machine-readable kind, used in API bodies and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ServingError::NotFound { .. } => "not_found",
            ServingError::DuplicateCapability { .. } => "duplicate_capability",
            ServingError::UnknownCapability(_) => "unknown_capability",
            ServingError::InvalidTransition { .. } => "invalid_transition",
            ServingError::InvalidWeight(_) => "invalid_weight",
            ServingError::NoActiveDeployment(_) => "no_active_deployment",
            ServingError::InsufficientSamples { .. } => "insufficient_samples",
            ServingError::Storage(_) => "storage",
            ServingError::Pipeline(_) => "pipeline",
        }
    }
}

impl From<sled::Error> for ServingError {
    fn from(e: sled::Error) -> Self { ServingError::Storage(e.to_string()) }
}

impl From<serde_json::Error> for ServingError {
    fn from(e: serde_json::Error) -> Self { ServingError::Storage(e.to_string()) }
}

pub type Result<T, E = ServingError> = std::result::Result<T, E>;

//! Shared records: predictors, deployments, routing decisions, results and article records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictorId(pub String);

impl PredictorId {
    pub fn generate() -> Self { Self(Uuid::new_v4().to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for PredictorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for PredictorId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self { Self(Uuid::new_v4().to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Opaque handle naming a scoring capability registered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityRef(pub String);

impl fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for CapabilityRef {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// One immutable, versioned model binding for a content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictor {
    pub id: PredictorId,
    pub content_type: String,
    pub version: u32,
    pub capability: CapabilityRef,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState { Staged, Active, Paused, Retired }

impl DeploymentState {
    pub fn is_terminal(self) -> bool { self == DeploymentState::Retired }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub predictor_id: PredictorId,
    pub content_type: String,
    pub version: u32,
    /// Live share of traffic; zero unless ACTIVE.
    pub traffic_weight: f64,
    /// Weight requested by `stage`/`set_weight`, reapplied when the deployment becomes
    /// active again.
    pub target_weight: f64,
    pub state: DeploymentState,
    pub staged_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// Audit entry written for every committed ledger mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub predictor_id: PredictorId,
    pub content_type: String,
    pub from: Option<DeploymentState>,
    pub to: DeploymentState,
    pub weight_after: f64,
    pub epoch: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: RequestId,
    pub content_type: String,
    pub predictor_id: PredictorId,
    pub decision_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Ground-truth feedback, possibly arriving long after the prediction.
    Feedback { value: f64 },
    /// No result arrived before the deadline.
    Timeout,
    /// The predictor failed to produce a score.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub request_id: RequestId,
    pub predictor_id: PredictorId,
    pub score: Option<f64>,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub completed_at: DateTime<Utc>,
}

impl PredictionResult {
    fn new(request_id: RequestId, predictor_id: PredictorId, latency_ms: f64) -> Self {
        Self {
            request_id,
            predictor_id,
            score: None,
            latency_ms,
            outcome: None,
            label: None,
            cost: None,
            completed_at: Utc::now(),
        }
    }

    pub fn scored(
        request_id: RequestId,
        predictor_id: PredictorId,
        score: f64,
        latency_ms: f64,
    ) -> Self {
        Self { score: Some(score), ..Self::new(request_id, predictor_id, latency_ms) }
    }

    pub fn timed_out(request_id: RequestId, predictor_id: PredictorId, waited_ms: f64) -> Self {
        Self::new(request_id, predictor_id, waited_ms).with_outcome(Outcome::Timeout)
    }

    pub fn failed(request_id: RequestId, predictor_id: PredictorId, latency_ms: f64) -> Self {
        Self::new(request_id, predictor_id, latency_ms).with_outcome(Outcome::Error)
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self { self.outcome = Some(outcome); self }
}

/// Article produced by the crawler; read-only input to inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl Article {
    /// Text handed to predictors: title, then description, then body.
    pub fn text(&self) -> &str {
        [&self.title, &self.description, &self.content]
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
            .find(|s| !s.trim().is_empty())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPrediction {
    pub score: f64,
    pub label: Option<String>,
    pub confidence: Option<f64>,
}

/// All predictions made for one article and content type; one of them is the served one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticlePrediction {
    pub article_id: String,
    pub content_type: String,
    pub selected_predictor_id: Option<PredictorId>,
    pub predictions: BTreeMap<PredictorId, StoredPrediction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArticlePrediction {
    pub fn selected(&self) -> Option<&StoredPrediction> {
        self.selected_predictor_id.as_ref().and_then(|id| self.predictions.get(id))
    }
}

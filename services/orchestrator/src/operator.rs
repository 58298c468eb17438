//! Operator HTTP API: every registry, ledger and comparison command, plus routing,
//! article submission and result intake for external workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::ServingError;
use crate::model::{Article, CapabilityRef, PredictionResult, PredictorId, RequestId};
use crate::orchestrator::Orchestrator;
use crate::pipeline::{Payload, Topic};

type AppState = Arc<Orchestrator>;

impl IntoResponse for ServingError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServingError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServingError::DuplicateCapability { .. } | ServingError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            ServingError::InvalidWeight(_) | ServingError::UnknownCapability(_) => {
                StatusCode::BAD_REQUEST
            }
            ServingError::NoActiveDeployment(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServingError::InsufficientSamples { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServingError::Storage(_) | ServingError::Pipeline(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({"error": {"kind": self.kind(), "message": self.to_string()}});
        (status, Json(body)).into_response()
    }
}

pub fn operator_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/capabilities", get(list_capabilities))
        .route("/v1/predictors", post(register_predictor))
        .route("/v1/predictors/:id", get(get_predictor))
        .route("/v1/content-types/:content_type/predictors", get(list_predictors))
        .route("/v1/content-types/:content_type/deployments", get(list_deployments))
        .route("/v1/content-types/:content_type/active", get(active_set))
        .route("/v1/content-types/:content_type/history", get(history))
        .route("/v1/deployments/:id", get(get_deployment))
        .route("/v1/deployments/:id/stage", post(stage))
        .route("/v1/deployments/:id/activate", post(activate))
        .route("/v1/deployments/:id/pause", post(pause))
        .route("/v1/deployments/:id/retire", post(retire))
        .route("/v1/deployments/:id/weight", put(set_weight))
        .route("/v1/compare", get(compare))
        .route("/v1/metrics/:id", get(snapshots))
        .route("/v1/route", post(route))
        .route("/v1/articles", post(submit_article))
        .route("/v1/articles/:id/predictions/:content_type", get(article_predictions))
        .route("/v1/results", post(publish_result))
        .route("/v1/controller/cycle", post(run_cycle))
        .route("/v1/pipeline/stats", get(pipeline_stats))
}

/// Bind the operator API and serve it in the background. Returns the bound address.
/// The process is reported not live if the server stops.
pub async fn serve(orch: AppState, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = operator_routes().with_state(orch);
    info!(addr=%local, "operator api listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error=?e, "operator api failed");
        }
        serving_core::mark_not_live();
    });
    Ok(local)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub content_type: String,
    pub capability: String,
}

#[derive(Debug, Deserialize)]
pub struct WeightRequest {
    pub weight: f64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub a: String,
    pub b: String,
    pub metric: Option<String>,
    pub window_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub content_type: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitArticleRequest {
    pub content_type: String,
    pub article: Article,
}

async fn list_capabilities(State(orch): State<AppState>) -> impl IntoResponse {
    Json(orch.capabilities.status().await)
}

async fn register_predictor(
    State(orch): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    match orch.registry.register(&req.content_type, CapabilityRef(req.capability)) {
        Ok(p) => (StatusCode::CREATED, Json(p)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_predictor(State(orch): State<AppState>, Path(id): Path<String>) -> Response {
    match orch.registry.get(&PredictorId(id)) {
        Ok(p) => Json(p).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_predictors(
    State(orch): State<AppState>,
    Path(content_type): Path<String>,
) -> impl IntoResponse {
    Json(orch.registry.list(&content_type))
}

async fn list_deployments(
    State(orch): State<AppState>,
    Path(content_type): Path<String>,
) -> impl IntoResponse {
    Json(orch.ledger.list(&content_type))
}

async fn active_set(
    State(orch): State<AppState>,
    Path(content_type): Path<String>,
) -> impl IntoResponse {
    Json(orch.ledger.active_set(&content_type).as_ref().clone())
}

async fn history(
    State(orch): State<AppState>,
    Path(content_type): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    Json(orch.ledger.history(&content_type, q.limit.unwrap_or(100)))
}

async fn get_deployment(State(orch): State<AppState>, Path(id): Path<String>) -> Response {
    match orch.ledger.get(&PredictorId(id)) {
        Ok(d) => Json(d).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stage(
    State(orch): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WeightRequest>,
) -> Response {
    match orch.ledger.stage(&PredictorId(id), req.weight) {
        Ok(d) => (StatusCode::CREATED, Json(d)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn activate(State(orch): State<AppState>, Path(id): Path<String>) -> Response {
    match orch.ledger.activate(&PredictorId(id)) {
        Ok(d) => Json(d).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn pause(State(orch): State<AppState>, Path(id): Path<String>) -> Response {
    match orch.ledger.pause(&PredictorId(id)) {
        Ok(d) => Json(d).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn retire(State(orch): State<AppState>, Path(id): Path<String>) -> Response {
    match orch.ledger.retire(&PredictorId(id)) {
        Ok(d) => Json(d).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn set_weight(
    State(orch): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WeightRequest>,
) -> Response {
    match orch.ledger.set_weight(&PredictorId(id), req.weight) {
        Ok(d) => Json(d).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn compare(State(orch): State<AppState>, Query(q): Query<CompareQuery>) -> Response {
    let metric = q.metric.unwrap_or_else(|| orch.config().controller.metric.clone());
    let (a, b) = (PredictorId(q.a), PredictorId(q.b));
    let res = match q.window_secs {
        Some(w) => orch.aggregator.compare_window(&a, &b, &metric, Duration::from_secs(w)),
        None => orch.aggregator.compare(&a, &b, &metric),
    };
    match res {
        Ok(c) => Json(c).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn snapshots(State(orch): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    Json(orch.aggregator.snapshots(&PredictorId(id)))
}

async fn route(State(orch): State<AppState>, Json(req): Json<RouteRequest>) -> Response {
    let res = match req.request_id {
        Some(id) => orch.router.decide(&req.content_type, &RequestId(id)),
        None => orch.router.route_new(&req.content_type),
    };
    match res {
        Ok(d) => Json(d).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn submit_article(
    State(orch): State<AppState>,
    Json(req): Json<SubmitArticleRequest>,
) -> Response {
    match orch.submit_article(&req.content_type, &req.article) {
        Ok(d) => (StatusCode::ACCEPTED, Json(d)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn article_predictions(
    State(orch): State<AppState>,
    Path((id, content_type)): Path<(String, String)>,
) -> Response {
    match orch.store.get_article_prediction(&id, &content_type) {
        Ok(Some(p)) => Json(p).into_response(),
        Ok(None) => {
            ServingError::not_found("article prediction", format!("{id}/{content_type}"))
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Intake for results produced outside this process, including late feedback.
async fn publish_result(
    State(orch): State<AppState>,
    Json(result): Json<PredictionResult>,
) -> Response {
    orch.pipeline.publish(Topic::PredictionResults, Payload::Result(result));
    StatusCode::ACCEPTED.into_response()
}

async fn run_cycle(State(orch): State<AppState>) -> impl IntoResponse {
    Json(orch.controller.run_cycle())
}

async fn pipeline_stats(State(orch): State<AppState>) -> impl IntoResponse {
    Json(json!({"backend": orch.pipeline.backend(), "stats": orch.pipeline.stats()}))
}

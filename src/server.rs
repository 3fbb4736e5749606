use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::header,
    response::{Html, IntoResponse, sse::Event, Sse},
    routing::{get, post},
};
use futures::Stream;
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::{
    config::{AppConfig, PipelineKind},
    error::ServiceError,
    language::DetectionPolicy,
    model::{GenerationRequest, ModelRegistry, RegisteredModel},
    pipeline::Orchestrator,
    transport,
};

const INDEX_HTML: &str = include_str!("../static/index.html");
const SCRIPT_JS: &str = include_str!("../static/script.js");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Serialize)]
struct MetadataResponse {
    pipeline: PipelineKind,
    detection_policy: DetectionPolicy,
    models: Vec<RegisteredModel>,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let state = AppState {
        orchestrator: Arc::new(Orchestrator::new(&config, registry.clone())),
        registry,
        config,
    };

    Router::new()
        .route("/", get(index))
        .route("/static/script.js", get(script))
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/generate", post(generate))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript")], SCRIPT_JS)
}

async fn health() -> &'static str {
    "ok"
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        pipeline: state.config.pipeline,
        detection_policy: state.config.detection_policy,
        models: state.registry.metadata(),
    })
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceError> {
    let Json(request) = payload.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;
    debug!(task = %request.task, chars = request.text.chars().count(), "generation requested");
    Ok(transport::sse_response(state.orchestrator.generate(request)))
}

//! Canned-answer API with the same routes as the live server, for developing
//! clients without a vector database or model credentials.
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::team::resolve_mode;
use crate::agents::{AgentKey, TeamMode};
use crate::error::StandardsError;
use crate::server::{
    ApiResult, AskResponse, HealthResponse, QueryRequest, TeamQueryRequest, bind_address,
    endpoint_catalogue, requested_team_mode, shutdown_signal,
};
use crate::telemetry::TelemetrySink;

#[derive(Clone)]
pub struct MockState {
    pub telemetry: TelemetrySink,
}

pub fn mock_answer(key: AgentKey, query: &str) -> String {
    match key {
        AgentKey::Safety => format!("Safety response to: {query}"),
        AgentKey::Quality => format!("Quality response to: {query}"),
    }
}

/// Validates the mode against the live dispatch table before answering.
pub fn mock_team_answer(query: &str, mode: Option<&str>) -> Result<String, StandardsError> {
    let mode = match mode {
        Some(name) => resolve_mode(name)?.mode,
        None => TeamMode::default(),
    };
    Ok(format!("Team response ({mode}) to: {query}"))
}

async fn handle_mock_ask(
    state: &MockState,
    key: AgentKey,
    request: QueryRequest,
) -> ApiResult<AskResponse> {
    state
        .telemetry
        .emit("mock.ask", json!({ "agent": key.label() }));
    Ok(Json(AskResponse {
        response: mock_answer(key, &request.query),
    }))
}

async fn handle_mock_safety(
    State(state): State<Arc<MockState>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<AskResponse> {
    handle_mock_ask(&state, AgentKey::Safety, request).await
}

async fn handle_mock_quality(
    State(state): State<Arc<MockState>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<AskResponse> {
    handle_mock_ask(&state, AgentKey::Quality, request).await
}

async fn handle_mock_team(
    State(state): State<Arc<MockState>>,
    Json(request): Json<TeamQueryRequest>,
) -> ApiResult<AskResponse> {
    let mode = requested_team_mode(&request)?;
    let response = mock_team_answer(&request.query, Some(mode))?;
    state.telemetry.emit(
        "mock.ask",
        json!({ "agent": "team", "mode": request.team_mode }),
    );
    Ok(Json(AskResponse { response }))
}

async fn handle_mock_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        agents_status: "available",
        available_agents: vec![AgentKey::Safety.label(), AgentKey::Quality.label(), "team"],
    })
}

async fn handle_mock_root() -> Json<Value> {
    Json(json!({
        "app": "Standards Agents Mock API",
        "version": env!("CARGO_PKG_VERSION"),
        "agents_status": "available",
        "endpoints": endpoint_catalogue(),
    }))
}

async fn handle_mock_config() -> Json<Value> {
    Json(json!({
        "lance_url": "Not set",
        "lance_api_key_set": false,
        "openai_api_key_set": false,
        "agents_available": true,
        "knowledge_backend": "mock",
        "default_model": crate::config::DEFAULT_MODEL_ID,
    }))
}

pub fn build_mock_router(state: Arc<MockState>) -> AxumRouter {
    AxumRouter::new()
        .route("/", get(handle_mock_root))
        .route("/health", get(handle_mock_health))
        .route("/config", get(handle_mock_config))
        .route("/safety/ask", post(handle_mock_safety))
        .route("/quality/ask", post(handle_mock_quality))
        .route("/team/ask", post(handle_mock_team))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_mock_server(host: String, port: u16, telemetry: &TelemetrySink) -> Result<()> {
    let addr = bind_address(&host, port)?;
    telemetry.emit("mock.started", json!({ "host": host, "port": port }));
    println!("Mock API listening on http://{addr} (canned answers, no external services)");

    let state = Arc::new(MockState {
        telemetry: telemetry.clone(),
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind mock server listener")?;
    axum::serve(listener, build_mock_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("mock server runtime failed")
}

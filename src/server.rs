use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agents::{AgentKey, AgentRegistry, TeamMode, TeamRun};
use crate::config::RuntimeConfig;
use crate::error::StandardsError;
use crate::provider::requested_model_id;
use crate::telemetry::{TelemetrySink, round_metric};

pub const APP_TITLE: &str = "Standards Agents API";

#[derive(Clone)]
pub struct ApiState {
    pub cfg: RuntimeConfig,
    pub registry: Arc<AgentRegistry>,
    pub telemetry: TelemetrySink,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TeamQueryRequest {
    pub query: String,
    #[serde(default)]
    pub model_id: Option<String>,
    /// Absent means collaborate; an explicit `null` is not a mode.
    #[serde(default = "default_team_mode")]
    pub team_mode: Option<String>,
}

fn default_team_mode() -> Option<String> {
    Some(TeamMode::default().label().to_string())
}

pub fn requested_team_mode(
    request: &TeamQueryRequest,
) -> std::result::Result<&str, StandardsError> {
    request
        .team_mode
        .as_deref()
        .ok_or_else(|| StandardsError::UnknownMode {
            mode: "null".to_string(),
        })
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AskResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agents_status: &'static str,
    pub available_agents: Vec<&'static str>,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "detail": message.into() })))
}

pub fn error_status(err: &StandardsError) -> StatusCode {
    match err {
        StandardsError::UnknownMode { .. } | StandardsError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        StandardsError::AgentUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StandardsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        StandardsError::Configuration(_) | StandardsError::Upstream(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<StandardsError> for (StatusCode, Json<Value>) {
    fn from(err: StandardsError) -> Self {
        api_error(error_status(&err), err.to_string())
    }
}

fn require_query(query: &str) -> std::result::Result<&str, StandardsError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(StandardsError::InvalidRequest(
            "query cannot be empty".to_string(),
        ));
    }
    Ok(query)
}

/// Bounds agent work by the configured request timeout.
async fn with_request_timeout<T, F>(
    timeout_secs: u64,
    work: F,
) -> std::result::Result<T, StandardsError>
where
    F: std::future::Future<Output = std::result::Result<T, StandardsError>>,
{
    tokio::time::timeout(Duration::from_secs(timeout_secs), work)
        .await
        .map_err(|_| StandardsError::Timeout(timeout_secs))?
}

fn record_outcome<T>(
    state: &ApiState,
    agent: &str,
    mode: Option<&str>,
    model: &str,
    started_at: Instant,
    outcome: &std::result::Result<T, StandardsError>,
) {
    let latency_ms = round_metric(started_at.elapsed().as_secs_f64() * 1000.0);
    match outcome {
        Ok(_) => {
            tracing::info!(agent, mode, model, latency_ms, "ask completed");
            state.telemetry.emit(
                "api.ask.completed",
                json!({ "agent": agent, "mode": mode, "model": model, "latency_ms": latency_ms }),
            );
        }
        Err(err) => {
            tracing::warn!(agent, mode, model, latency_ms, error = %err, "ask failed");
            state.telemetry.emit(
                "api.ask.failed",
                json!({
                    "agent": agent,
                    "mode": mode,
                    "model": model,
                    "status": error_status(err).as_u16(),
                    "error": err.to_string(),
                    "latency_ms": latency_ms
                }),
            );
        }
    }
}

async fn ask_domain_agent(
    state: &ApiState,
    key: AgentKey,
    request: QueryRequest,
) -> ApiResult<AskResponse> {
    let started_at = Instant::now();
    let outcome = async {
        let query = require_query(&request.query)?;
        let agent = state.registry.agent(key)?;
        with_request_timeout(
            state.cfg.request_timeout_secs,
            agent.run(query, request.model_id.as_deref()),
        )
        .await
    }
    .await;

    let model =
        requested_model_id(request.model_id.as_deref()).unwrap_or(&state.cfg.default_model);
    record_outcome(state, key.label(), None, model, started_at, &outcome);
    Ok(Json(AskResponse { response: outcome? }))
}

pub async fn handle_safety_ask(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<AskResponse> {
    ask_domain_agent(&state, AgentKey::Safety, request).await
}

pub async fn handle_quality_ask(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<AskResponse> {
    ask_domain_agent(&state, AgentKey::Quality, request).await
}

pub async fn handle_team_ask(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<TeamQueryRequest>,
) -> ApiResult<AskResponse> {
    let started_at = Instant::now();
    let outcome: std::result::Result<TeamRun, StandardsError> = async {
        let query = require_query(&request.query)?;
        let team = state.registry.team()?;
        let mode = requested_team_mode(&request)?;
        with_request_timeout(
            state.cfg.request_timeout_secs,
            team.run(query, Some(mode), request.model_id.as_deref()),
        )
        .await
    }
    .await;

    let mode_label = match &outcome {
        Ok(run) => Some(run.mode.label().to_string()),
        Err(_) => request.team_mode.clone(),
    };
    let model =
        requested_model_id(request.model_id.as_deref()).unwrap_or(&state.cfg.default_model);
    record_outcome(
        &state,
        "team",
        mode_label.as_deref(),
        model,
        started_at,
        &outcome,
    );

    let run = outcome?;
    tracing::debug!(
        mode = run.mode.label(),
        consulted = ?run.consulted,
        "team run finished"
    );
    Ok(Json(AskResponse {
        response: run.response,
    }))
}

pub async fn handle_health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        agents_status: state.registry.status_label(),
        available_agents: state.registry.available_agents(),
    })
}

pub async fn handle_config(State(state): State<Arc<ApiState>>) -> Json<Value> {
    let cfg = &state.cfg;
    Json(json!({
        "lance_url": cfg.lance_url.clone().unwrap_or_else(|| "Not set".to_string()),
        "lance_api_key_set": cfg.lance_api_key.is_some(),
        "openai_api_key_set": cfg.openai_api_key.is_some(),
        "agents_available": state.registry.is_available(),
        "knowledge_backend": format!("{:?}", cfg.knowledge_backend).to_ascii_lowercase(),
        "default_model": cfg.default_model,
    }))
}

pub fn endpoint_catalogue() -> Value {
    json!({
        "safety": "/safety/ask",
        "quality": "/quality/ask",
        "team": "/team/ask",
        "health": "/health",
        "config": "/config"
    })
}

pub async fn handle_root(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({
        "app": APP_TITLE,
        "version": env!("CARGO_PKG_VERSION"),
        "agents_status": state.registry.status_label(),
        "endpoints": endpoint_catalogue(),
    }))
}

pub fn build_api_router(state: Arc<ApiState>) -> AxumRouter {
    AxumRouter::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/config", get(handle_config))
        .route("/safety/ask", post(handle_safety_ask))
        .route("/quality/ask", post(handle_quality_ask))
        .route("/team/ask", post(handle_team_ask))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn bind_address(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{host}:{port}'"))
}

pub async fn run_server(
    cfg: RuntimeConfig,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = bind_address(&host, port)?;
    let registry = Arc::new(AgentRegistry::initialize(&cfg));

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": cfg.profile,
            "agents_status": registry.status_label(),
            "knowledge_backend": format!("{:?}", cfg.knowledge_backend).to_ascii_lowercase(),
            "model": cfg.default_model
        }),
    );

    if let Some(reason) = registry.unavailable_reason() {
        println!("Agents unavailable: {reason}");
    }
    println!(
        "{APP_TITLE} listening on http://{addr} (health: /health, ask: /safety/ask /quality/ask /team/ask)"
    );

    let state = Arc::new(ApiState {
        cfg,
        registry,
        telemetry: telemetry.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_api_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}

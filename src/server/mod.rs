//! Server-side code for the voice-bot gateway
//!
//! - SIP signaling towards the carrier (registration, one inbound call per agent)
//! - RTP media workers
//! - WebSocket bridge to the bot backend
//! - Agent orchestration and the HTTP control API
#![allow(dead_code)]

pub mod agent;
pub mod rtp;
pub mod sip;
pub mod websocket;

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::Method;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::models::{AgentStatusView, StartAgentRequest, StartAgentResponse};
use agent::{AgentError, AgentManager};

/// Process-level settings read from the environment
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    /// Directory holding `agent{id}.yaml` files
    pub agent_config_dir: PathBuf,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let agent_config_dir = std::env::var("AGENT_CONFIG_DIR")
            .unwrap_or_else(|_| "config/agents".to_string())
            .into();

        Self {
            port,
            agent_config_dir,
        }
    }
}

/// Application state shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<AgentManager>,
    pub config: Arc<GatewayConfig>,
}

/// Create the Axum router with all API routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/api/health", get(health_check))

        // Agent control
        .route("/api/agents/start", post(start_agent))
        .route("/api/agents/start/{id}", post(start_agent_from_file))
        .route("/api/agents/status", get(agent_status))
        .route("/api/agents/reconnect", post(reconnect_agents))
        .route("/api/agents/shutdown", post(shutdown_agents))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn error_response(error: AgentError) -> (StatusCode, Json<Value>) {
    let status = match &error {
        AgentError::AlreadyRunning(_) => StatusCode::CONFLICT,
        AgentError::Config(_) => StatusCode::BAD_REQUEST,
        AgentError::Load { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!("Agent request failed: {}", error);
    (status, Json(json!({ "error": error.to_string() })))
}

fn started(agent_name: String) -> (StatusCode, Json<StartAgentResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(StartAgentResponse {
            agent_name,
            status: "starting".to_string(),
        }),
    )
}

async fn start_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartAgentRequest>,
) -> Result<(StatusCode, Json<StartAgentResponse>), (StatusCode, Json<Value>)> {
    let config = req
        .into_config()
        .map_err(|e| error_response(AgentError::Config(e)))?;

    state
        .manager
        .start(config)
        .await
        .map(started)
        .map_err(error_response)
}

async fn start_agent_from_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<StartAgentResponse>), (StatusCode, Json<Value>)> {
    state
        .manager
        .start_from_file(&state.config.agent_config_dir, &id)
        .await
        .map(started)
        .map_err(error_response)
}

async fn agent_status(State(state): State<Arc<AppState>>) -> Json<Vec<AgentStatusView>> {
    Json(state.manager.status().await)
}

async fn reconnect_agents(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.manager.reconnect().await)
}

async fn shutdown_agents(State(state): State<Arc<AppState>>) -> StatusCode {
    state.manager.shutdown().await;
    StatusCode::NO_CONTENT
}

/// Run the control API until Ctrl-C, then stop every agent
pub async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    let port = config.port;
    let manager = Arc::new(AgentManager::new());

    let state = AppState {
        manager: manager.clone(),
        config: Arc::new(config),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Gateway control API running on http://0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}

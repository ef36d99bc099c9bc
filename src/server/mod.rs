//! HTTP server assembly: REST router, WebSocket event channels, CORS, and
//! startup wiring (workspace, engine registry, audit writer).

pub mod api;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::engine::{EngineRegistry, process::ProcessEngine};
use crate::events::EventBus;
use crate::store::workspace::Workspace;
use api::{AppState, SharedState};

pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4180,
            data_dir: PathBuf::from(".foreman/data"),
        }
    }
}

pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .merge(ws::ws_routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Engine adapters available to every project. Besides the built-in null
/// stub, `FOREMAN_ENGINE` may name an external CLI as
/// `name=program arg1 arg2...`.
pub fn build_engine_registry() -> EngineRegistry {
    let mut registry = EngineRegistry::default();
    if let Ok(spec) = std::env::var("FOREMAN_ENGINE") {
        match parse_engine_spec(&spec) {
            Some((name, program, args)) => {
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                registry.register(Arc::new(ProcessEngine::new(&name, &program, &arg_refs)));
                tracing::info!(engine = %name, %program, "registered external engine");
            }
            None => {
                tracing::warn!("ignoring malformed FOREMAN_ENGINE value: {spec:?}");
            }
        }
    }
    registry
}

fn parse_engine_spec(spec: &str) -> Option<(String, String, Vec<String>)> {
    let (name, command) = spec.split_once('=')?;
    let mut parts = command.split_whitespace();
    let program = parts.next()?;
    if name.trim().is_empty() {
        return None;
    }
    Some((
        name.trim().to_string(),
        program.to_string(),
        parts.map(|s| s.to_string()).collect(),
    ))
}

pub async fn start_server(config: ServerConfig) -> Result<()> {
    let bus = EventBus::default();
    let workspace = Arc::new(
        Workspace::open(&config.data_dir, bus).context("failed to open workspace")?,
    );
    let _audit = workspace.spawn_audit_writer();

    let engines = Arc::new(build_engine_registry());
    let state: SharedState = Arc::new(AppState::new(workspace, engines));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "foreman listening");
    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}

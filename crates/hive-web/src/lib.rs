//! HTTP, SSE and WebSocket surface over the hive coordination core.

pub mod api;
pub mod config;
pub mod ws;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use libhive::{AgentRegistry, EventGateway, JobDispatcher, StateStore, TaskWatcher};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::config::RuntimeConfig;

/// Shared application state.
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub dispatcher: JobDispatcher,
    pub registry: AgentRegistry,
    pub events: EventGateway,
    pub tasks: TaskWatcher,
    pub keepalive: Duration,
    pub shell: String,
}

impl AppState {
    pub async fn new(cfg: &RuntimeConfig, store: Arc<dyn StateStore>) -> Result<Arc<Self>> {
        let events =
            EventGateway::start(Arc::clone(&store), cfg.event_buffer, cfg.overflow_policy).await;
        let tasks = TaskWatcher::start(cfg.task_source.clone(), cfg.debounce).await?;
        Ok(Arc::new(Self {
            dispatcher: JobDispatcher::with_timeout(Arc::clone(&store), cfg.job_timeout),
            registry: AgentRegistry::new(Arc::clone(&store)),
            store,
            events,
            tasks,
            keepalive: cfg.keepalive,
            shell: cfg.shell.clone(),
        }))
    }
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/jobs/{worker_type}", post(api::dispatch_job))
        .route("/api/events", get(api::event_stream).post(api::publish))
        .route("/api/agents", get(api::list_agents))
        .route("/api/agents/{id}", get(api::get_agent).put(api::put_agent))
        .route(
            "/api/projects/{id}/context",
            get(api::get_project_context).put(api::put_project_context),
        )
        .route("/api/tasks", get(api::get_tasks))
        .route("/ws/tasks", get(ws::ws_tasks))
        .route("/ws/terminal", get(ws::ws_terminal))
        .layer(cors)
        .with_state(state)
}

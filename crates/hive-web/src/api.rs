use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use hive_protocol::{AgentState, TaskSnapshot, WorkerResponse};
use libhive::{HiveError, JobRequest, publish_event};

use crate::AppState;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Map a core error to the HTTP status and message the client sees.
pub fn api_error(err: HiveError) -> (StatusCode, String) {
    let (code, message) = err.status_code();
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        message,
    )
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "healthy": true,
        "store": state.store.backend(),
        "subscribers": state.events.subscriber_count(),
        "activeSubscriptions": state.store.active_subscriptions(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobBody {
    pub content: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// POST /api/jobs/{worker_type} - dispatch and wait for the worker's reply.
///
/// Timeouts and malformed replies still answer 200 with `error` set.
pub async fn dispatch_job(
    State(state): State<Arc<AppState>>,
    Path(worker_type): Path<String>,
    Json(body): Json<JobBody>,
) -> ApiResult<Json<WorkerResponse>> {
    let request = JobRequest {
        id: body.id,
        session_id: body.session_id,
        content: body.content,
    };
    state
        .dispatcher
        .dispatch(&worker_type, request)
        .await
        .map(Json)
        .map_err(api_error)
}

/// SSE cannot carry carriage returns, and a newline becomes a line break
/// between `data:` fields that the client joins back with `\n`. CRLF and lone
/// CR line endings therefore arrive as LF; everything else is verbatim.
fn sse_data(payload: &str) -> String {
    payload.replace("\r\n", "\n").replace('\r', "\n")
}

/// GET /api/events - live event stream, no replay.
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscriber = state.events.subscribe();
    debug!(subscribers = state.events.subscriber_count(), "event stream opened");

    let stream = async_stream::stream! {
        while let Some(payload) = subscriber.next().await {
            yield Ok(Event::default().data(sse_data(&payload)));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keepalive).text("keep-alive"))
}

/// POST /api/events - publish an arbitrary JSON event.
pub async fn publish(
    State(state): State<Arc<AppState>>,
    Json(event): Json<Value>,
) -> ApiResult<Json<Value>> {
    let receivers = publish_event(state.store.as_ref(), &event)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "receivers": receivers })))
}

#[derive(Debug, Serialize)]
pub struct OnlineAgent {
    pub id: String,
    /// `None` when the agent is present but its state expired.
    pub state: Option<AgentState>,
}

/// GET /api/agents
pub async fn list_agents(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<OnlineAgent>>> {
    let ids = state.registry.online_agents().await.map_err(api_error)?;
    let mut agents = Vec::with_capacity(ids.len());
    for id in ids {
        let agent_state = state.registry.agent_state(&id).await.map_err(api_error)?;
        agents.push(OnlineAgent {
            id,
            state: agent_state,
        });
    }
    Ok(Json(agents))
}

/// GET /api/agents/{id}
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentState>> {
    match state.registry.agent_state(&id).await.map_err(api_error)? {
        Some(agent) => Ok(Json(agent)),
        None => Err(api_error(HiveError::NotFound(format!("agent {id}")))),
    }
}

/// PUT /api/agents/{id}
pub async fn put_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(agent): Json<AgentState>,
) -> ApiResult<StatusCode> {
    state
        .registry
        .update_agent_state(&id, &agent)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/projects/{id}/context
pub async fn get_project_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    match state.registry.project_context(&id).await.map_err(api_error)? {
        Some(context) => Ok(Json(context)),
        None => Err(api_error(HiveError::NotFound(format!("project {id}")))),
    }
}

/// PUT /api/projects/{id}/context
pub async fn put_project_context(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(context): Json<Value>,
) -> ApiResult<StatusCode> {
    state
        .registry
        .set_project_context(&id, &context)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/tasks
pub async fn get_tasks(State(state): State<Arc<AppState>>) -> Json<TaskSnapshot> {
    Json(TaskSnapshot::clone(&state.tasks.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_maps_status_codes() {
        let (status, _) = api_error(HiveError::Store("down".into()));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let (status, message) = api_error(HiveError::NotFound("agent a1".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(message.contains("a1"));
    }

    #[test]
    fn sse_data_keeps_line_structure() {
        assert_eq!(sse_data(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(sse_data("one\r\ntwo\rthree\nfour"), "one\ntwo\nthree\nfour");
    }

    #[test]
    fn job_body_accepts_camel_case() {
        let body: JobBody =
            serde_json::from_str(r#"{"content":"hi","sessionId":"s1"}"#).unwrap();
        assert_eq!(body.content, "hi");
        assert_eq!(body.session_id.as_deref(), Some("s1"));
        assert_eq!(body.id, None);
    }
}

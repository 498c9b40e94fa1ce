use hive_protocol::{
    DEFAULT_JOB_TIMEOUT_SECS, JobEnvelope, WorkerResponse, job_channel, reply_channel,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HiveError, Result};
use crate::store::{StateStore, Subscription};

/// Caller-supplied part of a job.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    /// Job id; defaults to the generated request id.
    pub id: Option<String>,
    pub session_id: Option<String>,
    pub content: String,
}

impl JobRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Turns publish/subscribe into a call with a single reply or a timeout.
///
/// Every call gets its own reply channel keyed by a fresh request id, so
/// concurrent calls never see each other's replies.
#[derive(Clone)]
pub struct JobDispatcher {
    store: Arc<dyn StateStore>,
    timeout: Duration,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self::with_timeout(store, Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS))
    }

    pub fn with_timeout(store: Arc<dyn StateStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Publish a job for `worker_type` and wait for its reply.
    ///
    /// A missing reply and a malformed reply both come back as `Ok` with the
    /// `error` field set. `Err` is reserved for store failures.
    pub async fn dispatch(&self, worker_type: &str, request: JobRequest) -> Result<WorkerResponse> {
        let request_id = Uuid::new_v4().to_string();
        let envelope = JobEnvelope {
            id: request.id.unwrap_or_else(|| request_id.clone()),
            request_id: request_id.clone(),
            session_id: request.session_id,
            content: request.content,
        };
        let payload = serde_json::to_string(&envelope)?;
        let started = Instant::now();

        let mut reply = self.store.subscribe(&reply_channel(&request_id)).await?;
        let outcome = self.exchange(&mut reply, worker_type, &payload).await;
        reply.close().await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(response) => info!(
                worker_type,
                request_id,
                elapsed_ms,
                ok = !response.is_error(),
                error = response.error.as_deref().unwrap_or(""),
                "job dispatched"
            ),
            Err(err) => warn!(worker_type, request_id, elapsed_ms, error = %err, "job dispatch failed"),
        }
        outcome
    }

    async fn exchange(
        &self,
        reply: &mut Subscription,
        worker_type: &str,
        payload: &str,
    ) -> Result<WorkerResponse> {
        let receivers = self.store.publish(&job_channel(worker_type), payload).await?;
        if receivers == 0 {
            debug!(worker_type, "no worker listening; waiting for deadline");
        }

        match tokio::time::timeout(self.timeout, reply.next()).await {
            Ok(Some(raw)) => Ok(serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(channel = reply.channel(), error = %err, "malformed worker reply");
                WorkerResponse::invalid_format()
            })),
            Ok(None) => Err(HiveError::Store(format!(
                "reply subscription {} ended before a response arrived",
                reply.channel()
            ))),
            Err(_) => Ok(WorkerResponse::timeout()),
        }
    }
}

pub mod paths;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of a worker agent (also its presence-registry member).
pub type AgentId = String;

/// Correlation key pairing a job with its reply channel.
pub type RequestId = String;

/// Channel every component may publish dashboard events on.
pub const EVENTS_CHANNEL: &str = "events";

/// Sorted set of agent ids scored by last-active epoch ms.
pub const ONLINE_AGENTS_KEY: &str = "agents:online";

/// Agent state hashes expire this long after their last write.
pub const AGENT_STATE_TTL_SECS: u64 = 3600;

/// Presence entries older than this are stale.
pub const PRESENCE_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Hard deadline for a correlated job call.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 60;

pub const TIMEOUT_ERROR: &str = "Timeout waiting for agent response";
pub const INVALID_RESPONSE_ERROR: &str = "Invalid response format";

/// Channel a worker of the given type consumes jobs from.
pub fn job_channel(worker_type: &str) -> String {
    format!("jobs:{}", worker_type.to_ascii_uppercase())
}

/// Channel the reply for `request_id` is published on.
pub fn reply_channel(request_id: &str) -> String {
    format!("response:{request_id}")
}

pub fn agent_state_key(agent_id: &str) -> String {
    format!("agent:state:{agent_id}")
}

pub fn project_context_key(project_id: &str) -> String {
    format!("project:context:{project_id}")
}

/// Job published on `jobs:<WORKER_TYPE>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub id: String,
    pub request_id: RequestId,
    pub session_id: Option<String>,
    pub content: String,
}

/// Token accounting reported by a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// Reply published on `response:<requestId>`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl WorkerResponse {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn timeout() -> Self {
        Self::error(TIMEOUT_ERROR)
    }

    pub fn invalid_format() -> Self {
        Self::error(INVALID_RESPONSE_ERROR)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Offline,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(AgentStatus::Idle),
            "working" => Some(AgentStatus::Working),
            "offline" => Some(AgentStatus::Offline),
            "error" => Some(AgentStatus::Error),
            _ => None,
        }
    }
}

/// Ephemeral per-agent state kept under `agent:state:<id>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    /// Epoch milliseconds.
    pub last_active: u64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AgentState {
    pub fn new(status: AgentStatus, last_active: u64) -> Self {
        Self {
            status,
            current_task: None,
            last_active,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = Some(task.into());
        self
    }
}

/// One checklist item parsed from the task document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub id: String,
    pub content: String,
    pub completed: bool,
    pub in_progress: bool,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl TaskNode {
    pub fn is_pending(&self) -> bool {
        !self.completed && !self.in_progress
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub pending: usize,
}

impl TaskStats {
    pub fn from_nodes(nodes: &[TaskNode]) -> Self {
        let mut stats = TaskStats {
            total: nodes.len(),
            ..TaskStats::default()
        };
        for node in nodes {
            if node.completed {
                stats.completed += 1;
            } else if node.in_progress {
                stats.in_progress += 1;
            } else {
                stats.pending += 1;
            }
        }
        stats
    }
}

/// Per-phase counters, in document order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPhase {
    pub name: String,
    pub total: usize,
    pub completed: usize,
}

/// Full task view broadcast to observers on every change.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub phases: Vec<TaskPhase>,
    pub tasks: Vec<TaskNode>,
    pub stats: TaskStats,
}

/// Terminal connection mode requested by the client.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalMode {
    #[default]
    Local,
    Docker,
}

/// Events published by the core itself on [`EVENTS_CHANNEL`].
///
/// Anything else on the channel is relayed verbatim; this enum only covers the
/// payloads hive components emit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HiveEvent {
    JobStarted {
        agent_id: AgentId,
        worker_type: String,
        request_id: RequestId,
    },
    JobFinished {
        agent_id: AgentId,
        worker_type: String,
        request_id: RequestId,
        ok: bool,
        elapsed_ms: u64,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
    },
}

pub fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

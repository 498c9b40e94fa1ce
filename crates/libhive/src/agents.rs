use hive_protocol::{
    AGENT_STATE_TTL_SECS, AgentState, AgentStatus, ONLINE_AGENTS_KEY, PRESENCE_WINDOW_MS,
    agent_state_key, now_epoch_ms, project_context_key,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::StateStore;

/// Agent state, presence registry and project context over a [`StateStore`].
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn StateStore>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Write the agent's state, reset its TTL and refresh its presence score.
    ///
    /// Three independent single-key upserts; a failure part-way leaves the
    /// earlier writes in place.
    pub async fn update_agent_state(&self, agent_id: &str, state: &AgentState) -> Result<()> {
        let key = agent_state_key(agent_id);
        let fields = [
            ("status".to_string(), state.status.as_str().to_string()),
            ("lastActive".to_string(), state.last_active.to_string()),
            (
                "metadata".to_string(),
                serde_json::to_string(&state.metadata)?,
            ),
            // HSET cannot delete a field, so an absent task is stored as empty.
            (
                "currentTask".to_string(),
                state.current_task.clone().unwrap_or_default(),
            ),
        ];

        self.store.hash_set(&key, &fields).await?;
        self.store
            .expire(&key, Duration::from_secs(AGENT_STATE_TTL_SECS))
            .await?;
        self.store
            .sorted_add(ONLINE_AGENTS_KEY, agent_id, state.last_active as f64)
            .await?;
        debug!(agent_id, status = state.status.as_str(), "agent state updated");
        Ok(())
    }

    /// `None` means unknown: the state expired, was never written, or is
    /// unreadable.
    pub async fn agent_state(&self, agent_id: &str) -> Result<Option<AgentState>> {
        let hash = self.store.hash_get_all(&agent_state_key(agent_id)).await?;
        if hash.is_empty() {
            return Ok(None);
        }
        let state = decode_state(&hash);
        if state.is_none() {
            warn!(agent_id, "ignoring unparseable agent state");
        }
        Ok(state)
    }

    pub async fn touch_presence(&self, agent_id: &str) -> Result<()> {
        self.store
            .sorted_add(ONLINE_AGENTS_KEY, agent_id, now_epoch_ms() as f64)
            .await
    }

    /// Agents active within the presence window. Stale entries are purged
    /// before the set is read.
    pub async fn online_agents(&self) -> Result<Vec<String>> {
        self.online_agents_at(now_epoch_ms()).await
    }

    async fn online_agents_at(&self, now_ms: u64) -> Result<Vec<String>> {
        let cutoff = now_ms.saturating_sub(PRESENCE_WINDOW_MS) as f64;
        let purged = self
            .store
            .sorted_remove_below(ONLINE_AGENTS_KEY, cutoff)
            .await?;
        if purged > 0 {
            debug!(purged, "pruned stale presence entries");
        }
        self.store.sorted_range(ONLINE_AGENTS_KEY, cutoff).await
    }

    pub async fn project_context(&self, project_id: &str) -> Result<Option<serde_json::Value>> {
        match self.store.get(&project_context_key(project_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_project_context(
        &self,
        project_id: &str,
        context: &serde_json::Value,
    ) -> Result<()> {
        let raw = serde_json::to_string(context)?;
        self.store.set(&project_context_key(project_id), &raw).await
    }
}

fn decode_state(hash: &HashMap<String, String>) -> Option<AgentState> {
    let status = AgentStatus::parse(hash.get("status")?)?;
    let last_active = hash.get("lastActive")?.parse().ok()?;
    let current_task = hash
        .get("currentTask")
        .filter(|task| !task.is_empty())
        .cloned();
    let metadata = match hash.get("metadata") {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw).ok()?,
        _ => serde_json::Map::new(),
    };
    Some(AgentState {
        status,
        current_task,
        last_active,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> (AgentRegistry, Arc<dyn StateStore>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        (AgentRegistry::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn state_roundtrips_through_hash_fields() {
        let (registry, store) = registry();
        let mut state = AgentState::new(AgentStatus::Working, now_epoch_ms()).with_task("refactor");
        state
            .metadata
            .insert("model".to_string(), serde_json::json!("flash"));

        registry.update_agent_state("gemini-1", &state).await.unwrap();

        let hash = store.hash_get_all("agent:state:gemini-1").await.unwrap();
        assert_eq!(hash["status"], "working");
        assert_eq!(hash["currentTask"], "refactor");
        assert_eq!(
            registry.agent_state("gemini-1").await.unwrap(),
            Some(state)
        );
    }

    #[tokio::test]
    async fn absent_state_is_unknown_not_offline() {
        let (registry, store) = registry();
        assert_eq!(registry.agent_state("ghost").await.unwrap(), None);

        store
            .hash_set(
                "agent:state:broken",
                &[("status".to_string(), "sleeping".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(registry.agent_state("broken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_presence_is_excluded_and_removed() {
        let (registry, store) = registry();
        let now = now_epoch_ms();
        let stale = now - PRESENCE_WINDOW_MS - 1_000;

        store
            .sorted_add(ONLINE_AGENTS_KEY, "stale-agent", stale as f64)
            .await
            .unwrap();
        registry.touch_presence("fresh-agent").await.unwrap();

        let online = registry.online_agents().await.unwrap();
        assert_eq!(online, vec!["fresh-agent"]);

        let everything = store.sorted_range(ONLINE_AGENTS_KEY, 0.0).await.unwrap();
        assert!(!everything.contains(&"stale-agent".to_string()));
    }

    #[tokio::test]
    async fn presence_is_never_rolled_back() {
        let (registry, _store) = registry();
        let now = now_epoch_ms();

        let fresh = AgentState::new(AgentStatus::Idle, now);
        registry.update_agent_state("a1", &fresh).await.unwrap();

        // A late write carrying an old timestamp must not age the entry out.
        let old = AgentState::new(AgentStatus::Idle, now - PRESENCE_WINDOW_MS - 1_000);
        registry.update_agent_state("a1", &old).await.unwrap();

        assert_eq!(registry.online_agents_at(now).await.unwrap(), vec!["a1"]);
    }

    #[tokio::test]
    async fn project_context_is_last_writer_wins() {
        let (registry, _store) = registry();
        assert_eq!(registry.project_context("p1").await.unwrap(), None);

        registry
            .set_project_context("p1", &serde_json::json!({"goal": "ship"}))
            .await
            .unwrap();
        registry
            .set_project_context("p1", &serde_json::json!({"goal": "polish"}))
            .await
            .unwrap();

        assert_eq!(
            registry.project_context("p1").await.unwrap(),
            Some(serde_json::json!({"goal": "polish"}))
        );
    }
}

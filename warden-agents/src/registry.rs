//! Agent lifecycle registry.
//!
//! Single source of truth for agent existence and status. Agents are never
//! deleted: unregistering parks them in `Idle` so their metrics stay
//! queryable. Status changes are fail-open; an unusual transition is logged
//! and still applied.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use warden_core::{
    validate_identifier, AgentCapability, AgentFilter, AgentState, AgentStatus, JsonMap,
    StorageError, WardenError, WardenResult,
};
use warden_storage::{AgentStateUpdate, CoordinationStorage, StatusPromotion, TaskOutcome};

/// Re-registration resets a crashed agent.
const REGISTER_PROMOTION: StatusPromotion = StatusPromotion {
    from: &[AgentStatus::Error],
    to: AgentStatus::Init,
};

/// Startup recovery puts a parked or crashed agent straight back to work.
const STARTUP_PROMOTION: StatusPromotion = StatusPromotion {
    from: &[AgentStatus::Idle, AgentStatus::Error],
    to: AgentStatus::Active,
};

/// Lifecycle CRUD over agent state, backed by an injected storage client.
#[derive(Clone)]
pub struct AgentRegistry {
    storage: Arc<dyn CoordinationStorage>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry").finish_non_exhaustive()
    }
}

impl AgentRegistry {
    pub fn new(storage: Arc<dyn CoordinationStorage>) -> Self {
        Self { storage }
    }

    /// The storage client this registry writes through.
    pub fn storage(&self) -> &Arc<dyn CoordinationStorage> {
        &self.storage
    }

    /// Create or update an agent.
    ///
    /// An existing agent gets its capabilities replaced (when given) and its
    /// config shallow-merged. A prior `Error` status is reset to `Init`, which
    /// is the restart path for a crashed agent.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        capabilities: Option<Vec<AgentCapability>>,
        config: Option<JsonMap>,
    ) -> WardenResult<AgentState> {
        self.upsert(agent_id, capabilities, config, "register", REGISTER_PROMOTION)
            .await
    }

    /// Recovery entrypoint for an agent process that is starting up.
    ///
    /// A known agent in `Idle` or `Error` is promoted straight to `Active`;
    /// an unknown agent is registered as by [`register_agent`](Self::register_agent).
    pub async fn initialize_agent_on_startup(
        &self,
        agent_id: &str,
        capabilities: Option<Vec<AgentCapability>>,
        config: Option<JsonMap>,
    ) -> WardenResult<AgentState> {
        self.upsert(agent_id, capabilities, config, "startup", STARTUP_PROMOTION)
            .await
    }

    /// Create the row if absent, otherwise merge into the stored row in one
    /// storage update. Task ownership and metrics written concurrently by
    /// other callers are never overwritten.
    async fn upsert(
        &self,
        agent_id: &str,
        capabilities: Option<Vec<AgentCapability>>,
        config: Option<JsonMap>,
        action: &'static str,
        promotion: StatusPromotion,
    ) -> WardenResult<AgentState> {
        validate_identifier("agent_id", agent_id)?;

        // Only used for the transition log.
        let before = self
            .storage
            .agent_state_get(agent_id)
            .await?
            .map(|s| s.status);

        if before.is_none() {
            let mut state = AgentState::new(agent_id);
            if let Some(capabilities) = &capabilities {
                state.capabilities = capabilities.clone();
            }
            if let Some(config) = &config {
                state.config = config.clone();
            }
            if self.storage.agent_state_insert(&state).await? {
                info!(
                    agent_id = %agent_id,
                    action,
                    after = %state.status,
                    "Agent registered"
                );
                return Ok(state);
            }
            // Lost the insert to a concurrent registration; merge into its row.
        }

        let update = AgentStateUpdate {
            promote_status: Some(promotion),
            capabilities,
            merge_config: config,
            ..AgentStateUpdate::default()
        };
        let state = self
            .storage
            .agent_state_update(agent_id, update)
            .await?
            .ok_or_else(|| {
                WardenError::Storage(StorageError::NotFound {
                    entity: "agent",
                    id: agent_id.to_string(),
                })
            })?;

        log_transition(agent_id, action, before.unwrap_or(state.status), state.status);
        Ok(state)
    }

    /// Park an agent in `Idle`. Returns `false` if the agent is unknown.
    pub async fn unregister_agent(&self, agent_id: &str) -> WardenResult<bool> {
        Ok(self
            .update_agent_status(agent_id, AgentStatus::Idle)
            .await?
            .is_some())
    }

    pub async fn get_agent(&self, agent_id: &str) -> WardenResult<Option<AgentState>> {
        self.storage.agent_state_get(agent_id).await
    }

    /// List agents, optionally by status and by [`AgentFilter`].
    pub async fn list_agents(
        &self,
        status: Option<AgentStatus>,
        filter: Option<&AgentFilter>,
    ) -> WardenResult<Vec<AgentState>> {
        let states = self.storage.agent_state_list(status).await?;
        Ok(match filter {
            Some(filter) => states.into_iter().filter(|s| filter.matches(s)).collect(),
            None => states,
        })
    }

    /// Set an agent's status unconditionally. Returns `None` if unknown.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> WardenResult<Option<AgentState>> {
        let Some(current) = self.storage.agent_state_get(agent_id).await? else {
            return Ok(None);
        };

        let updated = self
            .storage
            .agent_state_update(agent_id, AgentStateUpdate::status(status))
            .await?;
        if updated.is_some() {
            log_transition(agent_id, "update_status", current.status, status);
        }
        Ok(updated)
    }

    /// Agents with a capability whose tools include `capability`.
    pub async fn get_agent_by_capability(&self, capability: &str) -> WardenResult<Vec<AgentState>> {
        let filter = AgentFilter::default().with_capability(capability);
        self.list_agents(None, Some(&filter)).await
    }

    /// Agents in `Active` or `Idle`. `Init` and `Error` are never available.
    pub async fn get_available_agents(&self) -> WardenResult<Vec<AgentState>> {
        let states = self.storage.agent_state_list(None).await?;
        Ok(states
            .into_iter()
            .filter(|s| s.status.is_available())
            .collect())
    }

    /// Fold a finished task into the agent's metrics and clear its current task.
    ///
    /// The task cleared is the one held when the call started; a task claimed
    /// in the meantime is kept. Metrics are folded inside the storage write so
    /// concurrent results are all counted.
    pub async fn record_task_result(
        &self,
        agent_id: &str,
        succeeded: bool,
        execution_time: Duration,
    ) -> WardenResult<Option<AgentState>> {
        let Some(current) = self.storage.agent_state_get(agent_id).await? else {
            return Ok(None);
        };

        let update = AgentStateUpdate {
            release_task: current.current_task_id.clone(),
            record_result: Some(TaskOutcome {
                succeeded,
                execution_time,
            }),
            ..AgentStateUpdate::default()
        };

        let updated = self.storage.agent_state_update(agent_id, update).await?;
        if let Some(state) = &updated {
            info!(
                agent_id = %agent_id,
                task_id = ?current.current_task_id,
                succeeded,
                tasks_completed = state.metrics.tasks_completed,
                success_rate = state.metrics.success_rate,
                "Task result recorded"
            );
        }
        Ok(updated)
    }

    /// Mark an agent as failed and keep the failure details.
    pub async fn record_failure(
        &self,
        agent_id: &str,
        error_info: serde_json::Value,
    ) -> WardenResult<Option<AgentState>> {
        let Some(current) = self.storage.agent_state_get(agent_id).await? else {
            return Ok(None);
        };

        let update = AgentStateUpdate {
            status: Some(AgentStatus::Error),
            last_error: Some(Some(error_info)),
            ..AgentStateUpdate::default()
        };
        let updated = self.storage.agent_state_update(agent_id, update).await?;
        if updated.is_some() {
            log_transition(agent_id, "failure", current.status, AgentStatus::Error);
        }
        Ok(updated)
    }
}

fn log_transition(agent_id: &str, action: &'static str, before: AgentStatus, after: AgentStatus) {
    if !before.is_expected_transition(after) {
        warn!(
            agent_id = %agent_id,
            action,
            before = %before,
            after = %after,
            "Unusual agent status transition applied"
        );
    }
    info!(
        agent_id = %agent_id,
        action,
        before = %before,
        after = %after,
        "Agent status updated"
    );
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_storage::MockStorage;

    fn registry() -> (Arc<MockStorage>, AgentRegistry) {
        let storage = Arc::new(MockStorage::new());
        let registry = AgentRegistry::new(storage.clone());
        (storage, registry)
    }

    fn config(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_register_creates_in_init() -> WardenResult<()> {
        let (_, registry) = registry();
        let state = registry
            .register_agent("a1", Some(vec![AgentCapability::new(["git"], "1")]), None)
            .await?;
        assert_eq!(state.status, AgentStatus::Init);
        assert!(state.has_capability("git"));
        assert_eq!(registry.get_agent("a1").await?, Some(state));
        Ok(())
    }

    #[tokio::test]
    async fn test_register_rejects_blank_id() {
        let (_, registry) = registry();
        let err = registry.register_agent("", None, None).await.unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
    }

    #[tokio::test]
    async fn test_reregister_replaces_capabilities_and_merges_config() -> WardenResult<()> {
        let (_, registry) = registry();
        registry
            .register_agent(
                "a1",
                Some(vec![AgentCapability::new(["git"], "1")]),
                Some(config(&[("model", json!("small")), ("region", json!("eu"))])),
            )
            .await?;

        let state = registry
            .register_agent(
                "a1",
                Some(vec![AgentCapability::new(["cargo"], "2")]),
                Some(config(&[("model", json!("large"))])),
            )
            .await?;

        assert!(!state.has_capability("git"));
        assert!(state.has_capability("cargo"));
        assert_eq!(state.config["model"], json!("large"));
        assert_eq!(state.config["region"], json!("eu"));
        Ok(())
    }

    #[tokio::test]
    async fn test_reregister_without_capabilities_keeps_them() -> WardenResult<()> {
        let (_, registry) = registry();
        registry
            .register_agent("a1", Some(vec![AgentCapability::new(["git"], "1")]), None)
            .await?;
        let state = registry.register_agent("a1", None, None).await?;
        assert!(state.has_capability("git"));
        Ok(())
    }

    #[tokio::test]
    async fn test_reregister_after_error_resets_to_init() -> WardenResult<()> {
        let (_, registry) = registry();
        registry.register_agent("a1", None, None).await?;
        registry.update_agent_status("a1", AgentStatus::Error).await?;

        let state = registry.register_agent("a1", None, None).await?;
        assert_eq!(state.status, AgentStatus::Init);
        Ok(())
    }

    #[tokio::test]
    async fn test_reregister_keeps_active_status() -> WardenResult<()> {
        let (_, registry) = registry();
        registry.register_agent("a1", None, None).await?;
        registry.update_agent_status("a1", AgentStatus::Active).await?;

        let state = registry.register_agent("a1", None, None).await?;
        assert_eq!(state.status, AgentStatus::Active);
        Ok(())
    }

    #[tokio::test]
    async fn test_unregister_parks_agent() -> WardenResult<()> {
        let (storage, registry) = registry();
        registry.register_agent("a1", None, None).await?;
        registry.record_task_result("a1", true, Duration::from_secs(3)).await?;

        assert!(registry.unregister_agent("a1").await?);
        let state = registry.get_agent("a1").await?.unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert_eq!(state.metrics.tasks_completed, 1);
        assert_eq!(storage.agent_count()?, 1);

        assert!(!registry.unregister_agent("ghost").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_status_is_fail_open() -> WardenResult<()> {
        let (_, registry) = registry();
        registry.register_agent("a1", None, None).await?;

        // INIT -> IDLE is not in the expected table but is still applied.
        let state = registry.update_agent_status("a1", AgentStatus::Idle).await?;
        assert_eq!(state.map(|s| s.status), Some(AgentStatus::Idle));

        assert!(registry
            .update_agent_status("ghost", AgentStatus::Active)
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_on_startup_promotes_idle_and_error() -> WardenResult<()> {
        let (_, registry) = registry();
        registry.register_agent("idle", None, None).await?;
        registry.update_agent_status("idle", AgentStatus::Idle).await?;
        registry.register_agent("err", None, None).await?;
        registry.update_agent_status("err", AgentStatus::Error).await?;
        registry.register_agent("init", None, None).await?;

        let idle = registry.initialize_agent_on_startup("idle", None, None).await?;
        let err = registry.initialize_agent_on_startup("err", None, None).await?;
        let init = registry.initialize_agent_on_startup("init", None, None).await?;
        let fresh = registry.initialize_agent_on_startup("fresh", None, None).await?;

        assert_eq!(idle.status, AgentStatus::Active);
        assert_eq!(err.status, AgentStatus::Active);
        assert_eq!(init.status, AgentStatus::Init);
        assert_eq!(fresh.status, AgentStatus::Init);
        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_on_startup_merges_config() -> WardenResult<()> {
        let (_, registry) = registry();
        registry
            .register_agent("a1", None, Some(config(&[("a", json!(1))])))
            .await?;
        let state = registry
            .initialize_agent_on_startup("a1", None, Some(config(&[("b", json!(2))])))
            .await?;
        assert_eq!(state.config.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_agents_with_filters() -> WardenResult<()> {
        let (storage, registry) = registry();
        registry
            .register_agent("coder", Some(vec![AgentCapability::new(["git", "cargo"], "1")]), None)
            .await?;
        registry
            .register_agent("writer", Some(vec![AgentCapability::new(["markdown"], "1")]), None)
            .await?;
        registry.update_agent_status("coder", AgentStatus::Active).await?;
        storage.agent_state_claim_task("coder", "t1").await?;

        let active = registry.list_agents(Some(AgentStatus::Active), None).await?;
        assert_eq!(active.len(), 1);

        let busy = AgentFilter::default().with_has_task(true);
        let busy = registry.list_agents(None, Some(&busy)).await?;
        assert_eq!(busy.iter().map(|s| s.agent_id.as_str()).collect::<Vec<_>>(), ["coder"]);

        let free = AgentFilter::default().with_has_task(false);
        let free = registry.list_agents(None, Some(&free)).await?;
        assert_eq!(free.iter().map(|s| s.agent_id.as_str()).collect::<Vec<_>>(), ["writer"]);

        let cargo = registry.get_agent_by_capability("cargo").await?;
        assert_eq!(cargo.len(), 1);
        assert!(registry.get_agent_by_capability("docker").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_available_agents_excludes_init_and_error() -> WardenResult<()> {
        let (_, registry) = registry();
        for (id, status) in [
            ("init", AgentStatus::Init),
            ("active", AgentStatus::Active),
            ("idle", AgentStatus::Idle),
            ("error", AgentStatus::Error),
        ] {
            registry.register_agent(id, None, None).await?;
            registry.update_agent_status(id, status).await?;
        }

        let available = registry.get_available_agents().await?;
        let ids: Vec<_> = available.iter().map(|s| s.agent_id.as_str()).collect();
        assert_eq!(ids, ["active", "idle"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_task_result_updates_metrics_and_clears_task() -> WardenResult<()> {
        let (storage, registry) = registry();
        registry.register_agent("a1", None, None).await?;
        storage.agent_state_claim_task("a1", "t1").await?;

        registry.record_task_result("a1", true, Duration::from_secs(2)).await?;
        let state = registry
            .record_task_result("a1", false, Duration::from_secs(4))
            .await?
            .unwrap();

        assert!(state.current_task_id.is_none());
        assert_eq!(state.metrics.tasks_completed, 2);
        assert_eq!(state.metrics.tasks_failed, 1);
        assert!((state.metrics.success_rate - 0.5).abs() < 1e-9);
        assert!((state.metrics.avg_execution_time - 3.0).abs() < 1e-9);
        assert!(registry
            .record_task_result("ghost", true, Duration::ZERO)
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_reregister_and_startup_keep_claimed_task() -> WardenResult<()> {
        let (storage, registry) = registry();
        registry.register_agent("a1", None, None).await?;
        storage.agent_state_claim_task("a1", "t1").await?;

        let state = registry.register_agent("a1", None, None).await?;
        assert_eq!(state.current_task_id.as_deref(), Some("t1"));
        let state = registry.initialize_agent_on_startup("a1", None, None).await?;
        assert_eq!(state.current_task_id.as_deref(), Some("t1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_record_failure_sets_error_and_details() -> WardenResult<()> {
        let (_, registry) = registry();
        registry.register_agent("a1", None, None).await?;
        let state = registry
            .record_failure("a1", json!({"reason": "segfault"}))
            .await?
            .unwrap();
        assert_eq!(state.status, AgentStatus::Error);
        assert_eq!(state.last_error, Some(json!({"reason": "segfault"})));
        Ok(())
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() -> WardenResult<()> {
        let (storage, registry) = registry();
        storage.disconnect().await?;
        let err = registry.register_agent("a1", None, None).await.unwrap_err();
        assert_eq!(err, WardenError::Storage(StorageError::NotConnected));
        assert!(registry.get_available_agents().await.is_err());
        Ok(())
    }
}

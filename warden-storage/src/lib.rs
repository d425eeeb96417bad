//! WARDEN Storage - Storage Trait and Mock Implementation
//!
//! Defines the persistence boundary for agent state and resource leases.
//! Durable backends (SQL, KV) live outside this workspace and implement
//! [`CoordinationStorage`]; [`MockStorage`] is the in-memory implementation
//! used by tests and single-process deployments.

mod mock;

pub use mock::MockStorage;

use ::async_trait::async_trait;
use std::time::Duration;
use warden_core::{
    AgentCapability, AgentId, AgentMetrics, AgentState, AgentStatus, JsonMap, ResourceLock,
    TaskId, Timestamp, WardenResult,
};

// ============================================================================
// UPDATE TYPES
// ============================================================================

/// Status change that only applies when the stored status is one of `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPromotion {
    pub from: &'static [AgentStatus],
    pub to: AgentStatus,
}

impl StatusPromotion {
    /// Status the row ends up in when it currently holds `current`.
    pub fn resolve(&self, current: AgentStatus) -> AgentStatus {
        if self.from.contains(&current) {
            self.to
        } else {
            current
        }
    }
}

/// One finished task, folded into the stored metrics by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    pub succeeded: bool,
    pub execution_time: Duration,
}

/// Partial update payload for an agent state row.
///
/// `None` leaves a field untouched. Nullable fields use a nested `Option` so
/// an update can clear them. The relative fields (`promote_status`,
/// `release_task`, `merge_config`, `record_result`) are evaluated against the
/// stored row inside the backend's write, so concurrent writers never
/// overwrite each other's changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentStateUpdate {
    /// New status
    pub status: Option<AgentStatus>,
    /// Status change conditional on the stored status, applied after `status`
    pub promote_status: Option<StatusPromotion>,
    /// New current task (`Some(None)` clears it)
    pub current_task_id: Option<Option<TaskId>>,
    /// Clear the current task only if it still equals this one
    pub release_task: Option<TaskId>,
    /// Replacement capability list
    pub capabilities: Option<Vec<AgentCapability>>,
    /// Replacement config map
    pub config: Option<JsonMap>,
    /// Keys shallow-merged into the stored config, new keys winning
    pub merge_config: Option<JsonMap>,
    /// Replacement metrics
    pub metrics: Option<AgentMetrics>,
    /// Task result folded into the stored metrics
    pub record_result: Option<TaskOutcome>,
    /// New last error (`Some(None)` clears it)
    pub last_error: Option<Option<serde_json::Value>>,
}

impl AgentStateUpdate {
    /// Update that only changes the status.
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Check whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the update to `state` in place and bump `updated_at`.
    pub fn apply_to(self, state: &mut AgentState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(promotion) = self.promote_status {
            state.status = promotion.resolve(state.status);
        }
        if let Some(current_task_id) = self.current_task_id {
            state.current_task_id = current_task_id;
        }
        if let Some(task_id) = self.release_task {
            if state.current_task_id.as_deref() == Some(task_id.as_str()) {
                state.current_task_id = None;
            }
        }
        if let Some(capabilities) = self.capabilities {
            state.capabilities = capabilities;
        }
        if let Some(config) = self.config {
            state.config = config;
        }
        if let Some(config) = self.merge_config {
            state.merge_config(config);
        }
        if let Some(metrics) = self.metrics {
            state.metrics = metrics;
        }
        if let Some(outcome) = self.record_result {
            state.metrics.record(outcome.succeeded, outcome.execution_time);
        }
        if let Some(last_error) = self.last_error {
            state.last_error = last_error;
        }
        state.touch();
    }
}

/// Outcome of an atomic task claim.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskClaim {
    /// The agent now owns the task (or already did)
    Claimed(AgentState),
    /// Another agent owns the task; nothing was written
    HeldBy(AgentId),
    /// No agent state exists for the claimant
    UnknownAgent,
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Persistence interface for agent state rows and the lease table.
///
/// Implementations must make `lock_try_insert`, `agent_state_claim_task`,
/// `agent_state_insert` and `agent_state_update` atomic with respect to
/// concurrent callers (a transaction or a unique constraint in SQL
/// backends). `agent_state_update` in particular is a read-modify-write of
/// one row. Every other operation needs only per-row atomicity.
#[async_trait]
pub trait CoordinationStorage: Send + Sync {
    // === Connection Lifecycle ===

    /// Open the connection to the backing store.
    async fn connect(&self) -> WardenResult<()>;

    /// Close the connection. Subsequent calls fail with `StorageError::NotConnected`.
    async fn disconnect(&self) -> WardenResult<()>;

    // === Agent State Operations ===

    /// Load an agent state by ID.
    async fn agent_state_get(&self, agent_id: &str) -> WardenResult<Option<AgentState>>;

    /// Insert or replace an agent state.
    async fn agent_state_save(&self, state: &AgentState) -> WardenResult<()>;

    /// Insert `state` unless a row for its agent already exists. Returns
    /// `false` (nothing written) if one does.
    async fn agent_state_insert(&self, state: &AgentState) -> WardenResult<bool>;

    /// Apply a partial update to the stored row. Returns `None` if the agent
    /// is unknown.
    async fn agent_state_update(
        &self,
        agent_id: &str,
        update: AgentStateUpdate,
    ) -> WardenResult<Option<AgentState>>;

    /// List agent states, optionally restricted to one status.
    async fn agent_state_list(&self, status: Option<AgentStatus>) -> WardenResult<Vec<AgentState>>;

    /// Atomically set `current_task_id` on `agent_id` unless another agent
    /// already owns `task_id`.
    async fn agent_state_claim_task(&self, agent_id: &str, task_id: &str)
        -> WardenResult<TaskClaim>;

    /// Clear `current_task_id` on `agent_id` if it equals `task_id`.
    async fn agent_state_release_task(&self, agent_id: &str, task_id: &str) -> WardenResult<bool>;

    // === Lock Operations ===

    /// Atomically check `lock` against the unexpired rows on its resource and
    /// insert it if compatible. Returns `false` (nothing written) on conflict.
    ///
    /// A compatible request from an agent that already has a row on the
    /// resource replaces that row.
    async fn lock_try_insert(&self, lock: &ResourceLock, now: Timestamp) -> WardenResult<bool>;

    /// Delete the unexpired row owned by `agent_id` on `resource_id`.
    async fn lock_delete(&self, resource_id: &str, agent_id: &str, now: Timestamp)
        -> WardenResult<bool>;

    /// Delete every row owned by `agent_id`. Returns how many were unexpired.
    async fn lock_delete_by_agent(&self, agent_id: &str, now: Timestamp) -> WardenResult<usize>;

    /// List unexpired rows on `resource_id`.
    async fn lock_list_by_resource(
        &self,
        resource_id: &str,
        now: Timestamp,
    ) -> WardenResult<Vec<ResourceLock>>;

    /// Move the expiry of an unexpired row. Returns `None` if there is no such row.
    async fn lock_extend(
        &self,
        resource_id: &str,
        agent_id: &str,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> WardenResult<Option<ResourceLock>>;

    /// Physically remove expired rows. Hygiene only.
    async fn lock_purge_expired(&self, now: Timestamp) -> WardenResult<usize>;
}

// ============================================================================
// TESTS
// ============================================================================

//! Resource lease engine and task assignment.
//!
//! Leases are rows in the storage lock table keyed by `(resource_id, agent_id)`.
//! Expiry is lazy: every read and acquire evaluates `is_expired` against a
//! single clock read, so an abandoned lease stops blocking once its TTL
//! passes even if nobody ever deletes it.

use crate::registry::AgentRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warden_core::{
    validate_identifier, AgentId, CoordinationConfig, JsonMap, LockType, ResourceLock,
    ValidationError, WardenError, WardenResult,
};
use warden_storage::{CoordinationStorage, TaskClaim};

// ============================================================================
// ACQUIRE OPTIONS
// ============================================================================

/// Options for [`AgentCoordination::acquire_resource_lock`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockOptions {
    /// Requested mode (default exclusive)
    pub lock_type: LockType,
    /// Lease length; `None` uses the configured default
    pub ttl: Option<Duration>,
    /// Keep retrying on contention instead of failing immediately
    pub wait: bool,
    /// Wait budget override; `None` uses the configured maximum
    pub max_wait: Option<Duration>,
    /// Stored alongside the lease
    pub metadata: JsonMap,
}

impl LockOptions {
    pub fn exclusive() -> Self {
        Self::default()
    }

    pub fn shared() -> Self {
        Self {
            lock_type: LockType::Shared,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Retry on contention for up to the configured wait budget.
    pub fn waiting(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Retry on contention for up to `max_wait`.
    pub fn waiting_for(mut self, max_wait: Duration) -> Self {
        self.wait = true;
        self.max_wait = Some(max_wait);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }
}

// ============================================================================
// COORDINATION ENGINE
// ============================================================================

/// Lease acquisition, multi-resource reservation and task assignment.
///
/// Holds the same storage client as its [`AgentRegistry`]. Cheap to share
/// behind an `Arc`; every method takes `&self`.
pub struct AgentCoordination {
    storage: Arc<dyn CoordinationStorage>,
    registry: AgentRegistry,
    config: CoordinationConfig,
}

impl std::fmt::Debug for AgentCoordination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCoordination")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentCoordination {
    /// Create an engine with the default configuration.
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            storage: registry.storage().clone(),
            registry,
            config: CoordinationConfig::default(),
        }
    }

    /// Create an engine with an explicit configuration.
    pub fn with_config(registry: AgentRegistry, config: CoordinationConfig) -> WardenResult<Self> {
        config.validate()?;
        Ok(Self {
            storage: registry.storage().clone(),
            registry,
            config,
        })
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    // === Leases ===

    /// Try to take a lease on `resource_id` for `agent_id`.
    ///
    /// Returns `false` when the request is incompatible with the unexpired
    /// leases on the resource. In waiting mode the attempt is repeated every
    /// `lock_retry_interval` until it succeeds or the wait budget runs out.
    pub async fn acquire_resource_lock(
        &self,
        resource_id: &str,
        agent_id: &str,
        options: LockOptions,
    ) -> WardenResult<bool> {
        validate_identifier("resource_id", resource_id)?;
        validate_identifier("agent_id", agent_id)?;

        let ttl = options.ttl.unwrap_or(self.config.default_lock_ttl);
        let deadline = if options.wait {
            let budget = options.max_wait.unwrap_or(self.config.max_lock_wait);
            let deadline = Instant::now().checked_add(budget).ok_or_else(|| {
                WardenError::Validation(ValidationError::InvalidValue {
                    field: "max_wait".to_string(),
                    reason: format!("wait budget {:?} is out of range", budget),
                })
            })?;
            Some(deadline)
        } else {
            None
        };
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let now = warden_core::now();
            let lock = ResourceLock::new(resource_id, agent_id, options.lock_type, ttl, now)?
                .with_metadata(options.metadata.clone());

            if self.storage.lock_try_insert(&lock, now).await? {
                debug!(
                    resource_id = %resource_id,
                    agent_id = %agent_id,
                    lock_type = %options.lock_type,
                    expires_at = %lock.expires_at,
                    attempts,
                    "Lock acquired"
                );
                return Ok(true);
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::ZERO,
            };
            if remaining.is_zero() {
                debug!(
                    resource_id = %resource_id,
                    agent_id = %agent_id,
                    lock_type = %options.lock_type,
                    attempts,
                    "Lock contended"
                );
                return Ok(false);
            }

            tokio::time::sleep(self.config.lock_retry_interval.min(remaining)).await;
        }
    }

    /// Drop the caller's unexpired lease on `resource_id`.
    pub async fn release_resource_lock(&self, resource_id: &str, agent_id: &str) -> WardenResult<bool> {
        let released = self
            .storage
            .lock_delete(resource_id, agent_id, warden_core::now())
            .await?;
        if released {
            debug!(resource_id = %resource_id, agent_id = %agent_id, "Lock released");
        }
        Ok(released)
    }

    /// Drop every lease owned by `agent_id`. Returns how many were still live.
    pub async fn release_all_agent_locks(&self, agent_id: &str) -> WardenResult<usize> {
        let released = self
            .storage
            .lock_delete_by_agent(agent_id, warden_core::now())
            .await?;
        info!(agent_id = %agent_id, released, "Released all agent locks");
        Ok(released)
    }

    /// Unexpired leases on `resource_id`.
    pub async fn get_resource_locks(&self, resource_id: &str) -> WardenResult<Vec<ResourceLock>> {
        self.storage
            .lock_list_by_resource(resource_id, warden_core::now())
            .await
    }

    /// `true` if no unexpired exclusive lease is held on `resource_id`.
    ///
    /// A shared lease alone leaves the resource available.
    pub async fn check_resource_available(&self, resource_id: &str) -> WardenResult<bool> {
        let locks = self.get_resource_locks(resource_id).await?;
        Ok(!locks.iter().any(ResourceLock::is_exclusive))
    }

    /// Push an unexpired lease's expiry to `now + ttl`.
    ///
    /// Returns `false` if the agent holds no live lease on the resource; an
    /// expired lease must be re-acquired.
    pub async fn renew_resource_lock(
        &self,
        resource_id: &str,
        agent_id: &str,
        ttl: Option<Duration>,
    ) -> WardenResult<bool> {
        let ttl = ttl.unwrap_or(self.config.default_lock_ttl);
        let now = warden_core::now();
        let Some(current) = self
            .storage
            .lock_list_by_resource(resource_id, now)
            .await?
            .into_iter()
            .find(|lock| lock.agent_id == agent_id)
        else {
            return Ok(false);
        };

        let mut renewed = current;
        renewed.extend(ttl, now)?;
        let extended = self
            .storage
            .lock_extend(resource_id, agent_id, renewed.expires_at, now)
            .await?;
        if let Some(lock) = &extended {
            debug!(
                resource_id = %resource_id,
                agent_id = %agent_id,
                expires_at = %lock.expires_at,
                "Lock renewed"
            );
        }
        Ok(extended.is_some())
    }

    /// Remove expired rows from storage. Reads already ignore them.
    pub async fn purge_expired_locks(&self) -> WardenResult<usize> {
        let purged = self.storage.lock_purge_expired(warden_core::now()).await?;
        if purged > 0 {
            debug!(purged, "Purged expired locks");
        }
        Ok(purged)
    }

    // === Multi-resource reservation ===

    /// Exclusively lock every resource in `required_resources` for `agent_id`,
    /// or none of them.
    ///
    /// Acquires in order without waiting. On the first refusal every lease
    /// taken by this call is released again and `false` is returned.
    /// Duplicate names are reserved once.
    pub async fn coordinate_task_assignment<R: AsRef<str> + Sync>(
        &self,
        task_id: &str,
        agent_id: &str,
        required_resources: &[R],
    ) -> WardenResult<bool> {
        validate_identifier("task_id", task_id)?;

        let mut acquired: Vec<&str> = Vec::with_capacity(required_resources.len());
        for resource in required_resources {
            let resource_id = resource.as_ref();
            if acquired.contains(&resource_id) {
                continue;
            }

            let outcome = self
                .acquire_resource_lock(resource_id, agent_id, LockOptions::exclusive())
                .await;
            match outcome {
                Ok(true) => acquired.push(resource_id),
                Ok(false) => {
                    info!(
                        task_id = %task_id,
                        agent_id = %agent_id,
                        blocked_on = %resource_id,
                        rolled_back = acquired.len(),
                        "Task reservation refused"
                    );
                    self.roll_back(agent_id, &acquired).await;
                    return Ok(false);
                }
                Err(e) => {
                    self.roll_back(agent_id, &acquired).await;
                    return Err(e);
                }
            }
        }

        info!(
            task_id = %task_id,
            agent_id = %agent_id,
            resources = acquired.len(),
            "Task resources reserved"
        );
        Ok(true)
    }

    async fn roll_back(&self, agent_id: &str, acquired: &[&str]) {
        for resource_id in acquired.iter().rev() {
            if let Err(e) = self.release_resource_lock(resource_id, agent_id).await {
                warn!(
                    resource_id = %resource_id,
                    agent_id = %agent_id,
                    error = %e,
                    "Failed to roll back lock, it will expire on its own"
                );
            }
        }
    }

    // === Failure handling ===

    /// Release every lease held by `agent_id` and mark it `Error`.
    ///
    /// Best effort: sub-step failures are logged and the call still reports
    /// `true`. The task assignment is kept so the failed task can be found.
    pub async fn handle_agent_failure(&self, agent_id: &str, error_info: serde_json::Value) -> bool {
        if let Err(e) = self.release_all_agent_locks(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to release locks of failed agent");
        }

        match self.registry.record_failure(agent_id, error_info).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(agent_id = %agent_id, "Failure reported for unknown agent"),
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to record agent failure"),
        }
        true
    }

    // === Task assignment ===

    /// Assign `task_id` to `agent_id` unless another agent already has it.
    ///
    /// Returns `false` on conflict or for an unknown agent, without writing.
    pub async fn assign_task_to_agent(&self, task_id: &str, agent_id: &str) -> WardenResult<bool> {
        validate_identifier("task_id", task_id)?;
        validate_identifier("agent_id", agent_id)?;

        match self.storage.agent_state_claim_task(agent_id, task_id).await? {
            TaskClaim::Claimed(_) => {
                info!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
                Ok(true)
            }
            TaskClaim::HeldBy(holder) => {
                debug!(
                    task_id = %task_id,
                    agent_id = %agent_id,
                    holder = %holder,
                    "Task already assigned"
                );
                Ok(false)
            }
            TaskClaim::UnknownAgent => {
                debug!(task_id = %task_id, agent_id = %agent_id, "Task assignment to unknown agent");
                Ok(false)
            }
        }
    }

    /// The agent currently holding `task_id`, if any.
    pub async fn check_task_assignment(&self, task_id: &str) -> WardenResult<Option<AgentId>> {
        let states = self.storage.agent_state_list(None).await?;
        Ok(states
            .into_iter()
            .find(|s| s.current_task_id.as_deref() == Some(task_id))
            .map(|s| s.agent_id))
    }

    /// Clear `task_id` from `agent_id`. Returns `false` if the agent does not hold it.
    pub async fn release_task_assignment(&self, task_id: &str, agent_id: &str) -> WardenResult<bool> {
        let released = self
            .storage
            .agent_state_release_task(agent_id, task_id)
            .await?;
        if released {
            info!(task_id = %task_id, agent_id = %agent_id, "Task assignment released");
        }
        Ok(released)
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! WARDEN Test Utilities
//!
//! Centralized test infrastructure for the WARDEN workspace:
//! - Proptest generators for agent and lease types
//! - A fault-injecting storage wrapper
//! - Test fixtures for common scenarios
//! - Custom assertions for coordination invariants
//! - Tracing setup for tests

// Re-export storage and engine types from their source crates
pub use warden_agents::{lock_sweeper_task, AgentCoordination, AgentRegistry, LockOptions};
pub use warden_storage::{
    AgentStateUpdate, CoordinationStorage, MockStorage, StatusPromotion, TaskClaim, TaskOutcome,
};

// Re-export core types for convenience
pub use warden_core::{
    AgentCapability, AgentFilter, AgentId, AgentMetrics, AgentState, AgentStatus, ConfigError,
    CoordinationConfig, JsonMap, LockType, ResourceId, ResourceLock, StorageError, TaskId,
    Timestamp, ValidationError, WardenError, WardenResult,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Storage operations that [`FaultyStorage`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Connect,
    Disconnect,
    AgentStateGet,
    AgentStateSave,
    AgentStateInsert,
    AgentStateUpdate,
    AgentStateList,
    AgentStateClaimTask,
    AgentStateReleaseTask,
    LockTryInsert,
    LockDelete,
    LockDeleteByAgent,
    LockListByResource,
    LockExtend,
    LockPurgeExpired,
}

/// A write from another caller that [`FaultyStorage`] slips in right after
/// an `agent_state_get` returns, to reproduce read-then-write races.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interleaved {
    ClaimTask { agent_id: AgentId, task_id: TaskId },
    ReleaseTask { agent_id: AgentId, task_id: TaskId },
}

impl Interleaved {
    pub fn claim(agent_id: &str, task_id: &str) -> Self {
        Self::ClaimTask {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
        }
    }

    pub fn release(agent_id: &str, task_id: &str) -> Self {
        Self::ReleaseTask {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
        }
    }
}

/// [`MockStorage`] wrapper that fails selected operations with
/// `StorageError::Backend` until they are healed, and can interleave
/// foreign writes between a read and the caller's next call.
#[derive(Debug, Default)]
pub struct FaultyStorage {
    inner: MockStorage,
    // op -> calls still allowed to succeed before failing
    failing: Mutex<HashMap<StorageOp, usize>>,
    interleaved: Mutex<Vec<Interleaved>>,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped storage, for seeding and inspection without faults.
    pub fn inner(&self) -> &MockStorage {
        &self.inner
    }

    /// Make every future call of `op` fail.
    pub fn fail(&self, op: StorageOp) {
        self.failing_ops().insert(op, 0);
    }

    /// Let the next `successes` calls of `op` through, then fail the rest.
    pub fn fail_after(&self, op: StorageOp, successes: usize) {
        self.failing_ops().insert(op, successes);
    }

    /// Let `op` succeed again.
    pub fn heal(&self, op: StorageOp) {
        self.failing_ops().remove(&op);
    }

    pub fn heal_all(&self) {
        self.failing_ops().clear();
    }

    /// Run `writes` against the inner storage right after the next
    /// `agent_state_get`, before its result reaches the caller.
    pub fn interleave_after_next_get(&self, writes: impl IntoIterator<Item = Interleaved>) {
        self.interleaved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(writes);
    }

    async fn run_interleaved(&self) -> WardenResult<()> {
        let writes = std::mem::take(
            &mut *self
                .interleaved
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for write in writes {
            match write {
                Interleaved::ClaimTask { agent_id, task_id } => {
                    self.inner.agent_state_claim_task(&agent_id, &task_id).await?;
                }
                Interleaved::ReleaseTask { agent_id, task_id } => {
                    self.inner.agent_state_release_task(&agent_id, &task_id).await?;
                }
            }
        }
        Ok(())
    }

    fn failing_ops(&self) -> std::sync::MutexGuard<'_, HashMap<StorageOp, usize>> {
        // A test that panicked mid-update leaves the set usable.
        self.failing.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, op: StorageOp) -> WardenResult<()> {
        match self.failing_ops().get_mut(&op) {
            Some(0) => Err(WardenError::Storage(StorageError::Backend {
                reason: format!("injected failure in {:?}", op),
            })),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CoordinationStorage for FaultyStorage {
    async fn connect(&self) -> WardenResult<()> {
        self.check(StorageOp::Connect)?;
        self.inner.connect().await
    }

    async fn disconnect(&self) -> WardenResult<()> {
        self.check(StorageOp::Disconnect)?;
        self.inner.disconnect().await
    }

    async fn agent_state_get(&self, agent_id: &str) -> WardenResult<Option<AgentState>> {
        self.check(StorageOp::AgentStateGet)?;
        let state = self.inner.agent_state_get(agent_id).await?;
        self.run_interleaved().await?;
        Ok(state)
    }

    async fn agent_state_save(&self, state: &AgentState) -> WardenResult<()> {
        self.check(StorageOp::AgentStateSave)?;
        self.inner.agent_state_save(state).await
    }

    async fn agent_state_insert(&self, state: &AgentState) -> WardenResult<bool> {
        self.check(StorageOp::AgentStateInsert)?;
        self.inner.agent_state_insert(state).await
    }

    async fn agent_state_update(
        &self,
        agent_id: &str,
        update: AgentStateUpdate,
    ) -> WardenResult<Option<AgentState>> {
        self.check(StorageOp::AgentStateUpdate)?;
        self.inner.agent_state_update(agent_id, update).await
    }

    async fn agent_state_list(&self, status: Option<AgentStatus>) -> WardenResult<Vec<AgentState>> {
        self.check(StorageOp::AgentStateList)?;
        self.inner.agent_state_list(status).await
    }

    async fn agent_state_claim_task(
        &self,
        agent_id: &str,
        task_id: &str,
    ) -> WardenResult<TaskClaim> {
        self.check(StorageOp::AgentStateClaimTask)?;
        self.inner.agent_state_claim_task(agent_id, task_id).await
    }

    async fn agent_state_release_task(&self, agent_id: &str, task_id: &str) -> WardenResult<bool> {
        self.check(StorageOp::AgentStateReleaseTask)?;
        self.inner.agent_state_release_task(agent_id, task_id).await
    }

    async fn lock_try_insert(&self, lock: &ResourceLock, now: Timestamp) -> WardenResult<bool> {
        self.check(StorageOp::LockTryInsert)?;
        self.inner.lock_try_insert(lock, now).await
    }

    async fn lock_delete(
        &self,
        resource_id: &str,
        agent_id: &str,
        now: Timestamp,
    ) -> WardenResult<bool> {
        self.check(StorageOp::LockDelete)?;
        self.inner.lock_delete(resource_id, agent_id, now).await
    }

    async fn lock_delete_by_agent(&self, agent_id: &str, now: Timestamp) -> WardenResult<usize> {
        self.check(StorageOp::LockDeleteByAgent)?;
        self.inner.lock_delete_by_agent(agent_id, now).await
    }

    async fn lock_list_by_resource(
        &self,
        resource_id: &str,
        now: Timestamp,
    ) -> WardenResult<Vec<ResourceLock>> {
        self.check(StorageOp::LockListByResource)?;
        self.inner.lock_list_by_resource(resource_id, now).await
    }

    async fn lock_extend(
        &self,
        resource_id: &str,
        agent_id: &str,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> WardenResult<Option<ResourceLock>> {
        self.check(StorageOp::LockExtend)?;
        self.inner
            .lock_extend(resource_id, agent_id, expires_at, now)
            .await
    }

    async fn lock_purge_expired(&self, now: Timestamp) -> WardenResult<usize> {
        self.check(StorageOp::LockPurgeExpired)?;
        self.inner.lock_purge_expired(now).await
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`. Output goes through the test
/// writer so it is captured per test.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating WARDEN types.

    use super::*;
    use proptest::prelude::*;

    // === Identity Generators ===

    /// Generate a non-blank agent ID.
    pub fn arb_agent_id() -> impl Strategy<Value = AgentId> {
        "[a-z][a-z0-9-]{2,15}"
    }

    /// Generate a resource name shaped like a file, repo or quota bucket.
    pub fn arb_resource_id() -> impl Strategy<Value = ResourceId> {
        prop_oneof![
            "repo-[0-9]{1,3}",
            "file:/src/[a-z]{3,8}\\.rs",
            "quota/[a-z]{3,6}",
        ]
    }

    /// Generate a task ID.
    pub fn arb_task_id() -> impl Strategy<Value = TaskId> {
        "task-[0-9a-f]{8}"
    }

    // === Enum Generators ===

    pub fn arb_agent_status() -> impl Strategy<Value = AgentStatus> {
        prop::sample::select(AgentStatus::ALL.to_vec())
    }

    pub fn arb_lock_type() -> impl Strategy<Value = LockType> {
        prop_oneof![Just(LockType::Exclusive), Just(LockType::Shared)]
    }

    // === Entity Generators ===

    /// Generate a capability with 1-5 tools.
    pub fn arb_capability() -> impl Strategy<Value = AgentCapability> {
        (
            prop::collection::btree_set("[a-z]{3,10}", 1..5),
            "[0-9]\\.[0-9]",
        )
            .prop_map(|(tools, version)| AgentCapability::new(tools, &version))
    }

    /// Generate a task execution time up to one minute.
    pub fn arb_execution_time() -> impl Strategy<Value = Duration> {
        (0u64..60_000).prop_map(Duration::from_millis)
    }

    /// Generate a sequence of task outcomes.
    pub fn arb_task_outcomes() -> impl Strategy<Value = Vec<(bool, Duration)>> {
        prop::collection::vec((any::<bool>(), arb_execution_time()), 0..50)
    }

    /// Generate a valid agent state.
    pub fn arb_agent_state() -> impl Strategy<Value = AgentState> {
        (
            arb_agent_id(),
            arb_agent_status(),
            prop::option::of(arb_task_id()),
            prop::collection::vec(arb_capability(), 0..3),
            arb_task_outcomes(),
        )
            .prop_map(|(agent_id, status, task, capabilities, outcomes)| {
                let mut state = AgentState::new(&agent_id).with_capabilities(capabilities);
                state.status = status;
                state.current_task_id = task;
                for (succeeded, execution_time) in outcomes {
                    state.metrics.record(succeeded, execution_time);
                }
                state
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Configuration with short waits so contention tests finish quickly.
    pub fn fast_config() -> CoordinationConfig {
        CoordinationConfig::default()
            .with_wait(Duration::from_millis(200), Duration::from_millis(10))
            .with_sweep_interval(Duration::from_millis(50))
    }

    pub fn coder_capability() -> AgentCapability {
        AgentCapability::new(["git", "cargo", "rustfmt"], "1.0")
    }

    pub fn reviewer_capability() -> AgentCapability {
        AgentCapability::new(["git", "diff"], "1.0")
    }

    /// A lease that expired a minute ago, for seeding storage directly.
    pub fn expired_lock(resource_id: &str, agent_id: &str, lock_type: LockType) -> ResourceLock {
        let acquired_at = warden_core::now() - chrono::Duration::seconds(120);
        ResourceLock::new(resource_id, agent_id, lock_type, Duration::from_secs(60), acquired_at)
            .expect("fixture lock is valid")
    }

    /// Registry and coordination engine over one fresh [`MockStorage`].
    pub struct TestHarness {
        pub storage: Arc<MockStorage>,
        pub registry: AgentRegistry,
        pub coordination: Arc<AgentCoordination>,
    }

    impl TestHarness {
        pub fn new() -> Self {
            Self::with_config(fast_config())
        }

        pub fn with_config(config: CoordinationConfig) -> Self {
            let storage = Arc::new(MockStorage::new());
            let registry = AgentRegistry::new(storage.clone());
            let coordination = AgentCoordination::with_config(registry.clone(), config)
                .expect("fixture config is valid");
            Self {
                storage,
                registry,
                coordination: Arc::new(coordination),
            }
        }

        /// Register `agent_id` and move it to `Active`.
        pub async fn register_active(&self, agent_id: &str) -> WardenResult<AgentState> {
            self.registry.register_agent(agent_id, None, None).await?;
            self.registry
                .update_agent_status(agent_id, AgentStatus::Active)
                .await?
                .ok_or_else(|| {
                    WardenError::Storage(StorageError::NotFound {
                        entity: "agent",
                        id: agent_id.to_string(),
                    })
                })
        }
    }

    impl Default for TestHarness {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Coordination engine over a [`FaultyStorage`].
    pub fn faulty_coordination() -> (Arc<FaultyStorage>, Arc<AgentCoordination>) {
        let storage = Arc::new(FaultyStorage::new());
        let registry = AgentRegistry::new(storage.clone());
        let coordination = AgentCoordination::with_config(registry, fast_config())
            .expect("fixture config is valid");
        (storage, Arc::new(coordination))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for WARDEN-specific validation.

    use super::*;

    /// Assert that a WardenResult is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &WardenResult<T>) {
        match result {
            Err(WardenError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    /// Assert that a WardenResult is a Storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &WardenResult<T>) {
        match result {
            Err(WardenError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that a set of unexpired leases on one resource is admissible:
    /// at most one exclusive holder, and never alongside another lease.
    #[track_caller]
    pub fn assert_leases_compatible(locks: &[ResourceLock]) {
        let exclusive = locks.iter().filter(|l| l.is_exclusive()).count();
        assert!(
            exclusive == 0 || locks.len() == 1,
            "Incompatible leases held: {:?}",
            locks
        );
    }

    /// Assert that no lease in `locks` belongs to `agent_id`.
    #[track_caller]
    pub fn assert_not_held_by(locks: &[ResourceLock], agent_id: &str) {
        assert!(
            locks.iter().all(|l| l.agent_id != agent_id),
            "Agent {} still holds a lease: {:?}",
            agent_id,
            locks
        );
    }

    /// Assert that metrics counters and derived values agree.
    #[track_caller]
    pub fn assert_metrics_consistent(metrics: &AgentMetrics) {
        if let Err(e) = metrics.validate() {
            panic!("Inconsistent metrics {:?}: {}", metrics, e);
        }
    }

    #[track_caller]
    pub fn assert_status(state: &AgentState, expected: AgentStatus) {
        assert_eq!(
            state.status, expected,
            "Agent {} has status {}, expected {}",
            state.agent_id, state.status, expected
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

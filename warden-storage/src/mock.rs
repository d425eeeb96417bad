//! In-memory storage.

use crate::{AgentStateUpdate, CoordinationStorage, TaskClaim};
use ::async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use warden_core::{
    lock_admits, AgentId, AgentState, AgentStatus, ResourceId, ResourceLock, StorageError,
    Timestamp, WardenResult,
};

type LockTable = HashMap<ResourceId, HashMap<AgentId, ResourceLock>>;

/// In-memory storage for tests and single-process deployments.
///
/// Every compound operation runs under one write guard, which gives the
/// per-resource atomic check-and-write the coordination layer relies on.
/// Starts connected.
#[derive(Debug)]
pub struct MockStorage {
    connected: AtomicBool,
    agents: RwLock<HashMap<AgentId, AgentState>>,
    locks: RwLock<LockTable>,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            agents: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
        }
    }
}

impl MockStorage {
    /// Create a new, connected mock storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all stored data.
    pub fn clear(&self) -> WardenResult<()> {
        self.agents_mut()?.clear();
        self.locks_mut()?.clear();
        Ok(())
    }

    /// Get count of stored agent states.
    pub fn agent_count(&self) -> WardenResult<usize> {
        Ok(self.agents()?.len())
    }

    /// Get count of physically stored lock rows, expired ones included.
    pub fn lock_row_count(&self) -> WardenResult<usize> {
        Ok(self.locks()?.values().map(HashMap::len).sum())
    }

    /// Insert a lock row without any compatibility check.
    ///
    /// Lets tests seed rows with arbitrary windows, e.g. already expired.
    pub fn lock_insert_unchecked(&self, lock: ResourceLock) -> WardenResult<()> {
        self.locks_mut()?
            .entry(lock.resource_id.clone())
            .or_default()
            .insert(lock.agent_id.clone(), lock);
        Ok(())
    }

    fn ensure_connected(&self) -> WardenResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotConnected.into())
        }
    }

    fn agents(&self) -> WardenResult<RwLockReadGuard<'_, HashMap<AgentId, AgentState>>> {
        self.agents
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn agents_mut(&self) -> WardenResult<RwLockWriteGuard<'_, HashMap<AgentId, AgentState>>> {
        self.agents
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn locks(&self) -> WardenResult<RwLockReadGuard<'_, LockTable>> {
        self.locks.read().map_err(|_| StorageError::LockPoisoned.into())
    }

    fn locks_mut(&self) -> WardenResult<RwLockWriteGuard<'_, LockTable>> {
        self.locks
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }
}

#[async_trait]
impl CoordinationStorage for MockStorage {
    // === Connection Lifecycle ===

    async fn connect(&self) -> WardenResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> WardenResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    // === Agent State Operations ===

    async fn agent_state_get(&self, agent_id: &str) -> WardenResult<Option<AgentState>> {
        self.ensure_connected()?;
        Ok(self.agents()?.get(agent_id).cloned())
    }

    async fn agent_state_save(&self, state: &AgentState) -> WardenResult<()> {
        self.ensure_connected()?;
        state.validate()?;
        self.agents_mut()?
            .insert(state.agent_id.clone(), state.clone());
        Ok(())
    }

    async fn agent_state_insert(&self, state: &AgentState) -> WardenResult<bool> {
        self.ensure_connected()?;
        state.validate()?;
        let mut agents = self.agents_mut()?;
        if agents.contains_key(&state.agent_id) {
            return Ok(false);
        }
        agents.insert(state.agent_id.clone(), state.clone());
        Ok(true)
    }

    async fn agent_state_update(
        &self,
        agent_id: &str,
        update: AgentStateUpdate,
    ) -> WardenResult<Option<AgentState>> {
        self.ensure_connected()?;
        let mut agents = self.agents_mut()?;
        let Some(existing) = agents.get(agent_id) else {
            return Ok(None);
        };

        let mut updated = existing.clone();
        update.apply_to(&mut updated);
        updated.validate()?;
        agents.insert(agent_id.to_string(), updated.clone());
        Ok(Some(updated))
    }

    async fn agent_state_list(&self, status: Option<AgentStatus>) -> WardenResult<Vec<AgentState>> {
        self.ensure_connected()?;
        let agents = self.agents()?;
        let mut states: Vec<AgentState> = agents
            .values()
            .filter(|s| status.map_or(true, |wanted| s.status == wanted))
            .cloned()
            .collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(states)
    }

    async fn agent_state_claim_task(
        &self,
        agent_id: &str,
        task_id: &str,
    ) -> WardenResult<TaskClaim> {
        self.ensure_connected()?;
        let mut agents = self.agents_mut()?;

        let holder = agents
            .values()
            .find(|s| s.agent_id != agent_id && s.current_task_id.as_deref() == Some(task_id))
            .map(|s| s.agent_id.clone());
        if let Some(holder) = holder {
            return Ok(TaskClaim::HeldBy(holder));
        }

        let Some(state) = agents.get_mut(agent_id) else {
            return Ok(TaskClaim::UnknownAgent);
        };
        if state.current_task_id.as_deref() != Some(task_id) {
            state.current_task_id = Some(task_id.to_string());
            state.touch();
        }
        Ok(TaskClaim::Claimed(state.clone()))
    }

    async fn agent_state_release_task(&self, agent_id: &str, task_id: &str) -> WardenResult<bool> {
        self.ensure_connected()?;
        let mut agents = self.agents_mut()?;
        match agents.get_mut(agent_id) {
            Some(state) if state.current_task_id.as_deref() == Some(task_id) => {
                state.current_task_id = None;
                state.touch();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // === Lock Operations ===

    async fn lock_try_insert(&self, lock: &ResourceLock, now: Timestamp) -> WardenResult<bool> {
        self.ensure_connected()?;
        let mut locks = self.locks_mut()?;
        let rows = locks.entry(lock.resource_id.clone()).or_default();
        rows.retain(|_, existing| !existing.is_expired(now));

        if !lock_admits(rows.values(), lock.lock_type, now) {
            return Ok(false);
        }
        rows.insert(lock.agent_id.clone(), lock.clone());
        Ok(true)
    }

    async fn lock_delete(
        &self,
        resource_id: &str,
        agent_id: &str,
        now: Timestamp,
    ) -> WardenResult<bool> {
        self.ensure_connected()?;
        let mut locks = self.locks_mut()?;
        let Some(rows) = locks.get_mut(resource_id) else {
            return Ok(false);
        };
        let removed = rows.remove(agent_id);
        if rows.is_empty() {
            locks.remove(resource_id);
        }
        Ok(removed.is_some_and(|lock| !lock.is_expired(now)))
    }

    async fn lock_delete_by_agent(&self, agent_id: &str, now: Timestamp) -> WardenResult<usize> {
        self.ensure_connected()?;
        let mut locks = self.locks_mut()?;
        let mut live = 0;
        for rows in locks.values_mut() {
            if let Some(lock) = rows.remove(agent_id) {
                if !lock.is_expired(now) {
                    live += 1;
                }
            }
        }
        locks.retain(|_, rows| !rows.is_empty());
        Ok(live)
    }

    async fn lock_list_by_resource(
        &self,
        resource_id: &str,
        now: Timestamp,
    ) -> WardenResult<Vec<ResourceLock>> {
        self.ensure_connected()?;
        let locks = self.locks()?;
        let mut live: Vec<ResourceLock> = locks
            .get(resource_id)
            .map(|rows| {
                rows.values()
                    .filter(|lock| !lock.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        live.sort_by(|a, b| {
            a.acquired_at
                .cmp(&b.acquired_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        Ok(live)
    }

    async fn lock_extend(
        &self,
        resource_id: &str,
        agent_id: &str,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> WardenResult<Option<ResourceLock>> {
        self.ensure_connected()?;
        let mut locks = self.locks_mut()?;
        let Some(lock) = locks
            .get_mut(resource_id)
            .and_then(|rows| rows.get_mut(agent_id))
        else {
            return Ok(None);
        };
        if lock.is_expired(now) {
            return Ok(None);
        }
        lock.expires_at = expires_at;
        Ok(Some(lock.clone()))
    }

    async fn lock_purge_expired(&self, now: Timestamp) -> WardenResult<usize> {
        self.ensure_connected()?;
        let mut locks = self.locks_mut()?;
        let mut purged = 0;
        for rows in locks.values_mut() {
            let before = rows.len();
            rows.retain(|_, lock| !lock.is_expired(now));
            purged += before - rows.len();
        }
        locks.retain(|_, rows| !rows.is_empty());
        Ok(purged)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;
    use warden_core::{LockType, WardenError};

    fn lease(resource: &str, agent: &str, lock_type: LockType) -> ResourceLock {
        ResourceLock::new(resource, agent, lock_type, Duration::from_secs(60), Utc::now()).unwrap()
    }

    fn expired(resource: &str, agent: &str, lock_type: LockType) -> ResourceLock {
        let past = Utc::now() - ChronoDuration::seconds(120);
        ResourceLock::new(resource, agent, lock_type, Duration::from_secs(60), past).unwrap()
    }

    #[tokio::test]
    async fn test_agent_state_save_and_get() -> WardenResult<()> {
        let storage = MockStorage::new();
        storage.agent_state_save(&AgentState::new("a1")).await?;

        let loaded = storage.agent_state_get("a1").await?;
        assert_eq!(loaded.map(|s| s.agent_id), Some("a1".to_string()));
        assert!(storage.agent_state_get("missing").await?.is_none());
        assert_eq!(storage.agent_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_state_save_validates() {
        let storage = MockStorage::new();
        let err = storage.agent_state_save(&AgentState::new(" ")).await.unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
    }

    #[tokio::test]
    async fn test_agent_state_insert_keeps_existing_row() -> WardenResult<()> {
        let storage = MockStorage::new();
        assert!(storage.agent_state_insert(&AgentState::new("a1")).await?);
        storage.agent_state_claim_task("a1", "t1").await?;

        assert!(!storage.agent_state_insert(&AgentState::new("a1")).await?);
        let stored = storage.agent_state_get("a1").await?;
        assert_eq!(stored.and_then(|s| s.current_task_id).as_deref(), Some("t1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_state_update_unknown_is_none() -> WardenResult<()> {
        let storage = MockStorage::new();
        let result = storage
            .agent_state_update("ghost", AgentStateUpdate::status(AgentStatus::Active))
            .await?;
        assert!(result.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_agent_state_list_filters_status() -> WardenResult<()> {
        let storage = MockStorage::new();
        storage.agent_state_save(&AgentState::new("b")).await?;
        let mut active = AgentState::new("a");
        active.status = AgentStatus::Active;
        storage.agent_state_save(&active).await?;

        let all = storage.agent_state_list(None).await?;
        assert_eq!(
            all.iter().map(|s| s.agent_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        let only_active = storage.agent_state_list(Some(AgentStatus::Active)).await?;
        assert_eq!(only_active.len(), 1);
        assert_eq!(only_active[0].agent_id, "a");
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_task_first_writer_wins() -> WardenResult<()> {
        let storage = MockStorage::new();
        storage.agent_state_save(&AgentState::new("a")).await?;
        storage.agent_state_save(&AgentState::new("b")).await?;

        assert!(matches!(
            storage.agent_state_claim_task("a", "t1").await?,
            TaskClaim::Claimed(_)
        ));
        assert_eq!(
            storage.agent_state_claim_task("b", "t1").await?,
            TaskClaim::HeldBy("a".to_string())
        );
        assert!(storage.agent_state_get("b").await?.unwrap().current_task_id.is_none());
        assert!(matches!(
            storage.agent_state_claim_task("a", "t1").await?,
            TaskClaim::Claimed(_)
        ));
        assert_eq!(
            storage.agent_state_claim_task("ghost", "t2").await?,
            TaskClaim::UnknownAgent
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_release_task_requires_matching_task() -> WardenResult<()> {
        let storage = MockStorage::new();
        storage.agent_state_save(&AgentState::new("a")).await?;
        storage.agent_state_claim_task("a", "t1").await?;

        assert!(!storage.agent_state_release_task("a", "t2").await?);
        assert!(storage.agent_state_release_task("a", "t1").await?);
        assert!(!storage.agent_state_release_task("a", "t1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_try_insert_compatibility() -> WardenResult<()> {
        let storage = MockStorage::new();
        let now = Utc::now();

        assert!(storage.lock_try_insert(&lease("r", "a", LockType::Shared), now).await?);
        assert!(storage.lock_try_insert(&lease("r", "b", LockType::Shared), now).await?);
        assert!(!storage.lock_try_insert(&lease("r", "c", LockType::Exclusive), now).await?);

        assert!(storage.lock_try_insert(&lease("x", "a", LockType::Exclusive), now).await?);
        assert!(!storage.lock_try_insert(&lease("x", "b", LockType::Shared), now).await?);
        assert!(!storage.lock_try_insert(&lease("x", "a", LockType::Exclusive), now).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible_and_replaced() -> WardenResult<()> {
        let storage = MockStorage::new();
        storage.lock_insert_unchecked(expired("r", "a", LockType::Exclusive))?;
        let now = Utc::now();

        assert!(storage.lock_list_by_resource("r", now).await?.is_empty());
        assert!(!storage.lock_delete("r", "a", now).await?);

        storage.lock_insert_unchecked(expired("r", "a", LockType::Exclusive))?;
        assert!(storage.lock_try_insert(&lease("r", "b", LockType::Exclusive), now).await?);
        assert_eq!(storage.lock_row_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_delete_by_agent_only_touches_owner() -> WardenResult<()> {
        let storage = MockStorage::new();
        let now = Utc::now();
        storage.lock_try_insert(&lease("r1", "a", LockType::Exclusive), now).await?;
        storage.lock_try_insert(&lease("r2", "a", LockType::Shared), now).await?;
        storage.lock_try_insert(&lease("r2", "b", LockType::Shared), now).await?;
        storage.lock_insert_unchecked(expired("r3", "a", LockType::Exclusive))?;

        assert_eq!(storage.lock_delete_by_agent("a", now).await?, 2);
        assert!(storage.lock_list_by_resource("r1", now).await?.is_empty());
        let r2 = storage.lock_list_by_resource("r2", now).await?;
        assert_eq!(r2.len(), 1);
        assert_eq!(r2[0].agent_id, "b");
        assert_eq!(storage.lock_row_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_extend_skips_expired() -> WardenResult<()> {
        let storage = MockStorage::new();
        let now = Utc::now();
        storage.lock_insert_unchecked(expired("r", "a", LockType::Exclusive))?;
        let later = now + ChronoDuration::seconds(30);
        assert!(storage.lock_extend("r", "a", later, now).await?.is_none());

        storage.lock_try_insert(&lease("q", "a", LockType::Exclusive), now).await?;
        let extended = storage.lock_extend("q", "a", later, now).await?;
        assert_eq!(extended.map(|l| l.expires_at), Some(later));
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_purge_expired() -> WardenResult<()> {
        let storage = MockStorage::new();
        let now = Utc::now();
        storage.lock_insert_unchecked(expired("r1", "a", LockType::Exclusive))?;
        storage.lock_insert_unchecked(expired("r2", "b", LockType::Shared))?;
        storage.lock_try_insert(&lease("r3", "c", LockType::Shared), now).await?;

        assert_eq!(storage.lock_purge_expired(now).await?, 2);
        assert_eq!(storage.lock_row_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnected_storage_fails() -> WardenResult<()> {
        let storage = MockStorage::new();
        storage.disconnect().await?;
        let err = storage.agent_state_get("a").await.unwrap_err();
        assert_eq!(err, WardenError::Storage(StorageError::NotConnected));

        storage.connect().await?;
        assert!(storage.agent_state_get("a").await?.is_none());
        Ok(())
    }
}

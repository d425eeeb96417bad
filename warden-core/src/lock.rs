//! Resource leases.
//!
//! Expiry is lazy: a lease whose `expires_at` has passed is treated as absent
//! by every read and acquire path, so no background reaper is needed for
//! correctness.
//!
//! # Compatibility
//!
//! ```text
//!                 held: exclusive   held: shared
//! want exclusive       no               no
//! want shared          no               yes
//! ```

use crate::{
    validate_identifier, AgentId, JsonMap, LockType, ResourceId, Timestamp, ValidationError,
    WardenError, WardenResult,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One agent's claim on one resource. Keyed by `(resource_id, agent_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ResourceLock {
    pub resource_id: ResourceId,
    /// Owning agent
    pub agent_id: AgentId,
    pub lock_type: LockType,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub acquired_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub expires_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub metadata: JsonMap,
}

impl ResourceLock {
    /// Create a lease starting at `now` and lasting `ttl`.
    pub fn new(
        resource_id: &str,
        agent_id: &str,
        lock_type: LockType,
        ttl: Duration,
        now: Timestamp,
    ) -> WardenResult<Self> {
        validate_identifier("resource_id", resource_id)?;
        validate_identifier("agent_id", agent_id)?;
        let expires_at = expiry_after(now, ttl)?;

        Ok(Self {
            resource_id: resource_id.to_string(),
            agent_id: agent_id.to_string(),
            lock_type,
            acquired_at: now,
            expires_at,
            metadata: JsonMap::new(),
        })
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check if the lease has expired at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.lock_type == LockType::Exclusive
    }
}

/// Compute `now + ttl`, rejecting zero or out-of-range durations.
pub(crate) fn expiry_after(now: Timestamp, ttl: Duration) -> WardenResult<Timestamp> {
    let invalid = |reason: &str| {
        WardenError::Validation(ValidationError::InvalidValue {
            field: "ttl".to_string(),
            reason: reason.to_string(),
        })
    };

    if ttl.is_zero() {
        return Err(invalid("ttl must be positive"));
    }
    let delta = chrono::Duration::from_std(ttl).map_err(|_| invalid("ttl is out of range"))?;
    now.checked_add_signed(delta)
        .ok_or_else(|| invalid("ttl overflows the timestamp range"))
}

impl ResourceLock {
    /// Move the expiry to `now + ttl`.
    pub fn extend(&mut self, ttl: Duration, now: Timestamp) -> WardenResult<()> {
        self.expires_at = expiry_after(now, ttl)?;
        Ok(())
    }
}

/// Decide whether a `requested` lock may be granted on a resource currently
/// carrying `existing` rows.
///
/// Expired rows are ignored. The rule is uniform: the requester's own row
/// counts like anyone else's.
pub fn lock_admits<'a, I>(existing: I, requested: LockType, now: Timestamp) -> bool
where
    I: IntoIterator<Item = &'a ResourceLock>,
{
    existing
        .into_iter()
        .filter(|lock| !lock.is_expired(now))
        .all(|lock| requested.is_compatible_with(lock.lock_type))
}

// ============================================================================
// TESTS
// ============================================================================

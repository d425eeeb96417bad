//! WARDEN Core - Coordination Data Types
//!
//! Pure data structures shared by every other crate in the workspace:
//! agent lifecycle snapshots, resource leases, errors and configuration.
//! Storage and coordination logic live in `warden-storage` and `warden-agents`.

mod agent;
mod config;
mod enums;
mod error;
mod lock;

pub use agent::{AgentCapability, AgentFilter, AgentMetrics, AgentState, JsonMap};
pub use config::CoordinationConfig;
pub use enums::{AgentStatus, LockType};
pub use error::{ConfigError, StorageError, ValidationError, WardenError, WardenResult};
pub use lock::{lock_admits, ResourceLock};

use chrono::{DateTime, Utc};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Agent identifier. Chosen by the agent runtime, unique per deployment.
pub type AgentId = String;

/// Name of a shared resource (file path, repository, quota bucket).
pub type ResourceId = String;

/// Identifier of an externally-managed task.
pub type TaskId = String;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Read the clock once for an operation.
///
/// Every read or acquire path evaluates expiry against a single `now`, so
/// callers take it here and pass it down instead of re-reading the clock.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Reject empty or whitespace-only identifiers.
pub fn validate_identifier(field: &str, value: &str) -> WardenResult<()> {
    if value.trim().is_empty() {
        return Err(WardenError::Validation(ValidationError::RequiredFieldMissing {
            field: field.to_string(),
        }));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

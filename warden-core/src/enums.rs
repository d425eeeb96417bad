//! Enum types for WARDEN entities

use crate::{ValidationError, WardenError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// AGENT STATUS
// ============================================================================

/// Lifecycle status of an agent.
///
/// There is no terminal state: every status can reach `Active` again, either
/// directly or through `Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Registered, not yet doing work
    #[default]
    Init,
    /// Running and able to take or hold tasks
    Active,
    /// Parked or unregistered; metrics are retained
    Idle,
    /// Crashed or misbehaving; needs a restart path
    Error,
}

impl AgentStatus {
    /// All statuses, in declaration order.
    pub const ALL: [AgentStatus; 4] = [
        AgentStatus::Init,
        AgentStatus::Active,
        AgentStatus::Idle,
        AgentStatus::Error,
    ];

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AgentStatus::Init => "INIT",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Error => "ERROR",
        }
    }

    /// Parse a status, accepting case-insensitive synonyms.
    pub fn from_db_str(s: &str) -> Result<Self, WardenError> {
        match s.trim().to_lowercase().as_str() {
            "init" | "initializing" | "initialized" | "new" | "starting" => Ok(AgentStatus::Init),
            "active" | "running" | "busy" | "working" => Ok(AgentStatus::Active),
            "idle" | "inactive" | "available" | "stopped" => Ok(AgentStatus::Idle),
            "error" | "failed" | "failure" | "crashed" => Ok(AgentStatus::Error),
            _ => Err(WardenError::Validation(ValidationError::InvalidValue {
                field: "status".to_string(),
                reason: format!(
                    "unknown status '{}', expected one of INIT, ACTIVE, IDLE, ERROR",
                    s
                ),
            })),
        }
    }

    /// Statuses this one is expected to move to.
    ///
    /// Advisory only: the registry applies any transition and uses this
    /// table to decide whether to log a warning.
    pub fn expected_successors(&self) -> &'static [AgentStatus] {
        match self {
            AgentStatus::Init => &[AgentStatus::Active, AgentStatus::Error],
            AgentStatus::Active => &[AgentStatus::Idle, AgentStatus::Error],
            AgentStatus::Idle => &[AgentStatus::Active, AgentStatus::Error],
            AgentStatus::Error => &[AgentStatus::Init, AgentStatus::Active],
        }
    }

    /// Whether moving to `next` is a usual transition. Staying put counts as usual.
    pub fn is_expected_transition(&self, next: AgentStatus) -> bool {
        *self == next || self.expected_successors().contains(&next)
    }

    /// Check if the agent counts as available for new work.
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Idle)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for AgentStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// LOCK TYPE
// ============================================================================

/// Lock type determining concurrency behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum LockType {
    /// Only one holder, excludes every other lock
    #[default]
    Exclusive,
    /// Many holders, excludes exclusive locks
    Shared,
}

impl LockType {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            LockType::Exclusive => "exclusive",
            LockType::Shared => "shared",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, WardenError> {
        match s.trim().to_lowercase().as_str() {
            "exclusive" | "write" | "x" => Ok(LockType::Exclusive),
            "shared" | "read" | "s" => Ok(LockType::Shared),
            _ => Err(WardenError::Validation(ValidationError::InvalidValue {
                field: "lock_type".to_string(),
                reason: format!("unknown lock type '{}', expected one of exclusive, shared", s),
            })),
        }
    }

    /// Whether a lock of this type can coexist with a held lock of type `held`.
    pub fn is_compatible_with(&self, held: LockType) -> bool {
        matches!((self, held), (LockType::Shared, LockType::Shared))
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for LockType {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// =============================================================================
// TESTS
// =============================================================================

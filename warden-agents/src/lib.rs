//! WARDEN Agents - Lifecycle Registry and Resource Coordination
//!
//! Provides the coordination layer for fleets of independent agents:
//! - Agent registration, status tracking and soft deletion ([`AgentRegistry`])
//! - TTL-bounded exclusive/shared resource leases ([`AgentCoordination`])
//! - All-or-nothing multi-resource reservation for a task
//! - First-writer-wins task assignment
//! - Best-effort failure cleanup
//! - An optional sweeper for expired lease rows ([`lock_sweeper_task`])
//!
//! Both components share one injected [`CoordinationStorage`] client.

pub mod coordination;
pub mod registry;
pub mod sweeper;

pub use coordination::{AgentCoordination, LockOptions};
pub use registry::AgentRegistry;
pub use sweeper::{lock_sweeper_task, SweeperMetrics, SweeperSnapshot};

pub use warden_core::{
    AgentCapability, AgentFilter, AgentMetrics, AgentState, AgentStatus, CoordinationConfig,
    LockType, ResourceLock, WardenError, WardenResult,
};
pub use warden_storage::{CoordinationStorage, MockStorage};

// ============================================================================
// PROPERTY TESTS
// ============================================================================

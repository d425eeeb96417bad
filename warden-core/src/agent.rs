//! Agent lifecycle snapshot and its validation rules.

use crate::{
    validate_identifier, AgentId, AgentStatus, TaskId, Timestamp, ValidationError, WardenError,
    WardenResult,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Opaque string-keyed JSON map used for agent config and capability metadata.
pub type JsonMap = BTreeMap<String, serde_json::Value>;

// ============================================================================
// CAPABILITIES
// ============================================================================

/// A capability advertised by an agent: a set of tools at a given version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentCapability {
    /// Tool names this capability provides
    pub tools: BTreeSet<String>,
    /// Free-form metadata
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub metadata: JsonMap,
    /// Capability version string
    pub version: String,
}

impl AgentCapability {
    /// Create a capability from a list of tool names.
    pub fn new<I, S>(tools: I, version: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            metadata: JsonMap::new(),
            version: version.to_string(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check whether this capability provides `tool`.
    pub fn provides(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Execution counters for an agent. Times are in seconds.
///
/// The derived fields (`avg_execution_time`, `success_rate`) are only ever
/// written by [`AgentMetrics::record`], which keeps them consistent with the
/// counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_execution_time: f64,
    pub avg_execution_time: f64,
    pub success_rate: f64,
}

impl AgentMetrics {
    /// Fold one finished task into the counters.
    pub fn record(&mut self, succeeded: bool, execution_time: Duration) {
        self.tasks_completed += 1;
        if succeeded {
            self.tasks_succeeded += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.total_execution_time += execution_time.as_secs_f64();
        self.recompute();
    }

    fn recompute(&mut self) {
        if self.tasks_completed == 0 {
            self.avg_execution_time = 0.0;
            self.success_rate = 0.0;
        } else {
            let completed = self.tasks_completed as f64;
            self.avg_execution_time = self.total_execution_time / completed;
            self.success_rate = self.tasks_succeeded as f64 / completed;
        }
    }

    /// Check the counter invariants.
    pub fn validate(&self) -> WardenResult<()> {
        if self.tasks_succeeded + self.tasks_failed != self.tasks_completed {
            return Err(WardenError::Validation(ValidationError::ConstraintViolation {
                constraint: "metrics.tasks_completed".to_string(),
                reason: format!(
                    "succeeded ({}) + failed ({}) != completed ({})",
                    self.tasks_succeeded, self.tasks_failed, self.tasks_completed
                ),
            }));
        }

        if !self.total_execution_time.is_finite() || self.total_execution_time < 0.0 {
            return Err(WardenError::Validation(ValidationError::InvalidValue {
                field: "metrics.total_execution_time".to_string(),
                reason: "must be a non-negative number of seconds".to_string(),
            }));
        }

        let mut expected = self.clone();
        expected.recompute();
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0);
        if !close(expected.success_rate, self.success_rate)
            || !close(expected.avg_execution_time, self.avg_execution_time)
        {
            return Err(WardenError::Validation(ValidationError::ConstraintViolation {
                constraint: "metrics.derived".to_string(),
                reason: "success_rate/avg_execution_time disagree with counters".to_string(),
            }));
        }

        Ok(())
    }
}

// ============================================================================
// AGENT STATE
// ============================================================================

/// One worker's current lifecycle snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentState {
    /// Unique key chosen by the agent runtime
    pub agent_id: AgentId,
    /// Current lifecycle status
    pub status: AgentStatus,
    /// Task currently owned by this agent (weak reference)
    pub current_task_id: Option<TaskId>,
    /// Ordered capability list
    pub capabilities: Vec<AgentCapability>,
    /// Execution counters
    pub metrics: AgentMetrics,
    /// Agent-specific opaque configuration
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub config: JsonMap,
    /// Details of the most recent failure, if any
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub last_error: Option<serde_json::Value>,
    /// When this agent first registered
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    /// Last time the snapshot changed
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
}

impl AgentState {
    /// Create a fresh agent in `Init` status.
    pub fn new(agent_id: &str) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Init,
            current_task_id: None,
            capabilities: Vec::new(),
            metrics: AgentMetrics::default(),
            config: JsonMap::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set capabilities.
    pub fn with_capabilities(mut self, capabilities: Vec<AgentCapability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set configuration.
    pub fn with_config(mut self, config: JsonMap) -> Self {
        self.config = config;
        self
    }

    /// Shallow-merge `config` into the existing map; incoming keys win.
    pub fn merge_config(&mut self, config: JsonMap) {
        self.config.extend(config);
    }

    /// Check if any capability provides `tool`.
    pub fn has_capability(&self, tool: &str) -> bool {
        self.capabilities.iter().any(|c| c.provides(tool))
    }

    /// Check if the agent currently owns a task.
    pub fn has_task(&self) -> bool {
        self.current_task_id.is_some()
    }

    /// Bump `updated_at`. Never moves it backwards, so a wall clock stepping
    /// back cannot push it behind `created_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at).max(self.created_at);
    }

    /// Validate the snapshot before it is persisted.
    pub fn validate(&self) -> WardenResult<()> {
        validate_identifier("agent_id", &self.agent_id)?;
        if let Some(task_id) = &self.current_task_id {
            validate_identifier("current_task_id", task_id)?;
        }
        self.metrics.validate()?;
        if self.updated_at < self.created_at {
            return Err(WardenError::Validation(ValidationError::ConstraintViolation {
                constraint: "updated_at".to_string(),
                reason: "updated_at precedes created_at".to_string(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// FILTERS
// ============================================================================

/// Optional filters for agent listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentFilter {
    /// Match on whether `current_task_id` is set
    pub has_task: Option<bool>,
    /// Match agents with a capability providing this tool
    pub capability: Option<String>,
}

impl AgentFilter {
    /// Filter on task ownership.
    pub fn with_has_task(mut self, has_task: bool) -> Self {
        self.has_task = Some(has_task);
        self
    }

    /// Filter on a capability tool.
    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capability = Some(capability.to_string());
        self
    }

    pub fn matches(&self, state: &AgentState) -> bool {
        if let Some(has_task) = self.has_task {
            if state.has_task() != has_task {
                return false;
            }
        }
        if let Some(capability) = &self.capability {
            if !state.has_capability(capability) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

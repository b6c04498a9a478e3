//! Error taxonomy shared by the registry, broker and orchestrator

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by conductor operations.
///
/// The type is `Clone` so a captured failure can live inside step and
/// workflow results after the operation that produced it has returned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestrationError {
    #[error("agent '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("invalid descriptor for agent '{agent_id}': {reason}")]
    InvalidDescriptor { agent_id: String, reason: String },

    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("agent '{0}' is disabled")]
    AgentDisabled(String),

    #[error("request '{correlation_id}' timed out after {timeout:?}")]
    RequestTimeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("request '{0}' is already awaiting a response")]
    DuplicateCorrelation(String),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("workflow '{0}' is already running")]
    WorkflowAlreadyRunning(String),

    #[error("invalid workflow '{workflow_id}': {reason}")]
    InvalidWorkflow { workflow_id: String, reason: String },

    #[error("workflow '{workflow_id}' exceeded its timeout of {timeout:?}")]
    WorkflowTimeout {
        workflow_id: String,
        timeout: Duration,
    },

    /// A step exhausted its attempts; `source` is the last attempt's error.
    #[error("step '{step_id}' failed: {source}")]
    Step {
        step_id: String,
        #[source]
        source: Box<OrchestrationError>,
    },

    /// An agent answered with `success = false`.
    #[error("agent error ({kind}): {message}")]
    Agent { kind: String, message: String },
}

impl OrchestrationError {
    /// Short machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateAgent(_) => "duplicate_agent",
            Self::InvalidDescriptor { .. } => "invalid_descriptor",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::AgentDisabled(_) => "agent_disabled",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::DuplicateCorrelation(_) => "duplicate_correlation",
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::WorkflowAlreadyRunning(_) => "workflow_already_running",
            Self::InvalidWorkflow { .. } => "invalid_workflow",
            Self::WorkflowTimeout { .. } => "workflow_timeout",
            Self::Step { .. } => "step_error",
            Self::Agent { .. } => "agent_error",
        }
    }

    /// Wrap an attempt error as the failure of `step_id`
    pub fn step(step_id: impl Into<String>, source: OrchestrationError) -> Self {
        Self::Step {
            step_id: step_id.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;

//! conductor-workflow - sequential multi-agent workflows
//!
//! Workflows are ordered steps, each invoking one agent capability through
//! the [`conductor_bus::MessageBroker`]. The orchestrator handles input
//! binding, conditions, retries, timeouts, cancellation and the workflow's
//! error policy.

pub mod context;
pub mod events;
pub mod orchestrator;
pub mod workflow;

pub use context::{
    CompensationRecord, StepOutcome, StepResult, WorkflowContext, WorkflowResult, WorkflowStatus,
};
pub use events::{EventBus, ExecutionEvents, WorkflowEvent, WorkflowEvents};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use workflow::{
    Compensation, DEFAULT_STEP_TIMEOUT, ErrorPolicy, InputBinding, StepCondition, Transform,
    Workflow, WorkflowStep,
};

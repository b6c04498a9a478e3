//! Per-execution state and the results handed back to callers

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_core::{OrchestrationError, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{InputBinding, StepCondition};

/// Lifecycle of one workflow execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.pad("pending"),
            Self::Running => f.pad("running"),
            Self::Completed => f.pad("completed"),
            Self::Failed => f.pad("failed"),
            Self::Cancelled => f.pad("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.pad("success"),
            Self::Failed => f.pad("failed"),
            Self::Skipped => f.pad("skipped"),
        }
    }
}

/// What happened to one step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub outcome: StepOutcome,
    /// Input the step was dispatched with (`Null` when it never ran)
    pub input: Value,
    pub response: Option<Response>,
    pub error: Option<OrchestrationError>,
    pub attempts: u32,
    pub duration: Duration,
}

impl StepResult {
    /// A step whose condition said not to run
    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            outcome: StepOutcome::Skipped,
            input: Value::Null,
            response: None,
            error: None,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    /// Response data, only for successful steps
    pub fn output(&self) -> Option<&Value> {
        if self.outcome != StepOutcome::Success {
            return None;
        }
        self.response.as_ref().and_then(|r| r.data.as_ref())
    }

    /// Failed, or skipped because the error policy swallowed a failure
    pub fn has_failed(&self) -> bool {
        self.outcome == StepOutcome::Failed || self.error.is_some()
    }
}

/// Result of running one compensation action
#[derive(Debug, Clone)]
pub struct CompensationRecord {
    pub step_id: String,
    pub agent_id: String,
    pub capability_id: String,
    pub error: Option<OrchestrationError>,
}

impl CompensationRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Mutable state of a single execution. Created fresh per run and
/// discarded once the run reaches a terminal status.
#[derive(Debug)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub variables: HashMap<String, Value>,
    results: HashMap<String, StepResult>,
    /// Step ids in the order their results were recorded
    order: Vec<String>,
    compensations: Vec<CompensationRecord>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>, variables: HashMap<String, Value>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            status: WorkflowStatus::Pending,
            current_step: 0,
            variables,
            results: HashMap::new(),
            order: Vec::new(),
            compensations: Vec::new(),
        }
    }

    pub fn record(&mut self, result: StepResult) {
        if !self.results.contains_key(&result.step_id) {
            self.order.push(result.step_id.clone());
        }
        self.results.insert(result.step_id.clone(), result);
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    /// Recorded results in execution order
    pub fn results(&self) -> impl DoubleEndedIterator<Item = &StepResult> {
        self.order.iter().filter_map(|id| self.results.get(id))
    }

    pub fn record_compensation(&mut self, record: CompensationRecord) {
        self.compensations.push(record);
    }

    /// Produce the input for a step. Missing data resolves to `Null`.
    pub fn resolve_input(&self, binding: &InputBinding) -> Value {
        match binding {
            InputBinding::Static(value) => value.clone(),
            InputBinding::Previous {
                step_id,
                select,
                transform,
            } => {
                let data = self
                    .result(step_id)
                    .and_then(|r| r.output())
                    .cloned()
                    .unwrap_or(Value::Null);
                shape(data, select.as_deref(), transform.as_ref())
            }
            InputBinding::Context {
                variable,
                select,
                transform,
            } => {
                let data = match variable {
                    Some(name) => self.variables.get(name).cloned().unwrap_or(Value::Null),
                    None => Value::Object(
                        self.variables
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    ),
                };
                shape(data, select.as_deref(), transform.as_ref())
            }
        }
    }

    /// Judge a step condition against the results recorded so far
    pub fn should_run(&self, condition: &StepCondition) -> bool {
        match condition {
            StepCondition::Always => true,
            StepCondition::AllSucceeded => self
                .results()
                .all(|r| r.outcome == StepOutcome::Success),
            StepCondition::AnyFailed => self.results().any(|r| r.has_failed()),
            StepCondition::StepSucceeded(id) => self
                .result(id)
                .is_some_and(|r| r.outcome == StepOutcome::Success),
            StepCondition::StepFailed(id) => self.result(id).is_some_and(|r| r.has_failed()),
            StepCondition::VariableEquals { name, value } => {
                self.variables.get(name) == Some(value)
            }
        }
    }

    /// Data of the last step that succeeded
    pub fn last_output(&self) -> Option<Value> {
        self.results().rev().find_map(|r| r.output().cloned())
    }

    /// Consume the context into the caller-facing summary
    pub fn finish(self, error: Option<OrchestrationError>) -> WorkflowResult {
        let ended_at = Utc::now();
        let duration = (ended_at - self.started_at).to_std().unwrap_or_default();
        let output = self.last_output();
        let Self {
            workflow_id,
            execution_id,
            started_at,
            status,
            mut results,
            order,
            compensations,
            ..
        } = self;

        let steps = order.iter().filter_map(|id| results.remove(id)).collect();

        WorkflowResult {
            workflow_id,
            execution_id,
            status,
            started_at,
            ended_at,
            duration,
            steps,
            output,
            error,
            compensations,
        }
    }
}

fn shape(value: Value, select: Option<&str>, transform: Option<&crate::workflow::Transform>) -> Value {
    let value = match select {
        Some(pointer) => value.pointer(pointer).cloned().unwrap_or(Value::Null),
        None => value,
    };
    match transform {
        Some(t) => t.apply(value),
        None => value,
    }
}

/// Summary returned by `Orchestrator::execute_workflow`, on success and failure alike
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub execution_id: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    /// Recorded step results in execution order; steps never reached are absent
    pub steps: Vec<StepResult>,
    pub output: Option<Value>,
    /// The error that terminated the run, if any
    pub error: Option<OrchestrationError>,
    pub compensations: Vec<CompensationRecord>,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

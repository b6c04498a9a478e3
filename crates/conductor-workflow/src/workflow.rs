//! Workflow definitions: ordered steps, input bindings, conditions and error policy

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use conductor_core::{OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Step timeout used when a step does not set one
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller-supplied function applied to a resolved input
#[derive(Clone)]
pub struct Transform(Arc<dyn Fn(Value) -> Value + Send + Sync>);

impl Transform {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, value: Value) -> Value {
        (self.0)(value)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transform(..)")
    }
}

/// Rule producing a step's input
#[derive(Debug, Clone)]
pub enum InputBinding {
    /// A literal value
    Static(Value),
    /// The response data of an earlier step
    Previous {
        step_id: String,
        /// JSON pointer applied before `transform`
        select: Option<String>,
        transform: Option<Transform>,
    },
    /// One workflow variable, or the whole variable table when `variable` is `None`
    Context {
        variable: Option<String>,
        select: Option<String>,
        transform: Option<Transform>,
    },
}

impl InputBinding {
    pub fn literal(value: Value) -> Self {
        Self::Static(value)
    }

    pub fn previous(step_id: impl Into<String>) -> Self {
        Self::Previous {
            step_id: step_id.into(),
            select: None,
            transform: None,
        }
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self::Context {
            variable: Some(name.into()),
            select: None,
            transform: None,
        }
    }

    pub fn variables() -> Self {
        Self::Context {
            variable: None,
            select: None,
            transform: None,
        }
    }

    /// Narrow the resolved value with a JSON pointer. No effect on `Static`.
    pub fn select(mut self, pointer: impl Into<String>) -> Self {
        match &mut self {
            Self::Static(_) => {}
            Self::Previous { select, .. } | Self::Context { select, .. } => {
                *select = Some(pointer.into());
            }
        }
        self
    }

    /// Apply `f` to the resolved value. No effect on `Static`.
    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        match &mut self {
            Self::Static(_) => {}
            Self::Previous { transform, .. } | Self::Context { transform, .. } => {
                *transform = Some(Transform::new(f));
            }
        }
        self
    }
}

impl Default for InputBinding {
    fn default() -> Self {
        Self::Static(Value::Null)
    }
}

/// Whether a step runs, judged against the results recorded so far
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    #[default]
    Always,
    /// Every step recorded so far succeeded
    AllSucceeded,
    /// At least one step recorded so far failed
    AnyFailed,
    StepSucceeded(String),
    StepFailed(String),
    VariableEquals { name: String, value: Value },
}

impl StepCondition {
    /// Step ids this condition refers to
    fn referenced_step(&self) -> Option<&str> {
        match self {
            Self::StepSucceeded(id) | Self::StepFailed(id) => Some(id),
            _ => None,
        }
    }
}

/// How an exhausted step failure affects the rest of the workflow
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record the failure and stop
    #[default]
    Fail,
    /// Record the step as skipped and continue
    Skip,
    /// Record the failure and continue; the step's own retries were the retry layer
    Retry,
    /// Record the failure, stop, then undo earlier successful steps in reverse order
    Compensate,
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Skip => write!(f, "skip"),
            Self::Retry => write!(f, "retry"),
            Self::Compensate => write!(f, "compensate"),
        }
    }
}

/// Capability that undoes a step; receives the step's output as input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compensation {
    pub agent_id: String,
    pub capability_id: String,
}

/// One capability invocation within a workflow
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub id: String,
    pub agent_id: String,
    pub capability_id: String,
    pub input: InputBinding,
    pub condition: StepCondition,
    /// Extra attempts after the first one fails
    pub retries: u32,
    /// Budget for a single attempt
    pub timeout: Duration,
    pub compensation: Option<Compensation>,
}

impl WorkflowStep {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        capability_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            capability_id: capability_id.into(),
            input: InputBinding::default(),
            condition: StepCondition::Always,
            retries: 0,
            timeout: DEFAULT_STEP_TIMEOUT,
            compensation: None,
        }
    }

    pub fn with_input(mut self, input: InputBinding) -> Self {
        self.input = input;
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_compensation(
        mut self,
        agent_id: impl Into<String>,
        capability_id: impl Into<String>,
    ) -> Self {
        self.compensation = Some(Compensation {
            agent_id: agent_id.into(),
            capability_id: capability_id.into(),
        });
        self
    }
}

/// A named, ordered sequence of steps with one error policy
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<WorkflowStep>,
    pub error_policy: ErrorPolicy,
    /// Wall-clock budget for the whole execution; `None` means unbounded
    pub timeout: Option<Duration>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            error_policy: ErrorPolicy::Fail,
            timeout: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Check structural invariants: a non-empty id, unique step ids, and
    /// step references that only point backwards.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| OrchestrationError::InvalidWorkflow {
            workflow_id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("workflow id must not be empty".to_string()));
        }

        let mut earlier: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(invalid("step id must not be empty".to_string()));
            }
            if earlier.contains(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }

            if let InputBinding::Previous { step_id, .. } = &step.input {
                if !earlier.contains(step_id.as_str()) {
                    return Err(invalid(format!(
                        "step '{}' takes input from '{}', which does not run before it",
                        step.id, step_id
                    )));
                }
            }

            if let Some(referenced) = step.condition.referenced_step() {
                if !earlier.contains(referenced) {
                    return Err(invalid(format!(
                        "condition of step '{}' refers to '{}', which does not run before it",
                        step.id, referenced
                    )));
                }
            }

            earlier.insert(step.id.as_str());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step() -> Workflow {
        Workflow::new("report", "Quarterly report")
            .with_step(WorkflowStep::new("gather", "sales", "export"))
            .with_step(
                WorkflowStep::new("summarize", "finance", "summarize")
                    .with_input(InputBinding::previous("gather")),
            )
    }

    #[test]
    fn test_validate_ok() {
        assert!(two_step().validate().is_ok());
        assert!(Workflow::new("empty", "No steps").validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_step() {
        let wf = two_step().with_step(WorkflowStep::new("gather", "sales", "export"));
        let err = wf.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate step id 'gather'"));
    }

    #[test]
    fn test_validate_forward_reference() {
        let wf = Workflow::new("bad", "Bad")
            .with_step(WorkflowStep::new("a", "x", "y").with_input(InputBinding::previous("b")))
            .with_step(WorkflowStep::new("b", "x", "y"));
        assert!(matches!(
            wf.validate(),
            Err(OrchestrationError::InvalidWorkflow { .. })
        ));
    }

    #[test]
    fn test_validate_self_reference() {
        let wf = Workflow::new("loop", "Loop")
            .with_step(WorkflowStep::new("a", "x", "y").with_input(InputBinding::previous("a")));
        assert!(wf.validate().is_err());
    }

    #[test]
    fn test_validate_condition_reference() {
        let wf = two_step().with_step(
            WorkflowStep::new("notify", "hr", "notify")
                .with_condition(StepCondition::StepFailed("missing".to_string())),
        );
        assert!(wf.validate().unwrap_err().to_string().contains("condition of step 'notify'"));
    }

    #[test]
    fn test_validate_empty_id() {
        assert!(Workflow::new("", "x").validate().is_err());
    }

    #[test]
    fn test_step_defaults() {
        let step = WorkflowStep::new("a", "agent", "cap");
        assert_eq!(step.retries, 0);
        assert_eq!(step.timeout, DEFAULT_STEP_TIMEOUT);
        assert_eq!(step.condition, StepCondition::Always);
        assert!(matches!(step.input, InputBinding::Static(Value::Null)));
    }

    #[test]
    fn test_binding_select_and_transform() {
        let binding = InputBinding::previous("a")
            .select("/items")
            .transform(|v| serde_json::json!({ "wrapped": v }));
        match binding {
            InputBinding::Previous {
                select, transform, ..
            } => {
                assert_eq!(select.as_deref(), Some("/items"));
                let out = transform.unwrap().apply(serde_json::json!(1));
                assert_eq!(out["wrapped"], 1);
            }
            other => panic!("unexpected binding {:?}", other),
        }

        // Static ignores both
        let binding = InputBinding::literal(serde_json::json!(5)).select("/x");
        assert!(matches!(binding, InputBinding::Static(v) if v == serde_json::json!(5)));
    }

    #[test]
    fn test_error_policy_serde() {
        let policy: ErrorPolicy = serde_json::from_str("\"compensate\"").unwrap();
        assert_eq!(policy, ErrorPolicy::Compensate);
        assert_eq!(ErrorPolicy::Skip.to_string(), "skip");
    }

    #[test]
    fn test_condition_serde() {
        let cond: StepCondition = serde_json::from_str("\"any_failed\"").unwrap();
        assert_eq!(cond, StepCondition::AnyFailed);

        let cond: StepCondition = serde_json::from_str(r#"{"step_succeeded":"gather"}"#).unwrap();
        assert_eq!(cond, StepCondition::StepSucceeded("gather".to_string()));

        let cond: StepCondition =
            serde_json::from_str(r#"{"variable_equals":{"name":"mode","value":"full"}}"#).unwrap();
        assert_eq!(
            cond,
            StepCondition::VariableEquals {
                name: "mode".to_string(),
                value: serde_json::json!("full")
            }
        );
    }
}

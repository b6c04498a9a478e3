//! Workflow orchestrator
//!
//! Runs registered workflows one step at a time through the message broker.
//! Steps of one execution never overlap; distinct workflows may run
//! concurrently, each with its own context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use conductor_bus::MessageBroker;
use conductor_core::{Message, OrchestrationError, Response, Result};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{
    CompensationRecord, StepOutcome, StepResult, WorkflowContext, WorkflowResult, WorkflowStatus,
};
use crate::events::{EventBus, WorkflowEvent, WorkflowEvents};
use crate::workflow::{Compensation, ErrorPolicy, Workflow, WorkflowStep};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Source id stamped on every message the orchestrator sends
    pub source_id: String,
    /// Pause between a failed attempt and its retry
    pub retry_delay: Duration,
    /// Capacity of the lifecycle event channel
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            source_id: "orchestrator".to_string(),
            retry_delay: Duration::ZERO,
            event_capacity: 64,
        }
    }
}

struct ActiveExecution {
    execution_id: String,
    token: CancellationToken,
}

type ActiveTable = Mutex<HashMap<String, ActiveExecution>>;

fn lock(active: &ActiveTable) -> MutexGuard<'_, HashMap<String, ActiveExecution>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes an execution from the active table when dropped, so the entry
/// goes away on every exit path, including a dropped future.
struct ActiveGuard<'a> {
    active: &'a ActiveTable,
    workflow_id: String,
    execution_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut active = lock(self.active);
        if active
            .get(&self.workflow_id)
            .is_some_and(|e| e.execution_id == self.execution_id)
        {
            active.remove(&self.workflow_id);
        }
    }
}

/// Outcome of the retry loop for one step
struct Dispatch {
    attempts: u32,
    outcome: Result<Response>,
    /// The workflow deadline stopped further attempts
    out_of_time: bool,
}

/// Sequential multi-agent workflow engine
pub struct Orchestrator {
    broker: MessageBroker,
    config: OrchestratorConfig,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    active: ActiveTable,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(broker: MessageBroker) -> Self {
        Self::with_config(broker, OrchestratorConfig::default())
    }

    pub fn with_config(broker: MessageBroker, config: OrchestratorConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            broker,
            config,
            workflows: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    /// Store a workflow definition. An existing definition with the same id
    /// is replaced.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<()> {
        workflow.validate()?;
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            warn!("Replacing definition of workflow '{}'", workflow.id);
        }
        info!(
            "Registered workflow '{}' with {} steps (policy: {})",
            workflow.id,
            workflow.steps.len(),
            workflow.error_policy
        );
        workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    /// Registered workflow ids, sorted
    pub async fn list_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of workflows currently executing
    pub fn get_active_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.active).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Request cancellation of a running workflow. The step in flight is
    /// allowed to finish; no further step or retry starts.
    pub fn cancel_workflow(&self, workflow_id: &str) -> bool {
        match lock(&self.active).get(workflow_id) {
            Some(execution) => {
                info!(
                    "Cancelling workflow '{}' (execution {})",
                    workflow_id, execution.execution_id
                );
                execution.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Lifecycle events of every workflow
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Lifecycle events of one workflow's executions
    pub fn subscribe_workflow(&self, workflow_id: &str) -> WorkflowEvents {
        self.events.subscribe_workflow(workflow_id)
    }

    /// Run a registered workflow to a terminal status.
    ///
    /// Step failures are reported inside the returned [`WorkflowResult`];
    /// `Err` is reserved for calls that cannot start at all (unknown id, or
    /// the workflow is already running).
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<WorkflowResult> {
        let workflow = self
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| OrchestrationError::WorkflowNotFound(workflow_id.to_string()))?;

        let mut ctx = WorkflowContext::new(&workflow.id, variables);
        let token = CancellationToken::new();
        let _guard = self.activate(&workflow.id, &ctx.execution_id, token.clone())?;

        ctx.status = WorkflowStatus::Running;
        info!(
            "Starting workflow '{}' (execution {}, {} steps)",
            workflow.id,
            ctx.execution_id,
            workflow.steps.len()
        );
        let events = self.events.execution(&ctx);
        events.started(ctx.started_at);

        let deadline = workflow.timeout.map(|t| Instant::now() + t);
        let error = self
            .run_steps(&workflow, &mut ctx, &token, deadline)
            .await
            .err();

        if error.is_some() && workflow.error_policy == ErrorPolicy::Compensate {
            self.compensate(&workflow, &mut ctx).await;
        }

        ctx.status = if token.is_cancelled() {
            WorkflowStatus::Cancelled
        } else if error.is_some() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        let result = ctx.finish(error);
        match &result.error {
            Some(e) => warn!(
                "Workflow '{}' {} after {:?}: {}",
                result.workflow_id, result.status, result.duration, e
            ),
            None => info!(
                "Workflow '{}' {} after {:?}",
                result.workflow_id, result.status, result.duration
            ),
        }
        events.finished(&result);
        Ok(result)
    }

    fn activate(
        &self,
        workflow_id: &str,
        execution_id: &str,
        token: CancellationToken,
    ) -> Result<ActiveGuard<'_>> {
        let mut active = lock(&self.active);
        if active.contains_key(workflow_id) {
            return Err(OrchestrationError::WorkflowAlreadyRunning(
                workflow_id.to_string(),
            ));
        }
        active.insert(
            workflow_id.to_string(),
            ActiveExecution {
                execution_id: execution_id.to_string(),
                token,
            },
        );
        Ok(ActiveGuard {
            active: &self.active,
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
        })
    }

    /// The step loop. Returns the error that terminated the run, if any.
    async fn run_steps(
        &self,
        workflow: &Workflow,
        ctx: &mut WorkflowContext,
        token: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        for (index, step) in workflow.steps.iter().enumerate() {
            ctx.current_step = index;

            if token.is_cancelled() {
                info!(
                    "Workflow '{}' cancelled before step '{}'",
                    workflow.id, step.id
                );
                return Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(timed_out(workflow));
            }

            if !ctx.should_run(&step.condition) {
                debug!("Condition not met, skipping step '{}'", step.id);
                self.record(ctx, StepResult::skipped(&step.id));
                continue;
            }

            let input = ctx.resolve_input(&step.input);
            let started = Instant::now();
            let dispatch = self.dispatch(step, &input, token, deadline).await;
            let duration = started.elapsed();

            let error = match dispatch.outcome {
                Ok(response) => {
                    self.record(
                        ctx,
                        StepResult {
                            step_id: step.id.clone(),
                            outcome: StepOutcome::Success,
                            input,
                            response: Some(response),
                            error: None,
                            attempts: dispatch.attempts,
                            duration,
                        },
                    );
                    continue;
                }
                Err(e) => e,
            };

            let outcome = match workflow.error_policy {
                ErrorPolicy::Skip => StepOutcome::Skipped,
                ErrorPolicy::Fail | ErrorPolicy::Retry | ErrorPolicy::Compensate => {
                    StepOutcome::Failed
                }
            };
            warn!(
                "Step '{}' of workflow '{}' failed after {} attempts: {}",
                step.id, workflow.id, dispatch.attempts, error
            );
            self.record(
                ctx,
                StepResult {
                    step_id: step.id.clone(),
                    outcome,
                    input,
                    response: None,
                    error: Some(error.clone()),
                    attempts: dispatch.attempts,
                    duration,
                },
            );

            match workflow.error_policy {
                ErrorPolicy::Fail | ErrorPolicy::Compensate => {
                    return Err(OrchestrationError::step(&step.id, error));
                }
                ErrorPolicy::Skip | ErrorPolicy::Retry => {}
            }
            if dispatch.out_of_time {
                return Err(timed_out(workflow));
            }
        }
        Ok(())
    }

    /// Send the step's invocation, retrying on any failure up to the step's budget
    async fn dispatch(
        &self,
        step: &WorkflowStep,
        input: &Value,
        token: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Dispatch {
        let mut attempts = 0;
        loop {
            let budget = match deadline {
                Some(d) => step.timeout.min(d.saturating_duration_since(Instant::now())),
                None => step.timeout,
            };
            attempts += 1;

            let message = Message::invocation(
                &self.config.source_id,
                &step.agent_id,
                &step.capability_id,
                input.clone(),
            );
            debug!(
                "Dispatching step '{}' to '{}.{}' (attempt {}, timeout {:?})",
                step.id, step.agent_id, step.capability_id, attempts, budget
            );

            let error = match self
                .broker
                .request(message, budget)
                .await
                .and_then(Response::into_result)
            {
                Ok(response) => {
                    return Dispatch {
                        attempts,
                        outcome: Ok(response),
                        out_of_time: false,
                    };
                }
                Err(e) => e,
            };

            if attempts > step.retries {
                return Dispatch {
                    attempts,
                    outcome: Err(error),
                    out_of_time: false,
                };
            }
            if token.is_cancelled() {
                debug!("Not retrying step '{}': workflow cancelled", step.id);
                return Dispatch {
                    attempts,
                    outcome: Err(error),
                    out_of_time: false,
                };
            }

            debug!(
                "Step '{}' attempt {} failed, retrying: {}",
                step.id, attempts, error
            );
            if !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Dispatch {
                    attempts,
                    outcome: Err(error),
                    out_of_time: true,
                };
            }
        }
    }

    /// Undo earlier successful steps, most recent first. One attempt each;
    /// failures are recorded and do not stop the remaining compensations.
    async fn compensate(&self, workflow: &Workflow, ctx: &mut WorkflowContext) {
        let actions: Vec<(&WorkflowStep, &Compensation, Value)> = ctx
            .results()
            .rev()
            .filter(|r| r.outcome == StepOutcome::Success)
            .filter_map(|r| {
                let step = workflow.step(&r.step_id)?;
                let compensation = step.compensation.as_ref()?;
                Some((step, compensation, r.output().cloned().unwrap_or(Value::Null)))
            })
            .collect();

        if actions.is_empty() {
            return;
        }
        info!(
            "Compensating {} steps of workflow '{}'",
            actions.len(),
            workflow.id
        );

        for (step, compensation, input) in actions {
            let message = Message::invocation(
                &self.config.source_id,
                &compensation.agent_id,
                &compensation.capability_id,
                input,
            );
            let error = self
                .broker
                .request(message, step.timeout)
                .await
                .and_then(Response::into_result)
                .err();
            if let Some(e) = &error {
                warn!("Compensation for step '{}' failed: {}", step.id, e);
            }
            ctx.record_compensation(CompensationRecord {
                step_id: step.id.clone(),
                agent_id: compensation.agent_id.clone(),
                capability_id: compensation.capability_id.clone(),
                error,
            });
        }
    }

    fn record(&self, ctx: &mut WorkflowContext, result: StepResult) {
        self.events.execution(ctx).step_finished(&result);
        ctx.record(result);
    }
}

fn timed_out(workflow: &Workflow) -> OrchestrationError {
    OrchestrationError::WorkflowTimeout {
        workflow_id: workflow.id.clone(),
        timeout: workflow.timeout.unwrap_or_default(),
    }
}

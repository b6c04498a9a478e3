//! Lifecycle events emitted while workflows run

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use crate::context::{StepOutcome, StepResult, WorkflowContext, WorkflowResult, WorkflowStatus};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        workflow_id: String,
        execution_id: String,
        at: DateTime<Utc>,
    },
    StepFinished {
        workflow_id: String,
        execution_id: String,
        step_id: String,
        outcome: StepOutcome,
        attempts: u32,
    },
    Finished {
        workflow_id: String,
        execution_id: String,
        status: WorkflowStatus,
        #[serde(with = "millis")]
        duration: Duration,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> &str {
        match self {
            Self::Started { workflow_id, .. }
            | Self::StepFinished { workflow_id, .. }
            | Self::Finished { workflow_id, .. } => workflow_id,
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id, .. }
            | Self::StepFinished { execution_id, .. }
            | Self::Finished { execution_id, .. } => execution_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "workflow.started",
            Self::StepFinished { .. } => "workflow.step_finished",
            Self::Finished { .. } => "workflow.finished",
        }
    }

    /// The last event an execution emits
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Fan-out of workflow lifecycle events. Emitting never blocks a run;
/// slow receivers observe `Lagged`.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<WorkflowEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Events of every workflow
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Events of one workflow, across all of its executions
    pub fn subscribe_workflow(&self, workflow_id: impl Into<String>) -> WorkflowEvents {
        WorkflowEvents {
            workflow_id: workflow_id.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Emitter for the execution tracked by `ctx`
    pub fn execution(&self, ctx: &WorkflowContext) -> ExecutionEvents<'_> {
        ExecutionEvents {
            bus: self,
            workflow_id: ctx.workflow_id.clone(),
            execution_id: ctx.execution_id.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn emit(&self, event: WorkflowEvent) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        debug!(
            "Workflow '{}' execution {}: {}",
            event.workflow_id(),
            event.execution_id(),
            event.name()
        );
        // Receivers may all have gone since the check
        let _ = self.sender.send(event);
    }
}

/// Emits the lifecycle of a single execution
pub struct ExecutionEvents<'a> {
    bus: &'a EventBus,
    workflow_id: String,
    execution_id: String,
}

impl ExecutionEvents<'_> {
    pub fn started(&self, at: DateTime<Utc>) {
        self.bus.emit(WorkflowEvent::Started {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
            at,
        });
    }

    pub fn step_finished(&self, result: &StepResult) {
        self.bus.emit(WorkflowEvent::StepFinished {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
            step_id: result.step_id.clone(),
            outcome: result.outcome,
            attempts: result.attempts,
        });
    }

    pub fn finished(&self, result: &WorkflowResult) {
        self.bus.emit(WorkflowEvent::Finished {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
            status: result.status,
            duration: result.duration,
        });
    }
}

/// Receiver narrowed to one workflow's events
pub struct WorkflowEvents {
    workflow_id: String,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl WorkflowEvents {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Next event of this workflow; events of other workflows are skipped.
    pub async fn recv(&mut self) -> Result<WorkflowEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.workflow_id() == self.workflow_id {
                return Ok(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Result<WorkflowEvent, TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if event.workflow_id() == self.workflow_id {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn context(workflow_id: &str) -> WorkflowContext {
        WorkflowContext::new(workflow_id, HashMap::new())
    }

    #[tokio::test]
    async fn test_execution_events_reach_all_subscribers() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let ctx = context("report");
        bus.execution(&ctx).started(ctx.started_at);

        let event = rx1.recv().await.unwrap();
        assert_eq!(event.workflow_id(), "report");
        assert_eq!(event.execution_id(), ctx.execution_id);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_execution_lifecycle_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_workflow("report");

        let mut ctx = context("report");
        let events = bus.execution(&ctx);
        events.started(ctx.started_at);
        events.step_finished(&StepResult::skipped("gather"));
        ctx.status = WorkflowStatus::Completed;
        events.finished(&ctx.finish(None));

        let started = rx.recv().await.unwrap();
        assert_eq!(started.name(), "workflow.started");
        match rx.recv().await.unwrap() {
            WorkflowEvent::StepFinished {
                step_id, outcome, ..
            } => {
                assert_eq!(step_id, "gather");
                assert_eq!(outcome, StepOutcome::Skipped);
            }
            other => panic!("unexpected event {:?}", other),
        }
        let finished = rx.recv().await.unwrap();
        assert!(finished.is_terminal());
        assert!(!started.is_terminal());
    }

    #[tokio::test]
    async fn test_workflow_subscription_skips_other_workflows() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_workflow("report");
        assert_eq!(rx.workflow_id(), "report");

        let other = context("payroll");
        let mine = context("report");
        bus.execution(&other).started(other.started_at);
        bus.execution(&mine).started(mine.started_at);
        bus.execution(&other).started(other.started_at);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.execution_id(), mine.execution_id);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(8);
        let ctx = context("report");
        bus.execution(&ctx).started(ctx.started_at);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        let ctx = context("report");
        bus.execution(&ctx).started(ctx.started_at);
        assert_eq!(rx.try_recv().unwrap().workflow_id(), "report");
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkflowEvent::Finished {
            workflow_id: "wf".to_string(),
            execution_id: "e1".to_string(),
            status: WorkflowStatus::Completed,
            duration: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "finished");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["duration"], 1500);
        assert_eq!(event.name(), "workflow.finished");
    }
}

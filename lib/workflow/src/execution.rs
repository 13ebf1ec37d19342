//! Workflow execution state machine.
//!
//! An execution records one run of a workflow. The state machine tracks:
//! - Overall execution status (forward-only, enforced by a transition table)
//! - Per-step records with their own status, attempts and output
//! - An append-only event log describing every status change
//!
//! Status fields are private. The only way to change them is through the
//! transition methods, which reject anything the table does not allow.

use crate::definition::WorkflowDefinition;
use crate::error::TransitionError;
use crate::step::{ActionKind, StepSequence, WorkflowStep};
use crate::trigger::{TriggerCriteria, TriggerKind, TriggerPayload};
use chrono::{DateTime, Utc};
use dealflow_core::{
    ExecutionId, OrganizationId, StepExecutionId, StepId, UserId, WorkflowId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Execution is in progress (possibly suspended on a wait step).
    Running,
    /// Every step completed.
    Completed,
    /// A step failed permanently.
    Failed,
    /// Cancellation was requested and observed between steps.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns the string representation stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses from the database string representation.
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition table allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }

    fn transition_to(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: "execution",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// The status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not started.
    Pending,
    /// Step is executing, retrying, or waiting for its resume time.
    Running,
    /// Step completed successfully.
    Completed,
    /// Step failed permanently.
    Failed,
    /// Step will not run (execution was cancelled while it waited).
    Skipped,
}

impl StepStatus {
    /// Returns the string representation stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parses from the database string representation.
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if the transition table allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Completed | Self::Failed | Self::Skipped)
        )
    }

    fn transition_to(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: "step",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// A record of a single workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub organization_id: OrganizationId,
    /// Soft reference; the workflow may have been deleted since.
    pub workflow_id: WorkflowId,
    pub triggered_by: Option<UserId>,
    pub trigger_kind: TriggerKind,
    /// Payload snapshot taken when the trigger fired.
    pub trigger_payload: TriggerPayload,
    /// Criteria snapshot taken when the trigger fired.
    pub trigger_config: TriggerCriteria,
    /// Steps as they were when the trigger fired. Later edits to the
    /// workflow, or its deletion, do not change what this execution runs.
    pub step_snapshot: StepSequence,
    pub dedupe_key: Option<String>,
    status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    pub cancel_requested: bool,
    /// Set while the execution is suspended on a wait step.
    pub resume_at: Option<DateTime<Utc>>,
}

/// Every field of a stored execution, used to rebuild one from storage.
#[derive(Debug, Clone)]
pub struct ExecutionParts {
    pub id: ExecutionId,
    pub organization_id: OrganizationId,
    pub workflow_id: WorkflowId,
    pub triggered_by: Option<UserId>,
    pub trigger_kind: TriggerKind,
    pub trigger_payload: TriggerPayload,
    pub trigger_config: TriggerCriteria,
    pub step_snapshot: StepSequence,
    pub dedupe_key: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub resume_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Starts a new execution of a workflow, snapshotting its trigger config
    /// and steps.
    #[must_use]
    pub fn start(
        workflow: &WorkflowDefinition,
        steps: StepSequence,
        payload: TriggerPayload,
        triggered_by: Option<UserId>,
        dedupe_key: Option<String>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            organization_id: workflow.organization_id,
            workflow_id: workflow.id,
            triggered_by,
            trigger_kind: workflow.trigger_kind,
            trigger_payload: payload,
            trigger_config: workflow.trigger_config.clone(),
            step_snapshot: steps,
            dedupe_key,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            cancel_requested: false,
            resume_at: None,
        }
    }

    /// Rebuilds an execution loaded from storage.
    #[must_use]
    pub fn restore(parts: ExecutionParts) -> Self {
        Self {
            id: parts.id,
            organization_id: parts.organization_id,
            workflow_id: parts.workflow_id,
            triggered_by: parts.triggered_by,
            trigger_kind: parts.trigger_kind,
            trigger_payload: parts.trigger_payload,
            trigger_config: parts.trigger_config,
            step_snapshot: parts.step_snapshot,
            dedupe_key: parts.dedupe_key,
            status: parts.status,
            started_at: parts.started_at,
            finished_at: parts.finished_at,
            error: parts.error,
            cancel_requested: parts.cancel_requested,
            resume_at: parts.resume_at,
        }
    }

    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Error message if failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Marks the execution as completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is not running.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish(ExecutionStatus::Completed, now)
    }

    /// Marks the execution as failed with an error message.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is not running.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish(ExecutionStatus::Failed, now)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Marks the execution as cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution is not running.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish(ExecutionStatus::Cancelled, now)
    }

    fn finish(&mut self, next: ExecutionStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition_to(next)?;
        self.finished_at = Some(now);
        self.resume_at = None;
        Ok(())
    }

    /// Flags the execution for cancellation at the next step boundary.
    ///
    /// Returns false if the execution already finished.
    pub fn request_cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// Returns the duration of the execution so far.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }

    /// Returns the id and status.
    #[must_use]
    pub fn handle(&self) -> ExecutionHandle {
        ExecutionHandle {
            id: self.id,
            status: self.status,
        }
    }
}

/// The identity and current status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionHandle {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
}

/// Execution record for a single step within an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepExecutionRecord {
    pub id: StepExecutionId,
    pub organization_id: OrganizationId,
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub position: i32,
    pub action_kind: ActionKind,
    status: StepStatus,
    /// Number of times the handler was invoked.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// When a waiting step may complete.
    pub resume_at: Option<DateTime<Utc>>,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
}

/// Every field of a stored step record, used to rebuild one from storage.
#[derive(Debug, Clone)]
pub struct StepRecordParts {
    pub id: StepExecutionId,
    pub organization_id: OrganizationId,
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub position: i32,
    pub action_kind: ActionKind,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
}

impl StepExecutionRecord {
    /// Creates a pending record for a step of an execution.
    #[must_use]
    pub fn pending(execution: &WorkflowExecution, step: &WorkflowStep) -> Self {
        Self {
            id: StepExecutionId::new(),
            organization_id: execution.organization_id,
            execution_id: execution.id,
            step_id: step.id,
            position: step.position,
            action_kind: step.action.kind(),
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            resume_at: None,
            output: None,
            error: None,
        }
    }

    /// Rebuilds a record loaded from storage.
    #[must_use]
    pub fn restore(parts: StepRecordParts) -> Self {
        Self {
            id: parts.id,
            organization_id: parts.organization_id,
            execution_id: parts.execution_id,
            step_id: parts.step_id,
            position: parts.position,
            action_kind: parts.action_kind,
            status: parts.status,
            attempts: parts.attempts,
            started_at: parts.started_at,
            finished_at: parts.finished_at,
            resume_at: parts.resume_at,
            output: parts.output,
            error: parts.error,
        }
    }

    #[must_use]
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Returns true if the step is running and parked until `resume_at`.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.status == StepStatus::Running && self.resume_at.is_some()
    }

    /// Starts the step and counts the first attempt.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step is pending.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition_to(StepStatus::Running)?;
        self.started_at = Some(now);
        self.attempts = 1;
        Ok(())
    }

    /// Counts another attempt of a running step.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step is running.
    pub fn retry(&mut self) -> Result<(), TransitionError> {
        if self.status != StepStatus::Running {
            return Err(TransitionError {
                entity: "step",
                from: self.status.as_str(),
                to: StepStatus::Running.as_str(),
            });
        }
        self.attempts += 1;
        Ok(())
    }

    /// Parks a running step until `resume_at`.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step is running.
    pub fn wait_until(&mut self, resume_at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != StepStatus::Running {
            return Err(TransitionError {
                entity: "step",
                from: self.status.as_str(),
                to: StepStatus::Running.as_str(),
            });
        }
        self.resume_at = Some(resume_at);
        Ok(())
    }

    /// Marks the step as completed with its output.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step is running.
    pub fn complete(&mut self, output: JsonValue, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition_to(StepStatus::Completed)?;
        self.finished_at = Some(now);
        self.output = Some(output);
        Ok(())
    }

    /// Marks the step as failed.
    ///
    /// # Errors
    ///
    /// Returns an error unless the step is running.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition_to(StepStatus::Failed)?;
        self.finished_at = Some(now);
        self.error = Some(error.into());
        Ok(())
    }

    /// Marks the step as skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the step already finished.
    pub fn skip(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.transition_to(StepStatus::Skipped)?;
        self.finished_at = Some(now);
        Ok(())
    }
}

/// Entries of the append-only execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        trigger_kind: TriggerKind,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        execution_id: ExecutionId,
        step_id: StepId,
        position: i32,
        timestamp: DateTime<Utc>,
    },
    /// A transient failure will be retried after `delay_ms`.
    StepRetrying {
        execution_id: ExecutionId,
        step_id: StepId,
        position: i32,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepWaiting {
        execution_id: ExecutionId,
        step_id: StepId,
        position: i32,
        resume_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step_id: StepId,
        position: i32,
        output: JsonValue,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        execution_id: ExecutionId,
        step_id: StepId,
        position: i32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepSkipped {
        execution_id: ExecutionId,
        step_id: StepId,
        position: i32,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
    ExecutionFailed {
        execution_id: ExecutionId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCancelled {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Returns the execution ID associated with this event.
    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepRetrying { execution_id, .. }
            | Self::StepWaiting { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ExecutionCancelled { execution_id, .. } => *execution_id,
        }
    }

    /// Returns the timestamp of this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ExecutionStarted { timestamp, .. }
            | Self::StepStarted { timestamp, .. }
            | Self::StepRetrying { timestamp, .. }
            | Self::StepWaiting { timestamp, .. }
            | Self::StepCompleted { timestamp, .. }
            | Self::StepFailed { timestamp, .. }
            | Self::StepSkipped { timestamp, .. }
            | Self::ExecutionCompleted { timestamp, .. }
            | Self::ExecutionFailed { timestamp, .. }
            | Self::ExecutionCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the event type name, as used in the serialized `type` tag.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepWaiting { .. } => "step_waiting",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
        }
    }
}

/// An execution with its step records and event history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: WorkflowExecution,
    pub steps: Vec<StepExecutionRecord>,
    pub events: Vec<ExecutionEvent>,
}

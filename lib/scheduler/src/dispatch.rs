//! The automation service's front door.
//!
//! The [`Dispatcher`] owns everything that happens on the request path:
//! managing definitions, turning trigger events into queued executions,
//! running workflows on demand, and reading execution history. It never runs
//! steps itself; executions are handed to the [`Worker`](crate::Worker)
//! through the [`JobQueue`].

use crate::error::DispatchError;
use crate::queue::JobQueue;
use chrono::Utc;
use dealflow_core::{ExecutionId, OrganizationId, Result, UserId, WorkflowId};
use dealflow_workflow::{
    ExecutionDetail, ExecutionEvent, ExecutionHandle, ExecutionLog, ExecutionQuery,
    ExecutionStatus, StepDraft, StepSequence, TriggerEvent, TriggerPayload, WorkflowDefinition,
    WorkflowDetail, WorkflowDraft, WorkflowExecution, WorkflowRepository, matching_workflows,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Tenant-scoped operations on workflows and their executions.
pub struct Dispatcher {
    workflows: Arc<dyn WorkflowRepository>,
    log: Arc<dyn ExecutionLog>,
    queue: Arc<dyn JobQueue>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        log: Arc<dyn ExecutionLog>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            workflows,
            log,
            queue,
        }
    }

    /// Starts every active workflow whose trigger matches the event.
    ///
    /// Failures are logged and never returned: a CRM write must not fail
    /// because automation is unavailable.
    pub async fn fire_trigger(&self, organization_id: OrganizationId, event: TriggerEvent) {
        if let Err(report) = self.enqueue_matches(organization_id, &event).await {
            tracing::error!(
                organization_id = %organization_id,
                trigger_kind = %event.kind,
                error = %report,
                "failed to dispatch trigger event"
            );
        }
    }

    /// Starts every active workflow whose trigger matches the event and
    /// returns the new executions.
    ///
    /// An event carrying a dedupe key starts each workflow at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage port or the queue fails. Executions
    /// created before the failure stay queued.
    #[instrument(skip(self, event), fields(organization_id = %organization_id, trigger_kind = %event.kind))]
    pub async fn enqueue_matches(
        &self,
        organization_id: OrganizationId,
        event: &TriggerEvent,
    ) -> Result<Vec<ExecutionId>, DispatchError> {
        if !event.kind.is_automatic() {
            debug!("manual events never match automatically");
            return Ok(Vec::new());
        }

        let candidates = self
            .workflows
            .list_active_by_trigger(organization_id, event.kind)
            .await
            .map_err(DispatchError::Store)?;

        let matched = matching_workflows(organization_id, event, &candidates);
        debug!(candidates = candidates.len(), matched = matched.len(), "trigger matched");

        let mut started = Vec::with_capacity(matched.len());
        for workflow in candidates
            .iter()
            .filter(|workflow| matched.contains(&workflow.id))
        {
            let steps = self.load_steps(organization_id, workflow.id).await?;
            let execution = WorkflowExecution::start(
                workflow,
                steps,
                event.payload.clone(),
                event.actor,
                event.dedupe_key.clone(),
            );
            if !self.enqueue_execution(&execution).await? {
                debug!(workflow_id = %workflow.id, "duplicate event ignored");
                continue;
            }
            started.push(execution.id);
        }

        if !started.is_empty() {
            info!(executions = started.len(), "workflows triggered");
        }
        Ok(started)
    }

    /// Runs a workflow on demand, whatever its trigger kind.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowNotFound` if the workflow does not exist in this
    /// organization and `WorkflowInactive` if it is switched off.
    #[instrument(skip(self, payload), fields(organization_id = %organization_id, workflow_id = %workflow_id))]
    pub async fn execute_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        payload: TriggerPayload,
        triggered_by: Option<UserId>,
    ) -> Result<ExecutionHandle, DispatchError> {
        let workflow = self.load_workflow(organization_id, workflow_id).await?;
        if !workflow.active {
            return Err(DispatchError::WorkflowInactive { workflow_id }.into());
        }

        let steps = self.load_steps(organization_id, workflow_id).await?;
        let execution = WorkflowExecution::start(&workflow, steps, payload, triggered_by, None);
        self.enqueue_execution(&execution).await?;
        info!(execution_id = %execution.id, "manual execution queued");
        Ok(execution.handle())
    }

    /// Lists executions newest first, optionally for one workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution log fails.
    pub async fn get_executions(
        &self,
        organization_id: OrganizationId,
        workflow_id: Option<WorkflowId>,
        limit: Option<u32>,
    ) -> Result<Vec<WorkflowExecution>, DispatchError> {
        let query = ExecutionQuery::new(workflow_id, limit);
        let executions = self
            .log
            .list_executions(organization_id, query)
            .await
            .map_err(DispatchError::Store)?;
        Ok(executions)
    }

    /// Loads an execution with its step records and events.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound` if the execution does not exist in this
    /// organization.
    pub async fn get_execution(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<ExecutionDetail, DispatchError> {
        let execution = self
            .log
            .find_execution(organization_id, execution_id)
            .await
            .map_err(DispatchError::Store)?
            .ok_or(DispatchError::ExecutionNotFound { execution_id })?;
        let steps = self
            .log
            .list_step_records(organization_id, execution_id)
            .await
            .map_err(DispatchError::Store)?;
        let events = self
            .log
            .list_events(organization_id, execution_id)
            .await
            .map_err(DispatchError::Store)?;

        Ok(ExecutionDetail {
            execution,
            steps,
            events,
        })
    }

    /// Requests cancellation of a running execution.
    ///
    /// The execution stops before its next step. A waiting execution is
    /// woken immediately so the cancellation takes effect without waiting
    /// for the timer.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionNotFound` if the execution does not exist and a
    /// transition error if it already finished.
    #[instrument(skip(self), fields(organization_id = %organization_id, execution_id = %execution_id))]
    pub async fn cancel_execution(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<ExecutionHandle, DispatchError> {
        let execution = self
            .log
            .request_cancel(organization_id, execution_id)
            .await
            .map_err(DispatchError::Store)?
            .ok_or(DispatchError::ExecutionNotFound { execution_id })?;

        if execution.is_terminal() {
            return Err(DispatchError::Transition(dealflow_workflow::TransitionError {
                entity: "execution",
                from: execution.status().as_str(),
                to: ExecutionStatus::Cancelled.as_str(),
            })
            .into());
        }

        self.queue
            .enqueue(organization_id, execution_id, Utc::now())
            .await
            .map_err(DispatchError::Queue)?;
        info!("cancellation requested");
        Ok(execution.handle())
    }

    /// Creates a definition with its steps.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the draft is invalid.
    #[instrument(skip(self, draft), fields(organization_id = %organization_id, name = %draft.name))]
    pub async fn create_workflow(
        &self,
        organization_id: OrganizationId,
        created_by: Option<UserId>,
        draft: WorkflowDraft,
    ) -> Result<WorkflowDetail, DispatchError> {
        let (definition, steps) = draft
            .into_new(organization_id, created_by)
            .map_err(DispatchError::Validation)?;
        self.workflows
            .insert_workflow(&definition, &steps)
            .await
            .map_err(DispatchError::Store)?;

        info!(workflow_id = %definition.id, steps = steps.len(), "workflow created");
        Ok(WorkflowDetail { definition, steps })
    }

    /// Replaces a definition's fields and steps.
    ///
    /// Executions already started keep the snapshot they were started with.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowNotFound` or a validation error.
    #[instrument(skip(self, draft), fields(organization_id = %organization_id, workflow_id = %workflow_id))]
    pub async fn update_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        draft: WorkflowDraft,
    ) -> Result<WorkflowDetail, DispatchError> {
        let existing = self.load_workflow(organization_id, workflow_id).await?;
        let (definition, steps) = draft
            .apply_to(&existing)
            .map_err(DispatchError::Validation)?;

        let updated = self
            .workflows
            .update_workflow(&definition, &steps)
            .await
            .map_err(DispatchError::Store)?;
        if !updated {
            return Err(DispatchError::WorkflowNotFound { workflow_id }.into());
        }
        Ok(WorkflowDetail { definition, steps })
    }

    /// Replaces only the steps of a definition.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowNotFound` or a validation error.
    pub async fn replace_steps(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        drafts: Vec<StepDraft>,
    ) -> Result<StepSequence, DispatchError> {
        let steps =
            StepSequence::from_drafts(workflow_id, drafts).map_err(DispatchError::Validation)?;
        let replaced = self
            .workflows
            .replace_steps(organization_id, workflow_id, &steps)
            .await
            .map_err(DispatchError::Store)?;
        if !replaced {
            return Err(DispatchError::WorkflowNotFound { workflow_id }.into());
        }
        Ok(steps)
    }

    /// Switches a definition on or off.
    ///
    /// Only future automatic matches are affected.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowNotFound` if the workflow does not exist.
    #[instrument(skip(self), fields(organization_id = %organization_id, workflow_id = %workflow_id))]
    pub async fn set_active(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        active: bool,
    ) -> Result<WorkflowDefinition, DispatchError> {
        let definition = self
            .workflows
            .set_active(organization_id, workflow_id, active)
            .await
            .map_err(DispatchError::Store)?
            .ok_or(DispatchError::WorkflowNotFound { workflow_id })?;
        info!(active, "workflow activation changed");
        Ok(definition)
    }

    /// Deletes a definition and its steps.
    ///
    /// Past executions and their snapshots are kept; executions still running
    /// finish from their step snapshot.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowNotFound` if the workflow does not exist.
    #[instrument(skip(self), fields(organization_id = %organization_id, workflow_id = %workflow_id))]
    pub async fn delete_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<(), DispatchError> {
        let deleted = self
            .workflows
            .delete_workflow(organization_id, workflow_id)
            .await
            .map_err(DispatchError::Store)?;
        if !deleted {
            return Err(DispatchError::WorkflowNotFound { workflow_id }.into());
        }
        info!("workflow deleted");
        Ok(())
    }

    /// Lists the organization's definitions, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository fails.
    pub async fn list_workflows(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<WorkflowDefinition>, DispatchError> {
        let workflows = self
            .workflows
            .list_workflows(organization_id)
            .await
            .map_err(DispatchError::Store)?;
        Ok(workflows)
    }

    /// Loads a definition with its steps.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowNotFound` if the workflow does not exist.
    pub async fn get_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDetail, DispatchError> {
        let definition = self.load_workflow(organization_id, workflow_id).await?;
        let steps = self
            .workflows
            .list_steps(organization_id, workflow_id)
            .await
            .map_err(DispatchError::Store)?;
        Ok(WorkflowDetail { definition, steps })
    }

    async fn load_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, DispatchError> {
        let workflow = self
            .workflows
            .find_workflow(organization_id, workflow_id)
            .await
            .map_err(DispatchError::Store)?
            .ok_or(DispatchError::WorkflowNotFound { workflow_id })?;
        Ok(workflow)
    }

    async fn load_steps(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<StepSequence, DispatchError> {
        let steps = self
            .workflows
            .list_steps(organization_id, workflow_id)
            .await
            .map_err(DispatchError::Store)?;
        Ok(steps)
    }

    /// Stores a new execution, records its start and queues it.
    ///
    /// Returns false if the execution was a duplicate and nothing was stored.
    /// An execution that was stored but could not be queued is marked failed,
    /// since no worker would ever pick it up.
    async fn enqueue_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<bool, DispatchError> {
        let organization_id = execution.organization_id;
        let inserted = self
            .log
            .insert_execution(execution)
            .await
            .map_err(DispatchError::Store)?;
        if !inserted {
            return Ok(false);
        }

        let event = ExecutionEvent::ExecutionStarted {
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            trigger_kind: execution.trigger_kind,
            timestamp: execution.started_at,
        };
        let queued = match self.log.append_event(organization_id, &event).await {
            Ok(()) => self
                .queue
                .enqueue(organization_id, execution.id, Utc::now())
                .await
                .map_err(DispatchError::Queue),
            Err(e) => Err(DispatchError::Store(e)),
        };
        if let Err(error) = queued {
            self.abandon(execution, &error).await;
            return Err(error.into());
        }
        Ok(true)
    }

    /// Fails an execution that never reached the queue. Errors here are only
    /// logged; the caller already has the original failure.
    async fn abandon(&self, execution: &WorkflowExecution, cause: &DispatchError) {
        let mut execution = execution.clone();
        let now = Utc::now();
        let error = format!("execution could not be queued: {cause}");
        if let Err(e) = execution.fail(error.clone(), now) {
            tracing::error!(
                execution_id = %execution.id,
                error = %e,
                "cannot fail unqueued execution"
            );
            return;
        }
        if let Err(e) = self.log.update_execution(&execution).await {
            tracing::error!(
                execution_id = %execution.id,
                error = %e,
                "failed to mark unqueued execution failed"
            );
            return;
        }
        let event = ExecutionEvent::ExecutionFailed {
            execution_id: execution.id,
            error,
            timestamp: now,
        };
        if let Err(e) = self.log.append_event(execution.organization_id, &event).await {
            tracing::warn!(
                execution_id = %execution.id,
                error = %e,
                "failed to record execution failure"
            );
        }
    }
}

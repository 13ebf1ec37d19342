//! In-process implementations of the storage ports.
//!
//! Used by tests throughout the workspace and handy for running the engine
//! without a database. Nothing here survives a restart.

use crate::crm::{Activity, CrmGateway, Deal, DealPatch, NewActivity, NewNotification, Notification};
use crate::definition::WorkflowDefinition;
use crate::error::StoreError;
use crate::execution::{ExecutionEvent, StepExecutionRecord, WorkflowExecution};
use crate::log::{ExecutionLog, ExecutionQuery};
use crate::step::StepSequence;
use crate::store::WorkflowRepository;
use crate::trigger::TriggerKind;
use async_trait::async_trait;
use dealflow_core::{ActivityId, DealId, ExecutionId, OrganizationId, WorkflowId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Definitions and steps held in memory.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: Mutex<HashMap<WorkflowId, (WorkflowDefinition, StepSequence)>>,
}

impl InMemoryWorkflowRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored steps across all workflows.
    #[must_use]
    pub fn step_count(&self) -> usize {
        lock(&self.workflows)
            .values()
            .map(|(_, steps)| steps.len())
            .sum()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn insert_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &StepSequence,
    ) -> Result<(), StoreError> {
        let mut workflows = lock(&self.workflows);
        if workflows.contains_key(&workflow.id) {
            return Err(StoreError::Conflict {
                reason: format!("workflow {} already exists", workflow.id),
            });
        }
        workflows.insert(workflow.id, (workflow.clone(), steps.clone()));
        Ok(())
    }

    async fn update_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &StepSequence,
    ) -> Result<bool, StoreError> {
        let mut workflows = lock(&self.workflows);
        match workflows.get_mut(&workflow.id) {
            Some(entry) if entry.0.organization_id == workflow.organization_id => {
                *entry = (workflow.clone(), steps.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_steps(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        steps: &StepSequence,
    ) -> Result<bool, StoreError> {
        let mut workflows = lock(&self.workflows);
        match workflows.get_mut(&workflow_id) {
            Some(entry) if entry.0.organization_id == organization_id => {
                entry.1 = steps.clone();
                entry.0.updated_at = chrono::Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_active(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        active: bool,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let mut workflows = lock(&self.workflows);
        match workflows.get_mut(&workflow_id) {
            Some(entry) if entry.0.organization_id == organization_id => {
                entry.0.set_active(active);
                Ok(Some(entry.0.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<bool, StoreError> {
        let mut workflows = lock(&self.workflows);
        let owned = workflows
            .get(&workflow_id)
            .is_some_and(|(w, _)| w.organization_id == organization_id);
        if owned {
            workflows.remove(&workflow_id);
        }
        Ok(owned)
    }

    async fn find_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(lock(&self.workflows)
            .get(&workflow_id)
            .filter(|(w, _)| w.organization_id == organization_id)
            .map(|(w, _)| w.clone()))
    }

    async fn list_workflows(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut workflows: Vec<_> = lock(&self.workflows)
            .values()
            .filter(|(w, _)| w.organization_id == organization_id)
            .map(|(w, _)| w.clone())
            .collect();
        workflows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(workflows)
    }

    async fn list_active_by_trigger(
        &self,
        organization_id: OrganizationId,
        trigger_kind: TriggerKind,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut workflows: Vec<_> = lock(&self.workflows)
            .values()
            .filter(|(w, _)| {
                w.organization_id == organization_id && w.active && w.trigger_kind == trigger_kind
            })
            .map(|(w, _)| w.clone())
            .collect();
        workflows.sort_by_key(|w| w.id);
        Ok(workflows)
    }

    async fn list_steps(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<StepSequence, StoreError> {
        Ok(lock(&self.workflows)
            .get(&workflow_id)
            .filter(|(w, _)| w.organization_id == organization_id)
            .map(|(_, steps)| steps.clone())
            .unwrap_or_default())
    }
}

/// Executions, step records and events held in memory.
#[derive(Default)]
pub struct InMemoryExecutionLog {
    executions: Mutex<HashMap<ExecutionId, WorkflowExecution>>,
    records: Mutex<HashMap<ExecutionId, Vec<StepExecutionRecord>>>,
    events: Mutex<Vec<(OrganizationId, ExecutionEvent)>>,
}

impl InMemoryExecutionLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLog for InMemoryExecutionLog {
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<bool, StoreError> {
        let mut executions = lock(&self.executions);
        if let Some(key) = &execution.dedupe_key {
            let duplicate = executions.values().any(|existing| {
                existing.workflow_id == execution.workflow_id
                    && existing.dedupe_key.as_ref() == Some(key)
            });
            if duplicate {
                return Ok(false);
            }
        }
        executions.insert(execution.id, execution.clone());
        Ok(true)
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut executions = lock(&self.executions);
        let Some(stored) = executions
            .get_mut(&execution.id)
            .filter(|e| e.organization_id == execution.organization_id)
        else {
            return Err(StoreError::NotFound {
                entity: "execution",
                id: execution.id.to_string(),
            });
        };
        // The flag is only ever raised by request_cancel; a stale copy must not clear it
        let cancel_requested = stored.cancel_requested || execution.cancel_requested;
        *stored = execution.clone();
        stored.cancel_requested = cancel_requested;
        Ok(())
    }

    async fn find_execution(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(lock(&self.executions)
            .get(&execution_id)
            .filter(|e| e.organization_id == organization_id)
            .cloned())
    }

    async fn list_executions(
        &self,
        organization_id: OrganizationId,
        query: ExecutionQuery,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut executions: Vec<_> = lock(&self.executions)
            .values()
            .filter(|e| e.organization_id == organization_id)
            .filter(|e| query.workflow_id.is_none_or(|id| e.workflow_id == id))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        executions.truncate(query.limit as usize);
        Ok(executions)
    }

    async fn request_cancel(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let mut executions = lock(&self.executions);
        Ok(executions
            .get_mut(&execution_id)
            .filter(|e| e.organization_id == organization_id)
            .map(|execution| {
                execution.request_cancel();
                execution.clone()
            }))
    }

    async fn is_cancel_requested(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<bool, StoreError> {
        Ok(lock(&self.executions)
            .get(&execution_id)
            .filter(|e| e.organization_id == organization_id)
            .is_some_and(|e| e.cancel_requested))
    }

    async fn save_step_record(&self, record: &StepExecutionRecord) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        let entries = records.entry(record.execution_id).or_default();
        match entries.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => entries.push(record.clone()),
        }
        Ok(())
    }

    async fn list_step_records(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Vec<StepExecutionRecord>, StoreError> {
        let mut records: Vec<_> = lock(&self.records)
            .get(&execution_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|r| r.organization_id == organization_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| r.position);
        Ok(records)
    }

    async fn append_event(
        &self,
        organization_id: OrganizationId,
        event: &ExecutionEvent,
    ) -> Result<(), StoreError> {
        lock(&self.events).push((organization_id, event.clone()));
        Ok(())
    }

    async fn list_events(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        Ok(lock(&self.events)
            .iter()
            .filter(|(org, e)| *org == organization_id && e.execution_id() == execution_id)
            .map(|(_, e)| e.clone())
            .collect())
    }
}

/// CRM records held in memory, with injectable write failures.
#[derive(Default)]
pub struct InMemoryCrm {
    deals: Mutex<HashMap<DealId, Deal>>,
    activities: Mutex<Vec<Activity>>,
    notifications: Mutex<Vec<Notification>>,
    failures: Mutex<VecDeque<StoreError>>,
}

impl InMemoryCrm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a deal and returns it.
    pub fn insert_deal(&self, deal: Deal) -> Deal {
        lock(&self.deals).insert(deal.id, deal.clone());
        deal
    }

    /// Returns a deal regardless of organization.
    #[must_use]
    pub fn deal(&self, deal_id: DealId) -> Option<Deal> {
        lock(&self.deals).get(&deal_id).cloned()
    }

    /// Activities of an organization in creation order.
    #[must_use]
    pub fn activities(&self, organization_id: OrganizationId) -> Vec<Activity> {
        lock(&self.activities)
            .iter()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect()
    }

    /// Notifications of an organization in creation order.
    #[must_use]
    pub fn notifications(&self, organization_id: OrganizationId) -> Vec<Notification> {
        lock(&self.notifications)
            .iter()
            .filter(|n| n.organization_id == organization_id)
            .cloned()
            .collect()
    }

    /// Marks an activity of the organization completed and returns it.
    pub fn complete_activity(
        &self,
        organization_id: OrganizationId,
        activity_id: ActivityId,
    ) -> Option<Activity> {
        let mut activities = lock(&self.activities);
        let activity = activities
            .iter_mut()
            .find(|a| a.id == activity_id && a.organization_id == organization_id)?;
        activity.completed = true;
        Some(activity.clone())
    }

    /// Makes the next write fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: StoreError) {
        lock(&self.failures).push_back(error);
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        match lock(&self.failures).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CrmGateway for InMemoryCrm {
    async fn find_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
    ) -> Result<Option<Deal>, StoreError> {
        Ok(lock(&self.deals)
            .get(&deal_id)
            .filter(|d| d.organization_id == organization_id)
            .cloned())
    }

    async fn update_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
        patch: &DealPatch,
    ) -> Result<Option<Deal>, StoreError> {
        self.injected_failure()?;
        let mut deals = lock(&self.deals);
        Ok(deals
            .get_mut(&deal_id)
            .filter(|d| d.organization_id == organization_id)
            .map(|deal| {
                deal.apply(patch);
                deal.clone()
            }))
    }

    async fn create_activity(
        &self,
        organization_id: OrganizationId,
        activity: NewActivity,
    ) -> Result<Activity, StoreError> {
        self.injected_failure()?;
        let activity = activity.into_activity(organization_id);
        lock(&self.activities).push(activity.clone());
        Ok(activity)
    }

    async fn create_notification(
        &self,
        organization_id: OrganizationId,
        notification: NewNotification,
    ) -> Result<Notification, StoreError> {
        self.injected_failure()?;
        let notification = notification.into_notification(organization_id);
        lock(&self.notifications).push(notification.clone());
        Ok(notification)
    }
}

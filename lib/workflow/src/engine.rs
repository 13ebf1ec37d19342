//! Sequential execution engine.
//!
//! The engine advances one execution as far as it can: it runs the remaining
//! steps in position order, stops at the first permanent failure, observes
//! cancellation between steps, and suspends on wait steps. All progress is
//! written to the [`ExecutionLog`] before moving on, so an execution can be
//! picked up again by any worker at any point.
//!
//! Steps come from the snapshot stored on the execution, never from the
//! live definition.

use crate::context::ExecutionContext;
use crate::crm::CrmGateway;
use crate::error::EngineError;
use crate::execution::{
    ExecutionEvent, ExecutionStatus, StepExecutionRecord, StepStatus, WorkflowExecution,
};
use crate::handler::{ActionHandlers, StepOutcome};
use crate::log::ExecutionLog;
use crate::retry::RetryPolicy;
use crate::step::WorkflowStep;
use chrono::{DateTime, Utc};
use dealflow_core::{ExecutionId, OrganizationId};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

/// Result of advancing an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step completed.
    Completed,
    /// A step failed permanently.
    Failed { error: String },
    /// Cancellation was observed.
    Cancelled,
    /// A wait step is pending; run again at or after `resume_at`.
    Suspended { resume_at: DateTime<Utc> },
    /// The execution had already finished; nothing was done.
    AlreadyFinished(ExecutionStatus),
    /// The execution does not exist for this organization.
    NotFound,
}

impl RunOutcome {
    /// Returns true if the execution needs no further scheduling.
    #[must_use]
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Suspended { .. })
    }
}

enum StepProgress {
    Continue(StepExecutionRecord),
    Stop(RunOutcome),
}

/// Runs workflow executions step by step.
pub struct ExecutionEngine {
    log: Arc<dyn ExecutionLog>,
    handlers: ActionHandlers,
    retry: RetryPolicy,
}

impl ExecutionEngine {
    /// Creates an engine with the default retry policy.
    #[must_use]
    pub fn new(log: Arc<dyn ExecutionLog>, crm: Arc<dyn CrmGateway>) -> Self {
        Self {
            log,
            handlers: ActionHandlers::new(crm),
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy for transient handler failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Advances an execution using the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage port fails; handler failures are
    /// recorded on the execution instead.
    pub async fn run(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<RunOutcome, EngineError> {
        self.run_at(organization_id, execution_id, Utc::now()).await
    }

    /// Advances an execution as of `now`.
    ///
    /// `now` decides whether pending waits have elapsed and is used for every
    /// timestamp written during this pass.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage port fails; handler failures are
    /// recorded on the execution instead.
    #[instrument(skip(self), fields(organization_id = %organization_id, execution_id = %execution_id))]
    pub async fn run_at(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, EngineError> {
        let Some(mut execution) = self
            .log
            .find_execution(organization_id, execution_id)
            .await?
        else {
            tracing::warn!("execution not found");
            return Ok(RunOutcome::NotFound);
        };

        if execution.is_terminal() {
            tracing::debug!(status = execution.status().as_str(), "execution already finished");
            return Ok(RunOutcome::AlreadyFinished(execution.status()));
        }

        let mut records = self
            .log
            .list_step_records(organization_id, execution_id)
            .await?;

        if execution.cancel_requested {
            return self.cancel(&mut execution, &mut records, now).await;
        }

        if let Some(resume_at) = execution.resume_at {
            if resume_at > now {
                return Ok(RunOutcome::Suspended { resume_at });
            }
        }

        let steps = execution.step_snapshot.clone();
        let mut ctx = ExecutionContext::rebuild(&execution, &records);

        for step in &steps {
            let record = records
                .iter()
                .find(|r| r.step_id == step.id)
                .cloned()
                .unwrap_or_else(|| StepExecutionRecord::pending(&execution, step));

            match record.status() {
                StepStatus::Completed | StepStatus::Skipped => continue,
                StepStatus::Failed => {
                    let error = record
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("step {} failed", step.position));
                    return self.fail(&mut execution, error, now).await;
                }
                StepStatus::Pending | StepStatus::Running => {}
            }

            if self
                .log
                .is_cancel_requested(organization_id, execution_id)
                .await?
            {
                return self.cancel(&mut execution, &mut records, now).await;
            }

            match self
                .run_step(&mut execution, step, record, &mut ctx, now)
                .await?
            {
                StepProgress::Continue(record) => remember(&mut records, record),
                StepProgress::Stop(RunOutcome::Suspended { resume_at }) => {
                    // A cancel that raced with the suspension must not wait out the delay
                    if self
                        .log
                        .is_cancel_requested(organization_id, execution_id)
                        .await?
                    {
                        let mut records = self
                            .log
                            .list_step_records(organization_id, execution_id)
                            .await?;
                        return self.cancel(&mut execution, &mut records, now).await;
                    }
                    return Ok(RunOutcome::Suspended { resume_at });
                }
                StepProgress::Stop(outcome) => return Ok(outcome),
            }
        }

        execution.complete(now)?;
        self.log.update_execution(&execution).await?;
        self.append(
            &execution,
            ExecutionEvent::ExecutionCompleted {
                execution_id,
                timestamp: now,
            },
        )
        .await?;
        tracing::info!(steps = steps.len(), "execution completed");
        Ok(RunOutcome::Completed)
    }

    async fn run_step(
        &self,
        execution: &mut WorkflowExecution,
        step: &WorkflowStep,
        mut record: StepExecutionRecord,
        ctx: &mut ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<StepProgress, EngineError> {
        if record.status() == StepStatus::Running {
            if let Some(resume_at) = record.resume_at {
                return self
                    .resume_wait(execution, step, record, resume_at, ctx, now)
                    .await;
            }
            // A previous attempt was interrupted before it recorded an outcome
            record.retry()?;
        } else {
            record.start(now)?;
        }
        self.log.save_step_record(&record).await?;
        self.append(
            execution,
            ExecutionEvent::StepStarted {
                execution_id: execution.id,
                step_id: step.id,
                position: step.position,
                timestamp: now,
            },
        )
        .await?;

        loop {
            match self.handlers.run(&step.action, ctx, now).await {
                Ok(StepOutcome::Completed { output }) => {
                    record.complete(output.clone(), now)?;
                    self.log.save_step_record(&record).await?;
                    self.append(
                        execution,
                        ExecutionEvent::StepCompleted {
                            execution_id: execution.id,
                            step_id: step.id,
                            position: step.position,
                            output: output.clone(),
                            timestamp: now,
                        },
                    )
                    .await?;
                    tracing::debug!(
                        position = step.position,
                        action = step.action.kind().as_str(),
                        attempts = record.attempts,
                        "step completed"
                    );
                    ctx.record_output(step.position, output);
                    return Ok(StepProgress::Continue(record));
                }
                Ok(StepOutcome::Suspend { resume_at }) => {
                    record.wait_until(resume_at)?;
                    self.log.save_step_record(&record).await?;
                    execution.resume_at = Some(resume_at);
                    self.log.update_execution(execution).await?;
                    self.append(
                        execution,
                        ExecutionEvent::StepWaiting {
                            execution_id: execution.id,
                            step_id: step.id,
                            position: step.position,
                            resume_at,
                            timestamp: now,
                        },
                    )
                    .await?;
                    tracing::info!(position = step.position, %resume_at, "execution suspended");
                    return Ok(StepProgress::Stop(RunOutcome::Suspended { resume_at }));
                }
                Err(e) if e.is_transient() && self.retry.should_retry(record.attempts) => {
                    let delay = self.retry.backoff_for(record.attempts);
                    tracing::warn!(
                        position = step.position,
                        attempt = record.attempts,
                        backoff_ms = delay.as_millis(),
                        error = %e,
                        "transient step failure, retrying"
                    );
                    self.append(
                        execution,
                        ExecutionEvent::StepRetrying {
                            execution_id: execution.id,
                            step_id: step.id,
                            position: step.position,
                            attempt: record.attempts,
                            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error: e.to_string(),
                            timestamp: now,
                        },
                    )
                    .await?;
                    tokio::time::sleep(delay).await;
                    record.retry()?;
                    self.log.save_step_record(&record).await?;
                }
                Err(e) => {
                    let error = e.to_string();
                    record.fail(error.clone(), now)?;
                    self.log.save_step_record(&record).await?;
                    self.append(
                        execution,
                        ExecutionEvent::StepFailed {
                            execution_id: execution.id,
                            step_id: step.id,
                            position: step.position,
                            error: error.clone(),
                            timestamp: now,
                        },
                    )
                    .await?;
                    return self
                        .fail(execution, error, now)
                        .await
                        .map(StepProgress::Stop);
                }
            }
        }
    }

    async fn resume_wait(
        &self,
        execution: &mut WorkflowExecution,
        step: &WorkflowStep,
        mut record: StepExecutionRecord,
        resume_at: DateTime<Utc>,
        ctx: &mut ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<StepProgress, EngineError> {
        if resume_at > now {
            if execution.resume_at != Some(resume_at) {
                execution.resume_at = Some(resume_at);
                self.log.update_execution(execution).await?;
            }
            return Ok(StepProgress::Stop(RunOutcome::Suspended { resume_at }));
        }

        let output = json!({ "waited_until": resume_at });
        record.complete(output.clone(), now)?;
        self.log.save_step_record(&record).await?;
        execution.resume_at = None;
        self.log.update_execution(execution).await?;
        self.append(
            execution,
            ExecutionEvent::StepCompleted {
                execution_id: execution.id,
                step_id: step.id,
                position: step.position,
                output: output.clone(),
                timestamp: now,
            },
        )
        .await?;
        tracing::info!(position = step.position, "execution resumed after wait");
        ctx.record_output(step.position, output);
        Ok(StepProgress::Continue(record))
    }

    async fn cancel(
        &self,
        execution: &mut WorkflowExecution,
        records: &mut [StepExecutionRecord],
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, EngineError> {
        for record in records.iter_mut().filter(|r| r.is_waiting()) {
            record.skip(now)?;
            self.log.save_step_record(record).await?;
            self.append(
                execution,
                ExecutionEvent::StepSkipped {
                    execution_id: execution.id,
                    step_id: record.step_id,
                    position: record.position,
                    timestamp: now,
                },
            )
            .await?;
        }

        execution.cancel(now)?;
        self.log.update_execution(execution).await?;
        self.append(
            execution,
            ExecutionEvent::ExecutionCancelled {
                execution_id: execution.id,
                timestamp: now,
            },
        )
        .await?;
        tracing::info!(execution_id = %execution.id, "execution cancelled");
        Ok(RunOutcome::Cancelled)
    }

    async fn fail(
        &self,
        execution: &mut WorkflowExecution,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, EngineError> {
        execution.fail(error.clone(), now)?;
        self.log.update_execution(execution).await?;
        self.append(
            execution,
            ExecutionEvent::ExecutionFailed {
                execution_id: execution.id,
                error: error.clone(),
                timestamp: now,
            },
        )
        .await?;
        tracing::warn!(execution_id = %execution.id, error = %error, "execution failed");
        Ok(RunOutcome::Failed { error })
    }

    async fn append(
        &self,
        execution: &WorkflowExecution,
        event: ExecutionEvent,
    ) -> Result<(), EngineError> {
        self.log
            .append_event(execution.organization_id, &event)
            .await
            .map_err(EngineError::from)
    }
}

fn remember(records: &mut Vec<StepExecutionRecord>, record: StepExecutionRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{
        Activity, ActivityType, Deal, DealPatch, NewActivity, NewNotification, Notification,
    };
    use crate::definition::WorkflowDefinition;
    use crate::error::StoreError;
    use crate::memory::{InMemoryCrm, InMemoryExecutionLog, InMemoryWorkflowRepository};
    use crate::step::{
        CreateActivityConfig, Recipient, SendNotificationConfig, StepAction, StepSequence,
        UpdateDealConfig, WaitConfig, WaitDuration,
    };
    use crate::store::WorkflowRepository;
    use crate::trigger::{TriggerKind, TriggerPayload};
    use async_trait::async_trait;
    use chrono::Duration;
    use dealflow_core::{DealId, UserId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        org: OrganizationId,
        workflows: Arc<InMemoryWorkflowRepository>,
        log: Arc<InMemoryExecutionLog>,
        crm: Arc<InMemoryCrm>,
        engine: ExecutionEngine,
    }

    impl Harness {
        fn new() -> Self {
            let crm = Arc::new(InMemoryCrm::new());
            Self::with_gateway(crm.clone(), crm)
        }

        fn with_gateway(crm: Arc<InMemoryCrm>, gateway: Arc<dyn CrmGateway>) -> Self {
            let workflows = Arc::new(InMemoryWorkflowRepository::new());
            let log = Arc::new(InMemoryExecutionLog::new());
            let engine = ExecutionEngine::new(log.clone(), gateway)
                .with_retry_policy(RetryPolicy::immediate());
            Self {
                org: OrganizationId::new(),
                workflows,
                log,
                crm,
                engine,
            }
        }

        async fn workflow(&self, actions: Vec<(i32, StepAction)>) -> WorkflowDefinition {
            let workflow =
                WorkflowDefinition::new(self.org, "Test workflow", TriggerKind::DealStageChanged);
            let steps = StepSequence::new(
                actions
                    .into_iter()
                    .map(|(position, action)| WorkflowStep::new(workflow.id, position, action))
                    .collect(),
            )
            .expect("valid steps");
            self.workflows
                .insert_workflow(&workflow, &steps)
                .await
                .expect("insert workflow");
            workflow
        }

        async fn start(
            &self,
            workflow: &WorkflowDefinition,
            payload: TriggerPayload,
        ) -> WorkflowExecution {
            let steps = self
                .workflows
                .list_steps(self.org, workflow.id)
                .await
                .expect("steps");
            let execution = WorkflowExecution::start(workflow, steps, payload, None, None);
            assert!(self.log.insert_execution(&execution).await.expect("insert"));
            execution
        }

        fn deal(&self, owner: Option<UserId>) -> Deal {
            let mut deal = Deal::new(self.org, "Acme renewal");
            deal.owner_id = owner;
            self.crm.insert_deal(deal)
        }

        async fn reload(&self, execution_id: ExecutionId) -> WorkflowExecution {
            self.log
                .find_execution(self.org, execution_id)
                .await
                .expect("find")
                .expect("exists")
        }

        async fn records(&self, execution_id: ExecutionId) -> Vec<StepExecutionRecord> {
            self.log
                .list_step_records(self.org, execution_id)
                .await
                .expect("records")
        }
    }

    fn task(title: &str) -> StepAction {
        StepAction::CreateActivity(CreateActivityConfig {
            activity_type: ActivityType::Task,
            title: title.to_string(),
            description: None,
            due_in: None,
        })
    }

    fn notify(message: &str) -> StepAction {
        StepAction::SendNotification(SendNotificationConfig {
            recipient: Recipient::EntityOwner,
            title: None,
            message: message.to_string(),
        })
    }

    fn wait_days(days: u32) -> StepAction {
        StepAction::Wait(WaitConfig {
            duration: WaitDuration::days(days),
        })
    }

    #[tokio::test]
    async fn completed_execution_records_every_step_in_order() {
        let h = Harness::new();
        let deal = h.deal(Some(UserId::new()));
        let workflow = h
            .workflow(vec![
                (30, notify("Done")),
                (10, task("Call")),
                (
                    20,
                    StepAction::UpdateDeal(UpdateDealConfig {
                        field: "probability".to_string(),
                        value: json!(60),
                    }),
                ),
            ])
            .await;
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;

        let outcome = h.engine.run(h.org, execution.id).await.expect("run");
        assert_eq!(outcome, RunOutcome::Completed);

        let records = h.records(execution.id).await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status() == StepStatus::Completed));
        let positions: Vec<_> = records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![10, 20, 30]);

        let stored = h.reload(execution.id).await;
        assert_eq!(stored.status(), ExecutionStatus::Completed);
        assert!(stored.finished_at().is_some());
        assert_eq!(h.crm.deal(deal.id).expect("deal").probability, Some(60));
    }

    /// Requests cancellation of the execution once a given number of
    /// activities has been created.
    struct CancelAfter {
        inner: Arc<InMemoryCrm>,
        log: Arc<InMemoryExecutionLog>,
        after: usize,
        created: AtomicUsize,
    }

    #[async_trait]
    impl CrmGateway for CancelAfter {
        async fn find_deal(
            &self,
            organization_id: OrganizationId,
            deal_id: DealId,
        ) -> Result<Option<Deal>, StoreError> {
            self.inner.find_deal(organization_id, deal_id).await
        }

        async fn update_deal(
            &self,
            organization_id: OrganizationId,
            deal_id: DealId,
            patch: &DealPatch,
        ) -> Result<Option<Deal>, StoreError> {
            self.inner.update_deal(organization_id, deal_id, patch).await
        }

        async fn create_activity(
            &self,
            organization_id: OrganizationId,
            activity: NewActivity,
        ) -> Result<Activity, StoreError> {
            let execution_id = activity.execution_id;
            let created = self.inner.create_activity(organization_id, activity).await?;
            if self.created.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                if let Some(execution_id) = execution_id {
                    self.log.request_cancel(organization_id, execution_id).await?;
                }
            }
            Ok(created)
        }

        async fn create_notification(
            &self,
            organization_id: OrganizationId,
            notification: NewNotification,
        ) -> Result<Notification, StoreError> {
            self.inner
                .create_notification(organization_id, notification)
                .await
        }
    }

    #[tokio::test]
    async fn cancellation_between_steps_keeps_completed_prefix() {
        let crm = Arc::new(InMemoryCrm::new());
        let log = Arc::new(InMemoryExecutionLog::new());
        let gateway = Arc::new(CancelAfter {
            inner: crm.clone(),
            log: log.clone(),
            after: 2,
            created: AtomicUsize::new(0),
        });
        let workflows = Arc::new(InMemoryWorkflowRepository::new());
        let h = Harness {
            org: OrganizationId::new(),
            engine: ExecutionEngine::new(log.clone(), gateway)
                .with_retry_policy(RetryPolicy::immediate()),
            workflows,
            log,
            crm,
        };
        let deal = h.deal(None);
        let workflow = h
            .workflow(vec![
                (1, task("one")),
                (2, task("two")),
                (3, task("three")),
                (4, task("four")),
            ])
            .await;
        let steps = h
            .workflows
            .list_steps(h.org, workflow.id)
            .await
            .expect("steps");
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;

        let outcome = h.engine.run(h.org, execution.id).await.expect("run");
        assert_eq!(outcome, RunOutcome::Cancelled);

        let records = h.records(execution.id).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status() == StepStatus::Completed));
        let third = &steps.as_slice()[2];
        assert!(records.iter().all(|r| r.step_id != third.id));
        assert_eq!(h.crm.activities(h.org).len(), 2);
        assert_eq!(h.reload(execution.id).await.status(), ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn permanent_failure_halts_execution() {
        let h = Harness::new();
        let workflow = h
            .workflow(vec![
                (
                    1,
                    StepAction::UpdateDeal(UpdateDealConfig {
                        field: "amount".to_string(),
                        value: json!(100),
                    }),
                ),
                (2, task("never")),
            ])
            .await;
        let missing = DealId::new();
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(missing)).await;

        let outcome = h.engine.run(h.org, execution.id).await.expect("run");
        let RunOutcome::Failed { error } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains(&missing.to_string()));

        let records = h.records(execution.id).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status(), StepStatus::Failed);
        assert_eq!(records[0].attempts, 1);
        assert!(h.crm.activities(h.org).is_empty());

        let stored = h.reload(execution.id).await;
        assert_eq!(stored.status(), ExecutionStatus::Failed);
        assert_eq!(stored.error(), Some(error.as_str()));
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let h = Harness::new();
        let deal = h.deal(None);
        let workflow = h.workflow(vec![(1, task("retry me"))]).await;
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;
        h.crm.fail_next(StoreError::Unavailable {
            reason: "connection reset".to_string(),
        });

        let outcome = h.engine.run(h.org, execution.id).await.expect("run");
        assert_eq!(outcome, RunOutcome::Completed);

        let records = h.records(execution.id).await;
        assert_eq!(records[0].attempts, 2);
        assert_eq!(h.crm.activities(h.org).len(), 1);

        let events = h.log.list_events(h.org, execution.id).await.expect("events");
        assert!(
            events
                .iter()
                .any(|e| matches!(e, ExecutionEvent::StepRetrying { attempt: 1, .. }))
        );
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_execution() {
        let h = Harness::new();
        let deal = h.deal(None);
        let workflow = h.workflow(vec![(1, task("flaky"))]).await;
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;
        for _ in 0..3 {
            h.crm.fail_next(StoreError::Unavailable {
                reason: "timeout".to_string(),
            });
        }

        let outcome = h.engine.run(h.org, execution.id).await.expect("run");
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        let records = h.records(execution.id).await;
        assert_eq!(records[0].attempts, 3);
        assert_eq!(records[0].status(), StepStatus::Failed);
    }

    #[tokio::test]
    async fn follow_up_scenario_waits_then_notifies() {
        let h = Harness::new();
        let owner = UserId::new();
        let deal = h.deal(Some(owner));
        let workflow = h
            .workflow(vec![
                (1, task("Follow up")),
                (2, wait_days(1)),
                (3, notify("Check in")),
            ])
            .await;
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;
        let now = Utc::now();

        let outcome = h.engine.run_at(h.org, execution.id, now).await.expect("run");
        let resume_at = now + Duration::days(1);
        assert_eq!(outcome, RunOutcome::Suspended { resume_at });

        let activities = h.crm.activities(h.org);
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].deal_id, Some(deal.id));
        assert_eq!(activities[0].title, "Follow up");
        assert!(h.crm.notifications(h.org).is_empty());

        let suspended = h.reload(execution.id).await;
        assert_eq!(suspended.status(), ExecutionStatus::Running);
        assert_eq!(suspended.resume_at, Some(resume_at));

        // Woken early: nothing happens
        let early = h
            .engine
            .run_at(h.org, execution.id, now + Duration::hours(1))
            .await
            .expect("run");
        assert_eq!(early, RunOutcome::Suspended { resume_at });
        assert!(h.crm.notifications(h.org).is_empty());

        let outcome = h
            .engine
            .run_at(h.org, execution.id, resume_at)
            .await
            .expect("run");
        assert_eq!(outcome, RunOutcome::Completed);

        let notifications = h.crm.notifications(h.org);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].recipient_id, owner);
        assert_eq!(notifications[0].message, "Check in");
        assert_eq!(h.crm.activities(h.org).len(), 1);

        let records = h.records(execution.id).await;
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status() == StepStatus::Completed));
        let finished = h.reload(execution.id).await;
        assert_eq!(finished.status(), ExecutionStatus::Completed);
        assert!(finished.resume_at.is_none());
    }

    #[tokio::test]
    async fn cancel_while_waiting_skips_wait_step() {
        let h = Harness::new();
        let deal = h.deal(None);
        let workflow = h
            .workflow(vec![(1, wait_days(2)), (2, task("after wait"))])
            .await;
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;
        let now = Utc::now();

        let outcome = h.engine.run_at(h.org, execution.id, now).await.expect("run");
        assert!(matches!(outcome, RunOutcome::Suspended { .. }));

        h.log
            .request_cancel(h.org, execution.id)
            .await
            .expect("cancel");
        let outcome = h.engine.run_at(h.org, execution.id, now).await.expect("run");
        assert_eq!(outcome, RunOutcome::Cancelled);

        let records = h.records(execution.id).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status(), StepStatus::Skipped);
        assert!(h.crm.activities(h.org).is_empty());
    }

    #[tokio::test]
    async fn finished_execution_is_left_alone() {
        let h = Harness::new();
        let deal = h.deal(None);
        let workflow = h.workflow(vec![(1, task("once"))]).await;
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;

        h.engine.run(h.org, execution.id).await.expect("run");
        let again = h.engine.run(h.org, execution.id).await.expect("run");
        assert_eq!(again, RunOutcome::AlreadyFinished(ExecutionStatus::Completed));
        assert_eq!(h.crm.activities(h.org).len(), 1);
    }

    #[tokio::test]
    async fn deleted_workflow_still_finishes_started_execution() {
        let h = Harness::new();
        let deal = h.deal(None);
        let workflow = h
            .workflow(vec![(1, wait_days(1)), (2, task("after delete"))])
            .await;
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;
        let now = Utc::now();

        let outcome = h.engine.run_at(h.org, execution.id, now).await.expect("run");
        assert!(matches!(outcome, RunOutcome::Suspended { .. }));
        h.workflows
            .delete_workflow(h.org, workflow.id)
            .await
            .expect("delete");

        let outcome = h
            .engine
            .run_at(h.org, execution.id, now + Duration::days(1))
            .await
            .expect("run");
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(h.crm.activities(h.org).len(), 1);
    }

    #[tokio::test]
    async fn editing_workflow_during_wait_does_not_rerun_steps() {
        let h = Harness::new();
        let deal = h.deal(Some(UserId::new()));
        let workflow = h
            .workflow(vec![
                (1, task("Follow up")),
                (2, wait_days(1)),
                (3, notify("Check in")),
            ])
            .await;
        let execution = h.start(&workflow, TriggerPayload::new().with_deal(deal.id)).await;
        let now = Utc::now();

        let outcome = h.engine.run_at(h.org, execution.id, now).await.expect("run");
        assert!(matches!(outcome, RunOutcome::Suspended { .. }));

        // Same actions, fresh step ids
        let edited = StepSequence::new(vec![
            WorkflowStep::new(workflow.id, 1, task("Follow up")),
            WorkflowStep::new(workflow.id, 2, wait_days(1)),
            WorkflowStep::new(workflow.id, 3, notify("Check in")),
        ])
        .expect("valid steps");
        assert!(
            h.workflows
                .replace_steps(h.org, workflow.id, &edited)
                .await
                .expect("replace")
        );

        let outcome = h
            .engine
            .run_at(h.org, execution.id, now + Duration::days(1))
            .await
            .expect("run");
        assert_eq!(outcome, RunOutcome::Completed);

        assert_eq!(h.crm.activities(h.org).len(), 1);
        assert_eq!(h.crm.notifications(h.org).len(), 1);
        let records = h.records(execution.id).await;
        let positions: Vec<_> = records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert!(records.iter().all(|r| r.status() == StepStatus::Completed));
    }

    #[tokio::test]
    async fn other_tenant_cannot_run_execution() {
        let h = Harness::new();
        let workflow = h.workflow(vec![(1, task("mine"))]).await;
        let execution = h.start(&workflow, TriggerPayload::new()).await;

        let outcome = h
            .engine
            .run(OrganizationId::new(), execution.id)
            .await
            .expect("run");
        assert_eq!(outcome, RunOutcome::NotFound);
        assert_eq!(h.reload(execution.id).await.status(), ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn outputs_flow_to_later_steps() {
        let h = Harness::new();
        let workflow = h
            .workflow(vec![(1, task("first")), (2, task("second"))])
            .await;
        let company = dealflow_core::CompanyId::new();
        let execution = h
            .start(&workflow, TriggerPayload::new().with_company(company))
            .await;

        h.engine.run(h.org, execution.id).await.expect("run");
        let records = h.records(execution.id).await;
        assert_eq!(records[0].output.as_ref().expect("output")["company_id"], company.to_string());
        assert!(
            h.crm
                .activities(h.org)
                .iter()
                .all(|a| a.company_id == Some(company))
        );
    }
}

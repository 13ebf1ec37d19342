//! Background worker that drains the job queue.
//!
//! Each poll claims a batch of visible jobs and advances their executions
//! concurrently. What happens to a job afterwards depends on the outcome:
//!
//! - Finished (completed, failed, cancelled, missing): the job is removed
//! - Suspended on a wait step: the job is hidden until the wait elapses
//! - Storage failure: the job is retried after a fixed backoff

use crate::error::QueueError;
use crate::queue::{Job, JobQueue};
use chrono::{DateTime, Utc};
use dealflow_workflow::{ExecutionEngine, RunOutcome};
use futures::future::join_all;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Polling and leasing behaviour of the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Delay between polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum jobs claimed per poll.
    pub batch_size: u32,
    /// How long a claimed job stays hidden from other workers, in seconds.
    pub lease_secs: u32,
    /// Delay before retrying a job whose run hit a storage error, in seconds.
    pub failure_backoff_secs: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 16,
            lease_secs: 300,
            failure_backoff_secs: 30,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.lease_secs))
    }

    #[must_use]
    pub fn failure_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.failure_backoff_secs))
    }
}

/// Claims queued executions and runs them with the engine.
pub struct Worker {
    engine: Arc<ExecutionEngine>,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
}

impl Worker {
    #[must_use]
    pub fn new(engine: Arc<ExecutionEngine>, queue: Arc<dyn JobQueue>, config: WorkerConfig) -> Self {
        Self {
            engine,
            queue,
            config,
        }
    }

    /// Polls the queue until `shutdown` resolves.
    ///
    /// A batch already in progress is finished before returning.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "starting execution worker"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!("shutdown requested, stopping execution worker");
                    break;
                }

                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(error = %e, "failed to poll job queue");
                    }
                }
            }
        }
    }

    /// Claims and processes one batch of jobs visible at `now`.
    ///
    /// Returns the number of jobs processed.
    ///
    /// # Errors
    ///
    /// Returns an error if jobs cannot be claimed. Failures while processing
    /// individual jobs are logged and leave the job to be retried.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let jobs = self
            .queue
            .claim(now, self.config.batch_size, self.config.lease())
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        debug!(jobs = jobs.len(), "claimed jobs");
        let count = jobs.len();
        join_all(jobs.into_iter().map(|job| self.process(job, now))).await;
        Ok(count)
    }

    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, execution_id = %job.execution_id, attempt = job.attempts))]
    async fn process(&self, job: Job, now: DateTime<Utc>) {
        let settled = match self
            .engine
            .run_at(job.organization_id, job.execution_id, now)
            .await
        {
            Ok(RunOutcome::Suspended { resume_at }) => {
                debug!(%resume_at, "execution waiting");
                self.queue.reschedule(job.id, resume_at).await
            }
            Ok(outcome) => {
                debug!(?outcome, "execution settled");
                self.queue.complete(job.id).await
            }
            Err(e) => {
                warn!(error = %e, "execution run failed, will retry");
                self.queue
                    .reschedule(job.id, now + self.config.failure_backoff())
                    .await
            }
        };

        if let Err(e) = settled {
            // The lease expires on its own, so the job is picked up again.
            warn!(error = %e, "failed to update job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::queue::InMemoryJobQueue;
    use chrono::Duration as TimeDelta;
    use dealflow_core::{ExecutionId, OrganizationId, StageId, UserId};
    use dealflow_workflow::memory::{InMemoryCrm, InMemoryExecutionLog, InMemoryWorkflowRepository};
    use dealflow_workflow::step::{
        CreateActivityConfig, Recipient, SendNotificationConfig, UpdateDealConfig, WaitConfig,
        WaitDuration,
    };
    use dealflow_workflow::{
        ActivityType, Deal, ExecutionLog, ExecutionStatus, RetryPolicy, StepAction, StepDraft,
        TriggerCriteria, TriggerEvent, TriggerKind, TriggerPayload, WorkflowDraft,
    };

    struct Harness {
        org: OrganizationId,
        log: Arc<InMemoryExecutionLog>,
        crm: Arc<InMemoryCrm>,
        queue: Arc<InMemoryJobQueue>,
        dispatcher: Dispatcher,
        worker: Worker,
    }

    impl Harness {
        fn new() -> Self {
            let workflows = Arc::new(InMemoryWorkflowRepository::new());
            let log = Arc::new(InMemoryExecutionLog::new());
            let crm = Arc::new(InMemoryCrm::new());
            let queue = Arc::new(InMemoryJobQueue::new());
            let engine = ExecutionEngine::new(log.clone(), crm.clone())
                .with_retry_policy(RetryPolicy::immediate());
            Self {
                org: OrganizationId::new(),
                dispatcher: Dispatcher::new(workflows, log.clone(), queue.clone()),
                worker: Worker::new(Arc::new(engine), queue.clone(), WorkerConfig::default()),
                log,
                crm,
                queue,
            }
        }

        async fn status(&self, execution_id: ExecutionId) -> ExecutionStatus {
            self.log
                .find_execution(self.org, execution_id)
                .await
                .expect("find")
                .expect("exists")
                .status()
        }
    }

    fn follow_up_draft(stage: StageId) -> WorkflowDraft {
        WorkflowDraft {
            name: "Proposal follow-up".to_string(),
            description: Some("Nudge the owner a day after the proposal".to_string()),
            trigger_kind: TriggerKind::DealStageChanged,
            trigger_config: TriggerCriteria::new().with("stage_id", stage.to_string()),
            active: true,
            steps: vec![
                StepDraft {
                    position: 1,
                    action: StepAction::CreateActivity(CreateActivityConfig {
                        activity_type: ActivityType::Task,
                        title: "Follow up".to_string(),
                        description: None,
                        due_in: None,
                    }),
                },
                StepDraft {
                    position: 2,
                    action: StepAction::Wait(WaitConfig {
                        duration: WaitDuration::days(1),
                    }),
                },
                StepDraft {
                    position: 3,
                    action: StepAction::SendNotification(SendNotificationConfig {
                        recipient: Recipient::EntityOwner,
                        title: None,
                        message: "Check in".to_string(),
                    }),
                },
            ],
        }
    }

    #[tokio::test]
    async fn stage_change_follow_up_runs_across_a_wait() {
        let h = Harness::new();
        let stage = StageId::new();
        h.dispatcher
            .create_workflow(h.org, None, follow_up_draft(stage))
            .await
            .expect("create");

        let owner = UserId::new();
        let mut deal = Deal::new(h.org, "Globex expansion");
        deal.owner_id = Some(owner);
        let deal = h.crm.insert_deal(deal);

        let started = h
            .dispatcher
            .enqueue_matches(
                h.org,
                &TriggerEvent::deal_stage_changed(deal.id, None, stage, Some(owner)),
            )
            .await
            .expect("dispatch");
        assert_eq!(started.len(), 1);
        let execution_id = started[0];

        let now = Utc::now();
        assert_eq!(h.worker.tick(now).await.expect("tick"), 1);
        assert_eq!(h.crm.activities(h.org).len(), 1);
        assert_eq!(h.crm.activities(h.org)[0].deal_id, Some(deal.id));
        assert!(h.crm.notifications(h.org).is_empty());
        assert_eq!(h.status(execution_id).await, ExecutionStatus::Running);

        let jobs = h.queue.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].visible_at, now + TimeDelta::days(1));

        assert_eq!(
            h.worker
                .tick(now + TimeDelta::hours(1))
                .await
                .expect("tick"),
            0
        );

        assert_eq!(
            h.worker.tick(now + TimeDelta::days(1)).await.expect("tick"),
            1
        );
        let notifications = h.crm.notifications(h.org);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].recipient_id, owner);
        assert_eq!(h.status(execution_id).await, ExecutionStatus::Completed);
        assert!(h.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn automated_stage_change_starts_no_further_workflows() {
        let h = Harness::new();
        let stage = StageId::new();
        let draft = WorkflowDraft {
            name: "Bounce back".to_string(),
            description: None,
            trigger_kind: TriggerKind::DealStageChanged,
            trigger_config: TriggerCriteria::new(),
            active: true,
            steps: vec![StepDraft {
                position: 1,
                action: StepAction::UpdateDeal(UpdateDealConfig {
                    field: "stage_id".to_string(),
                    value: serde_json::json!(stage.to_string()),
                }),
            }],
        };
        h.dispatcher
            .create_workflow(h.org, None, draft)
            .await
            .expect("create");
        let deal = h.crm.insert_deal(Deal::new(h.org, "Umbrella"));

        let started = h
            .dispatcher
            .enqueue_matches(
                h.org,
                &TriggerEvent::deal_stage_changed(deal.id, None, StageId::new(), None),
            )
            .await
            .expect("dispatch");
        assert_eq!(started.len(), 1);

        assert_eq!(h.worker.tick(Utc::now()).await.expect("tick"), 1);
        assert_eq!(h.status(started[0]).await, ExecutionStatus::Completed);
        assert_eq!(h.crm.deal(deal.id).expect("deal").stage_id, Some(stage));

        let executions = h
            .dispatcher
            .get_executions(h.org, None, None)
            .await
            .expect("history");
        assert_eq!(executions.len(), 1);
        assert!(h.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_waiting_execution_takes_effect_immediately() {
        let h = Harness::new();
        let stage = StageId::new();
        h.dispatcher
            .create_workflow(h.org, None, follow_up_draft(stage))
            .await
            .expect("create");
        let deal = h.crm.insert_deal(Deal::new(h.org, "Initech"));

        let started = h
            .dispatcher
            .enqueue_matches(
                h.org,
                &TriggerEvent::deal_stage_changed(deal.id, None, stage, None),
            )
            .await
            .expect("dispatch");
        let now = Utc::now();
        h.worker.tick(now).await.expect("tick");

        h.dispatcher
            .cancel_execution(h.org, started[0])
            .await
            .expect("cancel");
        assert_eq!(
            h.worker
                .tick(now + TimeDelta::seconds(1))
                .await
                .expect("tick"),
            1
        );
        assert_eq!(h.status(started[0]).await, ExecutionStatus::Cancelled);
        assert!(h.crm.notifications(h.org).is_empty());
        assert!(h.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn job_for_missing_execution_is_dropped() {
        let h = Harness::new();
        let now = Utc::now();
        h.queue
            .enqueue(h.org, ExecutionId::new(), now)
            .await
            .expect("enqueue");

        assert_eq!(h.worker.tick(now).await.expect("tick"), 1);
        assert!(h.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = Harness::new();
        let manual = h
            .dispatcher
            .create_workflow(
                h.org,
                None,
                WorkflowDraft {
                    name: "Manual".to_string(),
                    description: None,
                    trigger_kind: TriggerKind::Manual,
                    trigger_config: TriggerCriteria::new(),
                    active: true,
                    steps: Vec::new(),
                },
            )
            .await
            .expect("create");
        let handle = h
            .dispatcher
            .execute_workflow(h.org, manual.definition.id, TriggerPayload::new(), None)
            .await
            .expect("execute");

        // The first interval tick fires immediately
        h.worker
            .run(tokio::time::sleep(std::time::Duration::from_millis(50)))
            .await;
        assert_eq!(h.status(handle.id).await, ExecutionStatus::Completed);
    }

    #[test]
    fn config_defaults() {
        let config: WorkerConfig =
            serde_json::from_value(serde_json::json!({"batch_size": 4})).expect("deserialize");
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.lease(), chrono::Duration::minutes(5));
    }
}

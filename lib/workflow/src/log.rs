//! Execution log port.
//!
//! The log is append-only in spirit: step records and executions are only
//! ever moved forward through their state machines, and events are never
//! rewritten. Readers see the latest status of each record.

use crate::error::StoreError;
use crate::execution::{ExecutionEvent, StepExecutionRecord, WorkflowExecution};
use async_trait::async_trait;
use dealflow_core::{ExecutionId, OrganizationId, WorkflowId};
use std::sync::Arc;

/// Default number of executions returned by history queries.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Upper bound on executions returned by a single history query.
pub const MAX_HISTORY_LIMIT: u32 = 500;

/// Filter for execution history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionQuery {
    pub workflow_id: Option<WorkflowId>,
    pub limit: u32,
}

impl ExecutionQuery {
    /// Creates a query, clamping the limit to `1..=MAX_HISTORY_LIMIT`.
    #[must_use]
    pub fn new(workflow_id: Option<WorkflowId>, limit: Option<u32>) -> Self {
        Self {
            workflow_id,
            limit: limit
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .clamp(1, MAX_HISTORY_LIMIT),
        }
    }
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Persistence for executions, step records and execution events.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    /// Stores a new execution.
    ///
    /// Returns false, storing nothing, if an execution of the same workflow
    /// with the same dedupe key already exists.
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<bool, StoreError>;

    /// Writes the current state of an execution.
    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn find_execution(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Lists executions newest first.
    async fn list_executions(
        &self,
        organization_id: OrganizationId,
        query: ExecutionQuery,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Sets the cancellation flag of a running execution.
    ///
    /// Returns the execution as stored afterwards, or `None` if it does not exist.
    async fn request_cancel(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Reads the cancellation flag as currently stored.
    async fn is_cancel_requested(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<bool, StoreError>;

    /// Inserts or updates a step record.
    async fn save_step_record(&self, record: &StepExecutionRecord) -> Result<(), StoreError>;

    /// Lists step records of an execution in position order.
    async fn list_step_records(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Vec<StepExecutionRecord>, StoreError>;

    /// Appends an event.
    async fn append_event(
        &self,
        organization_id: OrganizationId,
        event: &ExecutionEvent,
    ) -> Result<(), StoreError>;

    /// Lists the events of an execution in the order they were appended.
    async fn list_events(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Vec<ExecutionEvent>, StoreError>;
}

/// A destination that receives a copy of every appended event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        organization_id: OrganizationId,
        event: &ExecutionEvent,
    ) -> Result<(), StoreError>;
}

/// An execution log that forwards appended events to a sink.
///
/// The inner log stays the source of truth: sink failures are logged and
/// never fail the append.
pub struct MirroredLog {
    inner: Arc<dyn ExecutionLog>,
    sink: Arc<dyn EventSink>,
}

impl MirroredLog {
    #[must_use]
    pub fn new(inner: Arc<dyn ExecutionLog>, sink: Arc<dyn EventSink>) -> Self {
        Self { inner, sink }
    }
}

#[async_trait]
impl ExecutionLog for MirroredLog {
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<bool, StoreError> {
        self.inner.insert_execution(execution).await
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.inner.update_execution(execution).await
    }

    async fn find_execution(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        self.inner.find_execution(organization_id, execution_id).await
    }

    async fn list_executions(
        &self,
        organization_id: OrganizationId,
        query: ExecutionQuery,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        self.inner.list_executions(organization_id, query).await
    }

    async fn request_cancel(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        self.inner.request_cancel(organization_id, execution_id).await
    }

    async fn is_cancel_requested(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<bool, StoreError> {
        self.inner
            .is_cancel_requested(organization_id, execution_id)
            .await
    }

    async fn save_step_record(&self, record: &StepExecutionRecord) -> Result<(), StoreError> {
        self.inner.save_step_record(record).await
    }

    async fn list_step_records(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Vec<StepExecutionRecord>, StoreError> {
        self.inner
            .list_step_records(organization_id, execution_id)
            .await
    }

    async fn append_event(
        &self,
        organization_id: OrganizationId,
        event: &ExecutionEvent,
    ) -> Result<(), StoreError> {
        self.inner.append_event(organization_id, event).await?;
        if let Err(e) = self.sink.publish(organization_id, event).await {
            tracing::warn!(
                execution_id = %event.execution_id(),
                event_type = event.event_type(),
                error = %e,
                "failed to mirror execution event"
            );
        }
        Ok(())
    }

    async fn list_events(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        self.inner.list_events(organization_id, execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryExecutionLog;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ExecutionEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn publish(
            &self,
            _organization_id: OrganizationId,
            event: &ExecutionEvent,
        ) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Unavailable {
                    reason: "sink down".to_string(),
                });
            }
            self.events.lock().expect("lock").push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn query_limit_is_clamped() {
        assert_eq!(ExecutionQuery::new(None, None).limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(ExecutionQuery::new(None, Some(0)).limit, 1);
        assert_eq!(
            ExecutionQuery::new(None, Some(10_000)).limit,
            MAX_HISTORY_LIMIT
        );
    }

    #[tokio::test]
    async fn mirrored_log_forwards_events() {
        let inner = Arc::new(InMemoryExecutionLog::new());
        let sink = Arc::new(RecordingSink::default());
        let log = MirroredLog::new(inner.clone(), sink.clone());
        let org = OrganizationId::new();
        let event = ExecutionEvent::ExecutionCompleted {
            execution_id: ExecutionId::new(),
            timestamp: Utc::now(),
        };

        log.append_event(org, &event).await.expect("append");

        assert_eq!(
            inner
                .list_events(org, event.execution_id())
                .await
                .expect("list"),
            vec![event.clone()]
        );
        assert_eq!(*sink.events.lock().expect("lock"), vec![event]);
    }

    #[tokio::test]
    async fn sink_failure_does_not_fail_append() {
        let inner = Arc::new(InMemoryExecutionLog::new());
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let log = MirroredLog::new(inner.clone(), sink);
        let org = OrganizationId::new();
        let event = ExecutionEvent::ExecutionCancelled {
            execution_id: ExecutionId::new(),
            timestamp: Utc::now(),
        };

        log.append_event(org, &event).await.expect("append");
        assert_eq!(
            inner
                .list_events(org, event.execution_id())
                .await
                .expect("list")
                .len(),
            1
        );
    }
}

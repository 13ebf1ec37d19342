//! Database log of executions, step records and execution events.

use super::{decode_error, parse_column, parse_optional, store_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealflow_core::{ExecutionId, OrganizationId};
use dealflow_workflow::execution::{ExecutionParts, StepRecordParts};
use dealflow_workflow::{
    ActionKind, ExecutionEvent, ExecutionLog, ExecutionQuery, ExecutionStatus,
    StepExecutionRecord, StepSequence, StepStatus, StoreError, TriggerCriteria,
    WorkflowExecution, WorkflowStep,
};
use sqlx::{FromRow, PgPool};

/// Row type for execution queries.
#[derive(FromRow)]
struct ExecutionRow {
    id: String,
    organization_id: String,
    workflow_id: String,
    triggered_by: Option<String>,
    trigger_kind: String,
    trigger_payload: serde_json::Value,
    trigger_config: serde_json::Value,
    step_snapshot: serde_json::Value,
    dedupe_key: Option<String>,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    cancel_requested: bool,
    resume_at: Option<DateTime<Utc>>,
}

impl ExecutionRow {
    fn try_into_record(self) -> Result<WorkflowExecution, sqlx::Error> {
        let status = ExecutionStatus::from_str_value(&self.status)
            .ok_or_else(|| decode_error(format!("invalid execution status '{}'", self.status)))?;
        let trigger_payload = serde_json::from_value(self.trigger_payload)
            .map_err(|e| decode_error(format!("invalid trigger payload of {}: {e}", self.id)))?;
        let steps: Vec<WorkflowStep> = serde_json::from_value(self.step_snapshot)
            .map_err(|e| decode_error(format!("invalid step snapshot of {}: {e}", self.id)))?;
        let step_snapshot = StepSequence::new(steps)
            .map_err(|e| decode_error(format!("invalid step snapshot of {}: {e}", self.id)))?;

        Ok(WorkflowExecution::restore(ExecutionParts {
            id: parse_column(&self.id, "execution id")?,
            organization_id: parse_column(&self.organization_id, "organization id")?,
            workflow_id: parse_column(&self.workflow_id, "workflow id")?,
            triggered_by: parse_optional(self.triggered_by.as_deref(), "user id")?,
            trigger_kind: parse_column(&self.trigger_kind, "trigger kind")?,
            trigger_payload,
            trigger_config: TriggerCriteria::from_json(self.trigger_config),
            step_snapshot,
            dedupe_key: self.dedupe_key,
            status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error,
            cancel_requested: self.cancel_requested,
            resume_at: self.resume_at,
        }))
    }
}

/// Row type for step record queries.
#[derive(FromRow)]
struct StepRecordRow {
    id: String,
    organization_id: String,
    execution_id: String,
    step_id: String,
    position: i32,
    action_kind: String,
    status: String,
    attempts: i32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    resume_at: Option<DateTime<Utc>>,
    output: Option<serde_json::Value>,
    error: Option<String>,
}

impl StepRecordRow {
    fn try_into_record(self) -> Result<StepExecutionRecord, sqlx::Error> {
        let status = StepStatus::from_str_value(&self.status)
            .ok_or_else(|| decode_error(format!("invalid step status '{}'", self.status)))?;
        let action_kind = ActionKind::parse(&self.action_kind)
            .map_err(|e| decode_error(e.to_string()))?;

        Ok(StepExecutionRecord::restore(StepRecordParts {
            id: parse_column(&self.id, "step execution id")?,
            organization_id: parse_column(&self.organization_id, "organization id")?,
            execution_id: parse_column(&self.execution_id, "execution id")?,
            step_id: parse_column(&self.step_id, "step id")?,
            position: self.position,
            action_kind,
            status,
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            resume_at: self.resume_at,
            output: self.output,
            error: self.error,
        }))
    }
}

const SELECT_EXECUTION: &str = r#"
    SELECT id, organization_id, workflow_id, triggered_by, trigger_kind, trigger_payload,
           trigger_config, step_snapshot, dedupe_key, status, started_at, finished_at, error,
           cancel_requested, resume_at
    FROM workflow_executions
"#;

/// Execution log stored in Postgres.
pub struct PgExecutionLog {
    pool: PgPool,
}

impl PgExecutionLog {
    /// Creates a new log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionLog for PgExecutionLog {
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<bool, StoreError> {
        let payload = serde_json::to_value(&execution.trigger_payload).map_err(|e| {
            StoreError::Backend {
                reason: format!("failed to encode trigger payload: {e}"),
            }
        })?;
        let step_snapshot = serde_json::to_value(&execution.step_snapshot).map_err(|e| {
            StoreError::Backend {
                reason: format!("failed to encode step snapshot: {e}"),
            }
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, organization_id, workflow_id, triggered_by, trigger_kind, trigger_payload,
                 trigger_config, step_snapshot, dedupe_key, status, started_at, finished_at,
                 error, cancel_requested, resume_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (workflow_id, dedupe_key) WHERE dedupe_key IS NOT NULL DO NOTHING
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.organization_id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(execution.triggered_by.map(|id| id.to_string()))
        .bind(execution.trigger_kind.as_str())
        .bind(payload)
        .bind(execution.trigger_config.to_json())
        .bind(step_snapshot)
        .bind(&execution.dedupe_key)
        .bind(execution.status().as_str())
        .bind(execution.started_at)
        .bind(execution.finished_at())
        .bind(execution.error())
        .bind(execution.cancel_requested)
        .bind(execution.resume_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        // cancel_requested is only ever raised, never cleared by a stale writer.
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $3, finished_at = $4, error = $5, resume_at = $6,
                cancel_requested = cancel_requested OR $7
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.organization_id.to_string())
        .bind(execution.status().as_str())
        .bind(execution.finished_at())
        .bind(execution.error())
        .bind(execution.resume_at)
        .bind(execution.cancel_requested)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "execution",
                id: execution.id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_execution(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "{SELECT_EXECUTION} WHERE id = $1 AND organization_id = $2"
        ))
        .bind(execution_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(ExecutionRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn list_executions(
        &self,
        organization_id: OrganizationId,
        query: ExecutionQuery,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            r#"{SELECT_EXECUTION}
            WHERE organization_id = $1 AND ($2::text IS NULL OR workflow_id = $2)
            ORDER BY started_at DESC, id DESC
            LIMIT $3"#
        ))
        .bind(organization_id.to_string())
        .bind(query.workflow_id.map(|id| id.to_string()))
        .bind(i64::from(query.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(|r| r.try_into_record().map_err(store_error))
            .collect()
    }

    async fn request_cancel(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            r#"
            UPDATE workflow_executions
            SET cancel_requested = cancel_requested OR status = 'running'
            WHERE id = $1 AND organization_id = $2
            RETURNING id, organization_id, workflow_id, triggered_by, trigger_kind,
                      trigger_payload, trigger_config, step_snapshot, dedupe_key, status,
                      started_at, finished_at, error, cancel_requested, resume_at
            "#,
        )
        .bind(execution_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(ExecutionRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn is_cancel_requested(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<bool, StoreError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT cancel_requested FROM workflow_executions WHERE id = $1 AND organization_id = $2",
        )
        .bind(execution_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(row.is_some_and(|(requested,)| requested))
    }

    async fn save_step_record(&self, record: &StepExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO step_executions
                (id, organization_id, execution_id, step_id, position, action_kind, status,
                 attempts, started_at, finished_at, resume_at, output, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, attempts = EXCLUDED.attempts,
                started_at = EXCLUDED.started_at, finished_at = EXCLUDED.finished_at,
                resume_at = EXCLUDED.resume_at, output = EXCLUDED.output,
                error = EXCLUDED.error
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.organization_id.to_string())
        .bind(record.execution_id.to_string())
        .bind(record.step_id.to_string())
        .bind(record.position)
        .bind(record.action_kind.as_str())
        .bind(record.status().as_str())
        .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.resume_at)
        .bind(&record.output)
        .bind(&record.error)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn list_step_records(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Vec<StepExecutionRecord>, StoreError> {
        let rows: Vec<StepRecordRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, execution_id, step_id, position, action_kind, status,
                   attempts, started_at, finished_at, resume_at, output, error
            FROM step_executions
            WHERE execution_id = $1 AND organization_id = $2
            ORDER BY position
            "#,
        )
        .bind(execution_id.to_string())
        .bind(organization_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(|r| r.try_into_record().map_err(store_error))
            .collect()
    }

    async fn append_event(
        &self,
        organization_id: OrganizationId,
        event: &ExecutionEvent,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_value(event).map_err(|e| StoreError::Backend {
            reason: format!("failed to encode event: {e}"),
        })?;

        sqlx::query(
            r#"
            INSERT INTO execution_events
                (organization_id, execution_id, event_type, payload, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(organization_id.to_string())
        .bind(event.execution_id().to_string())
        .bind(event.event_type())
        .bind(payload)
        .bind(event.timestamp())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn list_events(
        &self,
        organization_id: OrganizationId,
        execution_id: ExecutionId,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"
            SELECT payload
            FROM execution_events
            WHERE execution_id = $1 AND organization_id = $2
            ORDER BY seq
            "#,
        )
        .bind(execution_id.to_string())
        .bind(organization_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(|(payload,)| {
                serde_json::from_value(payload).map_err(|e| StoreError::Corrupt {
                    reason: format!("invalid event of {execution_id}: {e}"),
                })
            })
            .collect()
    }
}

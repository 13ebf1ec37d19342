//! Database repository for workflow definitions and their steps.

use super::{parse_column, parse_optional, store_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealflow_core::{OrganizationId, WorkflowId};
use dealflow_workflow::{
    StepAction, StepSequence, StoreError, TriggerCriteria, TriggerKind, WorkflowDefinition,
    WorkflowRepository, WorkflowStep,
};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

/// Row type for workflow queries.
#[derive(FromRow)]
struct WorkflowRow {
    id: String,
    organization_id: String,
    name: String,
    description: Option<String>,
    trigger_kind: String,
    trigger_config: serde_json::Value,
    active: bool,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    fn try_into_record(self) -> Result<WorkflowDefinition, sqlx::Error> {
        Ok(WorkflowDefinition {
            id: parse_column(&self.id, "workflow id")?,
            organization_id: parse_column(&self.organization_id, "organization id")?,
            name: self.name,
            description: self.description,
            trigger_kind: parse_column::<TriggerKind>(&self.trigger_kind, "trigger kind")?,
            trigger_config: TriggerCriteria::from_json(self.trigger_config),
            active: self.active,
            created_by: parse_optional(self.created_by.as_deref(), "user id")?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for step queries.
#[derive(FromRow)]
struct StepRow {
    id: String,
    workflow_id: String,
    position: i32,
    action_kind: String,
    config: serde_json::Value,
}

impl StepRow {
    fn try_into_record(self) -> Result<WorkflowStep, sqlx::Error> {
        let action = StepAction::from_parts(&self.action_kind, self.config)
            .map_err(|e| super::decode_error(format!("invalid step '{}': {e}", self.id)))?;
        Ok(WorkflowStep {
            id: parse_column(&self.id, "step id")?,
            workflow_id: parse_column(&self.workflow_id, "workflow id")?,
            position: self.position,
            action,
        })
    }
}

const SELECT_WORKFLOW: &str = r#"
    SELECT id, organization_id, name, description, trigger_kind, trigger_config,
           active, created_by, created_at, updated_at
    FROM workflows
"#;

/// Repository for workflow definitions.
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_steps(
        tx: &mut Transaction<'_, Postgres>,
        organization_id: OrganizationId,
        steps: &StepSequence,
    ) -> Result<(), sqlx::Error> {
        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps
                    (id, workflow_id, organization_id, position, action_kind, config)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(step.id.to_string())
            .bind(step.workflow_id.to_string())
            .bind(organization_id.to_string())
            .bind(step.position)
            .bind(step.action.kind().as_str())
            .bind(step.action.config_json())
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn delete_steps(
        tx: &mut Transaction<'_, Postgres>,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM workflow_steps WHERE workflow_id = $1 AND organization_id = $2")
            .bind(workflow_id.to_string())
            .bind(organization_id.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn fetch_many(
        &self,
        query: String,
        organization_id: OrganizationId,
        trigger_kind: Option<TriggerKind>,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut q = sqlx::query_as::<_, WorkflowRow>(&query).bind(organization_id.to_string());
        if let Some(kind) = trigger_kind {
            q = q.bind(kind.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(store_error)?;
        rows.into_iter()
            .map(|r| r.try_into_record().map_err(store_error))
            .collect()
    }
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn insert_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &StepSequence,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query(
            r#"
            INSERT INTO workflows
                (id, organization_id, name, description, trigger_kind, trigger_config,
                 active, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(workflow.organization_id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.trigger_kind.as_str())
        .bind(workflow.trigger_config.to_json())
        .bind(workflow.active)
        .bind(workflow.created_by.map(|id| id.to_string()))
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        Self::insert_steps(&mut tx, workflow.organization_id, steps)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)
    }

    async fn update_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &StepSequence,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET name = $3, description = $4, trigger_kind = $5, trigger_config = $6,
                active = $7, updated_at = $8
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(workflow.organization_id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.trigger_kind.as_str())
        .bind(workflow.trigger_config.to_json())
        .bind(workflow.active)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        Self::delete_steps(&mut tx, workflow.organization_id, workflow.id)
            .await
            .map_err(store_error)?;
        Self::insert_steps(&mut tx, workflow.organization_id, steps)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        Ok(true)
    }

    async fn replace_steps(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        steps: &StepSequence,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let touched = sqlx::query(
            "UPDATE workflows SET updated_at = NOW() WHERE id = $1 AND organization_id = $2",
        )
        .bind(workflow_id.to_string())
        .bind(organization_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        if touched.rows_affected() == 0 {
            return Ok(false);
        }

        Self::delete_steps(&mut tx, organization_id, workflow_id)
            .await
            .map_err(store_error)?;
        Self::insert_steps(&mut tx, organization_id, steps)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;
        Ok(true)
    }

    async fn set_active(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        active: bool,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            r#"
            UPDATE workflows
            SET active = $3, updated_at = NOW()
            WHERE id = $1 AND organization_id = $2
            RETURNING id, organization_id, name, description, trigger_kind, trigger_config,
                      active, created_by, created_at, updated_at
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(organization_id.to_string())
        .bind(active)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(WorkflowRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn delete_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<bool, StoreError> {
        // Steps go with the definition through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1 AND organization_id = $2")
            .bind(workflow_id.to_string())
            .bind(organization_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "{SELECT_WORKFLOW} WHERE id = $1 AND organization_id = $2"
        ))
        .bind(workflow_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(WorkflowRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn list_workflows(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        self.fetch_many(
            format!("{SELECT_WORKFLOW} WHERE organization_id = $1 ORDER BY updated_at DESC"),
            organization_id,
            None,
        )
        .await
    }

    async fn list_active_by_trigger(
        &self,
        organization_id: OrganizationId,
        trigger_kind: TriggerKind,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        self.fetch_many(
            format!(
                "{SELECT_WORKFLOW} WHERE organization_id = $1 AND trigger_kind = $2 AND active ORDER BY id"
            ),
            organization_id,
            Some(trigger_kind),
        )
        .await
    }

    async fn list_steps(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<StepSequence, StoreError> {
        let rows: Vec<StepRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, position, action_kind, config
            FROM workflow_steps
            WHERE workflow_id = $1 AND organization_id = $2
            ORDER BY position
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(organization_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        let steps = rows
            .into_iter()
            .map(StepRow::try_into_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;
        StepSequence::new(steps).map_err(|e| StoreError::Corrupt {
            reason: format!("stored steps of {workflow_id} are invalid: {e}"),
        })
    }
}

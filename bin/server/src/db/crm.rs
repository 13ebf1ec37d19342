//! Database access to deals, activities and notifications.

use super::{parse_column, parse_optional, store_error};
use crate::crm::{CrmStore, StageMove};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dealflow_core::{ActivityId, DealId, OrganizationId, StageId, UserId};
use dealflow_workflow::crm::{NewActivity, NewNotification};
use dealflow_workflow::{
    Activity, ActivityType, CrmGateway, Deal, DealPatch, Notification, StoreError,
};
use sqlx::{FromRow, PgPool};

const DEAL_COLUMNS: &str = "id, organization_id, name, stage_id, owner_id, company_id, \
     contact_id, amount, probability, expected_close_date, custom_fields, created_at, updated_at";

const ACTIVITY_COLUMNS: &str = "id, organization_id, activity_type, title, description, \
     due_at, deal_id, company_id, contact_id, owner_id, execution_id, completed, created_at";

/// Row type for deal queries.
#[derive(FromRow)]
struct DealRow {
    id: String,
    organization_id: String,
    name: String,
    stage_id: Option<String>,
    owner_id: Option<String>,
    company_id: Option<String>,
    contact_id: Option<String>,
    amount: Option<i64>,
    probability: Option<i16>,
    expected_close_date: Option<NaiveDate>,
    custom_fields: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DealRow {
    fn try_into_record(self) -> Result<Deal, sqlx::Error> {
        let custom_fields = match self.custom_fields {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Ok(Deal {
            id: parse_column(&self.id, "deal id")?,
            organization_id: parse_column(&self.organization_id, "organization id")?,
            name: self.name,
            stage_id: parse_optional(self.stage_id.as_deref(), "stage id")?,
            owner_id: parse_optional(self.owner_id.as_deref(), "user id")?,
            company_id: parse_optional(self.company_id.as_deref(), "company id")?,
            contact_id: parse_optional(self.contact_id.as_deref(), "contact id")?,
            amount: self.amount,
            probability: self.probability,
            expected_close_date: self.expected_close_date,
            custom_fields,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Row type for activity queries.
#[derive(FromRow)]
struct ActivityRow {
    id: String,
    organization_id: String,
    activity_type: String,
    title: String,
    description: Option<String>,
    due_at: Option<DateTime<Utc>>,
    deal_id: Option<String>,
    company_id: Option<String>,
    contact_id: Option<String>,
    owner_id: Option<String>,
    execution_id: Option<String>,
    completed: bool,
    created_at: DateTime<Utc>,
}

impl ActivityRow {
    fn try_into_record(self) -> Result<Activity, sqlx::Error> {
        let activity_type = ActivityType::from_str_value(&self.activity_type).ok_or_else(|| {
            super::decode_error(format!("invalid activity type '{}'", self.activity_type))
        })?;
        Ok(Activity {
            id: parse_column(&self.id, "activity id")?,
            organization_id: parse_column(&self.organization_id, "organization id")?,
            activity_type,
            title: self.title,
            description: self.description,
            due_at: self.due_at,
            deal_id: parse_optional(self.deal_id.as_deref(), "deal id")?,
            company_id: parse_optional(self.company_id.as_deref(), "company id")?,
            contact_id: parse_optional(self.contact_id.as_deref(), "contact id")?,
            owner_id: parse_optional(self.owner_id.as_deref(), "user id")?,
            execution_id: parse_optional(self.execution_id.as_deref(), "execution id")?,
            completed: self.completed,
            created_at: self.created_at,
        })
    }
}

/// Row type for notification queries.
#[derive(FromRow)]
struct NotificationRow {
    id: String,
    organization_id: String,
    recipient_id: String,
    title: String,
    message: String,
    deal_id: Option<String>,
    execution_id: Option<String>,
    read: bool,
    created_at: DateTime<Utc>,
}

impl NotificationRow {
    fn try_into_record(self) -> Result<Notification, sqlx::Error> {
        Ok(Notification {
            id: parse_column(&self.id, "notification id")?,
            organization_id: parse_column(&self.organization_id, "organization id")?,
            recipient_id: parse_column(&self.recipient_id, "user id")?,
            title: self.title,
            message: self.message,
            deal_id: parse_optional(self.deal_id.as_deref(), "deal id")?,
            execution_id: parse_optional(self.execution_id.as_deref(), "execution id")?,
            read: self.read,
            created_at: self.created_at,
        })
    }
}

fn update_deal_sql(assignment: &str) -> String {
    format!(
        "UPDATE deals SET {assignment}, updated_at = NOW() \
         WHERE id = $1 AND organization_id = $2 RETURNING {DEAL_COLUMNS}"
    )
}

/// CRM records stored in Postgres.
pub struct PgCrm {
    pool: PgPool,
}

impl PgCrm {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CrmGateway for PgCrm {
    async fn find_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
    ) -> Result<Option<Deal>, StoreError> {
        let row: Option<DealRow> = sqlx::query_as(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE id = $1 AND organization_id = $2"
        ))
        .bind(deal_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(DealRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn update_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
        patch: &DealPatch,
    ) -> Result<Option<Deal>, StoreError> {
        let id = deal_id.to_string();
        let org = organization_id.to_string();

        let row: Option<DealRow> = match patch {
            DealPatch::Stage(stage) => {
                sqlx::query_as(&update_deal_sql("stage_id = $3"))
                    .bind(&id)
                    .bind(&org)
                    .bind(stage.to_string())
                    .fetch_optional(&self.pool)
                    .await
            }
            DealPatch::Owner(owner) => {
                sqlx::query_as(&update_deal_sql("owner_id = $3"))
                    .bind(&id)
                    .bind(&org)
                    .bind(owner.map(|o| o.to_string()))
                    .fetch_optional(&self.pool)
                    .await
            }
            DealPatch::Amount(amount) => {
                sqlx::query_as(&update_deal_sql("amount = $3"))
                    .bind(&id)
                    .bind(&org)
                    .bind(*amount)
                    .fetch_optional(&self.pool)
                    .await
            }
            DealPatch::Probability(probability) => {
                sqlx::query_as(&update_deal_sql("probability = $3"))
                    .bind(&id)
                    .bind(&org)
                    .bind(*probability)
                    .fetch_optional(&self.pool)
                    .await
            }
            DealPatch::ExpectedCloseDate(date) => {
                sqlx::query_as(&update_deal_sql("expected_close_date = $3"))
                    .bind(&id)
                    .bind(&org)
                    .bind(*date)
                    .fetch_optional(&self.pool)
                    .await
            }
            DealPatch::CustomField { name, value } => {
                sqlx::query_as(&update_deal_sql(
                    "custom_fields = CASE WHEN $4 = 'null'::jsonb THEN custom_fields - $3 \
                     ELSE jsonb_set(custom_fields, ARRAY[$3], $4, true) END",
                ))
                .bind(&id)
                .bind(&org)
                .bind(name)
                .bind(value)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(store_error)?;

        row.map(DealRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn create_activity(
        &self,
        organization_id: OrganizationId,
        activity: NewActivity,
    ) -> Result<Activity, StoreError> {
        let activity = activity.into_activity(organization_id);
        sqlx::query(&format!(
            "INSERT INTO activities ({ACTIVITY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(activity.id.to_string())
        .bind(activity.organization_id.to_string())
        .bind(activity.activity_type.as_str())
        .bind(&activity.title)
        .bind(&activity.description)
        .bind(activity.due_at)
        .bind(activity.deal_id.map(|id| id.to_string()))
        .bind(activity.company_id.map(|id| id.to_string()))
        .bind(activity.contact_id.map(|id| id.to_string()))
        .bind(activity.owner_id.map(|id| id.to_string()))
        .bind(activity.execution_id.map(|id| id.to_string()))
        .bind(activity.completed)
        .bind(activity.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(activity)
    }

    async fn create_notification(
        &self,
        organization_id: OrganizationId,
        notification: NewNotification,
    ) -> Result<Notification, StoreError> {
        let notification = notification.into_notification(organization_id);
        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, organization_id, recipient_id, title, message, deal_id, execution_id,
                 read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(notification.id.to_string())
        .bind(notification.organization_id.to_string())
        .bind(notification.recipient_id.to_string())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.deal_id.map(|id| id.to_string()))
        .bind(notification.execution_id.map(|id| id.to_string()))
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(notification)
    }
}

#[async_trait]
impl CrmStore for PgCrm {
    async fn create_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO deals ({DEAL_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(deal.id.to_string())
        .bind(deal.organization_id.to_string())
        .bind(&deal.name)
        .bind(deal.stage_id.map(|id| id.to_string()))
        .bind(deal.owner_id.map(|id| id.to_string()))
        .bind(deal.company_id.map(|id| id.to_string()))
        .bind(deal.contact_id.map(|id| id.to_string()))
        .bind(deal.amount)
        .bind(deal.probability)
        .bind(deal.expected_close_date)
        .bind(serde_json::Value::Object(deal.custom_fields.clone()))
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(())
    }

    async fn move_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
        stage_id: StageId,
    ) -> Result<Option<StageMove>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT stage_id FROM deals WHERE id = $1 AND organization_id = $2 FOR UPDATE",
        )
        .bind(deal_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let Some((previous,)) = row else {
            return Ok(None);
        };
        let previous = parse_optional(previous.as_deref(), "stage id").map_err(store_error)?;

        let row: DealRow = sqlx::query_as(&update_deal_sql("stage_id = $3"))
            .bind(deal_id.to_string())
            .bind(organization_id.to_string())
            .bind(stage_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(store_error)?;
        tx.commit().await.map_err(store_error)?;

        let deal = row.try_into_record().map_err(store_error)?;
        Ok(Some(StageMove { previous, deal }))
    }

    async fn complete_activity(
        &self,
        organization_id: OrganizationId,
        activity_id: ActivityId,
    ) -> Result<Option<Activity>, StoreError> {
        let row: Option<ActivityRow> = sqlx::query_as(&format!(
            "UPDATE activities SET completed = TRUE \
             WHERE id = $1 AND organization_id = $2 RETURNING {ACTIVITY_COLUMNS}"
        ))
        .bind(activity_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(ActivityRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn list_notifications(
        &self,
        organization_id: OrganizationId,
        recipient_id: UserId,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, recipient_id, title, message, deal_id, execution_id,
                   read, created_at
            FROM notifications
            WHERE organization_id = $1 AND recipient_id = $2
            ORDER BY created_at DESC
            LIMIT 200
            "#,
        )
        .bind(organization_id.to_string())
        .bind(recipient_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(|r| r.try_into_record().map_err(store_error))
            .collect()
    }
}

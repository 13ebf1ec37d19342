//! CRM records touched by action handlers, and the port through which they are
//! read and written.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dealflow_core::{
    ActivityId, CompanyId, ContactId, DealId, ExecutionId, NotificationId, OrganizationId,
    StageId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

/// Prefix of deal fields addressing a custom field by name.
pub const CUSTOM_FIELD_PREFIX: &str = "custom_fields.";

/// The type of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Task,
    Call,
    Meeting,
    Email,
    Note,
}

impl ActivityType {
    /// Returns the string representation stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Call => "call",
            Self::Meeting => "meeting",
            Self::Email => "email",
            Self::Note => "note",
        }
    }

    /// Parses from the database string representation.
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "task" => Some(Self::Task),
            "call" => Some(Self::Call),
            "meeting" => Some(Self::Meeting),
            "email" => Some(Self::Email),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

/// A deal in the sales pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub stage_id: Option<StageId>,
    pub owner_id: Option<UserId>,
    pub company_id: Option<CompanyId>,
    pub contact_id: Option<ContactId>,
    /// Deal value in minor currency units.
    pub amount: Option<i64>,
    /// Win probability, 0 to 100.
    pub probability: Option<i16>,
    pub expected_close_date: Option<NaiveDate>,
    #[serde(default)]
    pub custom_fields: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    /// Creates a deal with only a name set.
    #[must_use]
    pub fn new(organization_id: OrganizationId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DealId::new(),
            organization_id,
            name: name.into(),
            stage_id: None,
            owner_id: None,
            company_id: None,
            contact_id: None,
            amount: None,
            probability: None,
            expected_close_date: None,
            custom_fields: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a patch in place.
    pub fn apply(&mut self, patch: &DealPatch) {
        match patch {
            DealPatch::Stage(stage) => self.stage_id = Some(*stage),
            DealPatch::Owner(owner) => self.owner_id = *owner,
            DealPatch::Amount(amount) => self.amount = *amount,
            DealPatch::Probability(probability) => self.probability = *probability,
            DealPatch::ExpectedCloseDate(date) => self.expected_close_date = *date,
            DealPatch::CustomField { name, value } => {
                if value.is_null() {
                    self.custom_fields.remove(name);
                } else {
                    self.custom_fields.insert(name.clone(), value.clone());
                }
            }
        }
        self.updated_at = Utc::now();
    }
}

/// A single-field change automation may apply to a deal.
///
/// Only whitelisted fields have a variant; anything else is rejected by
/// [`DealPatch::parse`].
#[derive(Debug, Clone, PartialEq)]
pub enum DealPatch {
    Stage(StageId),
    Owner(Option<UserId>),
    Amount(Option<i64>),
    Probability(Option<i16>),
    ExpectedCloseDate(Option<NaiveDate>),
    CustomField { name: String, value: JsonValue },
}

/// Why a deal patch could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// The field is not one automation may write.
    NotWhitelisted { field: String },
    /// The value has the wrong shape for the field.
    InvalidValue { field: String, reason: String },
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWhitelisted { field } => {
                write!(f, "deal field '{field}' cannot be updated by automation")
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "invalid value for deal field '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for PatchError {}

impl DealPatch {
    /// Returns true if automation may write the named field.
    #[must_use]
    pub fn is_whitelisted(field: &str) -> bool {
        matches!(
            field,
            "stage_id" | "amount" | "owner_id" | "expected_close_date" | "probability"
        ) || field
            .strip_prefix(CUSTOM_FIELD_PREFIX)
            .is_some_and(|name| !name.is_empty())
    }

    /// Builds a typed patch from a field name and a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is not whitelisted or the value does not
    /// fit the field.
    pub fn parse(field: &str, value: &JsonValue) -> Result<Self, PatchError> {
        let invalid = |reason: &str| PatchError::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        match field {
            "stage_id" => {
                let raw = value.as_str().ok_or_else(|| invalid("expected a stage id"))?;
                let stage = StageId::from_str(raw).map_err(|e| invalid(&e.to_string()))?;
                Ok(Self::Stage(stage))
            }
            "owner_id" => match value {
                JsonValue::Null => Ok(Self::Owner(None)),
                JsonValue::String(raw) => UserId::from_str(raw)
                    .map(|id| Self::Owner(Some(id)))
                    .map_err(|e| invalid(&e.to_string())),
                _ => Err(invalid("expected a user id or null")),
            },
            "amount" => match value {
                JsonValue::Null => Ok(Self::Amount(None)),
                other => other
                    .as_i64()
                    .map(|amount| Self::Amount(Some(amount)))
                    .ok_or_else(|| invalid("expected an integer amount")),
            },
            "probability" => match value {
                JsonValue::Null => Ok(Self::Probability(None)),
                other => other
                    .as_i64()
                    .filter(|p| (0..=100).contains(p))
                    .and_then(|p| i16::try_from(p).ok())
                    .map(|p| Self::Probability(Some(p)))
                    .ok_or_else(|| invalid("expected an integer between 0 and 100")),
            },
            "expected_close_date" => match value {
                JsonValue::Null => Ok(Self::ExpectedCloseDate(None)),
                JsonValue::String(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map(|date| Self::ExpectedCloseDate(Some(date)))
                    .map_err(|e| invalid(&e.to_string())),
                _ => Err(invalid("expected a YYYY-MM-DD date or null")),
            },
            other => match other.strip_prefix(CUSTOM_FIELD_PREFIX) {
                Some(name) if !name.is_empty() => Ok(Self::CustomField {
                    name: name.to_string(),
                    value: value.clone(),
                }),
                _ => Err(PatchError::NotWhitelisted {
                    field: field.to_string(),
                }),
            },
        }
    }

    /// Returns the field name this patch writes.
    #[must_use]
    pub fn field(&self) -> String {
        match self {
            Self::Stage(_) => "stage_id".to_string(),
            Self::Owner(_) => "owner_id".to_string(),
            Self::Amount(_) => "amount".to_string(),
            Self::Probability(_) => "probability".to_string(),
            Self::ExpectedCloseDate(_) => "expected_close_date".to_string(),
            Self::CustomField { name, .. } => format!("{CUSTOM_FIELD_PREFIX}{name}"),
        }
    }
}

/// A to-do or logged interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub organization_id: OrganizationId,
    pub activity_type: ActivityType,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub deal_id: Option<DealId>,
    pub company_id: Option<CompanyId>,
    pub contact_id: Option<ContactId>,
    pub owner_id: Option<UserId>,
    /// The execution that created this activity, if it was automated.
    pub execution_id: Option<ExecutionId>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create an activity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub activity_type: ActivityType,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub deal_id: Option<DealId>,
    pub company_id: Option<CompanyId>,
    pub contact_id: Option<ContactId>,
    pub owner_id: Option<UserId>,
    pub execution_id: Option<ExecutionId>,
}

impl NewActivity {
    /// An unlinked activity with only a type and title.
    #[must_use]
    pub fn new(activity_type: ActivityType, title: impl Into<String>) -> Self {
        Self {
            activity_type,
            title: title.into(),
            description: None,
            due_at: None,
            deal_id: None,
            company_id: None,
            contact_id: None,
            owner_id: None,
            execution_id: None,
        }
    }

    /// Builds the stored activity.
    #[must_use]
    pub fn into_activity(self, organization_id: OrganizationId) -> Activity {
        Activity {
            id: ActivityId::new(),
            organization_id,
            activity_type: self.activity_type,
            title: self.title,
            description: self.description,
            due_at: self.due_at,
            deal_id: self.deal_id,
            company_id: self.company_id,
            contact_id: self.contact_id,
            owner_id: self.owner_id,
            execution_id: self.execution_id,
            completed: false,
            created_at: Utc::now(),
        }
    }
}

/// An in-app notification for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub organization_id: OrganizationId,
    pub recipient_id: UserId,
    pub title: String,
    pub message: String,
    pub deal_id: Option<DealId>,
    pub execution_id: Option<ExecutionId>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub recipient_id: UserId,
    pub title: String,
    pub message: String,
    pub deal_id: Option<DealId>,
    pub execution_id: Option<ExecutionId>,
}

impl NewNotification {
    /// Builds the stored notification.
    #[must_use]
    pub fn into_notification(self, organization_id: OrganizationId) -> Notification {
        Notification {
            id: NotificationId::new(),
            organization_id,
            recipient_id: self.recipient_id,
            title: self.title,
            message: self.message,
            deal_id: self.deal_id,
            execution_id: self.execution_id,
            read: false,
            created_at: Utc::now(),
        }
    }
}

/// Access to CRM records for action handlers.
///
/// Every call is scoped to one organization; records of other organizations
/// are never visible.
#[async_trait]
pub trait CrmGateway: Send + Sync {
    /// Loads a deal.
    async fn find_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
    ) -> Result<Option<Deal>, StoreError>;

    /// Applies a patch to a deal, returning the updated deal or `None` if it
    /// does not exist.
    async fn update_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
        patch: &DealPatch,
    ) -> Result<Option<Deal>, StoreError>;

    /// Creates an activity.
    async fn create_activity(
        &self,
        organization_id: OrganizationId,
        activity: NewActivity,
    ) -> Result<Activity, StoreError>;

    /// Creates a notification.
    async fn create_notification(
        &self,
        organization_id: OrganizationId,
        notification: NewNotification,
    ) -> Result<Notification, StoreError>;
}

//! Workflow steps and their typed action configuration.
//!
//! Each step carries exactly one [`StepAction`]. The action kind and its
//! configuration are a single tagged enum, so an unknown kind or a config that
//! does not fit its kind is rejected when the step is built or decoded and can
//! never reach the engine.

use crate::crm::{ActivityType, DealPatch};
use crate::error::ValidationError;
use chrono::Duration;
use dealflow_core::{StepId, UserId, WorkflowId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;

/// The kind of action a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateActivity,
    SendNotification,
    UpdateDeal,
    Wait,
}

impl ActionKind {
    /// Returns the string representation stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateActivity => "create_activity",
            Self::SendNotification => "send_notification",
            Self::UpdateDeal => "update_deal",
            Self::Wait => "wait",
        }
    }

    /// Parses from the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnknownActionKind`] for any other string.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "create_activity" => Ok(Self::CreateActivity),
            "send_notification" => Ok(Self::SendNotification),
            "update_deal" => Ok(Self::UpdateDeal),
            "wait" => Ok(Self::Wait),
            other => Err(ValidationError::UnknownActionKind {
                kind: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of a wait duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitUnit {
    Minutes,
    Hours,
    Days,
}

/// A relative duration used by wait steps and activity due dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitDuration {
    pub value: u32,
    pub unit: WaitUnit,
}

impl WaitDuration {
    #[must_use]
    pub const fn minutes(value: u32) -> Self {
        Self {
            value,
            unit: WaitUnit::Minutes,
        }
    }

    #[must_use]
    pub const fn hours(value: u32) -> Self {
        Self {
            value,
            unit: WaitUnit::Hours,
        }
    }

    #[must_use]
    pub const fn days(value: u32) -> Self {
        Self {
            value,
            unit: WaitUnit::Days,
        }
    }

    /// Returns true if the duration is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// Converts to a chrono duration.
    #[must_use]
    pub fn to_duration(&self) -> Duration {
        let value = i64::from(self.value);
        match self.unit {
            WaitUnit::Minutes => Duration::minutes(value),
            WaitUnit::Hours => Duration::hours(value),
            WaitUnit::Days => Duration::days(value),
        }
    }
}

/// Who receives a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    /// A specific user.
    User { user_id: UserId },
    /// The owner of the entity that fired the trigger.
    #[default]
    EntityOwner,
    /// The user whose action fired the trigger.
    TriggeringUser,
}

/// Configuration of a `create_activity` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateActivityConfig {
    pub activity_type: ActivityType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Due date relative to the moment the step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_in: Option<WaitDuration>,
}

/// Configuration of a `send_notification` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendNotificationConfig {
    #[serde(default)]
    pub recipient: Recipient,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message: String,
}

/// Configuration of an `update_deal` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDealConfig {
    pub field: String,
    pub value: JsonValue,
}

/// Configuration of a `wait` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    pub duration: WaitDuration,
}

/// The action a step performs, together with its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum StepAction {
    CreateActivity(CreateActivityConfig),
    SendNotification(SendNotificationConfig),
    UpdateDeal(UpdateDealConfig),
    Wait(WaitConfig),
}

impl StepAction {
    /// Returns the kind of this action.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::CreateActivity(_) => ActionKind::CreateActivity,
            Self::SendNotification(_) => ActionKind::SendNotification,
            Self::UpdateDeal(_) => ActionKind::UpdateDeal,
            Self::Wait(_) => ActionKind::Wait,
        }
    }

    /// Returns the configuration as a JSON value (without the kind tag).
    #[must_use]
    pub fn config_json(&self) -> JsonValue {
        let value = match self {
            Self::CreateActivity(c) => serde_json::to_value(c),
            Self::SendNotification(c) => serde_json::to_value(c),
            Self::UpdateDeal(c) => serde_json::to_value(c),
            Self::Wait(c) => serde_json::to_value(c),
        };
        // Plain structs of owned data always serialize
        value.unwrap_or(JsonValue::Null)
    }

    /// Rebuilds an action from its stored kind and configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is unknown or the configuration does not
    /// fit the kind.
    pub fn from_parts(kind: &str, config: JsonValue) -> Result<Self, ValidationError> {
        let kind = ActionKind::parse(kind)?;
        match kind {
            ActionKind::CreateActivity => decode(kind, config).map(Self::CreateActivity),
            ActionKind::SendNotification => decode(kind, config).map(Self::SendNotification),
            ActionKind::UpdateDeal => decode(kind, config).map(Self::UpdateDeal),
            ActionKind::Wait => decode(kind, config).map(Self::Wait),
        }
    }

    /// Checks the configuration for a step at the given position.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self, position: i32) -> Result<(), ValidationError> {
        match self {
            Self::CreateActivity(c) if c.title.trim().is_empty() => {
                Err(ValidationError::EmptyActivityTitle { position })
            }
            Self::SendNotification(c) if c.message.trim().is_empty() => {
                Err(ValidationError::EmptyNotificationMessage { position })
            }
            Self::UpdateDeal(c) => DealPatch::parse(&c.field, &c.value)
                .map(|_| ())
                .map_err(|e| match e {
                    crate::crm::PatchError::NotWhitelisted { field } => {
                        ValidationError::FieldNotWhitelisted { position, field }
                    }
                    crate::crm::PatchError::InvalidValue { .. } => {
                        ValidationError::InvalidActionConfig {
                            kind: ActionKind::UpdateDeal.to_string(),
                            reason: e.to_string(),
                        }
                    }
                }),
            Self::Wait(c) if c.duration.is_zero() => Err(ValidationError::ZeroWait { position }),
            _ => Ok(()),
        }
    }
}

fn decode<T: DeserializeOwned>(kind: ActionKind, config: JsonValue) -> Result<T, ValidationError> {
    serde_json::from_value(config).map_err(|e| ValidationError::InvalidActionConfig {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// One step of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    /// Execution order; unique within the workflow, may be sparse.
    pub position: i32,
    pub action: StepAction,
}

impl WorkflowStep {
    /// Creates a step.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, position: i32, action: StepAction) -> Self {
        Self {
            id: StepId::new(),
            workflow_id,
            position,
            action,
        }
    }
}

/// A step as submitted by a caller, before it is assigned an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub position: i32,
    pub action: StepAction,
}

/// The steps of one workflow, in execution order.
///
/// Construction guarantees unique positions and ascending order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StepSequence(Vec<WorkflowStep>);

impl StepSequence {
    /// Orders and validates a set of steps.
    ///
    /// # Errors
    ///
    /// Returns an error if two steps share a position or any action is invalid.
    pub fn new(mut steps: Vec<WorkflowStep>) -> Result<Self, ValidationError> {
        let mut seen = BTreeSet::new();
        for step in &steps {
            if !seen.insert(step.position) {
                return Err(ValidationError::DuplicatePosition {
                    position: step.position,
                });
            }
            step.action.validate(step.position)?;
        }
        steps.sort_by_key(|step| step.position);
        Ok(Self(steps))
    }

    /// Builds steps for a workflow from drafts.
    ///
    /// # Errors
    ///
    /// Same as [`StepSequence::new`].
    pub fn from_drafts(workflow_id: WorkflowId, drafts: Vec<StepDraft>) -> Result<Self, ValidationError> {
        Self::new(
            drafts
                .into_iter()
                .map(|draft| WorkflowStep::new(workflow_id, draft.position, draft.action))
                .collect(),
        )
    }

    /// Returns the steps in execution order.
    #[must_use]
    pub fn as_slice(&self) -> &[WorkflowStep] {
        &self.0
    }

    /// Iterates over the steps in execution order.
    pub fn iter(&self) -> std::slice::Iter<'_, WorkflowStep> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the owned steps.
    #[must_use]
    pub fn into_inner(self) -> Vec<WorkflowStep> {
        self.0
    }
}

impl<'a> IntoIterator for &'a StepSequence {
    type Item = &'a WorkflowStep;
    type IntoIter = std::slice::Iter<'a, WorkflowStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

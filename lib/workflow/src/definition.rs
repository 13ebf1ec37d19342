//! Workflow definition types.
//!
//! A workflow is a named automation owned by one organization that consists of:
//! - A trigger kind and optional criteria
//! - An ordered list of steps (see [`crate::step`])
//! - An active flag controlling automatic matching

use crate::error::ValidationError;
use crate::step::{StepDraft, StepSequence};
use crate::trigger::{TriggerCriteria, TriggerEvent, TriggerKind};
use chrono::{DateTime, Utc};
use dealflow_core::{OrganizationId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};

/// A workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub organization_id: OrganizationId,
    /// Human-readable name for this workflow.
    pub name: String,
    pub description: Option<String>,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub trigger_config: TriggerCriteria,
    /// Inactive workflows never match automatic events.
    pub active: bool,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Creates a new active workflow.
    #[must_use]
    pub fn new(
        organization_id: OrganizationId,
        name: impl Into<String>,
        trigger_kind: TriggerKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            organization_id,
            name: name.into(),
            description: None,
            trigger_kind,
            trigger_config: TriggerCriteria::new(),
            active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the trigger criteria.
    #[must_use]
    pub fn with_criteria(mut self, criteria: TriggerCriteria) -> Self {
        self.trigger_config = criteria;
        self
    }

    /// Sets the creator.
    #[must_use]
    pub fn created_by(mut self, user_id: UserId) -> Self {
        self.created_by = Some(user_id);
        self
    }

    /// Activates or deactivates this workflow.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        self.updated_at = Utc::now();
    }

    /// Checks the definition's own fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        Ok(())
    }

    /// Returns true if this workflow should start for an automatic event.
    ///
    /// Manual workflows never match, inactive workflows never match, and every
    /// criterion must equal the payload attribute of the same name.
    #[must_use]
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        self.active
            && event.kind.is_automatic()
            && self.trigger_kind == event.kind
            && self.trigger_config.matches(&event.payload)
    }
}

/// The editable parts of a workflow, as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub trigger_config: TriggerCriteria,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub steps: Vec<StepDraft>,
}

fn default_active() -> bool {
    true
}

impl WorkflowDraft {
    /// Builds a new definition and its steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or any step is invalid.
    pub fn into_new(
        self,
        organization_id: OrganizationId,
        created_by: Option<UserId>,
    ) -> Result<(WorkflowDefinition, StepSequence), ValidationError> {
        let mut definition = WorkflowDefinition::new(organization_id, self.name, self.trigger_kind)
            .with_criteria(self.trigger_config);
        definition.description = self.description;
        definition.active = self.active;
        definition.created_by = created_by;
        definition.validate()?;

        let steps = StepSequence::from_drafts(definition.id, self.steps)?;
        Ok((definition, steps))
    }

    /// Applies this draft to an existing definition, replacing its steps.
    ///
    /// The id, owner and creation metadata are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or any step is invalid.
    pub fn apply_to(
        self,
        existing: &WorkflowDefinition,
    ) -> Result<(WorkflowDefinition, StepSequence), ValidationError> {
        let definition = WorkflowDefinition {
            name: self.name,
            description: self.description,
            trigger_kind: self.trigger_kind,
            trigger_config: self.trigger_config,
            active: self.active,
            updated_at: Utc::now(),
            ..existing.clone()
        };
        definition.validate()?;

        let steps = StepSequence::from_drafts(definition.id, self.steps)?;
        Ok((definition, steps))
    }
}

/// A definition together with its ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub definition: WorkflowDefinition,
    pub steps: StepSequence,
}

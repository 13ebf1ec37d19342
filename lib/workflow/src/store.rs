//! Storage port for workflow definitions and their steps.

use crate::definition::WorkflowDefinition;
use crate::error::StoreError;
use crate::step::StepSequence;
use crate::trigger::TriggerKind;
use async_trait::async_trait;
use dealflow_core::{OrganizationId, WorkflowId};

/// Persistence for definitions and their ordered steps.
///
/// Every method is scoped to one organization. A definition belonging to
/// another organization behaves exactly like a missing one.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Stores a new definition together with its steps.
    async fn insert_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &StepSequence,
    ) -> Result<(), StoreError>;

    /// Replaces a definition's fields and steps in one transaction.
    ///
    /// Returns false if the definition does not exist.
    async fn update_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &StepSequence,
    ) -> Result<bool, StoreError>;

    /// Replaces only the steps of a definition.
    ///
    /// Returns false if the definition does not exist.
    async fn replace_steps(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        steps: &StepSequence,
    ) -> Result<bool, StoreError>;

    /// Toggles the active flag, returning the updated definition.
    async fn set_active(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
        active: bool,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Deletes a definition and its steps.
    ///
    /// Returns false if the definition does not exist.
    async fn delete_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<bool, StoreError>;

    async fn find_workflow(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Lists all definitions of an organization, most recently updated first.
    async fn list_workflows(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Lists active definitions listening for a trigger kind.
    async fn list_active_by_trigger(
        &self,
        organization_id: OrganizationId,
        trigger_kind: TriggerKind,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Loads the steps of a definition in position order.
    async fn list_steps(
        &self,
        organization_id: OrganizationId,
        workflow_id: WorkflowId,
    ) -> Result<StepSequence, StoreError>;
}

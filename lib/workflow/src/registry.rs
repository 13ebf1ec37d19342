//! Trigger registry: which workflows start for a domain event.

use crate::definition::WorkflowDefinition;
use crate::trigger::TriggerEvent;
use dealflow_core::{OrganizationId, WorkflowId};

/// Returns the ids of definitions that should start for `event`.
///
/// Pure function of its inputs: only definitions of `organization_id` that are
/// active, listen for the event's kind and whose criteria all hold are
/// returned, in ascending id order. Manual workflows never match.
#[must_use]
pub fn matching_workflows(
    organization_id: OrganizationId,
    event: &TriggerEvent,
    definitions: &[WorkflowDefinition],
) -> Vec<WorkflowId> {
    let mut matched: Vec<_> = definitions
        .iter()
        .filter(|definition| definition.organization_id == organization_id)
        .filter(|definition| definition.matches(event))
        .map(|definition| definition.id)
        .collect();
    matched.sort_unstable();
    matched.dedup();
    matched
}

//! Data available to action handlers while an execution runs.

use crate::execution::{StepExecutionRecord, StepStatus, WorkflowExecution};
use crate::trigger::TriggerPayload;
use dealflow_core::{
    CompanyId, ContactId, DealId, ExecutionId, OrganizationId, UserId, WorkflowId,
};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::str::FromStr;

/// The trigger payload snapshot plus the outputs of completed steps.
///
/// Rebuilt from the execution log every time an execution is resumed, so it
/// never depends on in-process state.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub organization_id: OrganizationId,
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub triggered_by: Option<UserId>,
    pub payload: TriggerPayload,
    outputs: BTreeMap<i32, JsonValue>,
}

impl ExecutionContext {
    /// Builds the context for an execution from its completed step records.
    #[must_use]
    pub fn rebuild(execution: &WorkflowExecution, records: &[StepExecutionRecord]) -> Self {
        let outputs = records
            .iter()
            .filter(|record| record.status() == StepStatus::Completed)
            .filter_map(|record| record.output.clone().map(|out| (record.position, out)))
            .collect();

        Self {
            organization_id: execution.organization_id,
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            triggered_by: execution.triggered_by,
            payload: execution.trigger_payload.clone(),
            outputs,
        }
    }

    /// Records the output of a completed step.
    pub fn record_output(&mut self, position: i32, output: JsonValue) {
        self.outputs.insert(position, output);
    }

    /// Returns the output of the step at `position`, if it completed.
    #[must_use]
    pub fn output(&self, position: i32) -> Option<&JsonValue> {
        self.outputs.get(&position)
    }

    #[must_use]
    pub fn deal_id(&self) -> Option<DealId> {
        self.payload.deal_id.or_else(|| self.latest_output_id("deal_id"))
    }

    #[must_use]
    pub fn company_id(&self) -> Option<CompanyId> {
        self.payload
            .company_id
            .or_else(|| self.latest_output_id("company_id"))
    }

    #[must_use]
    pub fn contact_id(&self) -> Option<ContactId> {
        self.payload
            .contact_id
            .or_else(|| self.latest_output_id("contact_id"))
    }

    /// Owner of the triggering entity, as captured in the payload.
    #[must_use]
    pub fn owner_id(&self) -> Option<UserId> {
        self.payload.owner_id
    }

    /// Finds the most recent step output carrying an id under `key`.
    fn latest_output_id<T: FromStr>(&self, key: &str) -> Option<T> {
        self.outputs
            .values()
            .rev()
            .filter_map(|output| output.get(key)?.as_str())
            .find_map(|raw| raw.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::step::{StepAction, StepSequence, WaitConfig, WaitDuration, WorkflowStep};
    use crate::trigger::TriggerKind;
    use chrono::Utc;
    use serde_json::json;

    fn execution(payload: TriggerPayload) -> WorkflowExecution {
        let workflow =
            WorkflowDefinition::new(OrganizationId::new(), "Ctx", TriggerKind::DealCreated);
        WorkflowExecution::start(&workflow, StepSequence::default(), payload, None, None)
    }

    fn completed_record(
        execution: &WorkflowExecution,
        position: i32,
        output: JsonValue,
    ) -> StepExecutionRecord {
        let step = WorkflowStep::new(
            execution.workflow_id,
            position,
            StepAction::Wait(WaitConfig {
                duration: WaitDuration::minutes(1),
            }),
        );
        let mut record = StepExecutionRecord::pending(execution, &step);
        record.start(Utc::now()).expect("start");
        record.complete(output, Utc::now()).expect("complete");
        record
    }

    #[test]
    fn payload_ids_take_precedence() {
        let deal = DealId::new();
        let execution = execution(TriggerPayload::new().with_deal(deal));
        let records = [completed_record(
            &execution,
            1,
            json!({"deal_id": DealId::new().to_string()}),
        )];
        let ctx = ExecutionContext::rebuild(&execution, &records);
        assert_eq!(ctx.deal_id(), Some(deal));
    }

    #[test]
    fn falls_back_to_latest_output() {
        let execution = execution(TriggerPayload::new());
        let older = CompanyId::new();
        let newer = CompanyId::new();
        let records = [
            completed_record(&execution, 1, json!({"company_id": older.to_string()})),
            completed_record(&execution, 2, json!({"company_id": newer.to_string()})),
        ];
        let ctx = ExecutionContext::rebuild(&execution, &records);
        assert_eq!(ctx.company_id(), Some(newer));
        assert_eq!(ctx.contact_id(), None);
    }

    #[test]
    fn only_completed_outputs_are_loaded() {
        let execution = execution(TriggerPayload::new());
        let step = WorkflowStep::new(
            execution.workflow_id,
            1,
            StepAction::Wait(WaitConfig {
                duration: WaitDuration::minutes(1),
            }),
        );
        let mut running = StepExecutionRecord::pending(&execution, &step);
        running.start(Utc::now()).expect("start");
        running.output = Some(json!({"partial": true}));

        let mut ctx = ExecutionContext::rebuild(&execution, &[running]);
        assert!(ctx.output(1).is_none());

        ctx.record_output(1, json!({"done": true}));
        assert_eq!(ctx.output(1), Some(&json!({"done": true})));
    }
}

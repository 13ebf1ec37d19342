//! Workflow automation engine for the dealflow CRM.
//!
//! This crate provides the core workflow execution engine, including:
//!
//! - **Triggers**: Domain event kinds, criteria and the pure matching registry
//! - **Definitions & Steps**: Workflows with ordered, typed step actions
//! - **Execution**: State machines for executions and step records, plus the event log
//! - **Handlers**: Create activity, send notification, update deal and wait
//! - **Engine**: Sequential, resumable execution with retries and cancellation
//! - **Ports**: Storage traits with in-memory implementations and a NATS event stream

pub mod context;
pub mod crm;
pub mod definition;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod handler;
pub mod log;
pub mod memory;
pub mod nats;
pub mod registry;
pub mod retry;
pub mod step;
pub mod store;
pub mod trigger;

pub use context::ExecutionContext;
pub use crm::{Activity, ActivityType, CrmGateway, Deal, DealPatch, Notification};
pub use definition::{WorkflowDefinition, WorkflowDetail, WorkflowDraft};
pub use engine::{ExecutionEngine, RunOutcome};
pub use error::{EngineError, StoreError, TransitionError, ValidationError};
pub use execution::{
    ExecutionDetail, ExecutionEvent, ExecutionHandle, ExecutionStatus, StepExecutionRecord,
    StepStatus, WorkflowExecution,
};
pub use handler::{ActionError, ActionHandlers, StepOutcome};
pub use log::{EventSink, ExecutionLog, ExecutionQuery, MirroredLog};
pub use registry::matching_workflows;
pub use retry::RetryPolicy;
pub use step::{ActionKind, StepAction, StepDraft, StepSequence, WorkflowStep};
pub use store::WorkflowRepository;
pub use trigger::{TriggerCriteria, TriggerEvent, TriggerKind, TriggerPayload};

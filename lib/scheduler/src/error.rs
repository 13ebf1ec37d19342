//! Error types for the scheduler crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `QueueError`: Errors from the job queue
//! - `DispatchError`: Errors returned by the dispatcher's public operations

use dealflow_core::{ExecutionId, JobId, WorkflowId};
use dealflow_workflow::{StoreError, TransitionError, ValidationError};
use std::fmt;

/// Errors from job queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Job not found.
    NotFound { id: JobId },
    /// The queue backend could not be reached.
    Unavailable { reason: String },
    /// Any other backend failure.
    StorageFailed { reason: String },
}

impl QueueError {
    /// Returns true if retrying later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "job not found: {id}"),
            Self::Unavailable { reason } => write!(f, "job queue unavailable: {reason}"),
            Self::StorageFailed { reason } => write!(f, "job queue storage failed: {reason}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors from dispatcher operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The workflow does not exist in this organization.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The execution does not exist in this organization.
    ExecutionNotFound { execution_id: ExecutionId },
    /// The workflow is inactive and cannot be executed.
    WorkflowInactive { workflow_id: WorkflowId },
    /// The submitted definition is invalid.
    Validation(ValidationError),
    /// The execution cannot make the requested status change.
    Transition(TransitionError),
    /// A storage port failed.
    Store(StoreError),
    /// The job queue failed.
    Queue(QueueError),
}

impl DispatchError {
    /// Returns true for errors that mean "no such resource for this tenant".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::WorkflowNotFound { .. } | Self::ExecutionNotFound { .. }
        )
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "execution not found: {execution_id}")
            }
            Self::WorkflowInactive { workflow_id } => {
                write!(f, "workflow is inactive: {workflow_id}")
            }
            Self::Validation(e) => write!(f, "invalid workflow: {e}"),
            Self::Transition(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Queue(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ValidationError> for DispatchError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<TransitionError> for DispatchError {
    fn from(e: TransitionError) -> Self {
        Self::Transition(e)
    }
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for DispatchError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

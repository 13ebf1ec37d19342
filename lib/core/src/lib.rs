//! Core domain types and utilities for dealflow.
//!
//! This crate provides the identifiers and error handling shared by the
//! workflow engine, the scheduler and the server. Every entity belongs to
//! exactly one organization, so [`OrganizationId`] is threaded explicitly
//! through all tenant-scoped operations.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    ActivityId, CompanyId, ContactId, DealId, ExecutionId, JobId, NotificationId, OrganizationId,
    ParseIdError, StageId, StepExecutionId, StepId, UserId, WorkflowId,
};

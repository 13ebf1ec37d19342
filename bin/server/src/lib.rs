//! dealflow automation server.
//!
//! This crate provides the HTTP API and the Postgres adapters for the
//! dealflow workflow engine:
//!
//! - **Routes**: Workflow definitions, executions, event ingestion and CRM writes
//! - **Database**: Postgres implementations of the storage ports and job queue
//! - **Tenancy**: Organization and user extraction from proxy headers

pub mod config;
pub mod crm;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod tenant;

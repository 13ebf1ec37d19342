//! Dispatching and background execution of workflows.
//!
//! This crate provides:
//!
//! - **Dispatcher**: Definition management, trigger fan-out, manual runs and history
//! - **Job Queue**: Delayed, leased jobs with one job per execution
//! - **Worker**: Polls the queue and advances executions with the engine

pub mod dispatch;
pub mod error;
pub mod queue;
pub mod worker;

pub use dispatch::Dispatcher;
pub use error::{DispatchError, QueueError};
pub use queue::{InMemoryJobQueue, Job, JobQueue};
pub use worker::{Worker, WorkerConfig};

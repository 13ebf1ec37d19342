//! Shared application state for request handlers.

use crate::crm::CrmStore;
use dealflow_scheduler::Dispatcher;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub crm: Arc<dyn CrmStore>,
}

impl AppState {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, crm: Arc<dyn CrmStore>) -> Self {
        Self { dispatcher, crm }
    }
}

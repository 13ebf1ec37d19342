use crate::crm::CrmStore;
use crate::state::AppState;
use crate::tenant::{ORGANIZATION_HEADER, USER_HEADER};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use dealflow_core::{OrganizationId, UserId};
use dealflow_scheduler::{Dispatcher, InMemoryJobQueue, JobQueue};
use dealflow_workflow::memory::{InMemoryCrm, InMemoryExecutionLog, InMemoryWorkflowRepository};
use dealflow_workflow::{CrmGateway, ExecutionEngine, ExecutionLog, WorkflowRepository};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tower::ServiceExt;

/// An in-memory application plus handles to its ports.
pub struct TestApp {
    pub router: Router,
    pub crm: Arc<InMemoryCrm>,
    pub queue: Arc<InMemoryJobQueue>,
    pub engine: Arc<ExecutionEngine>,
    pub organization_id: OrganizationId,
    pub user_id: UserId,
}

impl TestApp {
    pub fn new() -> Self {
        let workflows: Arc<dyn WorkflowRepository> = Arc::new(InMemoryWorkflowRepository::new());
        let log: Arc<dyn ExecutionLog> = Arc::new(InMemoryExecutionLog::new());
        let crm = Arc::new(InMemoryCrm::new());
        let queue = Arc::new(InMemoryJobQueue::new());

        let gateway: Arc<dyn CrmGateway> = crm.clone();
        let engine = Arc::new(ExecutionEngine::new(log.clone(), gateway));
        let job_queue: Arc<dyn JobQueue> = queue.clone();
        let dispatcher = Arc::new(Dispatcher::new(workflows, log, job_queue));
        let store: Arc<dyn CrmStore> = crm.clone();

        Self {
            router: crate::routes::router(AppState::new(dispatcher, store)),
            crm,
            queue,
            engine,
            organization_id: OrganizationId::new(),
            user_id: UserId::new(),
        }
    }

    /// Sends a request as this app's tenant and user.
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<JsonValue>,
    ) -> (StatusCode, JsonValue) {
        self.send_as(self.organization_id, method, uri, body).await
    }

    /// Sends a request as another organization.
    pub async fn send_as(
        &self,
        organization_id: OrganizationId,
        method: Method,
        uri: &str,
        body: Option<JsonValue>,
    ) -> (StatusCode, JsonValue) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(ORGANIZATION_HEADER, organization_id.to_string())
            .header(USER_HEADER, self.user_id.to_string());
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }
}

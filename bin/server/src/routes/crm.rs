//! CRM record routes.
//!
//! Each write fires the matching trigger event after the record is stored.
//! Automation failures are logged by the dispatcher and never fail the write.

use super::parse_id;
use crate::error::ApiError;
use crate::state::AppState;
use crate::tenant::Tenant;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::NaiveDate;
use dealflow_core::{ActivityId, CompanyId, ContactId, DealId, StageId, UserId};
use dealflow_workflow::{Activity, Deal, Notification, TriggerEvent, TriggerPayload};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Deserialize)]
pub struct CreateDealRequest {
    pub name: String,
    #[serde(default)]
    pub stage_id: Option<StageId>,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub contact_id: Option<ContactId>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub probability: Option<i16>,
    #[serde(default)]
    pub expected_close_date: Option<NaiveDate>,
    #[serde(default)]
    pub custom_fields: Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct MoveDealRequest {
    pub stage_id: StageId,
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    pub user_id: Option<String>,
}

fn deal_payload(deal: &Deal) -> TriggerPayload {
    let mut payload = TriggerPayload::new().with_deal(deal.id);
    payload.company_id = deal.company_id;
    payload.contact_id = deal.contact_id;
    payload.owner_id = deal.owner_id;
    if let Some(stage_id) = deal.stage_id {
        payload = payload.with_attribute("stage_id", stage_id.to_string());
    }
    payload
}

fn activity_payload(activity: &Activity) -> TriggerPayload {
    let mut payload = TriggerPayload::new()
        .with_activity(activity.id)
        .with_attribute("activity_type", activity.activity_type.as_str());
    payload.deal_id = activity.deal_id;
    payload.company_id = activity.company_id;
    payload.contact_id = activity.contact_id;
    payload.owner_id = activity.owner_id;
    payload
}

fn with_actor(event: TriggerEvent, tenant: &Tenant) -> TriggerEvent {
    match tenant.user_id {
        Some(user_id) => event.by(user_id),
        None => event,
    }
}

pub async fn create_deal(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(request): Json<CreateDealRequest>,
) -> Result<(StatusCode, Json<Deal>), ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Deal name must not be empty",
        ));
    }
    if request.probability.is_some_and(|p| !(0..=100).contains(&p)) {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Probability must be between 0 and 100",
        ));
    }

    let mut deal = Deal::new(tenant.organization_id, request.name.trim());
    deal.stage_id = request.stage_id;
    deal.owner_id = request.owner_id;
    deal.company_id = request.company_id;
    deal.contact_id = request.contact_id;
    deal.amount = request.amount;
    deal.probability = request.probability;
    deal.expected_close_date = request.expected_close_date;
    deal.custom_fields = request.custom_fields;

    state.crm.create_deal(&deal).await?;
    tracing::info!(deal_id = %deal.id, "deal created");

    let event = TriggerEvent::deal_created(deal_payload(&deal))
        .with_dedupe_key(format!("deal_created:{}", deal.id));
    state
        .dispatcher
        .fire_trigger(tenant.organization_id, with_actor(event, &tenant))
        .await;

    Ok((StatusCode::CREATED, Json(deal)))
}

pub async fn move_deal(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
    Json(request): Json<MoveDealRequest>,
) -> Result<Json<Deal>, ApiError> {
    let deal_id: DealId = parse_id(&id, "deal")?;
    let moved = state
        .crm
        .move_deal(tenant.organization_id, deal_id, request.stage_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Deal not found"))?;

    if moved.previous == Some(request.stage_id) {
        return Ok(Json(moved.deal));
    }

    let mut event = TriggerEvent::deal_stage_changed(
        moved.deal.id,
        moved.previous,
        request.stage_id,
        moved.deal.owner_id,
    );
    event.payload.company_id = moved.deal.company_id;
    event.payload.contact_id = moved.deal.contact_id;
    state
        .dispatcher
        .fire_trigger(tenant.organization_id, with_actor(event, &tenant))
        .await;

    Ok(Json(moved.deal))
}

pub async fn complete_activity(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(id): Path<String>,
) -> Result<Json<Activity>, ApiError> {
    let activity_id: ActivityId = parse_id(&id, "activity")?;
    let activity = state
        .crm
        .complete_activity(tenant.organization_id, activity_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Activity not found"))?;

    // Completing twice must not start the same automation twice.
    let event = TriggerEvent::activity_completed(activity_payload(&activity))
        .with_dedupe_key(format!("activity_completed:{}", activity.id));
    state
        .dispatcher
        .fire_trigger(tenant.organization_id, with_actor(event, &tenant))
        .await;

    Ok(Json(activity))
}

pub async fn list_notifications(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(params): Query<NotificationParams>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let recipient = match params.user_id.as_deref() {
        Some(raw) => parse_id::<UserId>(raw, "user")?,
        None => tenant
            .user_id
            .ok_or_else(|| ApiError::bad_request("A user is required"))?,
    };
    let notifications = state
        .crm
        .list_notifications(tenant.organization_id, recipient)
        .await?;
    Ok(Json(notifications))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::TestApp;
    use axum::http::{Method, StatusCode};
    use chrono::{Duration, Utc};
    use dealflow_core::{ActivityId, OrganizationId, StageId, UserId};
    use dealflow_scheduler::{JobQueue, Worker, WorkerConfig};
    use dealflow_workflow::crm::NewActivity;
    use dealflow_workflow::{ActivityType, CrmGateway};
    use serde_json::json;
    use std::sync::Arc;

    fn worker(app: &TestApp) -> Worker {
        let queue: Arc<dyn JobQueue> = app.queue.clone();
        Worker::new(app.engine.clone(), queue, WorkerConfig::default())
    }

    #[tokio::test]
    async fn stage_change_runs_follow_up_workflow_end_to_end() {
        let app = TestApp::new();
        let owner = UserId::new();
        let demo = StageId::new();

        let draft = json!({
            "name": "Demo follow-up",
            "trigger_kind": "deal_stage_changed",
            "trigger_config": { "stage_id": demo.to_string() },
            "steps": [
                { "position": 0, "action": { "kind": "create_activity",
                    "config": { "activity_type": "task", "title": "Follow up" } } },
                { "position": 1, "action": { "kind": "wait",
                    "config": { "duration": { "value": 1, "unit": "days" } } } },
                { "position": 2, "action": { "kind": "send_notification",
                    "config": { "message": "Check in" } } }
            ]
        });
        let (status, _) = app.send(Method::POST, "/api/workflows", Some(draft)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, deal) = app
            .send(
                Method::POST,
                "/api/deals",
                Some(json!({ "name": "Acme renewal", "owner_id": owner.to_string() })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let deal_id = deal["id"].as_str().expect("deal id").to_string();

        let (status, moved) = app
            .send(
                Method::POST,
                &format!("/api/deals/{deal_id}/stage"),
                Some(json!({ "stage_id": demo.to_string() })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["stage_id"], json!(demo.to_string()));

        let worker = worker(&app);
        let now = Utc::now();
        assert_eq!(worker.tick(now).await.expect("tick"), 1);

        let activities = app.crm.activities(app.organization_id);
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].title, "Follow up");
        assert_eq!(activities[0].deal_id.map(|id| id.to_string()), Some(deal_id));
        assert!(app.crm.notifications(app.organization_id).is_empty());

        assert_eq!(worker.tick(now + Duration::hours(1)).await.expect("tick"), 0);
        assert_eq!(
            worker
                .tick(now + Duration::days(1) + Duration::seconds(1))
                .await
                .expect("tick"),
            1
        );

        let (status, notifications) = app
            .send(
                Method::GET,
                &format!("/api/notifications?user_id={owner}"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let notifications = notifications.as_array().expect("notifications");
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["message"], "Check in");

        let (_, executions) = app.send(Method::GET, "/api/executions", None).await;
        assert_eq!(executions[0]["status"], "completed");
        assert!(app.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn moving_to_the_same_stage_fires_nothing() {
        let app = TestApp::new();
        let stage = StageId::new();
        let draft = json!({
            "name": "Any move",
            "trigger_kind": "deal_stage_changed",
            "steps": [{ "position": 0, "action": { "kind": "send_notification",
                "config": { "message": "Moved" } } }]
        });
        app.send(Method::POST, "/api/workflows", Some(draft)).await;

        let (_, deal) = app
            .send(
                Method::POST,
                "/api/deals",
                Some(json!({ "name": "Globex", "stage_id": stage.to_string() })),
            )
            .await;
        let uri = format!("/api/deals/{}/stage", deal["id"].as_str().expect("id"));

        let (status, _) = app
            .send(
                Method::POST,
                &uri,
                Some(json!({ "stage_id": stage.to_string() })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn deal_creation_fires_deal_created_once() {
        let app = TestApp::new();
        let draft = json!({
            "name": "Welcome",
            "trigger_kind": "deal_created",
            "steps": [{ "position": 0, "action": { "kind": "create_activity",
                "config": { "activity_type": "call", "title": "Intro call" } } }]
        });
        app.send(Method::POST, "/api/workflows", Some(draft)).await;

        let (status, _) = app
            .send(Method::POST, "/api/deals", Some(json!({ "name": "Initech" })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(app.queue.jobs().len(), 1);
    }

    #[tokio::test]
    async fn invalid_deals_are_rejected() {
        let app = TestApp::new();
        let (status, _) = app
            .send(Method::POST, "/api/deals", Some(json!({ "name": " " })))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = app
            .send(
                Method::POST,
                "/api/deals",
                Some(json!({ "name": "Hooli", "probability": 140 })),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn completing_an_activity_fires_once() {
        let app = TestApp::new();
        let draft = json!({
            "name": "After meetings",
            "trigger_kind": "activity_completed",
            "trigger_config": { "activity_type": "meeting" },
            "steps": [{ "position": 0, "action": { "kind": "send_notification",
                "config": { "recipient": { "type": "triggering_user" }, "message": "Log notes" } } }]
        });
        app.send(Method::POST, "/api/workflows", Some(draft)).await;

        let activity = app
            .crm
            .create_activity(
                app.organization_id,
                NewActivity::new(ActivityType::Meeting, "Quarterly review"),
            )
            .await
            .expect("activity");
        let uri = format!("/api/activities/{}/complete", activity.id);

        let (status, body) = app.send(Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completed"], json!(true));
        app.send(Method::POST, &uri, None).await;

        assert_eq!(app.queue.jobs().len(), 1);
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let app = TestApp::new();
        let (status, _) = app
            .send(
                Method::POST,
                &format!("/api/activities/{}/complete", ActivityId::new()),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, deal) = app
            .send(Method::POST, "/api/deals", Some(json!({ "name": "Umbrella" })))
            .await;
        let (status, _) = app
            .send_as(
                OrganizationId::new(),
                Method::POST,
                &format!("/api/deals/{}/stage", deal["id"].as_str().expect("id")),
                Some(json!({ "stage_id": StageId::new().to_string() })),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_default_to_the_calling_user() {
        let app = TestApp::new();
        let (status, body) = app.send(Method::GET, "/api/notifications", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }
}

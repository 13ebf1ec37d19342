//! Action handlers.
//!
//! Each [`StepAction`] variant maps to one handler. Handlers perform a single
//! side effect through the [`CrmGateway`] and return a JSON output that is
//! stored on the step record and visible to later steps.

use crate::context::ExecutionContext;
use crate::crm::{CrmGateway, DealPatch, NewActivity, NewNotification, PatchError};
use crate::error::StoreError;
use crate::step::{
    CreateActivityConfig, Recipient, SendNotificationConfig, StepAction, UpdateDealConfig,
    WaitConfig,
};
use chrono::{DateTime, Utc};
use dealflow_core::{DealId, UserId};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::sync::Arc;

/// Default notification title when a step does not configure one.
const DEFAULT_NOTIFICATION_TITLE: &str = "Workflow notification";

/// What a handler did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The side effect happened; `output` is recorded on the step.
    Completed { output: JsonValue },
    /// The step must not complete before `resume_at`.
    Suspend { resume_at: DateTime<Utc> },
}

/// Errors from action handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The context has no deal, company or contact to link an activity to.
    MissingLinkage,
    /// No recipient could be resolved for a notification.
    UnresolvableRecipient { recipient: &'static str },
    /// The context has no deal to update.
    MissingDeal,
    /// The deal in the context no longer exists.
    DealNotFound { deal_id: DealId },
    /// The configured deal field or value is not allowed.
    InvalidPatch(PatchError),
    /// The data layer failed.
    Store(StoreError),
}

impl ActionError {
    /// Returns true if the same step may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingLinkage => write!(
                f,
                "no deal, company or contact available to link the activity to"
            ),
            Self::UnresolvableRecipient { recipient } => {
                write!(f, "could not resolve notification recipient ({recipient})")
            }
            Self::MissingDeal => write!(f, "no deal available to update"),
            Self::DealNotFound { deal_id } => write!(f, "deal {deal_id} not found"),
            Self::InvalidPatch(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ActionError {}

impl From<StoreError> for ActionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Runs step actions against the CRM.
#[derive(Clone)]
pub struct ActionHandlers {
    crm: Arc<dyn CrmGateway>,
}

impl ActionHandlers {
    #[must_use]
    pub fn new(crm: Arc<dyn CrmGateway>) -> Self {
        Self { crm }
    }

    /// Runs the handler for an action.
    ///
    /// # Errors
    ///
    /// Returns an error if the side effect could not be performed.
    pub async fn run(
        &self,
        action: &StepAction,
        ctx: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, ActionError> {
        match action {
            StepAction::CreateActivity(config) => self.create_activity(config, ctx, now).await,
            StepAction::SendNotification(config) => self.send_notification(config, ctx).await,
            StepAction::UpdateDeal(config) => self.update_deal(config, ctx).await,
            StepAction::Wait(config) => Ok(wait(config, now)),
        }
    }

    async fn create_activity(
        &self,
        config: &CreateActivityConfig,
        ctx: &ExecutionContext,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome, ActionError> {
        let deal_id = ctx.deal_id();
        let company_id = ctx.company_id();
        let contact_id = ctx.contact_id();
        if deal_id.is_none() && company_id.is_none() && contact_id.is_none() {
            return Err(ActionError::MissingLinkage);
        }

        let activity = self
            .crm
            .create_activity(
                ctx.organization_id,
                NewActivity {
                    activity_type: config.activity_type,
                    title: config.title.clone(),
                    description: config.description.clone(),
                    due_at: config.due_in.map(|due| now + due.to_duration()),
                    deal_id,
                    company_id,
                    contact_id,
                    owner_id: ctx.owner_id(),
                    execution_id: Some(ctx.execution_id),
                },
            )
            .await?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            activity_id = %activity.id,
            "created activity"
        );

        Ok(StepOutcome::Completed {
            output: json!({
                "activity_id": activity.id.to_string(),
                "deal_id": activity.deal_id.map(|id| id.to_string()),
                "company_id": activity.company_id.map(|id| id.to_string()),
                "contact_id": activity.contact_id.map(|id| id.to_string()),
            }),
        })
    }

    async fn send_notification(
        &self,
        config: &SendNotificationConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, ActionError> {
        let recipient_id = self.resolve_recipient(config.recipient, ctx).await?;

        let notification = self
            .crm
            .create_notification(
                ctx.organization_id,
                NewNotification {
                    recipient_id,
                    title: config
                        .title
                        .clone()
                        .unwrap_or_else(|| DEFAULT_NOTIFICATION_TITLE.to_string()),
                    message: config.message.clone(),
                    deal_id: ctx.deal_id(),
                    execution_id: Some(ctx.execution_id),
                },
            )
            .await?;

        Ok(StepOutcome::Completed {
            output: json!({
                "notification_id": notification.id.to_string(),
                "recipient_id": recipient_id.to_string(),
            }),
        })
    }

    async fn resolve_recipient(
        &self,
        recipient: Recipient,
        ctx: &ExecutionContext,
    ) -> Result<UserId, ActionError> {
        match recipient {
            Recipient::User { user_id } => Ok(user_id),
            Recipient::TriggeringUser => {
                ctx.triggered_by
                    .ok_or(ActionError::UnresolvableRecipient {
                        recipient: "triggering_user",
                    })
            }
            Recipient::EntityOwner => {
                if let Some(owner) = ctx.owner_id() {
                    return Ok(owner);
                }
                let unresolvable = ActionError::UnresolvableRecipient {
                    recipient: "entity_owner",
                };
                let Some(deal_id) = ctx.deal_id() else {
                    return Err(unresolvable);
                };
                self.crm
                    .find_deal(ctx.organization_id, deal_id)
                    .await?
                    .and_then(|deal| deal.owner_id)
                    .ok_or(unresolvable)
            }
        }
    }

    /// Patches the triggering deal.
    ///
    /// Writes go straight through the gateway and fire no trigger events, so
    /// moving `stage_id` here never starts `deal_stage_changed` workflows. An
    /// automation cannot re-trigger itself or chain into a loop.
    async fn update_deal(
        &self,
        config: &UpdateDealConfig,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, ActionError> {
        let patch = DealPatch::parse(&config.field, &config.value).map_err(ActionError::InvalidPatch)?;
        let deal_id = ctx.deal_id().ok_or(ActionError::MissingDeal)?;

        let deal = self
            .crm
            .update_deal(ctx.organization_id, deal_id, &patch)
            .await?
            .ok_or(ActionError::DealNotFound { deal_id })?;

        Ok(StepOutcome::Completed {
            output: json!({
                "deal_id": deal.id.to_string(),
                "field": patch.field(),
                "value": config.value,
            }),
        })
    }
}

fn wait(config: &WaitConfig, now: DateTime<Utc>) -> StepOutcome {
    StepOutcome::Suspend {
        resume_at: now + config.duration.to_duration(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{ActivityType, Deal};
    use crate::definition::WorkflowDefinition;
    use crate::execution::WorkflowExecution;
    use crate::memory::InMemoryCrm;
    use crate::step::{StepSequence, WaitDuration};
    use crate::trigger::{TriggerKind, TriggerPayload};
    use chrono::Duration;
    use dealflow_core::{CompanyId, OrganizationId};

    fn context(org: OrganizationId, payload: TriggerPayload, user: Option<UserId>) -> ExecutionContext {
        let workflow = WorkflowDefinition::new(org, "Handlers", TriggerKind::DealCreated);
        let execution =
            WorkflowExecution::start(&workflow, StepSequence::default(), payload, user, None);
        ExecutionContext::rebuild(&execution, &[])
    }

    fn follow_up() -> StepAction {
        StepAction::CreateActivity(CreateActivityConfig {
            activity_type: ActivityType::Task,
            title: "Follow up".to_string(),
            description: None,
            due_in: Some(WaitDuration::days(2)),
        })
    }

    #[tokio::test]
    async fn create_activity_links_deal() {
        let org = OrganizationId::new();
        let crm = Arc::new(InMemoryCrm::new());
        let deal = crm.insert_deal(Deal::new(org, "Acme"));
        let handlers = ActionHandlers::new(crm.clone());
        let ctx = context(org, TriggerPayload::new().with_deal(deal.id), None);
        let now = Utc::now();

        let outcome = handlers.run(&follow_up(), &ctx, now).await.expect("run");

        let activities = crm.activities(org);
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].deal_id, Some(deal.id));
        assert_eq!(activities[0].due_at, Some(now + Duration::days(2)));
        assert_eq!(activities[0].execution_id, Some(ctx.execution_id));
        match outcome {
            StepOutcome::Completed { output } => {
                assert_eq!(output["activity_id"], activities[0].id.to_string());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_activity_requires_linkage() {
        let org = OrganizationId::new();
        let handlers = ActionHandlers::new(Arc::new(InMemoryCrm::new()));
        let ctx = context(org, TriggerPayload::new(), None);

        let err = handlers
            .run(&follow_up(), &ctx, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, ActionError::MissingLinkage);
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn create_activity_accepts_company_only() {
        let org = OrganizationId::new();
        let crm = Arc::new(InMemoryCrm::new());
        let handlers = ActionHandlers::new(crm.clone());
        let company = CompanyId::new();
        let ctx = context(org, TriggerPayload::new().with_company(company), None);

        handlers
            .run(&follow_up(), &ctx, Utc::now())
            .await
            .expect("run");
        assert_eq!(crm.activities(org)[0].company_id, Some(company));
    }

    #[tokio::test]
    async fn notification_falls_back_to_deal_owner() {
        let org = OrganizationId::new();
        let owner = UserId::new();
        let crm = Arc::new(InMemoryCrm::new());
        let mut deal = Deal::new(org, "Acme");
        deal.owner_id = Some(owner);
        let deal = crm.insert_deal(deal);
        let handlers = ActionHandlers::new(crm.clone());
        let ctx = context(org, TriggerPayload::new().with_deal(deal.id), None);

        let action = StepAction::SendNotification(SendNotificationConfig {
            recipient: Recipient::EntityOwner,
            title: None,
            message: "Check in".to_string(),
        });
        handlers.run(&action, &ctx, Utc::now()).await.expect("run");

        let notifications = crm.notifications(org);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].recipient_id, owner);
        assert_eq!(notifications[0].title, DEFAULT_NOTIFICATION_TITLE);
        assert_eq!(notifications[0].deal_id, Some(deal.id));
    }

    #[tokio::test]
    async fn notification_to_missing_triggering_user_fails() {
        let org = OrganizationId::new();
        let handlers = ActionHandlers::new(Arc::new(InMemoryCrm::new()));
        let ctx = context(org, TriggerPayload::new(), None);

        let action = StepAction::SendNotification(SendNotificationConfig {
            recipient: Recipient::TriggeringUser,
            title: Some("Hi".to_string()),
            message: "Check in".to_string(),
        });
        let err = handlers.run(&action, &ctx, Utc::now()).await.unwrap_err();
        assert_eq!(
            err,
            ActionError::UnresolvableRecipient {
                recipient: "triggering_user"
            }
        );
    }

    #[tokio::test]
    async fn update_deal_applies_whitelisted_field() {
        let org = OrganizationId::new();
        let crm = Arc::new(InMemoryCrm::new());
        let deal = crm.insert_deal(Deal::new(org, "Acme"));
        let handlers = ActionHandlers::new(crm.clone());
        let ctx = context(org, TriggerPayload::new().with_deal(deal.id), None);

        let action = StepAction::UpdateDeal(UpdateDealConfig {
            field: "probability".to_string(),
            value: json!(80),
        });
        handlers.run(&action, &ctx, Utc::now()).await.expect("run");

        let stored = crm.deal(deal.id).expect("deal");
        assert_eq!(stored.probability, Some(80));
    }

    #[tokio::test]
    async fn update_deal_rejects_other_fields_and_missing_deal() {
        let org = OrganizationId::new();
        let crm = Arc::new(InMemoryCrm::new());
        let handlers = ActionHandlers::new(crm.clone());

        let forbidden = StepAction::UpdateDeal(UpdateDealConfig {
            field: "name".to_string(),
            value: json!("Renamed"),
        });
        let deal = crm.insert_deal(Deal::new(org, "Acme"));
        let ctx = context(org, TriggerPayload::new().with_deal(deal.id), None);
        let err = handlers.run(&forbidden, &ctx, Utc::now()).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidPatch(PatchError::NotWhitelisted { .. })));

        let missing = DealId::new();
        let ctx = context(org, TriggerPayload::new().with_deal(missing), None);
        let action = StepAction::UpdateDeal(UpdateDealConfig {
            field: "amount".to_string(),
            value: json!(1000),
        });
        let err = handlers.run(&action, &ctx, Utc::now()).await.unwrap_err();
        assert_eq!(err, ActionError::DealNotFound { deal_id: missing });
    }

    #[tokio::test]
    async fn deals_of_other_tenants_are_invisible() {
        let crm = Arc::new(InMemoryCrm::new());
        let deal = crm.insert_deal(Deal::new(OrganizationId::new(), "Theirs"));
        let handlers = ActionHandlers::new(crm.clone());
        let ctx = context(OrganizationId::new(), TriggerPayload::new().with_deal(deal.id), None);

        let action = StepAction::UpdateDeal(UpdateDealConfig {
            field: "amount".to_string(),
            value: json!(1),
        });
        let err = handlers.run(&action, &ctx, Utc::now()).await.unwrap_err();
        assert_eq!(err, ActionError::DealNotFound { deal_id: deal.id });
        assert_eq!(crm.deal(deal.id).expect("deal").amount, None);
    }

    #[tokio::test]
    async fn wait_suspends() {
        let handlers = ActionHandlers::new(Arc::new(InMemoryCrm::new()));
        let ctx = context(OrganizationId::new(), TriggerPayload::new(), None);
        let now = Utc::now();
        let action = StepAction::Wait(WaitConfig {
            duration: WaitDuration::hours(3),
        });

        let outcome = handlers.run(&action, &ctx, now).await.expect("run");
        assert_eq!(
            outcome,
            StepOutcome::Suspend {
                resume_at: now + Duration::hours(3)
            }
        );
    }

    #[test]
    fn only_store_unavailability_is_transient() {
        assert!(
            ActionError::Store(StoreError::Unavailable {
                reason: "timeout".to_string()
            })
            .is_transient()
        );
        assert!(!ActionError::MissingDeal.is_transient());
    }
}

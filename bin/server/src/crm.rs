//! CRM record operations exposed over HTTP.
//!
//! The engine only needs the narrow [`CrmGateway`](dealflow_workflow::CrmGateway);
//! the HTTP surface also creates deals, moves them between stages and
//! completes activities, each of which fires a trigger event.

use async_trait::async_trait;
use dealflow_core::{ActivityId, DealId, OrganizationId, StageId, UserId};
use dealflow_workflow::memory::InMemoryCrm;
use dealflow_workflow::{Activity, CrmGateway, Deal, DealPatch, Notification, StoreError};

/// A deal after a stage change, with the stage it left.
#[derive(Debug, Clone, PartialEq)]
pub struct StageMove {
    pub previous: Option<StageId>,
    pub deal: Deal,
}

/// CRM writes performed on behalf of API callers.
#[async_trait]
pub trait CrmStore: Send + Sync {
    async fn create_deal(&self, deal: &Deal) -> Result<(), StoreError>;

    /// Moves a deal to a stage. Returns `None` if the deal does not exist.
    async fn move_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
        stage_id: StageId,
    ) -> Result<Option<StageMove>, StoreError>;

    /// Marks an activity completed. Returns `None` if it does not exist.
    async fn complete_activity(
        &self,
        organization_id: OrganizationId,
        activity_id: ActivityId,
    ) -> Result<Option<Activity>, StoreError>;

    /// Lists a user's notifications, newest first.
    async fn list_notifications(
        &self,
        organization_id: OrganizationId,
        recipient_id: UserId,
    ) -> Result<Vec<Notification>, StoreError>;
}

#[async_trait]
impl CrmStore for InMemoryCrm {
    async fn create_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        self.insert_deal(deal.clone());
        Ok(())
    }

    async fn move_deal(
        &self,
        organization_id: OrganizationId,
        deal_id: DealId,
        stage_id: StageId,
    ) -> Result<Option<StageMove>, StoreError> {
        let Some(current) = self.find_deal(organization_id, deal_id).await? else {
            return Ok(None);
        };
        let moved = self
            .update_deal(organization_id, deal_id, &DealPatch::Stage(stage_id))
            .await?;
        Ok(moved.map(|deal| StageMove {
            previous: current.stage_id,
            deal,
        }))
    }

    async fn complete_activity(
        &self,
        organization_id: OrganizationId,
        activity_id: ActivityId,
    ) -> Result<Option<Activity>, StoreError> {
        Ok(InMemoryCrm::complete_activity(
            self,
            organization_id,
            activity_id,
        ))
    }

    async fn list_notifications(
        &self,
        organization_id: OrganizationId,
        recipient_id: UserId,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut notifications: Vec<_> = self
            .notifications(organization_id)
            .into_iter()
            .filter(|n| n.recipient_id == recipient_id)
            .collect();
        notifications.reverse();
        Ok(notifications)
    }
}

//! Trigger kinds, criteria and the events that fire them.
//!
//! A workflow definition declares one [`TriggerKind`] plus optional
//! [`TriggerCriteria`]. Domain events arriving from the CRM are described by a
//! [`TriggerEvent`]; whether a definition reacts to one is decided by
//! [`crate::registry::matching_workflows`].

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use dealflow_core::{ActivityId, CompanyId, ContactId, DealId, StageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The kind of domain event a workflow reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// A deal moved to another pipeline stage.
    DealStageChanged,
    /// A deal was created.
    DealCreated,
    /// An activity was marked completed.
    ActivityCompleted,
    /// Only started on demand by a user.
    Manual,
}

impl TriggerKind {
    /// All supported kinds.
    pub const ALL: [Self; 4] = [
        Self::DealStageChanged,
        Self::DealCreated,
        Self::ActivityCompleted,
        Self::Manual,
    ];

    /// Returns the string representation stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DealStageChanged => "deal_stage_changed",
            Self::DealCreated => "deal_created",
            Self::ActivityCompleted => "activity_completed",
            Self::Manual => "manual",
        }
    }

    /// Returns true for kinds fired by domain events rather than by a user.
    #[must_use]
    pub const fn is_automatic(&self) -> bool {
        !matches!(self, Self::Manual)
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownTriggerKind {
                kind: s.to_string(),
            })
    }
}

/// Free-form key/value criteria a definition places on its trigger.
///
/// Every key must equal the event payload attribute of the same name for the
/// definition to match. Empty criteria match every event of the kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerCriteria(BTreeMap<String, JsonValue>);

impl TriggerCriteria {
    /// Creates empty criteria.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a criterion, returning the updated criteria.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Returns true if no criteria are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the configured value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Returns true if every criterion equals the payload attribute of the same name.
    #[must_use]
    pub fn matches(&self, payload: &TriggerPayload) -> bool {
        self.0
            .iter()
            .all(|(key, expected)| payload.attribute(key).as_ref() == Some(expected))
    }

    /// Returns the criteria as a JSON value.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone().into_iter().collect())
    }

    /// Builds criteria from a JSON object. Non-object values yield empty criteria.
    #[must_use]
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self(map.into_iter().collect()),
            _ => Self::default(),
        }
    }
}

/// Data describing the entity that fired a trigger.
///
/// Snapshotted onto every execution at fire time, so later changes to the
/// entity do not affect what the execution sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deal_id: Option<DealId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<ActivityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<CompanyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<ContactId>,
    /// Owner of the triggering entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
    /// Additional event attributes (for example `stage_id`, `activity_type`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, JsonValue>,
}

impl TriggerPayload {
    /// Creates an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deal.
    #[must_use]
    pub fn with_deal(mut self, deal_id: DealId) -> Self {
        self.deal_id = Some(deal_id);
        self
    }

    /// Sets the activity.
    #[must_use]
    pub fn with_activity(mut self, activity_id: ActivityId) -> Self {
        self.activity_id = Some(activity_id);
        self
    }

    /// Sets the company.
    #[must_use]
    pub fn with_company(mut self, company_id: CompanyId) -> Self {
        self.company_id = Some(company_id);
        self
    }

    /// Sets the contact.
    #[must_use]
    pub fn with_contact(mut self, contact_id: ContactId) -> Self {
        self.contact_id = Some(contact_id);
        self
    }

    /// Sets the owner of the triggering entity.
    #[must_use]
    pub fn with_owner(mut self, owner_id: UserId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    /// Sets an additional attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Looks up an attribute by name.
    ///
    /// Explicit attributes win over the well-known linkage ids, which are
    /// exposed under their field names as prefixed id strings.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<JsonValue> {
        if let Some(value) = self.attributes.get(key) {
            return Some(value.clone());
        }
        let id = match key {
            "deal_id" => self.deal_id.map(|id| id.to_string()),
            "activity_id" => self.activity_id.map(|id| id.to_string()),
            "company_id" => self.company_id.map(|id| id.to_string()),
            "contact_id" => self.contact_id.map(|id| id.to_string()),
            "owner_id" => self.owner_id.map(|id| id.to_string()),
            _ => None,
        };
        id.map(JsonValue::String)
    }
}

/// A domain event delivered to the trigger registry.
///
/// The tenant is not part of the event; it is passed alongside it to every
/// operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    #[serde(default)]
    pub payload: TriggerPayload,
    /// The user whose action caused the event, if any.
    #[serde(default)]
    pub actor: Option<UserId>,
    /// Events carrying the same key start at most one execution per workflow.
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Creates an event of the given kind.
    #[must_use]
    pub fn new(kind: TriggerKind, payload: TriggerPayload) -> Self {
        Self {
            kind,
            payload,
            actor: None,
            dedupe_key: None,
            occurred_at: Utc::now(),
        }
    }

    /// A deal moved from `previous` to `stage`.
    #[must_use]
    pub fn deal_stage_changed(
        deal_id: DealId,
        previous: Option<StageId>,
        stage: StageId,
        owner_id: Option<UserId>,
    ) -> Self {
        let mut payload = TriggerPayload::new()
            .with_deal(deal_id)
            .with_attribute("stage_id", stage.to_string());
        if let Some(previous) = previous {
            payload = payload.with_attribute("previous_stage_id", previous.to_string());
        }
        payload.owner_id = owner_id;
        Self::new(TriggerKind::DealStageChanged, payload)
    }

    /// A deal was created.
    #[must_use]
    pub fn deal_created(payload: TriggerPayload) -> Self {
        Self::new(TriggerKind::DealCreated, payload)
    }

    /// An activity was completed.
    #[must_use]
    pub fn activity_completed(payload: TriggerPayload) -> Self {
        Self::new(TriggerKind::ActivityCompleted, payload)
    }

    /// Sets the acting user.
    #[must_use]
    pub fn by(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Sets the deduplication key.
    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_kind_string_roundtrip() {
        for kind in TriggerKind::ALL {
            assert_eq!(kind.as_str().parse::<TriggerKind>(), Ok(kind));
        }
        assert_eq!(
            "webhook".parse::<TriggerKind>(),
            Err(ValidationError::UnknownTriggerKind {
                kind: "webhook".to_string()
            })
        );
    }

    #[test]
    fn manual_is_not_automatic() {
        assert!(!TriggerKind::Manual.is_automatic());
        assert!(TriggerKind::DealCreated.is_automatic());
    }

    #[test]
    fn empty_criteria_match_anything() {
        assert!(TriggerCriteria::new().matches(&TriggerPayload::new()));
    }

    #[test]
    fn criteria_compare_attributes_and_ids() {
        let stage = StageId::new();
        let deal = DealId::new();
        let event = TriggerEvent::deal_stage_changed(deal, None, stage, None);

        let by_stage = TriggerCriteria::new().with("stage_id", stage.to_string());
        assert!(by_stage.matches(&event.payload));

        let by_deal = TriggerCriteria::new().with("deal_id", deal.to_string());
        assert!(by_deal.matches(&event.payload));

        let other_stage = TriggerCriteria::new().with("stage_id", StageId::new().to_string());
        assert!(!other_stage.matches(&event.payload));

        let missing = TriggerCriteria::new().with("pipeline_id", "sales");
        assert!(!missing.matches(&event.payload));
    }

    #[test]
    fn criteria_json_roundtrip() {
        let criteria = TriggerCriteria::new().with("activity_type", "call");
        assert_eq!(criteria.to_json(), json!({"activity_type": "call"}));
        assert_eq!(TriggerCriteria::from_json(criteria.to_json()), criteria);
        assert!(TriggerCriteria::from_json(json!(null)).is_empty());
    }

    #[test]
    fn payload_deserializes_with_defaults() {
        let deal = DealId::new();
        let payload: TriggerPayload =
            serde_json::from_value(json!({"deal_id": deal.to_string(), "attributes": {"amount": 10}}))
                .expect("deserialize");
        assert_eq!(payload.deal_id, Some(deal));
        assert_eq!(payload.attribute("amount"), Some(json!(10)));
        assert_eq!(payload.attribute("company_id"), None);
    }
}

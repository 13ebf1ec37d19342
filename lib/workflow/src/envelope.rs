//! Versioned envelope for execution events leaving the process.
//!
//! Every message published to NATS is wrapped so consumers can:
//! - Reject or migrate payloads from newer or older writers
//! - Route on the tenant without decoding the payload

use dealflow_core::OrganizationId;
use serde::{Deserialize, Serialize};

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned, tenant-tagged envelope that wraps serialized data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the envelope format.
    pub version: u32,
    /// The organization the payload belongs to.
    pub organization_id: OrganizationId,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current version.
    #[must_use]
    pub fn new(organization_id: OrganizationId, payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            organization_id,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Returns true if this envelope uses the current version.
    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// Deserializes an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionEvent;
    use chrono::Utc;
    use dealflow_core::ExecutionId;

    #[test]
    fn event_envelope_roundtrip() {
        let org = OrganizationId::new();
        let event = ExecutionEvent::ExecutionCompleted {
            execution_id: ExecutionId::new(),
            timestamp: Utc::now(),
        };
        let envelope = Envelope::new(org, event.clone());
        assert!(envelope.is_current_version());

        let bytes = envelope.to_json_bytes().expect("serialize");
        let parsed: Envelope<ExecutionEvent> = Envelope::from_json_bytes(&bytes).expect("parse");
        assert_eq!(parsed.organization_id, org);
        assert_eq!(parsed.into_payload(), event);
    }

    #[test]
    fn newer_version_is_detected() {
        let json = format!(
            r#"{{"version": 2, "organization_id": "{}", "payload": null}}"#,
            OrganizationId::new()
        );
        let parsed: Envelope<Option<u8>> =
            Envelope::from_json_bytes(json.as_bytes()).expect("parse");
        assert!(!parsed.is_current_version());
    }
}

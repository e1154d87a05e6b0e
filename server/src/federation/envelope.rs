//! Event envelopes exchanged between domains.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{FederationError, FederationResult};
use crate::validation::validate_identifier;

/// Body of `POST /_federation/v1/event`. The signature in the
/// `Authorization` header covers the exact serialised bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event: String,
    pub event_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// A typed event payload: its wire name, its serde shape, and the semantic
/// checks serde cannot express.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl Envelope {
    /// Wrap a payload under a fresh time-ordered event id.
    pub fn new<P: EventPayload>(payload: &P) -> FederationResult<Self> {
        Self::with_id(Uuid::now_v7().to_string(), payload)
    }

    pub fn with_id<P: EventPayload>(event_id: String, payload: &P) -> FederationResult<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| FederationError::Internal(anyhow::anyhow!("encoding {}: {}", P::NAME, e)))?;
        Ok(Self {
            event: P::NAME.to_string(),
            event_id,
            payload,
        })
    }

    /// Parse an inbound body. The event id is mandatory.
    pub fn from_slice(body: &[u8]) -> FederationResult<Self> {
        let envelope: Self = serde_json::from_slice(body)
            .map_err(|e| FederationError::validation(format!("malformed envelope: {}", e)))?;
        validate_identifier("Event id", &envelope.event_id).map_err(FederationError::Validation)?;
        if envelope.event.is_empty() {
            return Err(FederationError::validation("malformed envelope: empty event name"));
        }
        Ok(envelope)
    }

    pub fn to_bytes(&self) -> FederationResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| FederationError::Internal(anyhow::anyhow!("encoding envelope: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Ping {
        group_id: String,
    }

    impl EventPayload for Ping {
        const NAME: &'static str = "t.test.ping";
    }

    #[test]
    fn test_new_envelope_carries_name_and_payload() {
        let envelope = Envelope::new(&Ping {
            group_id: "g1".into(),
        })
        .unwrap();
        assert_eq!(envelope.event, "t.test.ping");
        assert_eq!(envelope.payload["groupId"], "g1");
        assert!(Uuid::parse_str(&envelope.event_id).is_ok());

        let json: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["eventId"], envelope.event_id.as_str());
    }

    #[test]
    fn test_from_slice_requires_event_id() {
        let err = Envelope::from_slice(br#"{"event":"t.test.ping","payload":{}}"#).unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));

        let err = Envelope::from_slice(br#"{"event":"t.test.ping","eventId":"","payload":{}}"#)
            .unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));

        let err = Envelope::from_slice(b"not json").unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));
    }
}

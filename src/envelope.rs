use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// Frame a client submits: who should receive it and an opaque payload.
#[derive(Debug, Deserialize)]
pub struct InboundRequest {
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default = "null_payload")]
    pub payload: Box<RawValue>,
}

/// Routed message as persisted on the backbone and pushed to sockets.
///
/// `payload` is kept as raw JSON text so it round-trips byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub sender_id: String,
    pub recipients: Vec<String>,
    pub payload: Box<RawValue>,
    pub sent_at: DateTime<Utc>,
}

impl InboundRequest {
    pub fn parse(frame: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(frame)
    }

    pub fn has_recipients(&self) -> bool {
        self.recipients
            .iter()
            .any(|recipient| !recipient.trim().is_empty())
    }
}

impl Envelope {
    #[cfg(test)]
    pub fn new(sender_id: &str, recipients: &[String], payload: Box<RawValue>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_owned(),
            recipients: recipients.to_vec(),
            payload,
            sent_at: Utc::now(),
        }
    }

    pub fn from_request(sender_id: &str, request: InboundRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_owned(),
            recipients: request.recipients,
            payload: request.payload,
            sent_at: Utc::now(),
        }
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn to_frame_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn null_payload() -> Box<RawValue> {
    RawValue::NULL.to_owned()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde_json::{json, Value};

    use super::{Envelope, InboundRequest};

    #[test]
    fn inbound_request_keeps_payload_text_verbatim() -> Result<()> {
        let request =
            InboundRequest::parse(br#"{"recipients":["u2"],"payload":{"x":1,  "y":[true]}}"#)?;
        assert_eq!(request.recipients, vec!["u2".to_owned()]);
        assert_eq!(request.payload.get(), r#"{"x":1,  "y":[true]}"#);
        assert!(request.has_recipients());
        Ok(())
    }

    #[test]
    fn inbound_request_without_recipients_is_flagged() -> Result<()> {
        let missing = InboundRequest::parse(br#"{"payload":"hi"}"#)?;
        assert!(!missing.has_recipients());
        let blank = InboundRequest::parse(br#"{"recipients":["  "],"payload":1}"#)?;
        assert!(!blank.has_recipients());
        let no_payload = InboundRequest::parse(br#"{"recipients":["a"]}"#)?;
        assert_eq!(no_payload.payload.get(), "null");
        Ok(())
    }

    #[test]
    fn inbound_request_rejects_invalid_json() {
        assert!(InboundRequest::parse(b"{not json").is_err());
        assert!(InboundRequest::parse(br#"{"recipients":"u2"}"#).is_err());
    }

    #[test]
    fn envelope_wire_shape_uses_snake_case_and_rfc3339() -> Result<()> {
        let request =
            InboundRequest::parse(br#"{"recipients":["u2","u3"],"payload":{"x":1}}"#)?;
        let envelope = Envelope::from_request("u1", request);
        let wire: Value = serde_json::from_slice(&envelope.encode()?)?;

        assert_eq!(wire["sender_id"], json!("u1"));
        assert_eq!(wire["recipients"], json!(["u2", "u3"]));
        assert_eq!(wire["payload"], json!({"x": 1}));
        assert_eq!(wire["id"].as_str(), Some(envelope.id.as_str()));
        let sent_at = wire["sent_at"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("sent_at must be a string"))?;
        assert!(chrono::DateTime::parse_from_rfc3339(sent_at).is_ok());

        let decoded = Envelope::decode(&envelope.encode()?)?;
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.payload.get(), envelope.payload.get());
        assert_eq!(decoded.sent_at, envelope.sent_at);
        Ok(())
    }

    #[test]
    fn envelope_ids_are_unique() -> Result<()> {
        let payload = serde_json::value::RawValue::from_string("1".to_owned())?;
        let a = Envelope::new("u1", &["u2".to_owned()], payload.clone());
        let b = Envelope::new("u1", &["u2".to_owned()], payload);
        assert_ne!(a.id, b.id);
        Ok(())
    }
}

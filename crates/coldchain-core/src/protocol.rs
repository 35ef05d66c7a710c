use crate::notification::AlertNotification;
use crate::telemetry::{
    InstrumentType, InstrumentUpdate, InstrumentViewModel, ReadingEvent, ReadingInput,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const TYPE_AUTH: &str = "AUTH";
pub const TYPE_INSTRUMENT_CREATE: &str = "INSTRUMENT_CREATE";
pub const TYPE_TEMPERATURE_READING: &str = "TEMPERATURE_READING";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame exceeds max size ({size} > {max})")]
    Oversized { size: usize, max: usize },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {message_type} payload: {reason}")]
    Payload {
        message_type: &'static str,
        reason: String,
    },
}

/// Generic `{ type, payload? }` frame, one JSON object per WebSocket message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn decode(frame: &[u8], max_frame_bytes: usize) -> Result<Self, FrameError> {
        if frame.len() > max_frame_bytes {
            return Err(FrameError::Oversized {
                size: frame.len(),
                max: max_frame_bytes,
            });
        }
        let envelope: Envelope =
            serde_json::from_slice(frame).map_err(|err| FrameError::Decode(err.to_string()))?;
        if envelope.r#type.trim().is_empty() {
            return Err(FrameError::Decode("missing type".to_string()));
        }
        Ok(envelope)
    }

    pub fn is_auth(&self) -> bool {
        self.r#type == TYPE_AUTH
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(default)]
    pub organization_id: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentCreatePayload {
    pub organization_id: String,
    pub name: String,
    #[serde(default)]
    pub instrument_type: InstrumentType,
    pub min_value: f64,
    pub max_value: f64,
    #[serde(default)]
    pub process_status_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReadingPayload {
    pub readings: Vec<ReadingInput>,
}

/// Typed agent-to-gateway message.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Auth(AuthPayload),
    InstrumentCreate(InstrumentCreatePayload),
    TemperatureReading(TemperatureReadingPayload),
}

impl AgentMessage {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, FrameError> {
        match envelope.r#type.as_str() {
            TYPE_AUTH => parse_auth(envelope.payload.as_ref()).map(AgentMessage::Auth),
            TYPE_INSTRUMENT_CREATE => parse_instrument_create(envelope.payload.as_ref())
                .map(AgentMessage::InstrumentCreate),
            TYPE_TEMPERATURE_READING => parse_temperature_reading(envelope.payload.as_ref())
                .map(AgentMessage::TemperatureReading),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AgentMessage::Auth(_) => TYPE_AUTH,
            AgentMessage::InstrumentCreate(_) => TYPE_INSTRUMENT_CREATE,
            AgentMessage::TemperatureReading(_) => TYPE_TEMPERATURE_READING,
        }
    }
}

fn payload_error(message_type: &'static str, reason: impl Into<String>) -> FrameError {
    FrameError::Payload {
        message_type,
        reason: reason.into(),
    }
}

fn parse_auth(payload: Option<&Value>) -> Result<AuthPayload, FrameError> {
    let payload = payload.ok_or_else(|| payload_error(TYPE_AUTH, "missing_payload"))?;
    let mut value: AuthPayload = serde_json::from_value(payload.clone())
        .map_err(|err| payload_error(TYPE_AUTH, err.to_string()))?;
    if value.token.trim().is_empty() {
        return Err(payload_error(TYPE_AUTH, "missing_token"));
    }
    if value
        .organization_id
        .as_deref()
        .is_some_and(|id| id.trim().is_empty())
    {
        value.organization_id = None;
    }
    Ok(value)
}

fn parse_instrument_create(
    payload: Option<&Value>,
) -> Result<InstrumentCreatePayload, FrameError> {
    let payload =
        payload.ok_or_else(|| payload_error(TYPE_INSTRUMENT_CREATE, "missing_payload"))?;
    let value: InstrumentCreatePayload = serde_json::from_value(payload.clone())
        .map_err(|err| payload_error(TYPE_INSTRUMENT_CREATE, err.to_string()))?;
    if value.organization_id.trim().is_empty() {
        return Err(payload_error(TYPE_INSTRUMENT_CREATE, "missing_organization_id"));
    }
    if value.name.trim().is_empty() {
        return Err(payload_error(TYPE_INSTRUMENT_CREATE, "missing_name"));
    }
    if !value.min_value.is_finite() || !value.max_value.is_finite() {
        return Err(payload_error(TYPE_INSTRUMENT_CREATE, "non_finite_bounds"));
    }
    if value.min_value > value.max_value {
        return Err(payload_error(TYPE_INSTRUMENT_CREATE, "inverted_bounds"));
    }
    Ok(value)
}

fn parse_temperature_reading(
    payload: Option<&Value>,
) -> Result<TemperatureReadingPayload, FrameError> {
    let payload =
        payload.ok_or_else(|| payload_error(TYPE_TEMPERATURE_READING, "missing_payload"))?;
    let value: TemperatureReadingPayload = serde_json::from_value(payload.clone())
        .map_err(|err| payload_error(TYPE_TEMPERATURE_READING, err.to_string()))?;
    if value.readings.is_empty() {
        return Err(payload_error(TYPE_TEMPERATURE_READING, "empty_readings"));
    }
    for reading in &value.readings {
        reading
            .validate()
            .map_err(|reason| payload_error(TYPE_TEMPERATURE_READING, reason))?;
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentCreatedPayload {
    pub slug: String,
    pub instrument_id: String,
}

/// Gateway-to-client message, to agents and to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    AuthOk,
    AuthError(AuthErrorPayload),
    InstrumentCreated(InstrumentCreatedPayload),
    InstrumentViewModel(InstrumentViewModel),
    TemperatureUpdate(ReadingEvent),
    InstrumentUpdate(InstrumentUpdate),
    AlertNotification(AlertNotification),
}

impl ServerMessage {
    pub fn auth_error(message: impl Into<String>) -> Self {
        ServerMessage::AuthError(AuthErrorPayload {
            message: message.into(),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::AuthOk => "AUTH_OK",
            ServerMessage::AuthError(_) => "AUTH_ERROR",
            ServerMessage::InstrumentCreated(_) => "INSTRUMENT_CREATED",
            ServerMessage::InstrumentViewModel(_) => "INSTRUMENT_VIEW_MODEL",
            ServerMessage::TemperatureUpdate(_) => "TEMPERATURE_UPDATE",
            ServerMessage::InstrumentUpdate(_) => "INSTRUMENT_UPDATE",
            ServerMessage::AlertNotification(_) => "ALERT_NOTIFICATION",
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        let raw = serde_json::to_vec(&value).expect("encode");
        Envelope::decode(&raw, DEFAULT_MAX_FRAME_BYTES).expect("decode")
    }

    #[test]
    fn decode_rejects_oversized_and_garbage_frames() {
        let err = Envelope::decode(b"{\"type\":\"AUTH\"}", 4).expect_err("oversized");
        assert_eq!(err, FrameError::Oversized { size: 15, max: 4 });

        let err = Envelope::decode(b"not json", DEFAULT_MAX_FRAME_BYTES).expect_err("garbage");
        assert!(matches!(err, FrameError::Decode(_)));

        let err = Envelope::decode(b"{\"type\":\" \"}", DEFAULT_MAX_FRAME_BYTES)
            .expect_err("blank type");
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[test]
    fn auth_payload_normalizes_blank_organization() {
        let msg = AgentMessage::from_envelope(&envelope(json!({
            "type": "AUTH",
            "payload": { "token": "t-1", "organizationId": "  " }
        })))
        .expect("auth");
        let AgentMessage::Auth(payload) = msg else {
            panic!("expected auth")
        };
        assert_eq!(payload.organization_id, None);
        assert_eq!(payload.token, "t-1");
    }

    #[test]
    fn auth_without_token_is_invalid() {
        let err = AgentMessage::from_envelope(&envelope(json!({
            "type": "AUTH",
            "payload": { "organizationId": "org-a" }
        })))
        .expect_err("missing token");
        assert!(matches!(err, FrameError::Payload { message_type: "AUTH", .. }));

        let err = AgentMessage::from_envelope(&envelope(json!({ "type": "AUTH" })))
            .expect_err("missing payload");
        assert!(matches!(err, FrameError::Payload { .. }));
    }

    #[test]
    fn reading_batch_requires_valid_readings() {
        let ok = AgentMessage::from_envelope(&envelope(json!({
            "type": "TEMPERATURE_READING",
            "payload": { "readings": [
                { "instrumentId": "i-1", "instrumentName": "Fridge", "value": 4.2, "minValue": 2, "maxValue": 8 }
            ]}
        })))
        .expect("readings");
        assert_eq!(ok.type_name(), "TEMPERATURE_READING");

        let err = AgentMessage::from_envelope(&envelope(json!({
            "type": "TEMPERATURE_READING",
            "payload": { "readings": [] }
        })))
        .expect_err("empty");
        assert_eq!(err.to_string(), "invalid TEMPERATURE_READING payload: empty_readings");

        let err = AgentMessage::from_envelope(&envelope(json!({
            "type": "TEMPERATURE_READING",
            "payload": { "readings": [
                { "instrumentId": "i-1", "value": "warm", "minValue": 2, "maxValue": 8 }
            ]}
        })))
        .expect_err("bad value");
        assert!(matches!(err, FrameError::Payload { .. }));
    }

    #[test]
    fn instrument_create_defaults_type() {
        let msg = AgentMessage::from_envelope(&envelope(json!({
            "type": "INSTRUMENT_CREATE",
            "payload": {
                "organizationId": "org-a",
                "name": "Freezer 1",
                "minValue": -25,
                "maxValue": -15,
                "processStatusText": "defrost"
            }
        })))
        .expect("create");
        let AgentMessage::InstrumentCreate(payload) = msg else {
            panic!("expected instrument create")
        };
        assert_eq!(payload.instrument_type, InstrumentType::Temperature);
        assert_eq!(payload.process_status_text.as_deref(), Some("defrost"));
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = AgentMessage::from_envelope(&envelope(json!({ "type": "PING" })))
            .expect_err("unknown");
        assert_eq!(err, FrameError::UnknownType("PING".to_string()));
    }

    #[test]
    fn server_messages_use_type_and_payload_keys() {
        let ok = ServerMessage::AuthOk.to_text().expect("encode");
        assert_eq!(ok, "{\"type\":\"AUTH_OK\"}");

        let err = serde_json::to_value(ServerMessage::auth_error("agent already active"))
            .expect("encode");
        assert_eq!(
            err,
            json!({ "type": "AUTH_ERROR", "payload": { "message": "agent already active" } })
        );

        let created = serde_json::to_value(ServerMessage::InstrumentCreated(
            InstrumentCreatedPayload {
                slug: "freezer-1".to_string(),
                instrument_id: "i-9".to_string(),
            },
        ))
        .expect("encode");
        assert_eq!(created["payload"]["instrumentId"], "i-9");
        assert_eq!(created["type"], "INSTRUMENT_CREATED");
    }
}

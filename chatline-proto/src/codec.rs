//! JSON encoding and decoding for the Chatline wire protocol.
//!
//! Requests are decoded leniently: a missing `data` object is treated as
//! empty, and the `ping` timestamp is accepted either inside `data` or next
//! to `action` at the top level. Unknown actions are not an error at this
//! layer; they decode to [`ClientRequest::Unknown`].

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::event::ServerEvent;
use crate::request::ClientRequest;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame is not a JSON object.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The envelope has no `action` field.
    #[error("missing action")]
    MissingAction,
    /// The `data` object does not fit the named action.
    #[error("invalid data for {action}: {reason}")]
    InvalidData {
        /// Action whose payload failed to decode.
        action: String,
        /// Decoder message.
        reason: String,
    },
    /// Serialization of an outgoing value failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Raw `{"action", "data"}` envelope before action dispatch.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
}

/// Decodes a client text frame into a [`ClientRequest`].
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] for non-JSON or non-object frames,
/// [`CodecError::MissingAction`] when `action` is absent or empty, and
/// [`CodecError::InvalidData`] when `data` does not match the action.
pub fn decode_request(text: &str) -> Result<ClientRequest, CodecError> {
    let raw: RawEnvelope =
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let Some(action) = raw.action.filter(|a| !a.is_empty()) else {
        return Err(CodecError::MissingAction);
    };
    let data = match raw.data {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v) => v,
    };

    let request = match action.as_str() {
        "auth" => ClientRequest::Auth(from_data(&action, data)?),
        "send-message" => ClientRequest::SendMessage(from_data(&action, data)?),
        "get-messages" => ClientRequest::GetMessages(from_data(&action, data)?),
        "ping" => {
            let timestamp = data
                .get("timestamp")
                .or(raw.timestamp.as_ref())
                .and_then(Value::as_i64);
            ClientRequest::Ping { timestamp }
        }
        _ => ClientRequest::Unknown { action },
    };
    Ok(request)
}

/// Encodes a [`ClientRequest`] as a wire envelope.
///
/// The relay never sends requests; this exists for clients and tests.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the payload cannot be serialized.
pub fn encode_request(request: &ClientRequest) -> Result<String, CodecError> {
    let data = match request {
        ClientRequest::Auth(auth) => to_value(auth)?,
        ClientRequest::SendMessage(send) => to_value(send)?,
        ClientRequest::GetMessages(get) => to_value(get)?,
        ClientRequest::Ping { timestamp } => {
            let mut map = Map::new();
            if let Some(ts) = timestamp {
                map.insert("timestamp".into(), Value::from(*ts));
            }
            Value::Object(map)
        }
        ClientRequest::Unknown { .. } => Value::Object(Map::new()),
    };
    let envelope = serde_json::json!({ "action": request.action(), "data": data });
    Ok(envelope.to_string())
}

/// Encodes a [`ServerEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the event cannot be serialized.
pub fn encode_event(event: &ServerEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a JSON text frame into a [`ServerEvent`].
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the text is not a known event.
pub fn decode_event(text: &str) -> Result<ServerEvent, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

fn from_data<T: DeserializeOwned>(action: &str, data: Value) -> Result<T, CodecError> {
    serde_json::from_value(data).map_err(|e| CodecError::InvalidData {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

//! Generic message envelope exchanged between the broker, the server and plugins.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// `status` of an operation that could not be carried out.
pub const FAILED: i64 = 5;

/// Message type that never gets a synthesized failure when unhandled.
pub const RESYNCHRONIZE: &str = "resynchronize";
pub const OPERATION_RESULT: &str = "operation-result";

const TYPE_KEY: &str = "type";
const OPERATION_ID_KEY: &str = "operation-id";
const STATUS_KEY: &str = "status";
const RESULT_TEXT_KEY: &str = "result-text";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to (de)serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("message payload is not a JSON object")]
    NotAnObject,
    #[error("message has no type")]
    MissingType,
}

/// A JSON object with a mandatory `type` and optional `operation-id`.
///
/// Construction through [`Message::new`] always sets the type; messages
/// arriving from outside may lack it, which is why [`Message::message_type`]
/// is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, JsonValue>);

impl Message {
    pub fn new(message_type: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_KEY.to_string(), JsonValue::String(message_type.into()));
        Self(fields)
    }

    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.0.get(TYPE_KEY).and_then(JsonValue::as_str)
    }

    /// The operation id, if present and not null.
    pub fn operation_id(&self) -> Option<&JsonValue> {
        self.0.get(OPERATION_ID_KEY).filter(|id| !id.is_null())
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: JsonValue = serde_json::from_slice(bytes)?;
        let JsonValue::Object(fields) = value else {
            return Err(MessageError::NotAnObject);
        };
        let message = Self(fields);
        if message.message_type().is_none() {
            return Err(MessageError::MissingType);
        }
        Ok(message)
    }

    /// Builds an `operation-result` answering `operation_id`.
    pub fn operation_result(operation_id: JsonValue, status: i64, result_text: &str) -> Self {
        Message::new(OPERATION_RESULT)
            .with(STATUS_KEY, status)
            .with(RESULT_TEXT_KEY, result_text)
            .with(OPERATION_ID_KEY, operation_id)
    }
}

impl From<Map<String, JsonValue>> for Message {
    fn from(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }
}

/// Result text sent back when no plugin handled an operation of `message_type`.
pub fn unhandled_operation_text(message_type: &str) -> String {
    format!(
        "The client could not handle this request ({message_type}): no plugin able to \
         process it was available. The plugin may have been disabled on purpose, or \
         the client may not be running correctly.\n\n\
         Contact your administrator for more information.\n"
    )
}

//! The on-wire envelope.
//!
//! Every frame body is the UTF-8 JSON serialization of a [`PipeMessage`]
//! with four recognized fields: `RequestId`, `MessageId`, `Type` and
//! `Payload`. The ids are hyphenated hex strings, the payload is base64.
//! Null fields are omitted on serialization and unknown fields are ignored
//! on deserialization.
//!
//! `RequestId` identifies the logical end-to-end request and survives
//! relaying; `MessageId` identifies one transmitted envelope and is the key
//! the pending-response table correlates by.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PipehubError, Result};

/// Reserved `Type` values for protocol traffic. Anything else is an
/// application method name.
pub mod message_type {
    /// First frame a worker sends on a newly established connection.
    pub const REGISTER_WORKER: &str = "RegisterWorker";
    /// Reserved for requests carrying no value; unused in replies.
    pub const VOID: &str = "Void";
    /// Reply carrying an explicit nil result.
    pub const NULL: &str = "Null";
    /// Reply carrying an error message.
    pub const ERROR: &str = "Error";
}

/// One application-level message on the wire, request or reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipeMessage {
    /// Identifier of the logical request; preserved across relaying.
    #[serde(rename = "RequestId")]
    pub request_id: Uuid,

    /// Identifier of this transmitted envelope; the correlation key.
    #[serde(rename = "MessageId")]
    pub message_id: Uuid,

    /// Method name for application traffic, or a reserved enumerant.
    #[serde(rename = "Type", default)]
    pub message_type: String,

    /// Serialized application value; base64 in the JSON encoding.
    #[serde(
        rename = "Payload",
        default,
        skip_serializing_if = "Option::is_none",
        with = "payload_base64"
    )]
    pub payload: Option<Bytes>,
}

impl PipeMessage {
    /// Build a fresh request envelope carrying `value`.
    pub fn request<T: Serialize>(message_type: &str, value: &T) -> Result<Self> {
        Ok(Self {
            request_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
            message_type: message_type.to_string(),
            payload: Some(Bytes::from(serde_json::to_vec(value)?)),
        })
    }

    /// Build a reply to `request`.
    ///
    /// Inherits both ids from the request, which is what lets the sender's
    /// pending-response table correlate the reply by `message_id`.
    pub fn reply_to<T: Serialize>(
        request: &PipeMessage,
        message_type: &str,
        value: &T,
    ) -> Result<Self> {
        Ok(Self {
            request_id: request.request_id,
            message_id: request.message_id,
            message_type: message_type.to_string(),
            payload: Some(Bytes::from(serde_json::to_vec(value)?)),
        })
    }

    /// Build a forwarding copy of `request` with a fresh `message_id`.
    ///
    /// The `request_id`, type and payload ride along unchanged so each
    /// forwarded hop correlates its own response independently.
    pub fn relay(request: &PipeMessage) -> Self {
        Self {
            request_id: request.request_id,
            message_id: Uuid::new_v4(),
            message_type: request.message_type.clone(),
            payload: request.payload.clone(),
        }
    }

    /// Reply carrying an explicit nil result.
    ///
    /// The singleton `null` payload lets the caller distinguish "handler
    /// ran and returned nothing" from "handler did not reply at all".
    pub fn null_reply(request: &PipeMessage) -> Self {
        Self {
            request_id: request.request_id,
            message_id: request.message_id,
            message_type: message_type::NULL.to_string(),
            payload: Some(Bytes::from_static(b"null")),
        }
    }

    /// Reply carrying an error message.
    pub fn error_reply(request: &PipeMessage, message: &str) -> Self {
        let payload = serde_json::to_vec(&ErrorResponse {
            message: message.to_string(),
        })
        .unwrap_or_else(|_| b"{}".to_vec());
        Self {
            request_id: request.request_id,
            message_id: request.message_id,
            message_type: message_type::ERROR.to_string(),
            payload: Some(Bytes::from(payload)),
        }
    }

    /// Registration envelope a worker sends as its first frame.
    pub fn register_worker(worker_id: &str, pipe_name: &str) -> Result<Self> {
        Self::request(
            message_type::REGISTER_WORKER,
            &RegisterWorkerRequest {
                worker_id: worker_id.to_string(),
                pipe_name: pipe_name.to_string(),
            },
        )
    }

    /// Decode the payload as one value of type `T`.
    ///
    /// A missing payload decodes as JSON `null`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes: &[u8] = self.payload.as_deref().unwrap_or(b"null");
        serde_json::from_slice(bytes).map_err(|e| PipehubError::PayloadMalformed(e.to_string()))
    }

    /// Decode the payload as a positional argument list.
    pub fn payload_args(&self) -> Result<Vec<serde_json::Value>> {
        match self.payload_as::<serde_json::Value>()? {
            serde_json::Value::Array(values) => Ok(values),
            other => Err(PipehubError::PayloadMalformed(format!(
                "expected an argument array, got {other}"
            ))),
        }
    }

    /// True for an `Error` reply.
    pub fn is_error(&self) -> bool {
        self.message_type == message_type::ERROR
    }

    /// True for an explicit-nil reply.
    pub fn is_null(&self) -> bool {
        self.message_type == message_type::NULL
    }
}

/// Payload of a `RegisterWorker` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterWorkerRequest {
    /// Unique worker identifier (compared case-insensitively).
    #[serde(rename = "WorkerId")]
    pub worker_id: String,
    /// Pipe name the worker advertises for itself.
    #[serde(rename = "PipeName")]
    pub pipe_name: String,
}

/// Payload of an `Error` envelope. Message only, no stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    #[serde(rename = "Message")]
    pub message: String,
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(|raw| Some(Bytes::from(raw)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

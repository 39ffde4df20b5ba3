//! Protocol message codec shared by the server and client engines.
//!
//! The transport speaks a small vocabulary over SSE: `next` records carrying execution
//! results, `complete` records marking the end of an operation, and `pong` keep-alive
//! records which receivers discard. Terminal failures are not events at all; they are
//! expressed by the HTTP status of the stream response. This module defines those
//! message shapes, the operation request envelope submitted by clients, and the header
//! that correlates single-connection requests with their stream reservation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sse::SseFrame;

/// Header correlating single-connection requests with a stream reservation.
///
/// Carried by the client on the stream-attach `GET`, operation-submitting `POST` and
/// cancelling `DELETE`; issued by the server in response to a reservation `PUT`.
pub const TOKEN_HEADER: &str = "x-graphql-event-stream-token";

/// An execution result as it travels through the transport.
///
/// Results are opaque JSON of the shape `{data?, errors?, extensions?, hasNext?}`
/// produced by the GraphQL engine. The transport preserves them bit-exactly and never
/// coerces their types, so they are held as raw JSON values end to end.
pub type ExecutionResult = Value;

/// Errors produced while decoding protocol messages from SSE records.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The record's event name is not part of the protocol.
    #[error("unknown event kind: {0:?}")]
    UnknownEvent(String),
    /// The record's data is not the JSON shape the event kind requires.
    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
    /// A `next` record without a `payload` member.
    #[error("next event is missing its payload")]
    MissingPayload,
}

/// A decoded server-to-client protocol message.
///
/// The `id` is present exactly when the stream multiplexes several operations
/// (single-connection mode); distinct-connection streams carry one operation and omit
/// it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// One execution result for the identified operation.
    Next {
        id: Option<String>,
        payload: ExecutionResult,
    },
    /// The identified operation finished; no further events will follow for it.
    Complete { id: Option<String> },
    /// Keep-alive; receivers discard it.
    Pong,
}

impl StreamMessage {
    /// The SSE event name this message travels under.
    pub fn event(&self) -> &'static str {
        match self {
            StreamMessage::Next { .. } => "next",
            StreamMessage::Complete { .. } => "complete",
            StreamMessage::Pong => "pong",
        }
    }

    /// Encodes the message into an SSE frame.
    ///
    /// Payload JSON is serialized without embedded newlines, so each message occupies
    /// a single `data:` line on the wire.
    pub fn to_frame(&self) -> SseFrame {
        let data = match self {
            StreamMessage::Next { id, payload } => {
                let mut obj = serde_json::Map::new();
                if let Some(id) = id {
                    obj.insert("id".to_string(), Value::String(id.clone()));
                }
                obj.insert("payload".to_string(), payload.clone());
                Value::Object(obj).to_string()
            }
            StreamMessage::Complete { id } => {
                let mut obj = serde_json::Map::new();
                if let Some(id) = id {
                    obj.insert("id".to_string(), Value::String(id.clone()));
                }
                Value::Object(obj).to_string()
            }
            StreamMessage::Pong => "{}".to_string(),
        };
        SseFrame::new(self.event(), data)
    }

    /// Decodes an SSE record into a protocol message.
    pub fn decode(frame: &SseFrame) -> Result<Self, ProtocolError> {
        match frame.event.as_str() {
            "next" => {
                let mut obj: serde_json::Map<String, Value> = serde_json::from_str(&frame.data)
                    .map_err(|source| ProtocolError::Malformed {
                        event: "next",
                        source,
                    })?;
                let payload = obj.remove("payload").ok_or(ProtocolError::MissingPayload)?;
                let id = obj
                    .get("id")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string());
                Ok(StreamMessage::Next { id, payload })
            }
            "complete" => {
                let data = if frame.data.is_empty() {
                    "{}"
                } else {
                    frame.data.as_str()
                };
                let obj: serde_json::Map<String, Value> =
                    serde_json::from_str(data).map_err(|source| ProtocolError::Malformed {
                        event: "complete",
                        source,
                    })?;
                let id = obj
                    .get("id")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string());
                Ok(StreamMessage::Complete { id })
            }
            "pong" => Ok(StreamMessage::Pong),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// A GraphQL operation request as submitted over the transport.
///
/// `variables` and `extensions` are opaque JSON preserved bit-exactly. The query may
/// be empty when `extensions` identifies a persisted document the server resolves
/// through its subscribe hook.
///
/// # Examples
///
/// ```rust
/// use graphql_sse::protocol::OperationRequest;
///
/// let op = OperationRequest::new("subscription { greetings }");
/// assert!(op.operation_id().is_none());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationRequest {
    /// The GraphQL document source.
    #[serde(default)]
    pub query: String,
    /// Which named operation in the document to run.
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Operation variables, passed through verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// Protocol and user extensions, passed through verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl OperationRequest {
    /// Creates a request for the given document with no name, variables or extensions.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Selects a named operation within the document.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Attaches operation variables.
    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Attaches protocol extensions.
    pub fn extensions(mut self, extensions: Value) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// The multiplexing id under `extensions.operationId`, if one is set.
    ///
    /// Empty strings do not count; single-connection submissions must carry a
    /// non-empty id unique within their reservation.
    pub fn operation_id(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|e| e.get("operationId"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Returns the request with `extensions.operationId` set to `id`.
    ///
    /// A non-object `extensions` value is replaced; anything else in it is kept.
    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        let id = Value::String(id.into());
        match &mut self.extensions {
            Some(Value::Object(obj)) => {
                obj.insert("operationId".to_string(), id);
            }
            ext => {
                let mut obj = serde_json::Map::new();
                obj.insert("operationId".to_string(), id);
                *ext = Some(Value::Object(obj));
            }
        }
        self
    }

    /// Parses a distinct-mode request from a URL query string.
    ///
    /// `variables` and `extensions` arrive JSON-encoded inside their query parameters,
    /// the convention used by `EventSource` clients that can only issue `GET`.
    pub fn from_query_string(qs: &str) -> Result<Self, String> {
        #[derive(Deserialize)]
        struct RawParams {
            query: Option<String>,
            #[serde(rename = "operationName")]
            operation_name: Option<String>,
            variables: Option<String>,
            extensions: Option<String>,
        }

        let raw: RawParams =
            serde_urlencoded::from_str(qs).map_err(|e| format!("invalid query string: {e}"))?;
        let variables = raw
            .variables
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(|e| format!("invalid variables: {e}"))?;
        let extensions = raw
            .extensions
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(|e| format!("invalid extensions: {e}"))?;
        Ok(Self {
            query: raw.query.unwrap_or_default(),
            operation_name: raw.operation_name,
            variables,
            extensions,
        })
    }
}

//! JSON-RPC 2.0 envelope types and wire-shape classification.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC version marker.
///
/// Serializes as the literal string `"2.0"` and refuses to deserialize
/// anything else, so a parsed envelope is version-checked by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "Invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// A JSON-RPC request identifier.
///
/// Either a string or an integer on the wire. Hashable so it can key a
/// pending-request map directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String identifier
    String(String),
    /// Numeric identifier
    Number(i64),
}

impl RequestId {
    /// Extracts a request id from a raw JSON value.
    ///
    /// Returns `None` for `null`, missing, or non-string/non-integer values.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// JSON-RPC request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Request method name
    pub method: String,
    /// Request parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request identifier
    pub id: RequestId,
}

impl JsonRpcRequest {
    /// Creates a new JSON-RPC request.
    pub fn new(method: impl Into<String>, params: Option<Value>, id: impl Into<RequestId>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
            id: id.into(),
        }
    }
}

/// JSON-RPC notification message (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Notification method name
    pub method: String,
    /// Notification parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response payload, keeping `result` and `error` mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponsePayload {
    /// Successful response with a result
    Success {
        /// Response result
        result: Value,
    },
    /// Error response
    Failure {
        /// Response error
        error: JsonRpcError,
    },
}

/// JSON-RPC response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Response payload (either result or error, never both)
    #[serde(flatten)]
    pub payload: JsonRpcResponsePayload,
    /// Request identifier; `None` only for parse-error responses
    pub id: Option<RequestId>,
}

impl JsonRpcResponse {
    /// Creates a successful response.
    pub fn success(result: Value, id: impl Into<RequestId>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            payload: JsonRpcResponsePayload::Success { result },
            id: Some(id.into()),
        }
    }

    /// Creates an error response for a known request id.
    pub fn failure(error: JsonRpcError, id: impl Into<RequestId>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            payload: JsonRpcResponsePayload::Failure { error },
            id: Some(id.into()),
        }
    }

    /// Returns the result value, if this is a success response.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            JsonRpcResponsePayload::Success { result } => Some(result),
            JsonRpcResponsePayload::Failure { .. } => None,
        }
    }

    /// Returns the error object, if this is an error response.
    pub fn error(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            JsonRpcResponsePayload::Success { .. } => None,
            JsonRpcResponsePayload::Failure { error } => Some(error),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Creates a new JSON-RPC error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a new JSON-RPC error with additional data.
    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Creates a parse error (-32700).
    pub fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }

    /// Creates an invalid request error (-32600).
    pub fn invalid_request() -> Self {
        Self::new(-32600, "Invalid Request")
    }

    /// Creates a method not found error (-32601).
    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {method}"))
    }

    /// Creates an invalid params error (-32602).
    pub fn invalid_params(details: &str) -> Self {
        Self::new(-32602, format!("Invalid params: {details}"))
    }

    /// Creates an internal error (-32603).
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(-32603, message)
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Errors produced while validating the shape of a JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MessageError {
    /// The message is not a JSON object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// The `jsonrpc` field is missing or not `"2.0"`.
    #[error("invalid or missing JSON-RPC version: {found}")]
    InvalidVersion {
        /// What the `jsonrpc` field actually contained.
        found: String,
    },

    /// An outbound message has no `method` field.
    #[error("message has no method")]
    MissingMethod,

    /// The `method` field is not a non-empty string.
    #[error("method must be a non-empty string")]
    InvalidMethod,

    /// The `id` field is present but neither a string nor an integer.
    #[error("id must be a string or an integer")]
    InvalidId,

    /// The `error` field of a response is not a well-formed error object.
    #[error("error member must be an object with numeric code and string message")]
    InvalidErrorObject,

    /// An inbound frame is neither a response nor a method-bearing message.
    #[error("frame is neither a response nor a request/notification")]
    UnclassifiableFrame,
}

/// Classification of a caller-supplied outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// An id-bearing request that expects exactly one response.
    Request(RequestId),
    /// An id-less notification; no response will arrive.
    Notification,
}

/// Classification of a frame arriving from a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingFrame {
    /// A response carrying `result` or `error`. The id is `None` when the
    /// backend answered with a null id (e.g. to a parse error).
    Response {
        /// The request id this response correlates to, if any.
        id: Option<RequestId>,
    },
    /// A backend-initiated request or notification (carries a `method`).
    ServerMessage {
        /// The method named by the backend.
        method: String,
    },
}

fn check_version(value: &Value) -> Result<&serde_json::Map<String, Value>, MessageError> {
    let obj = value.as_object().ok_or(MessageError::NotAnObject)?;
    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => Ok(obj),
        other => Err(MessageError::InvalidVersion {
            found: other.map_or_else(|| "absent".to_string(), ToString::to_string),
        }),
    }
}

/// Validates a caller-supplied message against the JSON-RPC 2.0 shape and
/// reports whether it expects a response.
///
/// Requirements: a JSON object with `jsonrpc: "2.0"`, a non-empty string
/// `method`, and an `id` that is absent, `null` (treated as a notification),
/// a string, or an integer.
pub fn classify_outbound(message: &Value) -> Result<OutboundMessage, MessageError> {
    let obj = check_version(message)?;

    match obj.get("method") {
        Some(Value::String(m)) if !m.is_empty() => {}
        Some(_) => return Err(MessageError::InvalidMethod),
        None => return Err(MessageError::MissingMethod),
    }

    match obj.get("id") {
        None | Some(Value::Null) => Ok(OutboundMessage::Notification),
        Some(id) => RequestId::from_value(id)
            .map(OutboundMessage::Request)
            .ok_or(MessageError::InvalidId),
    }
}

/// Classifies a frame read off the wire.
///
/// A frame carrying an `id` together with `result` or `error` is a response;
/// a frame carrying a `method` is a backend-initiated message. Responses are
/// matched to pending requests purely by id, so this never inspects `params`.
pub fn classify_incoming(frame: &Value) -> Result<IncomingFrame, MessageError> {
    let obj = check_version(frame)?;

    let has_result = obj.contains_key("result");
    let error = obj.get("error");

    if (has_result || error.is_some()) && obj.contains_key("id") {
        if let Some(err) = error {
            let well_formed = err
                .as_object()
                .is_some_and(|e| e.get("code").is_some_and(Value::is_i64) && e.get("message").is_some_and(Value::is_string));
            if !well_formed {
                return Err(MessageError::InvalidErrorObject);
            }
        }
        let id = obj.get("id").and_then(RequestId::from_value);
        return Ok(IncomingFrame::Response { id });
    }

    match obj.get("method") {
        Some(Value::String(m)) if !m.is_empty() => Ok(IncomingFrame::ServerMessage {
            method: m.clone(),
        }),
        Some(_) => Err(MessageError::InvalidMethod),
        None => Err(MessageError::UnclassifiableFrame),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn version_round_trip() {
        let v = serde_json::to_string(&JsonRpcVersion).unwrap();
        assert_eq!(v, "\"2.0\"");
        assert!(serde_json::from_str::<JsonRpcVersion>("\"2.0\"").is_ok());
        assert!(serde_json::from_str::<JsonRpcVersion>("\"1.0\"").is_err());
    }

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new("ping", None, 1);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "ping", "id": 1}));
    }

    #[test]
    fn response_payload_exclusivity() {
        let ok = JsonRpcResponse::success(json!("pong"), 1);
        assert!(ok.result().is_some());
        assert!(ok.error().is_none());

        let err = JsonRpcResponse::failure(JsonRpcError::internal_error("boom"), 1);
        assert!(err.result().is_none());
        assert_eq!(err.error().unwrap().code, -32603);
    }

    #[test]
    fn response_deserializes_both_shapes() {
        let ok: JsonRpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": "pong"})).unwrap();
        assert_eq!(ok.result(), Some(&json!("pong")));

        let err: JsonRpcResponse = serde_json::from_value(
            json!({"jsonrpc": "2.0", "id": "a", "error": {"code": -32603, "message": "x"}}),
        )
        .unwrap();
        assert_eq!(err.error().unwrap().message, "x");
        assert_eq!(err.id, Some(RequestId::from("a")));
    }

    #[test]
    fn request_id_from_value() {
        assert_eq!(RequestId::from_value(&json!(7)), Some(RequestId::Number(7)));
        assert_eq!(
            RequestId::from_value(&json!("abc")),
            Some(RequestId::String("abc".to_string()))
        );
        assert_eq!(RequestId::from_value(&json!(null)), None);
        assert_eq!(RequestId::from_value(&json!(1.5)), None);
    }

    #[test]
    fn classify_outbound_request_and_notification() {
        let req = json!({"jsonrpc": "2.0", "method": "ping", "id": 1});
        assert_eq!(
            classify_outbound(&req).unwrap(),
            OutboundMessage::Request(RequestId::Number(1))
        );

        let notif = json!({"jsonrpc": "2.0", "method": "log"});
        assert_eq!(classify_outbound(&notif).unwrap(), OutboundMessage::Notification);

        let null_id = json!({"jsonrpc": "2.0", "method": "log", "id": null});
        assert_eq!(classify_outbound(&null_id).unwrap(), OutboundMessage::Notification);
    }

    #[test]
    fn classify_outbound_rejects_malformed() {
        assert_eq!(classify_outbound(&json!("nope")), Err(MessageError::NotAnObject));
        assert!(matches!(
            classify_outbound(&json!({"method": "ping", "id": 1})),
            Err(MessageError::InvalidVersion { .. })
        ));
        assert!(matches!(
            classify_outbound(&json!({"jsonrpc": "1.0", "method": "ping"})),
            Err(MessageError::InvalidVersion { .. })
        ));
        assert_eq!(
            classify_outbound(&json!({"jsonrpc": "2.0", "id": 1})),
            Err(MessageError::MissingMethod)
        );
        assert_eq!(
            classify_outbound(&json!({"jsonrpc": "2.0", "method": ""})),
            Err(MessageError::InvalidMethod)
        );
        assert_eq!(
            classify_outbound(&json!({"jsonrpc": "2.0", "method": "m", "id": {"k": 1}})),
            Err(MessageError::InvalidId)
        );
    }

    #[test]
    fn classify_incoming_response() {
        let resp = json!({"jsonrpc": "2.0", "id": 7, "result": "pong"});
        assert_eq!(
            classify_incoming(&resp).unwrap(),
            IncomingFrame::Response {
                id: Some(RequestId::Number(7))
            }
        );

        let err = json!({"jsonrpc": "2.0", "id": 7, "error": {"code": -32603, "message": "gone"}});
        assert!(matches!(
            classify_incoming(&err).unwrap(),
            IncomingFrame::Response { id: Some(_) }
        ));

        // Null-id responses classify, but cannot match a pending request.
        let null_id = json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "parse"}});
        assert_eq!(
            classify_incoming(&null_id).unwrap(),
            IncomingFrame::Response { id: None }
        );
    }

    #[test]
    fn classify_incoming_server_message() {
        let push = json!({"jsonrpc": "2.0", "method": "notify/progress", "params": {"pct": 40}});
        assert_eq!(
            classify_incoming(&push).unwrap(),
            IncomingFrame::ServerMessage {
                method: "notify/progress".to_string()
            }
        );

        // A server-to-client request carries both method and id; it is still
        // a server message, never a response.
        let server_req = json!({"jsonrpc": "2.0", "method": "ping", "id": 3});
        assert!(matches!(
            classify_incoming(&server_req).unwrap(),
            IncomingFrame::ServerMessage { .. }
        ));
    }

    #[test]
    fn classify_incoming_rejects_malformed() {
        assert_eq!(
            classify_incoming(&json!({"jsonrpc": "2.0", "id": 1})),
            Err(MessageError::UnclassifiableFrame)
        );
        assert_eq!(
            classify_incoming(&json!({"jsonrpc": "2.0", "id": 1, "error": "boom"})),
            Err(MessageError::InvalidErrorObject)
        );
    }

    #[test]
    fn error_constructors() {
        assert_eq!(JsonRpcError::parse_error().code, -32700);
        assert_eq!(JsonRpcError::invalid_request().code, -32600);
        assert_eq!(JsonRpcError::method_not_found("x").code, -32601);
        assert_eq!(JsonRpcError::invalid_params("y").code, -32602);
        assert_eq!(JsonRpcError::internal_error("z").code, -32603);
        assert_eq!(
            JsonRpcError::internal_error("Process terminated").to_string(),
            "Process terminated (code -32603)"
        );
    }
}

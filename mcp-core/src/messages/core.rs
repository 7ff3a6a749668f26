//! Core JSON-RPC 2.0 message structures for MCP communication.
//!
//! This module provides the fundamental JSON-RPC message types that form the
//! foundation of all MCP communication, plus the wire codec that maps raw
//! bytes or text to typed messages and back.
//!
//! # Message Types
//!
//! - **Request**: messages carrying an `id` and a `method`, expecting a reply
//! - **Notification**: messages carrying a `method` but no `id` (one-way)
//! - **Response**: successful replies carrying an `id` and a `result`
//! - **Error**: failed replies carrying an `id` and an `error` object
//!
//! # Wire discrimination
//!
//! Inbound JSON is classified by key presence, checked in this order:
//! `method` + `id` is a request, `method` alone is a notification, `id` +
//! `error` is an error response, `id` + `result` is a response. Anything
//! else is a [`CodecError`]. Batch arrays are rejected; current protocol
//! revisions removed JSON-RPC batching.
//!
//! # Examples
//!
//! ```rust
//! use mcp_core::messages::core::{JsonRpcMessage, JsonRpcRequest, RequestId};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new(1i64, "tools/list", json!({}));
//! let wire = JsonRpcMessage::Request(request).to_wire().unwrap();
//! let decoded = JsonRpcMessage::from_wire(&wire).unwrap();
//! assert_eq!(decoded.id(), Some(&RequestId::Number(1)));
//! ```

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// JSON-RPC protocol version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request ID for JSON-RPC messages.
///
/// Either a string or a non-fractional number. `null` ids are rejected at
/// decode time, as are fractional numbers: the id must round-trip through
/// the codec byte-for-byte, so a numeric id never turns into a string and
/// `5` never turns into `5.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    /// String identifier
    String(String),
    /// Integer identifier
    Number(i64),
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Number(n) => serializer.serialize_i64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RequestIdVisitor;

        impl Visitor<'_> for RequestIdVisitor {
            type Value = RequestId;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a string or non-fractional number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(RequestId::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(RequestId::String(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(RequestId::Number(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                i64::try_from(v)
                    .map(RequestId::Number)
                    .map_err(|_| E::custom("request id out of i64 range"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Err(E::custom(format!("fractional request id not allowed: {v}")))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Err(E::custom("null request id not allowed"))
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Err(E::custom("null request id not allowed"))
            }
        }

        deserializer.deserialize_any(RequestIdVisitor)
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

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self::Number(n as i64)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// JSON-RPC 2.0 request message.
///
/// Carries an `id` for correlation and expects exactly one response or
/// error reply with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Unique identifier for request/response correlation
    pub id: RequestId,

    /// Method name being invoked
    pub method: String,

    /// Parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request with the given ID, method, and parameters.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: if params.is_null() { None } else { Some(params) },
        }
    }

    /// Create a new JSON-RPC request without parameters.
    pub fn without_params(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    /// Deserialize the parameters into a concrete type.
    ///
    /// Missing parameters deserialize as JSON `null`, which works for
    /// types where all fields are optional.
    pub fn params_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        match &self.params {
            Some(params) => serde_json::from_value(params.clone()),
            None => serde_json::from_value(Value::Null),
        }
    }
}

/// JSON-RPC 2.0 successful response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// ID from the corresponding request
    pub id: RequestId,

    /// Result payload
    pub result: Value,
}

impl JsonRpcResponse {
    /// Create a successful response for the given request id.
    pub fn new(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result,
        }
    }

    /// Deserialize the result into a concrete type.
    pub fn result_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_value(self.result.clone())
    }
}

/// JSON-RPC 2.0 error response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// ID from the corresponding request
    pub id: RequestId,

    /// The error that occurred
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    /// Create an error response for the given request id.
    pub fn new(id: impl Into<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            error,
        }
    }
}

/// JSON-RPC 2.0 notification message.
///
/// One-way; carries no `id` and must never be replied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name being invoked
    pub method: String,

    /// Parameters for the method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification with the given method and parameters.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: if params.is_null() { None } else { Some(params) },
        }
    }

    /// Create a new JSON-RPC notification without parameters.
    pub fn without_params(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }

    /// Deserialize the parameters into a concrete type.
    pub fn params_as<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        match &self.params {
            Some(params) => serde_json::from_value(params.clone()),
            None => serde_json::from_value(Value::Null),
        }
    }
}

/// Standard JSON-RPC error code: parse error.
pub const PARSE_ERROR: i32 = -32700;
/// Standard JSON-RPC error code: invalid request.
pub const INVALID_REQUEST: i32 = -32600;
/// Standard JSON-RPC error code: method not found.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Standard JSON-RPC error code: invalid params.
pub const INVALID_PARAMS: i32 = -32602;
/// Standard JSON-RPC error code: internal error.
pub const INTERNAL_ERROR: i32 = -32603;
/// MCP error code: request received before the session was initialized.
pub const SERVER_NOT_INITIALIZED: i32 = -32002;
/// MCP error code: the request was cancelled by the requester.
pub const REQUEST_CANCELLED: i32 = -32001;

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create a new JSON-RPC error.
    pub fn new(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    /// Create a "Parse error" (-32700).
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error", None)
    }

    /// Create an "Invalid Request" error (-32600).
    pub fn invalid_request(details: impl Into<String>) -> Self {
        Self::new(
            INVALID_REQUEST,
            "Invalid Request",
            Some(Value::String(details.into())),
        )
    }

    /// Create a "Method not found" error (-32601).
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            METHOD_NOT_FOUND,
            "Method not found",
            Some(Value::String(format!(
                "Method '{}' not found",
                method.into()
            ))),
        )
    }

    /// Create an "Invalid params" error (-32602).
    pub fn invalid_params(details: impl Into<String>) -> Self {
        Self::new(
            INVALID_PARAMS,
            "Invalid params",
            Some(Value::String(details.into())),
        )
    }

    /// Create an "Internal error" (-32603).
    pub fn internal_error(details: impl Into<String>) -> Self {
        Self::new(
            INTERNAL_ERROR,
            "Internal error",
            Some(serde_json::json!({ "message": details.into() })),
        )
    }

    /// Create a "Server not initialized" error (-32002).
    pub fn server_not_initialized(details: impl Into<String>) -> Self {
        Self::new(
            SERVER_NOT_INITIALIZED,
            "Server not initialized",
            Some(Value::String(details.into())),
        )
    }

    /// Create a "Request cancelled" error (-32001).
    pub fn request_cancelled(reason: impl Into<String>) -> Self {
        Self::new(
            REQUEST_CANCELLED,
            "Request cancelled",
            Some(Value::String(reason.into())),
        )
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({data})")?;
        }
        Ok(())
    }
}

impl std::error::Error for JsonRpcError {}

/// Enum over all four JSON-RPC message shapes.
///
/// This is the unit of transfer between transports and the protocol engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request message (`id` + `method`)
    Request(JsonRpcRequest),
    /// Notification message (`method`, no `id`)
    Notification(JsonRpcNotification),
    /// Successful response message (`id` + `result`)
    Response(JsonRpcResponse),
    /// Error response message (`id` + `error`)
    Error(JsonRpcErrorResponse),
}

impl JsonRpcMessage {
    /// Classify a decoded JSON value into one of the four message shapes.
    ///
    /// Classification is by key presence: `method` + `id` is a request,
    /// `method` alone is a notification, `id` + `error` is an error
    /// response, `id` + `result` is a response.
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        if value.is_array() {
            return Err(CodecError::BatchNotSupported);
        }

        let obj = value.as_object().ok_or_else(|| CodecError::InvalidMessage {
            reason: "JSON-RPC message must be an object".to_string(),
        })?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => {
                return Err(CodecError::InvalidMessage {
                    reason: format!("unsupported jsonrpc version: {other}"),
                })
            }
            None => {
                return Err(CodecError::InvalidMessage {
                    reason: "missing jsonrpc version field".to_string(),
                })
            }
        }

        let has_method = obj.contains_key("method");
        let has_id = obj.contains_key("id");
        let has_error = obj.contains_key("error");
        let has_result = obj.contains_key("result");

        let message = if has_method && has_id {
            Self::Request(serde_json::from_value(value)?)
        } else if has_method {
            Self::Notification(serde_json::from_value(value)?)
        } else if has_id && has_error {
            Self::Error(serde_json::from_value(value)?)
        } else if has_id && has_result {
            Self::Response(serde_json::from_value(value)?)
        } else {
            return Err(CodecError::InvalidMessage {
                reason: "message is neither request, notification, response nor error"
                    .to_string(),
            });
        };

        Ok(message)
    }

    /// Decode one message from wire text.
    pub fn from_wire(text: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decode wire text that may be a legacy batch.
    ///
    /// Protocol revisions before 2025-06-18 allowed JSON-RPC batch arrays;
    /// this accepts either form and always yields a sequence. An empty
    /// batch is invalid per JSON-RPC 2.0.
    pub fn from_wire_batch(text: &str) -> Result<Vec<Self>, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(entries) => {
                if entries.is_empty() {
                    return Err(CodecError::InvalidMessage {
                        reason: "empty batch".to_string(),
                    });
                }
                entries.into_iter().map(Self::from_value).collect()
            }
            single => Ok(vec![Self::from_value(single)?]),
        }
    }

    /// Decode one message from wire bytes.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// Encode this message to wire text.
    pub fn to_wire(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Get the method name if this is a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            Self::Response(_) | Self::Error(_) => None,
        }
    }

    /// Get the request ID if this message carries one.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => Some(&resp.id),
            Self::Error(err) => Some(&err.id),
            Self::Notification(_) => None,
        }
    }

    /// Check if this message expects a reply.
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(de::Error::custom)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(req: JsonRpcRequest) -> Self {
        Self::Request(req)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(resp: JsonRpcResponse) -> Self {
        Self::Response(resp)
    }
}

impl From<JsonRpcErrorResponse> for JsonRpcMessage {
    fn from(err: JsonRpcErrorResponse) -> Self {
        Self::Error(err)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notif: JsonRpcNotification) -> Self {
        Self::Notification(notif)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_creation() {
        let request = JsonRpcRequest::new("1", "test_method", json!({"param": "value"}));

        assert_eq!(request.jsonrpc, "2.0");
        assert_eq!(request.id, RequestId::String("1".to_string()));
        assert_eq!(request.method, "test_method");
        assert!(request.params.is_some());
    }

    #[test]
    fn test_null_params_are_omitted() {
        let request = JsonRpcRequest::new(1i64, "test", Value::Null);
        let wire = serde_json::to_string(&request).unwrap();
        assert!(!wire.contains("params"));

        let notification = JsonRpcNotification::new("event", Value::Null);
        let wire = serde_json::to_string(&notification).unwrap();
        assert!(!wire.contains("params"));
    }

    #[test]
    fn test_discrimination_order() {
        let request = JsonRpcMessage::from_wire(r#"{"jsonrpc":"2.0","id":1,"method":"m"}"#).unwrap();
        assert!(matches!(request, JsonRpcMessage::Request(_)));

        let notification = JsonRpcMessage::from_wire(r#"{"jsonrpc":"2.0","method":"m"}"#).unwrap();
        assert!(matches!(notification, JsonRpcMessage::Notification(_)));

        let error = JsonRpcMessage::from_wire(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        assert!(matches!(error, JsonRpcMessage::Error(_)));

        let response =
            JsonRpcMessage::from_wire(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(response, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn test_invalid_envelope_rejected() {
        assert!(JsonRpcMessage::from_wire(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
        assert!(JsonRpcMessage::from_wire(r#"{"id":1,"method":"m"}"#).is_err());
        assert!(JsonRpcMessage::from_wire(r#"{"jsonrpc":"1.0","id":1,"method":"m"}"#).is_err());
        assert!(JsonRpcMessage::from_wire("[]").is_err());
        assert!(JsonRpcMessage::from_wire("not json").is_err());
    }

    #[test]
    fn test_null_id_rejected() {
        let result = JsonRpcMessage::from_wire(r#"{"jsonrpc":"2.0","id":null,"method":"m"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_fractional_id_rejected() {
        let result = JsonRpcMessage::from_wire(r#"{"jsonrpc":"2.0","id":1.5,"method":"m"}"#);
        assert!(result.is_err());

        let result = JsonRpcMessage::from_wire(r#"{"jsonrpc":"2.0","id":1.0,"method":"m"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_request_id_round_trip() {
        let numeric = r#"{"jsonrpc":"2.0","id":42,"method":"m"}"#;
        let decoded = JsonRpcMessage::from_wire(numeric).unwrap();
        let encoded = decoded.to_wire().unwrap();
        assert!(encoded.contains(r#""id":42"#));
        assert!(!encoded.contains(r#""id":"42""#));

        let string = r#"{"jsonrpc":"2.0","id":"42","method":"m"}"#;
        let decoded = JsonRpcMessage::from_wire(string).unwrap();
        let encoded = decoded.to_wire().unwrap();
        assert!(encoded.contains(r#""id":"42""#));
    }

    #[test]
    fn test_response_result_as() {
        #[derive(Deserialize)]
        struct Payload {
            status: String,
        }

        let response = JsonRpcResponse::new(1i64, json!({"status": "ok"}));
        let payload: Payload = response.result_as().unwrap();
        assert_eq!(payload.status, "ok");
    }

    #[test]
    fn test_error_constructors() {
        assert_eq!(JsonRpcError::parse_error().code, PARSE_ERROR);
        assert_eq!(JsonRpcError::method_not_found("x").code, METHOD_NOT_FOUND);
        assert_eq!(
            JsonRpcError::server_not_initialized("early").code,
            SERVER_NOT_INITIALIZED
        );
        assert_eq!(
            JsonRpcError::request_cancelled("user").code,
            REQUEST_CANCELLED
        );
    }

    #[test]
    fn test_message_accessors() {
        let request = JsonRpcMessage::Request(JsonRpcRequest::new(1i64, "test", json!({})));
        let notification =
            JsonRpcMessage::Notification(JsonRpcNotification::new("event", json!({})));

        assert_eq!(request.method(), Some("test"));
        assert_eq!(request.id(), Some(&RequestId::Number(1)));
        assert!(request.expects_response());

        assert_eq!(notification.method(), Some("event"));
        assert_eq!(notification.id(), None);
        assert!(!notification.expects_response());
    }

    #[test]
    fn test_legacy_batch_decoding() {
        let wire = r#"[{"jsonrpc":"2.0","id":1,"method":"a"},{"jsonrpc":"2.0","method":"b"}]"#;
        let batch = JsonRpcMessage::from_wire_batch(wire).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch[0], JsonRpcMessage::Request(_)));
        assert!(matches!(batch[1], JsonRpcMessage::Notification(_)));

        let single = JsonRpcMessage::from_wire_batch(r#"{"jsonrpc":"2.0","method":"c"}"#).unwrap();
        assert_eq!(single.len(), 1);

        assert!(JsonRpcMessage::from_wire_batch("[]").is_err());
    }

    #[test]
    fn test_extra_fields_tolerated_on_decode() {
        let wire = r#"{"jsonrpc":"2.0","id":1,"method":"m","params":{},"x-vendor":true}"#;
        let decoded = JsonRpcMessage::from_wire(wire).unwrap();
        assert!(matches!(decoded, JsonRpcMessage::Request(_)));
    }
}

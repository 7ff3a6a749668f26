//! Progress streaming and cancellation notification payloads.
//!
//! A requester attaches a progress token under `params._meta.progressToken`;
//! the responder may emit any number of `notifications/progress` messages
//! carrying that token before the final response. `notifications/cancelled`
//! travels the other way: it names an in-flight request id the requester has
//! given up on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ProgressToken, RequestId};

/// Payload of `notifications/progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressNotification {
    /// Token identifying the request this update belongs to
    #[serde(rename = "progressToken")]
    pub progress_token: ProgressToken,

    /// Amount of work done so far; non-decreasing per token
    pub progress: f64,

    /// Total amount of work, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,

    /// Human-readable status line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressNotification {
    /// Create a new progress notification.
    pub fn new(progress_token: impl Into<ProgressToken>, progress: f64) -> Self {
        Self {
            progress_token: progress_token.into(),
            progress,
            total: None,
            message: None,
        }
    }

    /// Set the total amount of work.
    pub fn with_total(mut self, total: f64) -> Self {
        self.total = Some(total);
        self
    }

    /// Set the status message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Payload of `notifications/cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledNotification {
    /// Id of the request being abandoned
    #[serde(rename = "requestId")]
    pub request_id: RequestId,

    /// Why the requester gave up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CancelledNotification {
    /// Create a new cancellation notification.
    pub fn new(request_id: impl Into<RequestId>, reason: Option<String>) -> Self {
        Self {
            request_id: request_id.into(),
            reason,
        }
    }
}

/// Attach a progress token to a params value under `_meta.progressToken`.
///
/// Existing `_meta` entries are preserved; a `null` or absent params value
/// becomes an object holding only the `_meta` field.
pub fn attach_progress_token(params: Option<Value>, token: &ProgressToken) -> Value {
    let mut obj = match params {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let meta = obj
        .entry("_meta".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(meta_map) = meta {
        meta_map.insert(
            "progressToken".to_string(),
            serde_json::to_value(token).unwrap_or(Value::Null),
        );
    }

    Value::Object(obj)
}

/// Extract the progress token from a params value, if present.
pub fn extract_progress_token(params: Option<&Value>) -> Option<ProgressToken> {
    params
        .and_then(|p| p.get("_meta"))
        .and_then(|meta| meta.get("progressToken"))
        .and_then(|token| serde_json::from_value(token.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_wire_format() {
        let progress = ProgressNotification::new("t1", 50.0)
            .with_total(100.0)
            .with_message("halfway");
        let json = serde_json::to_value(&progress).unwrap();

        assert_eq!(json["progressToken"], "t1");
        assert_eq!(json["progress"], 50.0);
        assert_eq!(json["total"], 100.0);
        assert_eq!(json["message"], "halfway");
    }

    #[test]
    fn test_progress_optional_fields_omitted() {
        let progress = ProgressNotification::new(3i64, 10.0);
        let json = serde_json::to_value(&progress).unwrap();

        assert_eq!(json["progressToken"], 3);
        assert!(json.get("total").is_none());
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_cancelled_wire_format() {
        let cancelled = CancelledNotification::new(5i64, Some("user".to_string()));
        let json = serde_json::to_value(&cancelled).unwrap();

        assert_eq!(json["requestId"], 5);
        assert_eq!(json["reason"], "user");
    }

    #[test]
    fn test_attach_token_preserves_existing_meta() {
        let params = json!({"name": "tool", "_meta": {"trace": "abc"}});
        let token = ProgressToken::from("t1");
        let with_token = attach_progress_token(Some(params), &token);

        assert_eq!(with_token["_meta"]["trace"], "abc");
        assert_eq!(with_token["_meta"]["progressToken"], "t1");
        assert_eq!(with_token["name"], "tool");
    }

    #[test]
    fn test_attach_token_to_empty_params() {
        let with_token = attach_progress_token(None, &ProgressToken::from(9i64));
        assert_eq!(with_token["_meta"]["progressToken"], 9);
    }

    #[test]
    fn test_extract_token_round_trip() {
        let params = attach_progress_token(Some(json!({"a": 1})), &ProgressToken::from("tok"));
        let extracted = extract_progress_token(Some(&params)).unwrap();
        assert_eq!(extracted, ProgressToken::String("tok".to_string()));

        assert_eq!(extract_progress_token(Some(&json!({"a": 1}))), None);
        assert_eq!(extract_progress_token(None), None);
    }
}

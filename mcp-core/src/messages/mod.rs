//! MCP (Model Context Protocol) message types and JSON-RPC structures.
//!
//! This module provides the envelope-level types the protocol runtime reads
//! and writes. Domain payloads (tool calls, prompt renders, resource reads)
//! stay opaque `serde_json::Value` blobs; the runtime only fixes the fields
//! it needs for correlation, progress, cancellation, and the handshake.
//!
//! # Message Categories
//!
//! - **Core Messages**: JSON-RPC request/response/notification structures and
//!   the wire codec
//! - **Initialization**: protocol version negotiation and capability exchange
//! - **Progress**: progress streaming and cancellation notifications
//!
//! # Examples
//!
//! ```rust
//! use mcp_core::messages::{InitializeRequest, ProtocolVersion, Implementation};
//!
//! let init_request = InitializeRequest {
//!     protocol_version: ProtocolVersion::default(),
//!     capabilities: Default::default(),
//!     client_info: Implementation::new("example-client", "0.1.0"),
//! };
//! ```

pub mod core;
pub mod initialization;
pub mod progress;

pub use self::core::{
    JsonRpcError, JsonRpcErrorResponse, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
pub use initialization::{InitializeRequest, InitializeResult, InitializedNotification};
pub use progress::{CancelledNotification, ProgressNotification};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known MCP method names the runtime itself handles.
pub mod methods {
    /// Handshake request opening a session.
    pub const INITIALIZE: &str = "initialize";
    /// Notification completing the handshake.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Progress update for an in-flight request.
    pub const PROGRESS: &str = "notifications/progress";
    /// Cancellation of an in-flight request.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Liveness check; always answered with an empty result.
    pub const PING: &str = "ping";
}

/// MCP protocol version identifier.
///
/// The protocol uses date-based version strings. Known versions get their
/// own variants; anything else is carried through as [`Self::Custom`] so a
/// newer peer's version survives decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MCP Protocol version 2025-06-18 (current)
    #[serde(rename = "2025-06-18")]
    V2025_06_18,

    /// MCP Protocol version 2025-03-26
    #[serde(rename = "2025-03-26")]
    V2025_03_26,

    /// MCP Protocol version 2024-11-05 (legacy)
    #[serde(rename = "2024-11-05")]
    V2024_11_05,

    /// Unrecognized version string, preserved for negotiation
    #[serde(untagged)]
    Custom(String),
}

impl ProtocolVersion {
    /// Get the string representation of the protocol version.
    pub fn as_str(&self) -> &str {
        match self {
            Self::V2025_06_18 => "2025-06-18",
            Self::V2025_03_26 => "2025-03-26",
            Self::V2024_11_05 => "2024-11-05",
            Self::Custom(version) => version,
        }
    }

    /// Check if this version is supported by the current implementation.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }

    /// All supported protocol versions, newest first.
    ///
    /// Negotiation walks this order: the server accepts the first client
    /// proposal it finds here, and falls back to the newest entry when it
    /// recognizes none of the proposals.
    pub fn supported_versions() -> Vec<Self> {
        vec![Self::V2025_06_18, Self::V2025_03_26, Self::V2024_11_05]
    }

    /// The newest supported protocol version.
    pub fn latest() -> Self {
        Self::V2025_06_18
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::latest()
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Feature flags a client advertises during the handshake.
///
/// The server consults these before issuing client-directed requests
/// (sampling, roots listing, elicitation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientCapabilities {
    /// Client can answer `sampling/*` requests from the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingCapability>,

    /// Client can provide workspace roots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,

    /// Client can answer `elicitation/*` requests from the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationCapability>,

    /// Experimental, implementation-specific capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, serde_json::Value>>,
}

/// Feature flags a server advertises during the handshake.
///
/// The client consults these before issuing server-directed requests
/// (tools, prompts, resources, logging, completion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Server exposes tools for invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,

    /// Server exposes prompt templates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,

    /// Server exposes readable resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,

    /// Server emits log messages toward the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingCapability>,

    /// Server offers argument completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<CompletionsCapability>,

    /// Experimental, implementation-specific capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, serde_json::Value>>,
}

/// Tool-related server capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ToolsCapability {
    /// Whether the server emits `notifications/tools/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Prompt-related server capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PromptsCapability {
    /// Whether the server emits `notifications/prompts/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Resource-related server capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourcesCapability {
    /// Whether the server supports per-resource subscriptions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,

    /// Whether the server emits `notifications/resources/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Logging server capability. Presence alone enables the feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoggingCapability {}

/// Completion server capability. Presence alone enables the feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompletionsCapability {}

/// Sampling client capability. Presence alone enables the feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SamplingCapability {}

/// Roots client capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RootsCapability {
    /// Whether the client emits `notifications/roots/list_changed`
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Elicitation client capability. Presence alone enables the feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ElicitationCapability {}

/// Implementation information for client or server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Name of the implementation
    pub name: String,

    /// Version of the implementation
    pub version: String,

    /// Human-readable display name (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Implementation {
    /// Create a new implementation info structure.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            title: None,
        }
    }

    /// Set the display title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Progress token for long-running operations.
///
/// Chosen by the requester and carried in `params._meta.progressToken`; the
/// responder echoes it on every `notifications/progress` it emits for that
/// request. Same shape as [`RequestId`]: string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// String-based progress token
    String(String),
    /// Numeric progress token
    Number(i64),
}

impl From<String> for ProgressToken {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for ProgressToken {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&RequestId> for ProgressToken {
    fn from(id: &RequestId) -> Self {
        match id {
            RequestId::String(s) => Self::String(s.clone()),
            RequestId::Number(n) => Self::Number(*n),
        }
    }
}

impl std::fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version_serialization() {
        let version = ProtocolVersion::V2024_11_05;
        let json = serde_json::to_string(&version).unwrap();
        assert_eq!(json, "\"2024-11-05\"");

        let deserialized: ProtocolVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, version);
    }

    #[test]
    fn test_protocol_version_custom() {
        let custom: ProtocolVersion = serde_json::from_str("\"9999-99-99\"").unwrap();
        assert_eq!(custom, ProtocolVersion::Custom("9999-99-99".to_string()));
        assert!(!custom.is_supported());
    }

    #[test]
    fn test_supported_versions_newest_first() {
        let versions = ProtocolVersion::supported_versions();
        assert_eq!(versions[0], ProtocolVersion::latest());
        assert!(versions.iter().all(ProtocolVersion::is_supported));
    }

    #[test]
    fn test_capabilities_omit_absent_flags() {
        let caps = ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(true),
            }),
            ..Default::default()
        };

        let json = serde_json::to_value(&caps).unwrap();
        assert!(json.get("tools").is_some());
        assert!(json.get("resources").is_none());
        assert_eq!(json["tools"]["listChanged"], serde_json::json!(true));
    }

    #[test]
    fn test_progress_token_from_request_id() {
        let id = RequestId::Number(7);
        assert_eq!(ProgressToken::from(&id), ProgressToken::Number(7));

        let id = RequestId::String("r1".to_string());
        assert_eq!(ProgressToken::from(&id), ProgressToken::String("r1".into()));
    }

    #[test]
    fn test_progress_token_wire_forms() {
        let json_string = serde_json::to_string(&ProgressToken::from("t1")).unwrap();
        let json_number = serde_json::to_string(&ProgressToken::from(42i64)).unwrap();

        assert_eq!(json_string, "\"t1\"");
        assert_eq!(json_number, "42");
    }

    #[test]
    fn test_implementation_creation() {
        let info = Implementation::new("example", "0.1.0").with_title("Example");
        assert_eq!(info.name, "example");
        assert_eq!(info.title.as_deref(), Some("Example"));

        let json = serde_json::to_value(Implementation::new("a", "b")).unwrap();
        assert!(json.get("title").is_none());
    }
}

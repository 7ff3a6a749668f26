//! MCP initialization and protocol negotiation message types.
//!
//! The initialization sequence frames every session:
//! 1. Client sends `initialize` with its protocol version, capabilities and
//!    implementation info
//! 2. Server answers with the negotiated version, its capabilities and
//!    implementation info
//! 3. Client sends `notifications/initialized` to complete the handshake
//!
//! Only the handshake carries a protocol version; every later message is
//! exchanged under the agreed version.

use serde::{Deserialize, Serialize};

use super::{ClientCapabilities, Implementation, ProtocolVersion, ServerCapabilities};

/// Client-to-server initialization request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeRequest {
    /// Protocol version proposed by the client
    #[serde(rename = "protocolVersion")]
    pub protocol_version: ProtocolVersion,

    /// Capabilities offered by the client
    pub capabilities: ClientCapabilities,

    /// Information about the client implementation
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

impl InitializeRequest {
    /// Create a new initialization request.
    pub fn new(
        protocol_version: ProtocolVersion,
        capabilities: ClientCapabilities,
        client_info: Implementation,
    ) -> Self {
        Self {
            protocol_version,
            capabilities,
            client_info,
        }
    }

    /// Create a request proposing the newest supported version with default
    /// capabilities.
    pub fn basic(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self::new(
            ProtocolVersion::latest(),
            ClientCapabilities::default(),
            Implementation::new(client_name, client_version),
        )
    }
}

/// Server-to-client initialization result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Protocol version selected by the server
    #[serde(rename = "protocolVersion")]
    pub protocol_version: ProtocolVersion,

    /// Capabilities offered by the server
    pub capabilities: ServerCapabilities,

    /// Information about the server implementation
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,

    /// Optional usage instructions for the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Create a new initialization result.
    pub fn new(
        protocol_version: ProtocolVersion,
        capabilities: ServerCapabilities,
        server_info: Implementation,
    ) -> Self {
        Self {
            protocol_version,
            capabilities,
            server_info,
            instructions: None,
        }
    }

    /// Attach usage instructions for the client.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

/// Client-to-server handshake completion notification.
///
/// Sent after the client has accepted the server's `initialize` result. The
/// payload is empty; the notification's arrival is the signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializedNotification {}

impl InitializedNotification {
    /// Create a new initialized notification.
    pub fn new() -> Self {
        Self {}
    }
}

/// Select the protocol version for a session from the client's proposal.
///
/// The server accepts the first client-proposed version it recognizes. When
/// it recognizes none, it answers with its own newest version and leaves the
/// final accept/close decision to the client.
pub fn negotiate_version(proposed: &ProtocolVersion) -> ProtocolVersion {
    if proposed.is_supported() {
        proposed.clone()
    } else {
        ProtocolVersion::latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_request_wire_format() {
        let request = InitializeRequest::basic("client", "1.0");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["protocolVersion"], "2025-06-18");
        assert_eq!(json["clientInfo"]["name"], "client");
        assert!(json.get("capabilities").is_some());
    }

    #[test]
    fn test_initialize_result_instructions_omitted() {
        let result = InitializeResult::new(
            ProtocolVersion::latest(),
            ServerCapabilities::default(),
            Implementation::new("server", "1.0"),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("instructions").is_none());

        let with = result.with_instructions("use the tools");
        let json = serde_json::to_value(&with).unwrap();
        assert_eq!(json["instructions"], "use the tools");
    }

    #[test]
    fn test_negotiation_accepts_known_proposal() {
        let picked = negotiate_version(&ProtocolVersion::V2024_11_05);
        assert_eq!(picked, ProtocolVersion::V2024_11_05);
    }

    #[test]
    fn test_negotiation_counters_unknown_proposal() {
        let picked = negotiate_version(&ProtocolVersion::Custom("9999-99-99".to_string()));
        assert_eq!(picked, ProtocolVersion::latest());
    }
}

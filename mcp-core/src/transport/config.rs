//! Transport configuration system for MCP sessions.
//!
//! This module provides a type-safe configuration system for all MCP
//! transport types. Configurations can be created programmatically or loaded
//! from JSON, YAML, or TOML files.
//!
//! # Examples
//!
//! ```rust
//! use mcp_core::transport::TransportConfig;
//!
//! // Stdio transport configuration
//! let stdio_config = TransportConfig::stdio("python", &["server.py"]);
//!
//! // SSE transport configuration
//! let sse_config = TransportConfig::sse("https://api.example.com/sse").unwrap();
//!
//! // Streamable HTTP transport configuration
//! let http_config = TransportConfig::streamable_http("https://api.example.com/mcp").unwrap();
//! ```

use crate::error::{ConfigError, McpResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Transport configuration enum supporting all MCP transport types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Local process communication via stdio
    Stdio(StdioConfig),

    /// Remote server over SSE stream + HTTP POST back-channel
    Sse(SseConfig),

    /// Remote server over the single-URL Streamable HTTP protocol
    StreamableHttp(StreamableHttpConfig),
}

impl TransportConfig {
    /// Create a new stdio transport configuration.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mcp_core::transport::TransportConfig;
    ///
    /// let config = TransportConfig::stdio("python", &["server.py"]);
    /// ```
    pub fn stdio(command: impl Into<String>, args: &[impl ToString]) -> Self {
        Self::Stdio(StdioConfig {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            environment: HashMap::new(),
        })
    }

    /// Create a new SSE transport configuration.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mcp_core::transport::TransportConfig;
    ///
    /// let config = TransportConfig::sse("https://api.example.com/sse").unwrap();
    /// ```
    pub fn sse(sse_url: impl AsRef<str>) -> McpResult<Self> {
        let url = parse_url("sse_url", sse_url.as_ref())?;

        Ok(Self::Sse(SseConfig {
            sse_url: url,
            request_timeout: Duration::from_secs(60),
            headers: HashMap::new(),
            auth: None,
        }))
    }

    /// Create a new Streamable HTTP transport configuration.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mcp_core::transport::TransportConfig;
    ///
    /// let config = TransportConfig::streamable_http("https://api.example.com/mcp").unwrap();
    /// ```
    pub fn streamable_http(url: impl AsRef<str>) -> McpResult<Self> {
        let url = parse_url("url", url.as_ref())?;

        Ok(Self::StreamableHttp(StreamableHttpConfig {
            url,
            request_timeout: Duration::from_secs(60),
            headers: HashMap::new(),
            auth: None,
            open_standalone_stream: true,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_attempts: 5,
        }))
    }

    /// Get a human-readable name for this transport type.
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Sse(_) => "sse",
            Self::StreamableHttp(_) => "streamable-http",
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> McpResult<()> {
        match self {
            Self::Stdio(config) => config.validate(),
            Self::Sse(config) => config.validate(),
            Self::StreamableHttp(config) => config.validate(),
        }
    }

    /// Load configuration from a file.
    ///
    /// Supports JSON, YAML, and TOML formats based on file extension.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> McpResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_e| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::InvalidFormat {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidFormat {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::InvalidFormat {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            _ => {
                return Err(ConfigError::InvalidFormat {
                    path: path.display().to_string(),
                    reason: "Unsupported file format. Use .json, .yaml, or .toml".to_string(),
                }
                .into())
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> McpResult<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                serde_json::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(self).map_err(|e| ConfigError::InvalidFormat {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            Some("toml") => {
                toml::to_string(self).map_err(|e| ConfigError::InvalidFormat {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            _ => {
                return Err(ConfigError::InvalidFormat {
                    path: path.display().to_string(),
                    reason: "Unsupported file format. Use .json, .yaml, or .toml".to_string(),
                }
                .into())
            }
        };

        std::fs::write(path, content)?;

        Ok(())
    }
}

fn parse_url(parameter: &str, value: &str) -> McpResult<Url> {
    value.parse().map_err(|e| {
        ConfigError::InvalidValue {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason: format!("Invalid URL: {e}"),
        }
        .into()
    })
}

fn validate_http_url(parameter: &str, url: &Url) -> McpResult<()> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidValue {
            parameter: parameter.to_string(),
            value: url.to_string(),
            reason: "URL must use http or https scheme".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Configuration for stdio (local process) transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Command to execute (e.g., "python", "/usr/bin/node")
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the process (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Environment variables to set for the process
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl StdioConfig {
    /// Create a new stdio configuration.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            environment: HashMap::new(),
        }
    }

    /// Add an argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Validate the stdio configuration.
    pub fn validate(&self) -> McpResult<()> {
        if self.command.is_empty() {
            return Err(ConfigError::MissingParameter {
                parameter: "command".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Configuration for the SSE transport pair (event stream + POST).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseConfig {
    /// URL of the SSE stream; the POST endpoint is advertised by the
    /// stream's first event
    pub sse_url: Url,

    /// Timeout for individual POST round trips
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Additional HTTP headers to include on every request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Authentication configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

impl SseConfig {
    /// Create a new SSE configuration.
    pub fn new(sse_url: Url) -> Self {
        Self {
            sse_url,
            request_timeout: default_request_timeout(),
            headers: HashMap::new(),
            auth: None,
        }
    }

    /// Add an HTTP header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set authentication configuration.
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Validate the SSE configuration.
    pub fn validate(&self) -> McpResult<()> {
        validate_http_url("sse_url", &self.sse_url)?;
        if let Some(ref auth) = self.auth {
            auth.validate()?;
        }
        Ok(())
    }
}

/// Configuration for the Streamable HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamableHttpConfig {
    /// The single MCP endpoint URL serving POST, GET and DELETE
    pub url: Url,

    /// Timeout for individual POST round trips
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Additional HTTP headers to include on every request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Authentication configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Whether to open the standalone GET stream for server-initiated
    /// messages once a session id is known
    #[serde(default = "default_true")]
    pub open_standalone_stream: bool,

    /// Delay before reconnecting a dropped GET stream
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,

    /// Reconnect attempts before the stream is declared lost
    #[serde(default = "default_max_reconnects")]
    pub max_reconnect_attempts: u32,
}

impl StreamableHttpConfig {
    /// Create a new Streamable HTTP configuration.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            request_timeout: default_request_timeout(),
            headers: HashMap::new(),
            auth: None,
            open_standalone_stream: true,
            reconnect_delay: default_reconnect_delay(),
            max_reconnect_attempts: default_max_reconnects(),
        }
    }

    /// Add an HTTP header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set authentication configuration.
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Validate the Streamable HTTP configuration.
    pub fn validate(&self) -> McpResult<()> {
        validate_http_url("url", &self.url)?;
        if let Some(ref auth) = self.auth {
            auth.validate()?;
        }
        Ok(())
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_reconnects() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// Authentication configuration for HTTP-based transports.
///
/// Credentials are opaque to the runtime: each variant resolves to a header
/// attached to outbound requests, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum AuthConfig {
    /// Bearer token authentication
    Bearer { token: String },

    /// HTTP Basic Authentication
    Basic { username: String, password: String },

    /// Custom header-based authentication
    Header { name: String, value: String },
}

impl AuthConfig {
    /// Create a new bearer token authentication configuration.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Create a new basic authentication configuration.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Create a new custom header authentication configuration.
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Header {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Validate the authentication configuration.
    pub fn validate(&self) -> McpResult<()> {
        let (field, empty) = match self {
            Self::Bearer { token } => ("token", token.is_empty()),
            Self::Basic { username, .. } => ("username", username.is_empty()),
            Self::Header { name, .. } => ("name", name.is_empty()),
        };
        if empty {
            return Err(ConfigError::MissingParameter {
                parameter: format!("auth.{field}"),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_builder() {
        let config = TransportConfig::stdio("python", &["server.py"]);
        assert_eq!(config.transport_type(), "stdio");
        assert!(config.validate().is_ok());

        let empty = TransportConfig::Stdio(StdioConfig::new(""));
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_sse_url_validation() {
        let config = TransportConfig::sse("https://example.com/sse").unwrap();
        assert_eq!(config.transport_type(), "sse");
        assert!(config.validate().is_ok());

        assert!(TransportConfig::sse("not a url").is_err());

        let ftp = TransportConfig::Sse(SseConfig::new("ftp://example.com/sse".parse().unwrap()));
        assert!(ftp.validate().is_err());
    }

    #[test]
    fn test_streamable_http_defaults() {
        let config = TransportConfig::streamable_http("http://localhost:3000/mcp").unwrap();
        if let TransportConfig::StreamableHttp(http) = &config {
            assert!(http.open_standalone_stream);
            assert_eq!(http.max_reconnect_attempts, 5);
        } else {
            panic!("wrong variant");
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_auth_validation() {
        assert!(AuthConfig::bearer("secret").validate().is_ok());
        assert!(AuthConfig::bearer("").validate().is_err());
        assert!(AuthConfig::header("X-Api-Key", "k").validate().is_ok());
        assert!(AuthConfig::header("", "k").validate().is_err());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.json");

        let config = TransportConfig::streamable_http("http://localhost:3000/mcp").unwrap();
        config.to_file(&path).unwrap();

        let loaded = TransportConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_file_unknown_extension() {
        let result = TransportConfig::from_file("config.ini");
        assert!(result.is_err());
    }
}

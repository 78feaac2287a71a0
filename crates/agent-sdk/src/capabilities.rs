//! Agent capability declaration.
//!
//! Capabilities are declarative: the proxy is expected to respect them, and
//! the agent tolerates events outside its advertised set by answering allow.

use serde::{Deserialize, Serialize};

/// What processing an agent supports, exchanged during the handshake.
///
/// ```
/// use zentinel_agent_sdk::AgentCapabilities;
///
/// let caps = AgentCapabilities::new()
///     .handle_request_body()
///     .handle_response_headers()
///     .with_streaming()
///     .with_max_concurrent_requests(100);
/// assert!(caps.handles_request_headers);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCapabilities {
    pub handles_request_headers: bool,
    pub handles_request_body: bool,
    pub handles_response_headers: bool,
    pub handles_response_body: bool,
    pub supports_streaming: bool,
    pub supports_cancellation: bool,
    /// Concurrent in-flight request limit. `None` means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
    /// Free-form feature strings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supported_features: Vec<String>,
}

impl Default for AgentCapabilities {
    /// Request header handling plus cancellation, nothing else.
    fn default() -> Self {
        Self {
            handles_request_headers: true,
            handles_request_body: false,
            handles_response_headers: false,
            handles_response_body: false,
            supports_streaming: false,
            supports_cancellation: true,
            max_concurrent_requests: None,
            supported_features: Vec::new(),
        }
    }
}

impl AgentCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every processing capability plus streaming and cancellation.
    pub fn all() -> Self {
        Self::new()
            .handle_request_body()
            .handle_response_headers()
            .handle_response_body()
            .with_streaming()
            .with_cancellation()
    }

    pub fn handle_request_headers(mut self) -> Self {
        self.handles_request_headers = true;
        self
    }

    pub fn handle_request_body(mut self) -> Self {
        self.handles_request_body = true;
        self
    }

    pub fn handle_response_headers(mut self) -> Self {
        self.handles_response_headers = true;
        self
    }

    pub fn handle_response_body(mut self) -> Self {
        self.handles_response_body = true;
        self
    }

    pub fn with_streaming(mut self) -> Self {
        self.supports_streaming = true;
        self
    }

    pub fn with_cancellation(mut self) -> Self {
        self.supports_cancellation = true;
        self
    }

    pub fn without_cancellation(mut self) -> Self {
        self.supports_cancellation = false;
        self
    }

    pub fn with_max_concurrent_requests(mut self, max: u32) -> Self {
        self.max_concurrent_requests = Some(max);
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.supported_features.push(feature.into());
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_features
            .extend(features.into_iter().map(Into::into));
        self
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.supported_features.iter().any(|f| f == feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_request_headers_and_cancellation() {
        let caps = AgentCapabilities::new();
        assert!(caps.handles_request_headers);
        assert!(caps.supports_cancellation);
        assert!(!caps.handles_request_body);
        assert!(!caps.handles_response_headers);
        assert!(!caps.handles_response_body);
        assert!(!caps.supports_streaming);
        assert!(caps.max_concurrent_requests.is_none());
    }

    #[test]
    fn builder_chain() {
        let caps = AgentCapabilities::new()
            .handle_request_body()
            .with_streaming()
            .with_max_concurrent_requests(64)
            .with_feature("sql-injection")
            .with_features(["xss", "lfi"]);

        assert!(caps.handles_request_body);
        assert!(caps.supports_streaming);
        assert_eq!(caps.max_concurrent_requests, Some(64));
        assert!(caps.has_feature("sql-injection"));
        assert!(caps.has_feature("lfi"));
        assert!(!caps.has_feature("rce"));
    }

    #[test]
    fn all_enables_everything() {
        let caps = AgentCapabilities::all();
        assert!(caps.handles_request_headers);
        assert!(caps.handles_request_body);
        assert!(caps.handles_response_headers);
        assert!(caps.handles_response_body);
        assert!(caps.supports_streaming);
        assert!(caps.supports_cancellation);
    }

    #[test]
    fn wire_shape_uses_snake_case_flags() {
        let json = serde_json::to_value(AgentCapabilities::new()).unwrap();
        assert_eq!(json["handles_request_headers"], true);
        assert_eq!(json["supports_cancellation"], true);
        assert!(json.get("max_concurrent_requests").is_none());
    }
}

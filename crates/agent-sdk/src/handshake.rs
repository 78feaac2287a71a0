//! Handshake and reverse-connection registration messages.
//!
//! The handshake is required as the first inbound frame on every stream. On
//! reverse connections the agent additionally registers itself before the
//! proxy initiates the handshake.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::capabilities::AgentCapabilities;

/// The protocol version this SDK speaks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Sent by the proxy to initiate a session (0x01).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    /// Identifies the connecting proxy
    pub client_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supported_features: Vec<String>,
}

impl HandshakeRequest {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            client_name: client_name.into(),
            supported_features: Vec::new(),
        }
    }
}

/// Sent by the agent in response to a [`HandshakeRequest`] (0x02).
///
/// Capabilities are present iff the handshake was accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub protocol_version: u32,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<AgentCapabilities>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub accepted: bool,
}

impl HandshakeResponse {
    /// An accepting response carrying the capability snapshot.
    pub fn accept(agent_name: impl Into<String>, capabilities: AgentCapabilities) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            agent_name: agent_name.into(),
            capabilities: Some(capabilities),
            error: String::new(),
            accepted: true,
        }
    }

    /// A rejecting response with the reason in `error`.
    pub fn reject(agent_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            agent_name: agent_name.into(),
            capabilities: None,
            error: error.into(),
            accepted: false,
        }
    }
}

/// Sent by an agent when it dials the proxy on a reverse connection (0x03).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub protocol_version: u32,
    pub agent_id: String,
    pub capabilities: AgentCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RegistrationRequest {
    pub fn new(agent_id: impl Into<String>, capabilities: AgentCapabilities) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            agent_id: agent_id.into(),
            capabilities,
            auth_token: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Sent by the proxy in response to a [`RegistrationRequest`] (0x04).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Proxy-assigned connection ID
    #[serde(skip_serializing_if = "String::is_empty")]
    pub assigned_id: String,
    /// Optional configuration pushed by the proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl RegistrationResponse {
    pub fn accept(assigned_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            assigned_id: assigned_id.into(),
            ..Default::default()
        }
    }

    pub fn reject(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error: error.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_carries_capabilities() {
        let resp = HandshakeResponse::accept("waf", AgentCapabilities::all());
        assert!(resp.accepted);
        assert_eq!(resp.protocol_version, PROTOCOL_VERSION);
        assert!(resp.capabilities.is_some());
        assert!(resp.error.is_empty());
    }

    #[test]
    fn reject_carries_no_capabilities() {
        let resp = HandshakeResponse::reject("waf", "unsupported protocol version");
        assert!(!resp.accepted);
        assert!(resp.capabilities.is_none());

        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["accepted"], false);
        assert_eq!(json["error"], "unsupported protocol version");
        assert!(json.get("capabilities").is_none());
    }

    #[test]
    fn registration_roundtrip() {
        let req = RegistrationRequest::new("auth-agent", AgentCapabilities::new())
            .with_auth_token("secret")
            .with_metadata("zone", serde_json::json!("eu-west"));

        let json = serde_json::to_string(&req).unwrap();
        let parsed: RegistrationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.agent_id, "auth-agent");
        assert_eq!(parsed.auth_token.as_deref(), Some("secret"));
        assert_eq!(parsed.metadata["zone"], "eu-west");
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
    }
}

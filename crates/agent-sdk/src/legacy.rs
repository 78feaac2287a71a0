//! Compatibility shim for the v1 JSON event envelope.
//!
//! v1 proxies send `{version, event_type, payload}` objects keyed by a
//! string correlation id and expect a single response object back. The shim
//! projects the correlation id through the same hash the gRPC bridge uses
//! and feeds the v2 dispatch table, so a v2 agent serves v1 traffic without
//! separate handler code.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::decision::{DecisionMessage, Verdict};
use crate::grpc::hash_correlation_id;
use crate::handler::SessionHandler;
use crate::protocol::{
    Frame, MessageType, RequestBodyChunkEvent, RequestHeadersEvent, RequestMetadata,
    ResponseBodyChunkEvent, ResponseHeadersEvent,
};

/// The protocol version stamped on v1 responses.
pub const LEGACY_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyEnvelope {
    event_type: String,
    payload: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyRequestMetadata {
    correlation_id: String,
    client_ip: String,
    client_port: u16,
    server_name: Option<String>,
    protocol: String,
    tls_version: Option<String>,
    route_id: Option<String>,
    upstream_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyRequestHeaders {
    metadata: LegacyRequestMetadata,
    method: String,
    uri: String,
    headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyBodyChunk {
    correlation_id: String,
    data: String,
    is_last: bool,
    chunk_index: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyResponseHeaders {
    correlation_id: String,
    status: u16,
    headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyRequestComplete {
    correlation_id: String,
    status: u16,
    duration_ms: u64,
}

impl SessionHandler {
    /// Handle a v1 event envelope, returning the v1 response object.
    ///
    /// Unknown event types and malformed payloads are answered with a v1
    /// allow to keep the proxy flowing.
    pub async fn handle_legacy_event(&self, event: &Value) -> Value {
        let envelope: LegacyEnvelope = match serde_json::from_value(event.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "failed to parse legacy event envelope");
                return legacy_allow();
            }
        };

        match envelope.event_type.as_str() {
            "configure" => {
                let config = envelope
                    .payload
                    .get("config")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                match self.agent.on_configure(config).await {
                    Ok(()) => json!({"success": true}),
                    Err(e) => json!({"success": false, "error": e.to_string()}),
                }
            }
            "request_headers" => {
                let payload: LegacyRequestHeaders = match serde_json::from_value(envelope.payload)
                {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to parse legacy request headers");
                        return legacy_allow();
                    }
                };
                let event = RequestHeadersEvent {
                    request_id: hash_correlation_id(&payload.metadata.correlation_id),
                    method: payload.method,
                    uri: payload.uri,
                    headers: payload.headers,
                    has_body: false,
                    metadata: RequestMetadata {
                        correlation_id: payload.metadata.correlation_id,
                        client_ip: payload.metadata.client_ip,
                        client_port: payload.metadata.client_port,
                        server_name: payload.metadata.server_name,
                        protocol: payload.metadata.protocol,
                        tls_version: payload.metadata.tls_version,
                        route_id: payload.metadata.route_id,
                        upstream_id: payload.metadata.upstream_id,
                        traceparent: None,
                    },
                };
                self.legacy_dispatch(Frame::new(MessageType::RequestHeaders, &event))
                    .await
            }
            "request_body_chunk" => {
                let payload: LegacyBodyChunk = match serde_json::from_value(envelope.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to parse legacy body chunk");
                        return legacy_allow();
                    }
                };
                let event = RequestBodyChunkEvent {
                    request_id: hash_correlation_id(&payload.correlation_id),
                    chunk_index: payload.chunk_index,
                    data: payload.data,
                    is_last: payload.is_last,
                };
                self.legacy_dispatch(Frame::new(MessageType::RequestBodyChunk, &event))
                    .await
            }
            "response_headers" => {
                let payload: LegacyResponseHeaders = match serde_json::from_value(envelope.payload)
                {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to parse legacy response headers");
                        return legacy_allow();
                    }
                };
                let event = ResponseHeadersEvent {
                    request_id: hash_correlation_id(&payload.correlation_id),
                    status_code: payload.status,
                    headers: payload.headers,
                    has_body: false,
                };
                self.legacy_dispatch(Frame::new(MessageType::ResponseHeaders, &event))
                    .await
            }
            "response_body_chunk" => {
                let payload: LegacyBodyChunk = match serde_json::from_value(envelope.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "failed to parse legacy body chunk");
                        return legacy_allow();
                    }
                };
                let event = ResponseBodyChunkEvent {
                    request_id: hash_correlation_id(&payload.correlation_id),
                    chunk_index: payload.chunk_index,
                    data: payload.data,
                    is_last: payload.is_last,
                };
                self.legacy_dispatch(Frame::new(MessageType::ResponseBodyChunk, &event))
                    .await
            }
            "request_complete" => {
                let payload: LegacyRequestComplete = match serde_json::from_value(envelope.payload)
                {
                    Ok(payload) => payload,
                    Err(_) => return json!({"success": true}),
                };
                let id = hash_correlation_id(&payload.correlation_id);
                let request = self.registry.request(id).await;
                self.registry.close(id).await;
                if let Some(request) = request {
                    self.agent
                        .on_request_complete(&request, payload.status, payload.duration_ms)
                        .await;
                }
                json!({"success": true})
            }
            other => {
                warn!(event_type = %other, "unknown legacy event type");
                legacy_allow()
            }
        }
    }

    async fn legacy_dispatch(&self, frame: Result<Frame, crate::error::AgentError>) -> Value {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to build frame for legacy event");
                return legacy_allow();
            }
        };

        match self.handle_frame(frame).await {
            Ok(Some(reply)) if reply.is(MessageType::Decision) => {
                match reply.parse::<DecisionMessage>() {
                    Ok(message) => legacy_response(message),
                    Err(e) => {
                        warn!(error = %e, "failed to parse decision for legacy reply");
                        legacy_allow()
                    }
                }
            }
            Ok(_) => legacy_allow(),
            Err(e) => {
                warn!(error = %e, "legacy dispatch failed");
                legacy_allow()
            }
        }
    }
}

fn legacy_response(message: DecisionMessage) -> Value {
    let (decision, needs_more) = match &message.decision {
        Verdict::NeedsMore(_) => (json!("allow"), true),
        other => (
            serde_json::to_value(other).unwrap_or_else(|_| json!("allow")),
            false,
        ),
    };

    let mut response = json!({
        "version": LEGACY_PROTOCOL_VERSION,
        "decision": decision,
        "needs_more": needs_more,
    });

    if !message.request_headers.is_empty() {
        response["request_headers"] =
            serde_json::to_value(&message.request_headers).unwrap_or_default();
    }
    if !message.response_headers.is_empty() {
        response["response_headers"] =
            serde_json::to_value(&message.response_headers).unwrap_or_default();
    }
    if !message.audit.is_empty() {
        response["audit"] = serde_json::to_value(&message.audit).unwrap_or_default();
    }

    response
}

fn legacy_allow() -> Value {
    json!({
        "version": LEGACY_PROTOCOL_VERSION,
        "decision": "allow",
        "needs_more": false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentV2;
    use crate::capabilities::AgentCapabilities;
    use crate::decision::Decision;
    use crate::error::AgentError;
    use crate::metrics::MetricsCollector;
    use crate::protocol::encode_chunk_data;
    use crate::request::Request;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct LegacyAgent {
        completions: AtomicU64,
        configures: AtomicU64,
    }

    #[async_trait]
    impl AgentV2 for LegacyAgent {
        fn name(&self) -> &str {
            "legacy"
        }

        fn capabilities(&self) -> AgentCapabilities {
            AgentCapabilities::new().handle_request_body()
        }

        async fn on_configure(&self, _config: Value) -> Result<(), AgentError> {
            self.configures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_request(&self, request: &Request) -> Result<Decision, AgentError> {
            if request.path_starts_with("/admin") {
                return Ok(Decision::deny());
            }
            Ok(Decision::allow().add_request_header("X-Checked", "true"))
        }

        async fn on_request_body(&self, request: &Request) -> Result<Decision, AgentError> {
            if request.body_string().unwrap_or_default().contains("attack") {
                return Ok(Decision::deny());
            }
            Ok(Decision::allow())
        }

        async fn on_request_complete(
            &self,
            _request: &Request,
            _status: u16,
            _duration_ms: u64,
        ) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler() -> (SessionHandler, Arc<LegacyAgent>) {
        let agent = Arc::new(LegacyAgent::default());
        let handler = SessionHandler::new(
            Arc::clone(&agent) as Arc<dyn AgentV2>,
            Arc::new(MetricsCollector::new()),
        );
        (handler, agent)
    }

    fn headers_event(correlation_id: &str, uri: &str) -> Value {
        json!({
            "version": 1,
            "event_type": "request_headers",
            "payload": {
                "metadata": {"correlation_id": correlation_id, "client_ip": "127.0.0.1"},
                "method": "GET",
                "uri": uri,
                "headers": {},
            }
        })
    }

    #[tokio::test]
    async fn request_headers_produce_a_v1_response() {
        let (handler, _) = handler();

        let response = handler
            .handle_legacy_event(&headers_event("req-1", "/ok"))
            .await;
        assert_eq!(response["version"], 1);
        assert_eq!(response["decision"], "allow");
        assert_eq!(response["needs_more"], false);
        assert_eq!(response["request_headers"][0]["operation"], "set");
        assert_eq!(response["request_headers"][0]["name"], "X-Checked");
    }

    #[tokio::test]
    async fn blocked_path_maps_to_a_block_decision() {
        let (handler, _) = handler();

        let response = handler
            .handle_legacy_event(&headers_event("req-2", "/admin/users"))
            .await;
        assert_eq!(response["decision"]["block"]["status"], 403);
    }

    #[tokio::test]
    async fn chunked_body_flows_through_the_v2_registry() {
        let (handler, _) = handler();
        handler
            .handle_legacy_event(&headers_event("req-3", "/upload"))
            .await;

        let chunk = |data: &[u8], is_last: bool, index: u32| {
            json!({
                "version": 1,
                "event_type": "request_body_chunk",
                "payload": {
                    "correlation_id": "req-3",
                    "data": encode_chunk_data(data),
                    "is_last": is_last,
                    "chunk_index": index,
                }
            })
        };

        let response = handler.handle_legacy_event(&chunk(b"att", false, 0)).await;
        assert_eq!(response["needs_more"], true);

        let response = handler.handle_legacy_event(&chunk(b"ack", true, 1)).await;
        assert_eq!(response["decision"]["block"]["status"], 403);
    }

    #[tokio::test]
    async fn request_complete_invokes_the_hook_and_closes_the_entry() {
        let (handler, agent) = handler();
        handler
            .handle_legacy_event(&headers_event("req-4", "/done"))
            .await;

        let response = handler
            .handle_legacy_event(&json!({
                "version": 1,
                "event_type": "request_complete",
                "payload": {"correlation_id": "req-4", "status": 200, "duration_ms": 12},
            }))
            .await;
        assert_eq!(response["success"], true);
        assert_eq!(agent.completions.load(Ordering::SeqCst), 1);
        assert!(!handler
            .registry
            .contains(hash_correlation_id("req-4"))
            .await);
    }

    #[tokio::test]
    async fn configure_reaches_the_agent() {
        let (handler, agent) = handler();

        let response = handler
            .handle_legacy_event(&json!({
                "version": 1,
                "event_type": "configure",
                "payload": {"config": {"rate_limit": 5}},
            }))
            .await;
        assert_eq!(response["success"], true);
        assert_eq!(agent.configures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_is_allowed() {
        let (handler, _) = handler();

        let response = handler
            .handle_legacy_event(&json!({
                "version": 1,
                "event_type": "websocket_frame",
                "payload": {},
            }))
            .await;
        assert_eq!(response["decision"], "allow");
    }
}

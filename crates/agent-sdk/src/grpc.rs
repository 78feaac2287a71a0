//! JSON-over-gRPC bridge exposing the v2 runtime as `AgentServiceV2`.
//!
//! The service is hand-wired rather than generated: a JSON codec carries raw
//! JSON objects whose fields mirror the proto oneofs, and each inbound
//! message is translated onto the frame-level message model before hitting
//! the session handler. Dispatch semantics are therefore identical to the
//! byte-stream transports.
//!
//! The proxy identifies requests by a string `correlation_id` on this
//! transport. The bridge projects that string to the internal 64-bit
//! `request_id` with [`hash_correlation_id`]; the projection is one-way, so
//! outbound decisions carry the decimal text of the hash as their
//! `correlation_id`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::{empty_body, http, BoxFuture, Service};
use tonic::server::{Grpc, NamedService, StreamingService, UnaryService};
use tonic::{Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::agent::AgentV2;
use crate::decision::{DecisionMessage, HeaderOp, Verdict};
use crate::error::AgentError;
use crate::handler::SessionHandler;
use crate::handshake::{HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION};
use crate::health::{HealthState, HealthStatus};
use crate::metrics::MetricsCollector;
use crate::protocol::{
    CancelRequestMessage, Frame, MessageType, PingMessage, PongMessage, RequestBodyChunkEvent,
    RequestHeadersEvent, RequestMetadata, ResponseBodyChunkEvent, ResponseHeadersEvent,
};

/// Project a proxy correlation id onto the 64-bit request-id space.
///
/// DJB2 in 64-bit wrap-around arithmetic:
/// `h = 5381; for each byte b: h = ((h << 5) + h) + b`.
///
/// The projection is deterministic but irreversible; decisions emitted on
/// this transport carry the decimal text of the hash, and the proxy
/// reconciles it against its own mapping.
pub fn hash_correlation_id(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for &byte in s.as_bytes() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(u64::from(byte));
    }
    hash
}

// ============================================================================
// JSON codec
// ============================================================================

/// Raw JSON container used as the gRPC message type on both directions.
#[derive(Debug, Clone)]
pub struct JsonMessage(pub Value);

/// gRPC codec that moves raw JSON instead of protobuf.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

#[derive(Debug)]
pub struct JsonEncoder;

#[derive(Debug)]
pub struct JsonDecoder;

impl Encoder for JsonEncoder {
    type Item = JsonMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        let bytes =
            serde_json::to_vec(&item.0).map_err(|e| Status::internal(e.to_string()))?;
        dst.put_slice(&bytes);
        Ok(())
    }
}

impl Decoder for JsonDecoder {
    type Item = JsonMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = src.copy_to_bytes(src.remaining());
        if bytes.is_empty() {
            return Ok(Some(JsonMessage(json!({}))));
        }
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| Status::invalid_argument(format!("invalid JSON message: {e}")))?;
        Ok(Some(JsonMessage(value)))
    }
}

impl Codec for JsonCodec {
    type Encode = JsonMessage;
    type Decode = JsonMessage;
    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder
    }
}

// ============================================================================
// Message translation
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProxyMessage {
    handshake: Option<GrpcHandshakeRequest>,
    request_headers: Option<GrpcRequestHeadersEvent>,
    request_body_chunk: Option<GrpcBodyChunkEvent>,
    response_headers: Option<GrpcResponseHeadersEvent>,
    response_body_chunk: Option<GrpcBodyChunkEvent>,
    cancel: Option<GrpcCancelRequest>,
    configure: Option<Value>,
    ping: Option<GrpcPing>,
    request_complete: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcHandshakeRequest {
    supported_versions: Vec<u32>,
    proxy_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcRequestMetadata {
    correlation_id: String,
    client_ip: String,
    client_port: u32,
    server_name: Option<String>,
    protocol: String,
    tls_version: Option<String>,
    route_id: Option<String>,
    upstream_id: Option<String>,
    traceparent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcHeader {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcRequestHeadersEvent {
    metadata: Option<GrpcRequestMetadata>,
    method: String,
    uri: String,
    headers: Vec<GrpcHeader>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcResponseHeadersEvent {
    correlation_id: String,
    status_code: u32,
    headers: Vec<GrpcHeader>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcBodyChunkEvent {
    correlation_id: String,
    chunk_index: u32,
    /// Base64-encoded bytes, as proto bytes are carried in JSON
    data: String,
    is_last: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcCancelRequest {
    correlation_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcPing {
    timestamp_ms: u64,
}

fn flatten_headers(headers: Vec<GrpcHeader>) -> std::collections::HashMap<String, Vec<String>> {
    let mut map: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for header in headers {
        map.entry(header.name).or_default().push(header.value);
    }
    map
}

/// Translate a ProxyToAgent JSON message into a protocol frame.
///
/// Returns `Ok(None)` for messages handled outside the dispatch table
/// (configure) or with no frame equivalent (request_complete).
pub(crate) fn proxy_message_to_frame(value: &Value) -> Result<Option<Frame>, AgentError> {
    let msg: ProxyMessage =
        serde_json::from_value(value.clone()).map_err(|e| AgentError::Decode(e.to_string()))?;

    if let Some(hs) = msg.handshake {
        let version = if hs.supported_versions.is_empty()
            || hs.supported_versions.contains(&PROTOCOL_VERSION)
        {
            PROTOCOL_VERSION
        } else {
            hs.supported_versions[0]
        };
        let request = HandshakeRequest {
            protocol_version: version,
            client_name: hs.proxy_id,
            supported_features: Vec::new(),
        };
        return Frame::new(MessageType::HandshakeRequest, &request).map(Some);
    }

    if let Some(event) = msg.request_headers {
        let metadata = event.metadata.unwrap_or_default();
        let request_id = hash_correlation_id(&metadata.correlation_id);
        let headers = RequestHeadersEvent {
            request_id,
            method: event.method,
            uri: event.uri,
            headers: flatten_headers(event.headers),
            has_body: false,
            metadata: RequestMetadata {
                correlation_id: metadata.correlation_id,
                client_ip: metadata.client_ip,
                client_port: metadata.client_port as u16,
                server_name: metadata.server_name,
                protocol: metadata.protocol,
                tls_version: metadata.tls_version,
                route_id: metadata.route_id,
                upstream_id: metadata.upstream_id,
                traceparent: metadata.traceparent,
            },
        };
        return Frame::new(MessageType::RequestHeaders, &headers).map(Some);
    }

    if let Some(chunk) = msg.request_body_chunk {
        let event = RequestBodyChunkEvent {
            request_id: hash_correlation_id(&chunk.correlation_id),
            chunk_index: chunk.chunk_index,
            data: chunk.data,
            is_last: chunk.is_last,
        };
        return Frame::new(MessageType::RequestBodyChunk, &event).map(Some);
    }

    if let Some(event) = msg.response_headers {
        let headers = ResponseHeadersEvent {
            request_id: hash_correlation_id(&event.correlation_id),
            status_code: event.status_code as u16,
            headers: flatten_headers(event.headers),
            has_body: false,
        };
        return Frame::new(MessageType::ResponseHeaders, &headers).map(Some);
    }

    if let Some(chunk) = msg.response_body_chunk {
        let event = ResponseBodyChunkEvent {
            request_id: hash_correlation_id(&chunk.correlation_id),
            chunk_index: chunk.chunk_index,
            data: chunk.data,
            is_last: chunk.is_last,
        };
        return Frame::new(MessageType::ResponseBodyChunk, &event).map(Some);
    }

    if let Some(cancel) = msg.cancel {
        let message = CancelRequestMessage {
            request_id: hash_correlation_id(&cancel.correlation_id),
            reason: None,
        };
        return Frame::new(MessageType::CancelRequest, &message).map(Some);
    }

    if let Some(ping) = msg.ping {
        let message = PingMessage {
            timestamp: ping.timestamp_ms as i64,
        };
        return Frame::new(MessageType::Ping, &message).map(Some);
    }

    // Configure is handled out of band; request_complete has no frame
    // equivalent on this transport.
    if msg.configure.is_some() || msg.request_complete.is_some() {
        return Ok(None);
    }

    Err(AgentError::Decode(
        "empty ProxyToAgent message: no oneof field set".to_string(),
    ))
}

/// Translate an outbound frame into an AgentToProxy JSON message.
pub(crate) fn frame_to_agent_message(frame: &Frame) -> Result<Value, AgentError> {
    match frame.msg_type() {
        Some(MessageType::HandshakeResponse) => {
            let response: HandshakeResponse = frame.parse()?;
            Ok(json!({ "handshake": handshake_response_to_grpc(&response) }))
        }
        Some(MessageType::Decision) => {
            let decision: DecisionMessage = frame.parse()?;
            Ok(json!({ "response": decision_to_grpc(&decision) }))
        }
        Some(MessageType::Pong) => {
            let pong: PongMessage = frame.parse()?;
            Ok(json!({
                "pong": {
                    "ping_timestamp_ms": pong.timestamp,
                    "timestamp_ms": now_ms(),
                }
            }))
        }
        Some(MessageType::HealthResponse) => {
            let health: HealthStatus = frame.parse()?;
            Ok(json!({ "health": health_to_grpc(&health) }))
        }
        Some(MessageType::MetricsResponse) => {
            let report: Value = frame.parse()?;
            Ok(json!({ "metrics": report }))
        }
        _ => Err(AgentError::Serialization(format!(
            "unsupported response message type: 0x{:02X}",
            frame.tag
        ))),
    }
}

fn handshake_response_to_grpc(response: &HandshakeResponse) -> Value {
    let mut grpc = json!({
        "protocol_version": response.protocol_version,
        "success": response.accepted,
    });

    if !response.error.is_empty() {
        grpc["error"] = json!(response.error);
    }

    if let Some(caps) = &response.capabilities {
        let mut events = Vec::new();
        if caps.handles_request_headers {
            events.push(1);
        }
        if caps.handles_request_body {
            events.push(2);
        }
        if caps.handles_response_headers {
            events.push(3);
        }
        if caps.handles_response_body {
            events.push(4);
        }

        grpc["capabilities"] = json!({
            "protocol_version": PROTOCOL_VERSION,
            "agent_id": response.agent_name,
            "name": response.agent_name,
            "version": env!("CARGO_PKG_VERSION"),
            "supported_events": events,
            "features": {
                "streaming_body": caps.supports_streaming,
                "cancellation": caps.supports_cancellation,
                "concurrent_requests": caps.max_concurrent_requests.unwrap_or(0),
                "health_reporting": true,
                "metrics_export": true,
            },
        });
    }

    grpc
}

fn decision_to_grpc(decision: &DecisionMessage) -> Value {
    // The request id is the hash of the proxy's correlation id; its decimal
    // text is the only correlation identity available on the way back.
    let correlation_id = decision.request_id.to_string();

    let (verdict, needs_more) = match &decision.decision {
        Verdict::NeedsMore(_) => (json!("allow"), true),
        other => (
            serde_json::to_value(other).unwrap_or_else(|_| json!("allow")),
            false,
        ),
    };

    let mut grpc = json!({
        "correlation_id": correlation_id,
        "decision": verdict,
        "needs_more": needs_more,
    });

    if !decision.request_headers.is_empty() {
        grpc["request_headers"] = Value::Array(
            decision.request_headers.iter().map(header_op_to_grpc).collect(),
        );
    }
    if !decision.response_headers.is_empty() {
        grpc["response_headers"] = Value::Array(
            decision.response_headers.iter().map(header_op_to_grpc).collect(),
        );
    }
    if !decision.audit.is_empty() {
        grpc["audit"] = serde_json::to_value(&decision.audit).unwrap_or_default();
    }

    grpc
}

fn header_op_to_grpc(op: &HeaderOp) -> Value {
    match op {
        HeaderOp::Set { name, value } => json!({"set": {"name": name, "value": value}}),
        HeaderOp::Add { name, value } => json!({"add": {"name": name, "value": value}}),
        HeaderOp::Remove { name } => json!({"remove": name}),
    }
}

fn health_to_grpc(health: &HealthStatus) -> Value {
    let state = match health.state {
        HealthState::Healthy => 1,
        HealthState::Degraded => 2,
        HealthState::Unhealthy => 4,
    };
    json!({
        "state": state,
        "message": health.message,
        "timestamp_ms": health.timestamp.timestamp_millis(),
    })
}

fn extract_configure(value: &Value) -> Option<Value> {
    let configure = value.get("configure")?;
    let config_json = configure
        .get("config_json")
        .and_then(Value::as_str)
        .unwrap_or("");
    if config_json.is_empty() {
        return Some(json!({}));
    }
    match serde_json::from_str(config_json) {
        Ok(config) => Some(config),
        Err(e) => {
            error!(error = %e, "failed to parse configure event config");
            Some(json!({}))
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Service
// ============================================================================

type MessageStream = Pin<Box<dyn Stream<Item = Result<JsonMessage, Status>> + Send + 'static>>;

/// The `AgentServiceV2` gRPC service.
///
/// Three methods: `ProcessStream` (bidi) for the request path,
/// `ControlStream` (bidi) for health/metrics/config pushes, and
/// `ProcessEvent` (unary) for one-shot events.
#[derive(Clone)]
pub struct AgentServiceV2 {
    inner: Arc<BridgeState>,
}

struct BridgeState {
    agent: Arc<dyn AgentV2>,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
    draining: Arc<AtomicBool>,
    stream_seq: AtomicU64,
}

impl AgentServiceV2 {
    pub fn new(
        agent: Arc<dyn AgentV2>,
        metrics: Arc<MetricsCollector>,
        shutdown: CancellationToken,
        draining: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeState {
                agent,
                metrics,
                shutdown,
                draining,
                stream_seq: AtomicU64::new(0),
            }),
        }
    }

    async fn process_stream(
        &self,
        request: tonic::Request<Streaming<JsonMessage>>,
    ) -> Result<tonic::Response<MessageStream>, Status> {
        if self.inner.draining.load(Ordering::Relaxed) {
            return Err(Status::unavailable("agent draining"));
        }

        let state = Arc::clone(&self.inner);
        let mut inbound = request.into_inner();
        // The underlying stream is not safe for concurrent sends; every
        // outbound message funnels through this channel and the single
        // stream task below is its only producer.
        let (tx, rx) = mpsc::channel::<Result<JsonMessage, Status>>(64);

        tokio::spawn(async move {
            let stream_id = format!(
                "grpc-stream-{}",
                state.stream_seq.fetch_add(1, Ordering::Relaxed) + 1
            );
            debug!(stream_id = %stream_id, "gRPC ProcessStream started");

            let handler =
                SessionHandler::new(Arc::clone(&state.agent), Arc::clone(&state.metrics));
            let mut handshaken = false;

            loop {
                if state.draining.load(Ordering::Relaxed) {
                    let _ = tx.send(Err(Status::unavailable("agent draining"))).await;
                    break;
                }

                let received = tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    received = inbound.message() => received,
                };
                let msg = match received {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(stream_id = %stream_id, error = %e, "stream receive failed");
                        break;
                    }
                };

                // Configure events bypass the dispatch table.
                if let Some(config) = extract_configure(&msg.0) {
                    if let Err(e) = state.agent.on_configure(config).await {
                        error!(stream_id = %stream_id, error = %e, "agent configuration failed");
                    } else {
                        debug!(stream_id = %stream_id, "agent configuration applied");
                    }
                    continue;
                }

                let frame = match proxy_message_to_frame(&msg.0) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(stream_id = %stream_id, error = %e, "failed to convert message");
                        continue;
                    }
                };

                if !handshaken && !frame.is(MessageType::HandshakeRequest) {
                    warn!(stream_id = %stream_id, "frame before handshake, closing stream");
                    let _ = tx
                        .send(Err(Status::failed_precondition("handshake required")))
                        .await;
                    break;
                }

                let mut close_after_send = false;
                let reply = if frame.is(MessageType::HandshakeRequest) {
                    match handler.handshake(&frame).await {
                        Ok((reply, accepted)) => {
                            handshaken = accepted;
                            close_after_send = !accepted;
                            Some(reply)
                        }
                        Err(e) => {
                            error!(stream_id = %stream_id, error = %e, "handshake failed");
                            break;
                        }
                    }
                } else {
                    match handler.handle_frame(frame).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            error!(stream_id = %stream_id, error = %e, "failed to handle message");
                            continue;
                        }
                    }
                };

                if let Some(reply) = reply {
                    match frame_to_agent_message(&reply) {
                        Ok(value) => {
                            if tx.send(Ok(JsonMessage(value))).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(stream_id = %stream_id, error = %e, "failed to convert response");
                        }
                    }
                }

                if close_after_send {
                    break;
                }
            }

            handler.abort_session().await;
            state.agent.on_stream_closed(&stream_id).await;
            debug!(stream_id = %stream_id, "gRPC ProcessStream ended");
        });

        Ok(tonic::Response::new(
            Box::pin(ReceiverStream::new(rx)) as MessageStream
        ))
    }

    async fn control_stream(
        &self,
        request: tonic::Request<Streaming<JsonMessage>>,
    ) -> Result<tonic::Response<MessageStream>, Status> {
        let state = Arc::clone(&self.inner);
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<JsonMessage, Status>>(16);

        tokio::spawn(async move {
            let stream_id = format!(
                "grpc-control-{}",
                state.stream_seq.fetch_add(1, Ordering::Relaxed) + 1
            );
            debug!(stream_id = %stream_id, "gRPC ControlStream started");

            loop {
                let received = tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    received = inbound.message() => received,
                };
                let msg = match received {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(stream_id = %stream_id, error = %e, "control receive failed");
                        break;
                    }
                };

                if let Some(config) = extract_configure(&msg.0) {
                    if let Err(e) = state.agent.on_configure(config).await {
                        error!(stream_id = %stream_id, error = %e, "agent configuration failed");
                    }
                    continue;
                }

                // A health probe is answered with a real health snapshot.
                if msg.0.get("health").is_some() {
                    let health = state.agent.health_check().await;
                    let reply = json!({ "health": health_to_grpc(&health) });
                    if tx.send(Ok(JsonMessage(reply))).await.is_err() {
                        break;
                    }
                    continue;
                }

                if msg.0.get("metrics").is_some() {
                    debug!(stream_id = %stream_id, "received metrics probe via control stream");
                    let report = match state.agent.metrics().await {
                        Some(report) => report,
                        None => state.metrics.report(),
                    };
                    let reply = json!({
                        "metrics": serde_json::to_value(&report).unwrap_or_default()
                    });
                    if tx.send(Ok(JsonMessage(reply))).await.is_err() {
                        break;
                    }
                }
            }

            debug!(stream_id = %stream_id, "gRPC ControlStream ended");
        });

        Ok(tonic::Response::new(
            Box::pin(ReceiverStream::new(rx)) as MessageStream
        ))
    }

    async fn process_event(
        &self,
        request: tonic::Request<JsonMessage>,
    ) -> Result<tonic::Response<JsonMessage>, Status> {
        let msg = request.into_inner();

        if let Some(config) = extract_configure(&msg.0) {
            if let Err(e) = self.inner.agent.on_configure(config).await {
                error!(error = %e, "agent configuration failed");
            } else {
                info!("agent configuration applied");
            }
            return Ok(tonic::Response::new(JsonMessage(json!({}))));
        }

        let frame = proxy_message_to_frame(&msg.0)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let Some(frame) = frame else {
            return Ok(tonic::Response::new(JsonMessage(json!({}))));
        };

        // One-shot events get a session of their own.
        let handler = SessionHandler::new(
            Arc::clone(&self.inner.agent),
            Arc::clone(&self.inner.metrics),
        );
        let reply = handler
            .handle_frame(frame)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        match reply {
            Some(frame) => {
                let value = frame_to_agent_message(&frame)
                    .map_err(|e| Status::internal(e.to_string()))?;
                Ok(tonic::Response::new(JsonMessage(value)))
            }
            None => Ok(tonic::Response::new(JsonMessage(json!({})))),
        }
    }
}

impl Service<http::Request<tonic::body::BoxBody>> for AgentServiceV2 {
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<tonic::body::BoxBody>) -> Self::Future {
        let svc = self.clone();
        match req.uri().path() {
            "/zentinel.agent.v2.AgentServiceV2/ProcessStream" => Box::pin(async move {
                struct ProcessStreamSvc(AgentServiceV2);

                impl StreamingService<JsonMessage> for ProcessStreamSvc {
                    type Response = JsonMessage;
                    type ResponseStream = MessageStream;
                    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

                    fn call(
                        &mut self,
                        request: tonic::Request<Streaming<JsonMessage>>,
                    ) -> Self::Future {
                        let svc = self.0.clone();
                        Box::pin(async move { svc.process_stream(request).await })
                    }
                }

                let mut grpc = Grpc::new(JsonCodec::default());
                Ok(grpc.streaming(ProcessStreamSvc(svc), req).await)
            }),
            "/zentinel.agent.v2.AgentServiceV2/ControlStream" => Box::pin(async move {
                struct ControlStreamSvc(AgentServiceV2);

                impl StreamingService<JsonMessage> for ControlStreamSvc {
                    type Response = JsonMessage;
                    type ResponseStream = MessageStream;
                    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

                    fn call(
                        &mut self,
                        request: tonic::Request<Streaming<JsonMessage>>,
                    ) -> Self::Future {
                        let svc = self.0.clone();
                        Box::pin(async move { svc.control_stream(request).await })
                    }
                }

                let mut grpc = Grpc::new(JsonCodec::default());
                Ok(grpc.streaming(ControlStreamSvc(svc), req).await)
            }),
            "/zentinel.agent.v2.AgentServiceV2/ProcessEvent" => Box::pin(async move {
                struct ProcessEventSvc(AgentServiceV2);

                impl UnaryService<JsonMessage> for ProcessEventSvc {
                    type Response = JsonMessage;
                    type Future = BoxFuture<tonic::Response<JsonMessage>, Status>;

                    fn call(&mut self, request: tonic::Request<JsonMessage>) -> Self::Future {
                        let svc = self.0.clone();
                        Box::pin(async move { svc.process_event(request).await })
                    }
                }

                let mut grpc = Grpc::new(JsonCodec::default());
                Ok(grpc.unary(ProcessEventSvc(svc), req).await)
            }),
            _ => Box::pin(async move {
                Ok(http::Response::builder()
                    .status(200)
                    .header("grpc-status", tonic::Code::Unimplemented as i32)
                    .header("content-type", "application/grpc")
                    .body(empty_body())
                    .unwrap())
            }),
        }
    }
}

impl NamedService for AgentServiceV2 {
    const NAME: &'static str = "zentinel.agent.v2.AgentServiceV2";
}

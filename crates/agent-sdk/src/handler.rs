//! Per-session message dispatch.
//!
//! One handler is created per proxy connection. It owns the request registry
//! for that session and routes frames to the agent's callbacks, producing at
//! most one reply frame per inbound frame. Cancellation messages never get a
//! reply. Decode failures and unknown request ids are answered with a
//! defensive allow to keep the proxy flowing.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentV2;
use crate::capabilities::AgentCapabilities;
use crate::decision::{Decision, DecisionMessage};
use crate::error::AgentError;
use crate::handshake::{HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION};
use crate::metrics::MetricsCollector;
use crate::protocol::{
    CancelRequestMessage, Frame, MessageType, PingMessage, PongMessage, RequestBodyChunkEvent,
    RequestHeadersEvent, ResponseBodyChunkEvent, ResponseHeadersEvent,
};
use crate::registry::{RequestRegistry, ResponseHead};
use crate::request::{Request, Response};

/// Dispatches one session's frames to the agent.
pub struct SessionHandler {
    pub(crate) agent: Arc<dyn AgentV2>,
    pub(crate) registry: RequestRegistry,
    metrics: Arc<MetricsCollector>,
    /// Capability snapshot taken at session start
    capabilities: AgentCapabilities,
}

impl SessionHandler {
    pub fn new(agent: Arc<dyn AgentV2>, metrics: Arc<MetricsCollector>) -> Self {
        let capabilities = agent.capabilities();
        Self {
            agent,
            registry: RequestRegistry::new(),
            metrics,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &AgentCapabilities {
        &self.capabilities
    }

    /// Answer the handshake frame that must open every session.
    ///
    /// Returns the response frame and whether the handshake was accepted; a
    /// rejected handshake is flushed by the caller and the session closed.
    pub async fn handshake(&self, frame: &Frame) -> Result<(Frame, bool), AgentError> {
        let response = match frame.parse::<HandshakeRequest>() {
            Err(e) => {
                error!(error = %e, "failed to parse handshake request");
                HandshakeResponse::reject(self.agent.name(), "failed to parse handshake")
            }
            Ok(req) if req.protocol_version != PROTOCOL_VERSION => {
                warn!(
                    client = %req.client_name,
                    version = req.protocol_version,
                    "rejecting handshake: unsupported protocol version"
                );
                HandshakeResponse::reject(self.agent.name(), "unsupported protocol version")
            }
            Ok(req) => {
                info!(
                    client = %req.client_name,
                    version = req.protocol_version,
                    "handshake accepted"
                );
                HandshakeResponse::accept(self.agent.name(), self.capabilities.clone())
            }
        };

        let accepted = response.accepted;
        let frame = Frame::new(MessageType::HandshakeResponse, &response)?;
        Ok((frame, accepted))
    }

    /// Dispatch one frame, producing at most one reply frame.
    pub async fn handle_frame(&self, frame: Frame) -> Result<Option<Frame>, AgentError> {
        match frame.msg_type() {
            Some(MessageType::HandshakeRequest) => {
                let (reply, _) = self.handshake(&frame).await?;
                Ok(Some(reply))
            }
            Some(MessageType::RequestHeaders) => self.on_request_headers(&frame).await,
            Some(MessageType::RequestBodyChunk) => self.on_request_body_chunk(&frame).await,
            Some(MessageType::ResponseHeaders) => self.on_response_headers(&frame).await,
            Some(MessageType::ResponseBodyChunk) => self.on_response_body_chunk(&frame).await,
            Some(MessageType::CancelRequest) => self.on_cancel_request(&frame).await,
            Some(MessageType::CancelAll) => self.on_cancel_all().await,
            Some(MessageType::Ping) => self.on_ping(&frame),
            Some(MessageType::HealthRequest) => {
                let health = self.agent.health_check().await;
                Ok(Some(Frame::new(MessageType::HealthResponse, &health)?))
            }
            Some(MessageType::MetricsRequest) => {
                let report = match self.agent.metrics().await {
                    Some(report) => report,
                    None => self.metrics.report(),
                };
                Ok(Some(Frame::new(MessageType::MetricsResponse, &report)?))
            }
            Some(other) => {
                warn!(msg_type = ?other, "unexpected message type from proxy");
                self.allow_reply(0)
            }
            None => {
                warn!(tag = frame.tag, "unknown message type");
                self.allow_reply(0)
            }
        }
    }

    /// Tear down the session: fire every cancellation token and clear the
    /// registry. Used on stream loss and shutdown.
    pub async fn abort_session(&self) {
        let ids = self.registry.cancel_all().await;
        if !ids.is_empty() {
            debug!(count = ids.len(), "cancelled in-flight requests on session teardown");
        }
    }

    async fn on_request_headers(&self, frame: &Frame) -> Result<Option<Frame>, AgentError> {
        let event: RequestHeadersEvent = match frame.parse() {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "failed to parse request headers");
                return self.allow_reply(0);
            }
        };

        let id = event.request_id;
        let start = Instant::now();
        self.metrics.increment_active();

        let request = Arc::new(Request::from_event(event, CancellationToken::new()));
        let cancel = self.registry.open(id, Arc::clone(&request)).await;

        let (decision, errored) = if self.capabilities.handles_request_headers {
            self.invoke(self.agent.on_request(&request), id).await
        } else {
            (Decision::allow(), false)
        };

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        if errored {
            self.metrics.record_error();
        } else {
            self.metrics.record_request(decision.is_allow(), elapsed_ms);
        }
        self.metrics.decrement_active();

        if cancel.is_cancelled() {
            self.registry.close(id).await;
            return Ok(None);
        }

        self.decision_reply(id, decision).await
    }

    async fn on_request_body_chunk(&self, frame: &Frame) -> Result<Option<Frame>, AgentError> {
        let chunk: RequestBodyChunkEvent = match frame.parse() {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(error = %e, "failed to parse request body chunk");
                return self.allow_reply(0);
            }
        };

        let id = chunk.request_id;
        let data = match chunk.decoded_data() {
            Ok(data) => data,
            Err(e) => {
                error!(request_id = id, error = %e, "failed to decode chunk data");
                return self.allow_reply(id);
            }
        };

        self.registry.append_request_chunk(id, &data).await;

        if !chunk.is_last {
            return self.needs_more_reply(id);
        }

        let (request, body) = match self.registry.take_request_body(id).await {
            Some(taken) => taken,
            None => return self.allow_reply(id),
        };

        match request {
            Some(request) if self.capabilities.handles_request_body => {
                let with_body = request.with_body(body);
                let (decision, errored) =
                    self.invoke(self.agent.on_request_body(&with_body), id).await;
                if errored {
                    self.metrics.record_error();
                }
                if request.is_cancelled() {
                    self.registry.close(id).await;
                    return Ok(None);
                }
                self.decision_reply(id, decision).await
            }
            Some(_) => self.allow_reply(id),
            None => {
                // Final chunk for a request whose headers were never seen.
                warn!(request_id = id, "body completed for unknown request");
                self.registry.close(id).await;
                self.allow_reply(id)
            }
        }
    }

    async fn on_response_headers(&self, frame: &Frame) -> Result<Option<Frame>, AgentError> {
        let event: ResponseHeadersEvent = match frame.parse() {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "failed to parse response headers");
                return self.allow_reply(0);
            }
        };

        let id = event.request_id;
        let request = match self.registry.request(id).await {
            Some(request) => request,
            None => {
                warn!(request_id = id, "response headers for unknown request");
                return self.allow_reply(id);
            }
        };

        let head = ResponseHead {
            status: event.status_code,
            headers: event.headers,
        };
        let response = Response::new(head.status, head.headers.clone());
        self.registry.cache_response_head(id, head).await;

        let (decision, errored) = if self.capabilities.handles_response_headers {
            self.invoke(self.agent.on_response(&request, &response), id)
                .await
        } else {
            (Decision::allow(), false)
        };
        if errored {
            self.metrics.record_error();
        }

        if request.is_cancelled() {
            self.registry.close(id).await;
            return Ok(None);
        }

        self.decision_reply(id, decision).await
    }

    async fn on_response_body_chunk(&self, frame: &Frame) -> Result<Option<Frame>, AgentError> {
        let chunk: ResponseBodyChunkEvent = match frame.parse() {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(error = %e, "failed to parse response body chunk");
                return self.allow_reply(0);
            }
        };

        let id = chunk.request_id;
        let data = match chunk.decoded_data() {
            Ok(data) => data,
            Err(e) => {
                error!(request_id = id, error = %e, "failed to decode chunk data");
                return self.allow_reply(id);
            }
        };

        if !self.registry.append_response_chunk(id, &data).await {
            return self.allow_reply(id);
        }

        if !chunk.is_last {
            return self.needs_more_reply(id);
        }

        let (request, head, body) = match self.registry.take_response_body(id).await {
            Some(taken) => taken,
            None => return self.allow_reply(id),
        };

        match (request, head) {
            (Some(request), Some(head)) if self.capabilities.handles_response_body => {
                let response = Response::new(head.status, head.headers).with_body(body);
                let (decision, errored) = self
                    .invoke(self.agent.on_response_body(&request, &response), id)
                    .await;
                if errored {
                    self.metrics.record_error();
                }
                if request.is_cancelled() {
                    self.registry.close(id).await;
                    return Ok(None);
                }
                self.decision_reply(id, decision).await
            }
            _ => self.allow_reply(id),
        }
    }

    async fn on_cancel_request(&self, frame: &Frame) -> Result<Option<Frame>, AgentError> {
        let cancel: CancelRequestMessage = match frame.parse() {
            Ok(cancel) => cancel,
            Err(e) => {
                error!(error = %e, "failed to parse cancel request");
                return Ok(None);
            }
        };

        debug!(request_id = cancel.request_id, reason = ?cancel.reason, "cancelling request");
        self.registry.cancel(cancel.request_id).await;
        self.agent.on_cancel(cancel.request_id).await;

        Ok(None)
    }

    async fn on_cancel_all(&self) -> Result<Option<Frame>, AgentError> {
        let ids = self.registry.cancel_all().await;
        debug!(count = ids.len(), "cancelling all requests");
        for id in ids {
            self.agent.on_cancel(id).await;
        }

        Ok(None)
    }

    fn on_ping(&self, frame: &Frame) -> Result<Option<Frame>, AgentError> {
        let ping: PingMessage = frame.parse().unwrap_or_default();
        let pong = PongMessage {
            timestamp: ping.timestamp,
        };
        Ok(Some(Frame::new(MessageType::Pong, &pong)?))
    }

    /// Run a policy callback, mapping an error to a defensive allow.
    /// The second element reports whether the callback failed.
    async fn invoke<F>(&self, fut: F, id: u64) -> (Decision, bool)
    where
        F: std::future::Future<Output = Result<Decision, AgentError>>,
    {
        match fut.await {
            Ok(decision) => (decision, false),
            Err(e) => {
                warn!(request_id = id, error = %e, "policy callback failed, allowing");
                (Decision::allow(), true)
            }
        }
    }

    async fn decision_reply(
        &self,
        id: u64,
        decision: Decision,
    ) -> Result<Option<Frame>, AgentError> {
        let message = decision.into_message(id);
        if message.decision.is_blocking() {
            self.registry.close(id).await;
        }
        Ok(Some(Frame::new(MessageType::Decision, &message)?))
    }

    fn allow_reply(&self, id: u64) -> Result<Option<Frame>, AgentError> {
        Ok(Some(Frame::new(
            MessageType::Decision,
            &DecisionMessage::allow(id),
        )?))
    }

    fn needs_more_reply(&self, id: u64) -> Result<Option<Frame>, AgentError> {
        Ok(Some(Frame::new(
            MessageType::Decision,
            &DecisionMessage::needs_more(id),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Verdict;
    use crate::protocol::encode_chunk_data;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingAgent {
        caps: Option<AgentCapabilities>,
        on_request_calls: AtomicU64,
        on_request_body_calls: AtomicU64,
        cancelled: AtomicU64,
        block_on_body: Option<&'static str>,
    }

    #[async_trait]
    impl AgentV2 for CountingAgent {
        fn name(&self) -> &str {
            "counting"
        }

        fn capabilities(&self) -> AgentCapabilities {
            self.caps.clone().unwrap_or_default()
        }

        async fn on_request(&self, _request: &Request) -> Result<Decision, AgentError> {
            self.on_request_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Decision::allow())
        }

        async fn on_request_body(&self, request: &Request) -> Result<Decision, AgentError> {
            self.on_request_body_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(needle) = self.block_on_body {
                if request.body_string().unwrap_or_default().contains(needle) {
                    return Ok(Decision::deny());
                }
            }
            Ok(Decision::allow())
        }

        async fn on_cancel(&self, _request_id: u64) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler_with(agent: CountingAgent) -> (SessionHandler, Arc<CountingAgent>) {
        let agent = Arc::new(agent);
        let handler = SessionHandler::new(
            Arc::clone(&agent) as Arc<dyn AgentV2>,
            Arc::new(MetricsCollector::new()),
        );
        (handler, agent)
    }

    fn headers_frame(id: u64) -> Frame {
        Frame::new(
            MessageType::RequestHeaders,
            &RequestHeadersEvent {
                request_id: id,
                method: "GET".to_string(),
                uri: "/".to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn chunk_frame(id: u64, index: u32, data: &[u8], is_last: bool) -> Frame {
        Frame::new(
            MessageType::RequestBodyChunk,
            &RequestBodyChunkEvent {
                request_id: id,
                chunk_index: index,
                data: encode_chunk_data(data),
                is_last,
            },
        )
        .unwrap()
    }

    fn decision_of(frame: &Frame) -> DecisionMessage {
        assert_eq!(frame.msg_type(), Some(MessageType::Decision));
        frame.parse().unwrap()
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (handler, _) = handler_with(CountingAgent::default());
        let frame = Frame::new(
            MessageType::HandshakeRequest,
            &HandshakeRequest {
                protocol_version: 1,
                client_name: "proxy".to_string(),
                supported_features: Vec::new(),
            },
        )
        .unwrap();

        let (reply, accepted) = handler.handshake(&frame).await.unwrap();
        assert!(!accepted);
        let response: HandshakeResponse = reply.parse().unwrap();
        assert!(!response.accepted);
        assert_eq!(response.error, "unsupported protocol version");
        assert!(response.capabilities.is_none());
    }

    #[tokio::test]
    async fn handshake_carries_capability_snapshot() {
        let (handler, _) = handler_with(CountingAgent {
            caps: Some(AgentCapabilities::new().handle_request_body()),
            ..Default::default()
        });
        let frame =
            Frame::new(MessageType::HandshakeRequest, &HandshakeRequest::new("proxy")).unwrap();

        let (reply, accepted) = handler.handshake(&frame).await.unwrap();
        assert!(accepted);
        let response: HandshakeResponse = reply.parse().unwrap();
        assert!(response.accepted);
        assert!(response.capabilities.unwrap().handles_request_body);
    }

    #[tokio::test]
    async fn request_headers_produce_one_allow_decision() {
        let (handler, agent) = handler_with(CountingAgent::default());

        let reply = handler.handle_frame(headers_frame(1)).await.unwrap().unwrap();
        let decision = decision_of(&reply);
        assert_eq!(decision.request_id, 1);
        assert_eq!(decision.decision, Verdict::Allow);
        assert_eq!(agent.on_request_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unadvertised_event_synthesises_allow_without_callback() {
        let caps = AgentCapabilities {
            handles_request_headers: false,
            ..AgentCapabilities::new()
        };
        let (handler, agent) = handler_with(CountingAgent {
            caps: Some(caps),
            ..Default::default()
        });

        let reply = handler.handle_frame(headers_frame(1)).await.unwrap().unwrap();
        assert_eq!(decision_of(&reply).decision, Verdict::Allow);
        assert_eq!(agent.on_request_calls.load(Ordering::SeqCst), 0);
        // The entry is still cached for response correlation.
        assert!(handler.registry.contains(1).await);
    }

    #[tokio::test]
    async fn chunked_body_yields_needs_more_then_one_terminal_decision() {
        let (handler, agent) = handler_with(CountingAgent {
            caps: Some(AgentCapabilities::new().handle_request_body()),
            block_on_body: Some("foobar"),
            ..Default::default()
        });

        handler.handle_frame(headers_frame(2)).await.unwrap();

        let reply = handler
            .handle_frame(chunk_frame(2, 0, b"foo", false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision_of(&reply).decision, Verdict::NeedsMore(true));
        assert_eq!(agent.on_request_body_calls.load(Ordering::SeqCst), 0);

        let reply = handler
            .handle_frame(chunk_frame(2, 1, b"bar", true))
            .await
            .unwrap()
            .unwrap();
        let decision = decision_of(&reply);
        assert_eq!(agent.on_request_body_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            decision.decision,
            Verdict::Block { status: 403, .. }
        ));
        // Blocking decision closes the entry.
        assert!(!handler.registry.contains(2).await);
    }

    #[tokio::test]
    async fn final_chunk_for_unknown_request_is_allowed() {
        let (handler, agent) = handler_with(CountingAgent {
            caps: Some(AgentCapabilities::new().handle_request_body()),
            ..Default::default()
        });

        let reply = handler
            .handle_frame(chunk_frame(99, 0, b"orphan", true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision_of(&reply).decision, Verdict::Allow);
        assert_eq!(agent.on_request_body_calls.load(Ordering::SeqCst), 0);
        assert!(!handler.registry.contains(99).await);
    }

    #[tokio::test]
    async fn cancel_request_has_no_reply_and_clears_the_entry() {
        let (handler, agent) = handler_with(CountingAgent::default());
        handler.handle_frame(headers_frame(3)).await.unwrap();
        assert!(handler.registry.contains(3).await);

        let frame = Frame::new(
            MessageType::CancelRequest,
            &CancelRequestMessage {
                request_id: 3,
                reason: None,
            },
        )
        .unwrap();
        let reply = handler.handle_frame(frame).await.unwrap();

        assert!(reply.is_none());
        assert!(!handler.registry.contains(3).await);
        assert_eq!(agent.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_all_notifies_each_request() {
        let (handler, agent) = handler_with(CountingAgent::default());
        handler.handle_frame(headers_frame(1)).await.unwrap();
        handler.handle_frame(headers_frame(2)).await.unwrap();

        let frame = Frame::empty(MessageType::CancelAll);
        let reply = handler.handle_frame(frame).await.unwrap();

        assert!(reply.is_none());
        assert!(handler.registry.is_empty().await);
        assert_eq!(agent.cancelled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ping_echoes_timestamp() {
        let (handler, _) = handler_with(CountingAgent::default());
        let frame = Frame::new(MessageType::Ping, &PingMessage { timestamp: 12345 }).unwrap();

        let reply = handler.handle_frame(frame).await.unwrap().unwrap();
        assert_eq!(reply.msg_type(), Some(MessageType::Pong));
        let pong: PongMessage = reply.parse().unwrap();
        assert_eq!(pong.timestamp, 12345);
    }

    #[tokio::test]
    async fn unknown_tag_is_answered_with_allow_zero() {
        let (handler, _) = handler_with(CountingAgent::default());
        let frame = Frame {
            tag: 0x7F,
            payload: b"{}".to_vec(),
        };

        let reply = handler.handle_frame(frame).await.unwrap().unwrap();
        let decision = decision_of(&reply);
        assert_eq!(decision.request_id, 0);
        assert_eq!(decision.decision, Verdict::Allow);
    }

    #[tokio::test]
    async fn response_headers_for_unknown_request_are_allowed() {
        let (handler, _) = handler_with(CountingAgent::default());
        let frame = Frame::new(
            MessageType::ResponseHeaders,
            &ResponseHeadersEvent {
                request_id: 42,
                status_code: 200,
                ..Default::default()
            },
        )
        .unwrap();

        let reply = handler.handle_frame(frame).await.unwrap().unwrap();
        let decision = decision_of(&reply);
        assert_eq!(decision.request_id, 42);
        assert_eq!(decision.decision, Verdict::Allow);
    }

    struct FailingAgent;

    #[async_trait]
    impl AgentV2 for FailingAgent {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_request(&self, _request: &Request) -> Result<Decision, AgentError> {
            Err(AgentError::Callback("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn callback_error_maps_to_errored_counter_and_allow() {
        let metrics = Arc::new(MetricsCollector::new());
        let handler = SessionHandler::new(Arc::new(FailingAgent), Arc::clone(&metrics));

        let reply = handler.handle_frame(headers_frame(1)).await.unwrap().unwrap();
        assert_eq!(decision_of(&reply).decision, Verdict::Allow);

        let report = metrics.report();
        assert_eq!(report.requests_errored, 1);
        assert_eq!(
            report.requests_total,
            report.requests_allowed + report.requests_blocked + report.requests_errored
        );
    }
}

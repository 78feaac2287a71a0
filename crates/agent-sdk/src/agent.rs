//! The agent callback surface.

use async_trait::async_trait;

use crate::capabilities::AgentCapabilities;
use crate::decision::Decision;
use crate::error::AgentError;
use crate::health::HealthStatus;
use crate::metrics::MetricsReport;
use crate::request::{Request, Response};

/// A policy agent cooperating with the proxy over protocol v2.
///
/// Every method has a default body, so an implementation overrides only the
/// events it advertises in [`capabilities`](AgentV2::capabilities). Events
/// outside the advertised set are answered with allow by the runtime without
/// reaching the agent.
///
/// Policy callbacks return `Result<Decision, AgentError>`; an error is
/// recorded in the errored counter and answered with a defensive allow — the
/// proxy, not the agent, decides whether to fail closed.
///
/// ```
/// use zentinel_agent_sdk::{AgentError, AgentV2, Decision, Request};
///
/// struct DenyAdmin;
///
/// #[async_trait::async_trait]
/// impl AgentV2 for DenyAdmin {
///     fn name(&self) -> &str {
///         "deny-admin"
///     }
///
///     async fn on_request(&self, request: &Request) -> Result<Decision, AgentError> {
///         if request.path_starts_with("/admin") {
///             return Ok(Decision::deny().with_reason_code("ADMIN_BLOCKED"));
///         }
///         Ok(Decision::allow())
///     }
/// }
/// ```
#[async_trait]
pub trait AgentV2: Send + Sync + 'static {
    /// Agent name, used in the handshake and for logging.
    fn name(&self) -> &str;

    /// The capability snapshot advertised during the handshake.
    ///
    /// Taken once per session; treated as immutable afterwards.
    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities::new()
    }

    /// Configuration pushed by the proxy (initial or runtime).
    async fn on_configure(&self, _config: serde_json::Value) -> Result<(), AgentError> {
        Ok(())
    }

    /// Request headers received.
    async fn on_request(&self, _request: &Request) -> Result<Decision, AgentError> {
        Ok(Decision::allow())
    }

    /// Full request body accumulated (called once, on the final chunk).
    async fn on_request_body(&self, _request: &Request) -> Result<Decision, AgentError> {
        Ok(Decision::allow())
    }

    /// Upstream response headers received.
    async fn on_response(
        &self,
        _request: &Request,
        _response: &Response,
    ) -> Result<Decision, AgentError> {
        Ok(Decision::allow())
    }

    /// Full response body accumulated (called once, on the final chunk).
    async fn on_response_body(
        &self,
        _request: &Request,
        _response: &Response,
    ) -> Result<Decision, AgentError> {
        Ok(Decision::allow())
    }

    /// Current health, answered to health probes.
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy()
    }

    /// Agent-supplied metrics report. `None` (the default) answers metrics
    /// probes with the runtime collector's snapshot instead.
    async fn metrics(&self) -> Option<MetricsReport> {
        None
    }

    /// A request was cancelled by the proxy.
    async fn on_cancel(&self, _request_id: u64) {}

    /// Request processing finished (legacy completion events).
    async fn on_request_complete(&self, _request: &Request, _status: u16, _duration_ms: u64) {}

    /// A proxy connection closed. Fires exactly once per session.
    async fn on_stream_closed(&self, _stream_id: &str) {}

    /// The agent should stop accepting new work; in-flight requests finish.
    async fn on_drain(&self) {}

    /// Final cleanup before the process exits.
    async fn on_shutdown(&self) {}
}

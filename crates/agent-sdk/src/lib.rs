//! SDK for building external processing agents for the Zentinel proxy.
//!
//! Agents are out-of-process policy servers: the proxy streams per-request
//! events (headers, body chunks, cancellations) to the agent over a duplex
//! session and applies the agent's decisions — allow, block, redirect,
//! challenge — plus header mutations to live traffic. One session carries
//! many concurrent requests, correlated by a 64-bit request id.
//!
//! The v2 wire protocol is length-prefixed binary frames:
//!
//! ```text
//! +--------+--------+------------------+
//! | Length | Type   | Payload          |
//! | 4 bytes| 1 byte | variable         |
//! | BE u32 | u8     | JSON             |
//! +--------+--------+------------------+
//! ```
//!
//! Three transports serve the same dispatch semantics: a Unix socket server
//! the proxy dials, a JSON-over-gRPC bridge (`AgentServiceV2`), and a
//! reverse connection where the agent dials the proxy and registers itself.
//!
//! # Example
//!
//! ```no_run
//! use zentinel_agent_sdk::{
//!     AgentCapabilities, AgentError, AgentRunner, AgentV2, Decision, Request, RunnerConfig,
//! };
//!
//! struct DenylistAgent {
//!     blocked_paths: Vec<String>,
//! }
//!
//! #[async_trait::async_trait]
//! impl AgentV2 for DenylistAgent {
//!     fn name(&self) -> &str {
//!         "denylist"
//!     }
//!
//!     fn capabilities(&self) -> AgentCapabilities {
//!         AgentCapabilities::new()
//!     }
//!
//!     async fn on_request(&self, request: &Request) -> Result<Decision, AgentError> {
//!         for path in &self.blocked_paths {
//!             if request.path_starts_with(path) {
//!                 return Ok(Decision::deny()
//!                     .with_body("Forbidden path")
//!                     .with_reason_code("PATH_BLOCKED"));
//!             }
//!         }
//!         Ok(Decision::allow())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AgentError> {
//!     let agent = DenylistAgent {
//!         blocked_paths: vec!["/admin".to_string()],
//!     };
//!     AgentRunner::new(agent)
//!         .with_config(RunnerConfig::parse_args())
//!         .run()
//!         .await
//! }
//! ```

pub mod agent;
pub mod capabilities;
pub mod decision;
pub mod error;
pub mod grpc;
pub mod handler;
pub mod handshake;
pub mod health;
pub mod legacy;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod request;
pub mod runner;

pub use agent::AgentV2;
pub use capabilities::AgentCapabilities;
pub use decision::{
    AuditMetadata, BodyMutationMessage, Decision, DecisionMessage, HeaderOp, Verdict,
};
pub use error::AgentError;
pub use grpc::{hash_correlation_id, AgentServiceV2};
pub use handler::SessionHandler;
pub use handshake::{
    HandshakeRequest, HandshakeResponse, RegistrationRequest, RegistrationResponse,
    PROTOCOL_VERSION,
};
pub use health::{HealthCheck, HealthState, HealthStatus};
pub use metrics::{MetricsCollector, MetricsReport};
pub use protocol::{
    read_frame, write_frame, Frame, MessageType, PingMessage, PongMessage,
    RequestBodyChunkEvent, RequestHeadersEvent, RequestMetadata, ResponseBodyChunkEvent,
    ResponseHeadersEvent, MAX_FRAME_SIZE,
};
pub use registry::{RequestRegistry, ResponseHead};
pub use request::{Request, Response};
pub use runner::{AgentRunner, RunnerConfig, RunnerHandle, Transport};

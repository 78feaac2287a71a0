//! Echo Agent - reference implementation for Zentinel policy agents
//!
//! This agent demonstrates the v2 agent protocol by echoing request
//! information back as headers and providing audit metadata.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use zentinel_agent_sdk::{
    AgentCapabilities, AgentError, AgentRunner, AgentV2, Decision, Request, Response,
    RunnerConfig,
};

/// Echo agent command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Unix socket path to listen on
    #[arg(
        short,
        long,
        env = "ECHO_AGENT_SOCKET",
        default_value = "/tmp/echo-agent.sock"
    )]
    socket: PathBuf,

    /// gRPC address to listen on (e.g. "0.0.0.0:50051"); enables the gRPC transport
    #[arg(short, long, env = "ECHO_AGENT_GRPC")]
    grpc: Option<String>,

    /// Proxy address to dial for a reverse connection; enables the reverse transport
    #[arg(short, long, env = "ECHO_AGENT_REVERSE")]
    reverse: Option<String>,

    /// Authentication token for reverse connections
    #[arg(long, env = "ECHO_AGENT_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "ECHO_AGENT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, env = "ECHO_AGENT_JSON_LOGS")]
    json_logs: bool,

    /// Add prefix to all echo headers
    #[arg(short, long, env = "ECHO_AGENT_PREFIX", default_value = "X-Echo-")]
    prefix: String,

    /// Enable verbose mode (adds more headers)
    #[arg(short, long, env = "ECHO_AGENT_VERBOSE")]
    verbose: bool,
}

/// Echo agent implementation
struct EchoAgent {
    /// Header prefix for echo headers
    prefix: String,
    /// Verbose mode flag
    verbose: bool,
    /// Request counter for tracking
    request_count: AtomicU64,
}

impl EchoAgent {
    fn new(prefix: String, verbose: bool) -> Self {
        Self {
            prefix,
            verbose,
            request_count: AtomicU64::new(0),
        }
    }

    fn header_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl AgentV2 for EchoAgent {
    fn name(&self) -> &str {
        "echo-agent"
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities::new()
            .handle_response_headers()
            .with_feature("echo")
    }

    async fn on_request(&self, request: &Request) -> Result<Decision, AgentError> {
        let request_num = self.request_count.fetch_add(1, Ordering::Relaxed) + 1;

        debug!(
            correlation_id = %request.correlation_id(),
            method = %request.method(),
            uri = %request.uri(),
            request_num = request_num,
            "processing request headers"
        );

        let mut decision = Decision::allow()
            .add_request_header(self.header_name("Agent"), "echo-agent/2.0")
            .add_request_header(
                self.header_name("Correlation-Id"),
                request.correlation_id(),
            )
            .add_request_header(self.header_name("Request-Num"), request_num.to_string())
            .add_request_header(self.header_name("Method"), request.method())
            .add_request_header(self.header_name("Path"), request.path());

        if self.verbose {
            decision = decision
                .add_request_header(self.header_name("Client-Ip"), request.client_ip())
                .add_request_header(
                    self.header_name("Header-Count"),
                    request.headers().len().to_string(),
                );

            if let Some(user_agent) = request.header("user-agent") {
                decision =
                    decision.add_request_header(self.header_name("User-Agent"), user_agent);
            }
        }

        Ok(decision
            .with_tag("echo")
            .with_metadata("request_num", serde_json::json!(request_num)))
    }

    async fn on_response(
        &self,
        request: &Request,
        response: &Response,
    ) -> Result<Decision, AgentError> {
        debug!(
            correlation_id = %request.correlation_id(),
            status = response.status(),
            "processing response headers"
        );

        let mut decision = Decision::allow().add_response_header(
            self.header_name("Response-Status"),
            response.status().to_string(),
        );

        if self.verbose {
            decision = decision.add_response_header(
                self.header_name("Response-Header-Count"),
                response.headers().len().to_string(),
            );
        }

        Ok(decision.with_tag("echo"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %args.socket.display(),
        prefix = %args.prefix,
        verbose = args.verbose,
        "starting echo agent"
    );

    let config = RunnerConfig {
        socket_path: args.socket,
        grpc_address: args.grpc,
        reverse_address: args.reverse,
        auth_token: args.auth_token,
        log_level: args.log_level,
        json_logs: args.json_logs,
        ..Default::default()
    };

    let agent = EchoAgent::new(args.prefix, args.verbose);
    AgentRunner::new(agent)
        .with_config(config)
        .run()
        .await
        .context("failed to run echo agent")?;

    Ok(())
}

//! Agent runner: transports and process lifecycle.
//!
//! The runner brings up one of three transports behind the same session
//! handler:
//!
//! - a Unix socket server the proxy dials (the default),
//! - the gRPC bridge ([`AgentServiceV2`]),
//! - a reverse connection where the agent dials the proxy, registers, and
//!   then serves the same session pump, reconnecting on disconnect.
//!
//! On SIGTERM/SIGINT the runner drains: `on_drain` runs bounded by the drain
//! timeout, new connections are refused, in-flight sessions get until the
//! drain timeout to finish, then `on_shutdown` runs bounded by the shutdown
//! timeout. Sessions still live after the drain window are abandoned; their
//! teardown fires the per-request cancellation tokens and `on_stream_closed`.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::agent::AgentV2;
use crate::error::AgentError;
use crate::grpc::AgentServiceV2;
use crate::handler::SessionHandler;
use crate::handshake::{RegistrationRequest, RegistrationResponse};
use crate::metrics::MetricsCollector;
use crate::protocol::{read_frame, write_frame, Frame, MessageType};

/// Transport selection. When several are configured the precedence is
/// reverse > gRPC > Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    UnixSocket,
    Grpc,
    Reverse,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Agent name for logging; defaults to the agent's own name.
    pub name: String,
    /// Unix socket path (default transport)
    pub socket_path: PathBuf,
    /// gRPC listen address; enables the gRPC transport when set
    pub grpc_address: Option<String>,
    /// Proxy address to dial; enables the reverse transport when set
    pub reverse_address: Option<String>,
    /// Emit JSON logs (consumed by binaries when installing a subscriber)
    pub json_logs: bool,
    /// Log level (consumed by binaries when installing a subscriber)
    pub log_level: String,
    pub shutdown_timeout: Duration,
    pub drain_timeout: Duration,
    /// Reconnect interval for the reverse transport
    pub reconnect_interval: Duration,
    /// Authentication token for reverse registration
    pub auth_token: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "agent".to_string(),
            socket_path: PathBuf::from("/tmp/zentinel-agent.sock"),
            grpc_address: None,
            reverse_address: None,
            json_logs: false,
            log_level: "info".to_string(),
            shutdown_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            auth_token: None,
        }
    }
}

impl RunnerConfig {
    /// Parse the standard agent flag surface from the command line.
    pub fn parse_args() -> Self {
        Args::parse().into()
    }

    pub fn transport(&self) -> Transport {
        if self.reverse_address.is_some() {
            Transport::Reverse
        } else if self.grpc_address.is_some() {
            Transport::Grpc
        } else {
            Transport::UnixSocket
        }
    }
}

/// Standard command-line surface shared by agent binaries.
#[derive(Parser, Debug)]
#[command(about = "Zentinel policy agent")]
struct Args {
    /// Unix socket path to listen on
    #[arg(long, env = "AGENT_SOCKET", default_value = "/tmp/zentinel-agent.sock")]
    socket: PathBuf,

    /// gRPC listen address (enables the gRPC transport)
    #[arg(long, env = "AGENT_GRPC")]
    grpc: Option<String>,

    /// Proxy address to dial for a reverse connection (enables the reverse transport)
    #[arg(long, env = "AGENT_REVERSE")]
    reverse: Option<String>,

    /// Emit JSON logs
    #[arg(long, env = "AGENT_JSON_LOGS")]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AGENT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Graceful shutdown timeout in seconds
    #[arg(long, env = "AGENT_SHUTDOWN_TIMEOUT", default_value_t = 30)]
    shutdown_timeout: u64,

    /// Drain timeout in seconds
    #[arg(long, env = "AGENT_DRAIN_TIMEOUT", default_value_t = 10)]
    drain_timeout: u64,

    /// Reconnect interval for reverse connections in seconds
    #[arg(long, env = "AGENT_RECONNECT_INTERVAL", default_value_t = 5)]
    reconnect_interval: u64,

    /// Authentication token for reverse connections
    #[arg(long, env = "AGENT_AUTH_TOKEN")]
    auth_token: Option<String>,
}

impl From<Args> for RunnerConfig {
    fn from(args: Args) -> Self {
        Self {
            socket_path: args.socket,
            grpc_address: args.grpc,
            reverse_address: args.reverse,
            json_logs: args.json_logs,
            log_level: args.log_level,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            drain_timeout: Duration::from_secs(args.drain_timeout),
            reconnect_interval: Duration::from_secs(args.reconnect_interval),
            auth_token: args.auth_token,
            ..Default::default()
        }
    }
}

/// Handle for triggering graceful shutdown programmatically.
///
/// The same path the signal handler takes: drain first, then stop.
#[derive(Clone)]
pub struct RunnerHandle {
    agent: Arc<dyn AgentV2>,
    shutdown: CancellationToken,
    draining: Arc<AtomicBool>,
    drain_timeout: Duration,
}

impl RunnerHandle {
    /// Begin graceful shutdown. Idempotent; `on_drain` runs once.
    pub async fn shutdown(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(self.drain_timeout, self.agent.on_drain()).await;
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Runs an agent on the configured transport.
///
/// ```no_run
/// use zentinel_agent_sdk::{AgentRunner, AgentV2, RunnerConfig};
///
/// # struct MyAgent;
/// # #[async_trait::async_trait]
/// # impl AgentV2 for MyAgent {
/// #     fn name(&self) -> &str { "my-agent" }
/// # }
/// # async fn run() -> Result<(), zentinel_agent_sdk::AgentError> {
/// AgentRunner::new(MyAgent)
///     .with_config(RunnerConfig::parse_args())
///     .run()
///     .await
/// # }
/// ```
pub struct AgentRunner {
    agent: Arc<dyn AgentV2>,
    config: RunnerConfig,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
    draining: Arc<AtomicBool>,
}

impl AgentRunner {
    pub fn new<A: AgentV2>(agent: A) -> Self {
        Self::from_arc(Arc::new(agent))
    }

    pub fn from_arc(agent: Arc<dyn AgentV2>) -> Self {
        let config = RunnerConfig {
            name: agent.name().to_string(),
            ..Default::default()
        };
        Self {
            agent,
            config,
            metrics: Arc::new(MetricsCollector::new()),
            shutdown: CancellationToken::new(),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, mut config: RunnerConfig) -> Self {
        if config.name == "agent" {
            config.name = self.agent.name().to_string();
        }
        self.config = config;
        self
    }

    pub fn with_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_path = path.into();
        self
    }

    pub fn with_grpc(mut self, address: impl Into<String>) -> Self {
        self.config.grpc_address = Some(address.into());
        self
    }

    pub fn with_reverse(mut self, address: impl Into<String>) -> Self {
        self.config.reverse_address = Some(address.into());
        self
    }

    pub fn with_reverse_auth(
        mut self,
        address: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        self.config.reverse_address = Some(address.into());
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// The collector answering metrics probes; use it to record custom
    /// metrics from agent code.
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// A handle for triggering graceful shutdown from outside the runner.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            agent: Arc::clone(&self.agent),
            shutdown: self.shutdown.clone(),
            draining: Arc::clone(&self.draining),
            drain_timeout: self.config.drain_timeout,
        }
    }

    /// Run until shutdown. Returns an error only for lifecycle failures
    /// (bind/listen errors, invalid configuration).
    pub async fn run(self) -> Result<(), AgentError> {
        info!(
            name = %self.config.name,
            transport = ?self.config.transport(),
            "starting agent"
        );

        match self.config.transport() {
            Transport::UnixSocket => self.run_unix_socket().await,
            Transport::Grpc => self.run_grpc().await,
            Transport::Reverse => self.run_reverse().await,
        }
    }

    fn spawn_signal_task(&self) {
        let handle = self.handle();
        tokio::spawn(async move {
            wait_for_signal().await;
            handle.shutdown().await;
        });
    }

    async fn run_unix_socket(self) -> Result<(), AgentError> {
        let path = self.config.socket_path.clone();

        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                AgentError::Lifecycle(format!("failed to remove existing socket: {e}"))
            })?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            AgentError::Lifecycle(format!("failed to listen on {}: {e}", path.display()))
        })?;

        if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660)) {
            warn!(error = %e, "failed to set socket permissions");
        }

        self.spawn_signal_task();
        info!(socket = %path.display(), "agent listening");

        let tracker = TaskTracker::new();
        let mut session_seq: u64 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        if self.draining.load(Ordering::SeqCst) {
                            debug!("refusing connection while draining");
                            continue;
                        }
                        session_seq += 1;
                        let stream_id = format!("uds-{session_seq}");
                        let agent = Arc::clone(&self.agent);
                        let metrics = Arc::clone(&self.metrics);
                        let shutdown = self.shutdown.clone();
                        let draining = Arc::clone(&self.draining);
                        tracker.spawn(async move {
                            run_session(stream, stream_id, agent, metrics, shutdown, draining)
                                .await;
                        });
                    }
                    Err(e) => {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        error!(error = %e, "failed to accept connection");
                    }
                },
            }
        }

        drop(listener);
        tracker.close();
        if tokio::time::timeout(self.config.drain_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!("drain timeout reached, abandoning live sessions");
        }

        let _ = tokio::time::timeout(self.config.shutdown_timeout, self.agent.on_shutdown()).await;
        let _ = std::fs::remove_file(&path);
        info!("agent shutdown complete");

        Ok(())
    }

    async fn run_grpc(self) -> Result<(), AgentError> {
        let address = self
            .config
            .grpc_address
            .clone()
            .ok_or_else(|| AgentError::Lifecycle("gRPC address not configured".to_string()))?;
        let addr: std::net::SocketAddr = address.parse().map_err(|e| {
            AgentError::Lifecycle(format!("invalid gRPC address {address}: {e}"))
        })?;

        self.spawn_signal_task();

        let service = AgentServiceV2::new(
            Arc::clone(&self.agent),
            Arc::clone(&self.metrics),
            self.shutdown.clone(),
            Arc::clone(&self.draining),
        );

        info!(address = %addr, "agent listening (gRPC)");

        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_shutdown(addr, self.shutdown.clone().cancelled_owned())
            .await
            .map_err(|e| AgentError::Lifecycle(format!("gRPC server failed: {e}")))?;

        let _ = tokio::time::timeout(self.config.shutdown_timeout, self.agent.on_shutdown()).await;
        info!("agent shutdown complete");

        Ok(())
    }

    async fn run_reverse(self) -> Result<(), AgentError> {
        let address = self
            .config
            .reverse_address
            .clone()
            .ok_or_else(|| AgentError::Lifecycle("reverse address not configured".to_string()))?;

        self.spawn_signal_task();
        info!(address = %address, "connecting to proxy (reverse)");

        let mut attempt: u64 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            attempt += 1;
            let stream_id = format!("reverse-{attempt}");
            let result = if address.starts_with('/') {
                match UnixStream::connect(&address).await {
                    Ok(stream) => self.reverse_session(stream, &stream_id).await,
                    Err(e) => Err(AgentError::Transport(format!(
                        "failed to connect to {address}: {e}"
                    ))),
                }
            } else {
                match TcpStream::connect(&address).await {
                    Ok(stream) => self.reverse_session(stream, &stream_id).await,
                    Err(e) => Err(AgentError::Transport(format!(
                        "failed to connect to {address}: {e}"
                    ))),
                }
            };

            if let Err(e) = result {
                error!(error = %e, "reverse connection failed");
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            info!(
                interval_ms = self.config.reconnect_interval.as_millis() as u64,
                "connection lost, reconnecting"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }

        let _ = tokio::time::timeout(self.config.shutdown_timeout, self.agent.on_shutdown()).await;
        info!("agent shutdown complete");

        Ok(())
    }

    /// Register on a freshly dialed reverse connection, then serve the
    /// normal session pump on it.
    async fn reverse_session<S>(&self, stream: S, stream_id: &str) -> Result<(), AgentError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        let mut registration =
            RegistrationRequest::new(self.agent.name(), self.agent.capabilities());
        if let Some(token) = &self.config.auth_token {
            registration = registration.with_auth_token(token.clone());
        }
        write_frame(
            &mut writer,
            &Frame::new(MessageType::Registration, &registration)?,
        )
        .await?;

        let ack = read_frame(&mut reader).await?.ok_or_else(|| {
            AgentError::Transport("connection closed during registration".to_string())
        })?;
        if !ack.is(MessageType::RegistrationAck) {
            return Err(AgentError::ProtocolViolation(format!(
                "expected registration ack, got 0x{:02X}",
                ack.tag
            )));
        }
        let response: RegistrationResponse = ack.parse()?;
        if !response.accepted {
            return Err(AgentError::HandshakeRejected(format!(
                "registration rejected: {}",
                response.error
            )));
        }
        info!(assigned_id = %response.assigned_id, "registered with proxy");

        if let Some(config) = response.config {
            if let Err(e) = self.agent.on_configure(config).await {
                error!(error = %e, "agent configuration failed");
            }
        }

        let handler = SessionHandler::new(Arc::clone(&self.agent), Arc::clone(&self.metrics));
        let accepted = tokio::select! {
            _ = self.shutdown.cancelled() => Ok(false),
            result = perform_handshake(&handler, &mut reader, &mut writer) => result,
        };

        let result = match accepted {
            Ok(true) => {
                pump_frames(
                    &handler,
                    &mut reader,
                    &mut writer,
                    &self.shutdown,
                    &self.draining,
                    stream_id,
                )
                .await;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        handler.abort_session().await;
        self.agent.on_stream_closed(stream_id).await;
        result
    }
}

/// One accepted connection: handshake gate, frame pump, teardown.
async fn run_session<S>(
    stream: S,
    stream_id: String,
    agent: Arc<dyn AgentV2>,
    metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
    draining: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let handler = SessionHandler::new(Arc::clone(&agent), metrics);
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    debug!(stream_id = %stream_id, "session established");

    let accepted = tokio::select! {
        _ = shutdown.cancelled() => Ok(false),
        result = perform_handshake(&handler, &mut reader, &mut writer) => result,
    };

    match accepted {
        Ok(true) => {
            pump_frames(&handler, &mut reader, &mut writer, &shutdown, &draining, &stream_id)
                .await;
        }
        Ok(false) => {}
        Err(e) => log_session_error(&stream_id, &e),
    }

    handler.abort_session().await;
    agent.on_stream_closed(&stream_id).await;
    debug!(stream_id = %stream_id, "session closed");
}

/// The handshake must be the first inbound frame; anything else is a
/// protocol violation that closes the session. Returns whether the session
/// may proceed (a rejected handshake is flushed, then the session ends).
async fn perform_handshake<R, W>(
    handler: &SessionHandler,
    reader: &mut R,
    writer: &mut W,
) -> Result<bool, AgentError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let frame = match read_frame(reader).await? {
        Some(frame) => frame,
        None => return Ok(false),
    };

    if !frame.is(MessageType::HandshakeRequest) {
        return Err(AgentError::ProtocolViolation(format!(
            "expected handshake request, got 0x{:02X}",
            frame.tag
        )));
    }

    let (reply, accepted) = handler.handshake(&frame).await?;
    write_frame(writer, &reply).await?;
    Ok(accepted)
}

/// The per-session message pump: strictly sequential reads, one reply at
/// most per frame, ending on stream loss, shutdown, or drain.
async fn pump_frames<R, W>(
    handler: &SessionHandler,
    reader: &mut R,
    writer: &mut W,
    shutdown: &CancellationToken,
    draining: &AtomicBool,
    stream_id: &str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        if draining.load(Ordering::SeqCst) {
            debug!(stream_id = %stream_id, "session ending for drain");
            break;
        }

        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = read_frame(reader) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log_session_error(stream_id, &e);
                    break;
                }
            },
        };

        match handler.handle_frame(frame).await {
            Ok(Some(reply)) => {
                if let Err(e) = write_frame(writer, &reply).await {
                    error!(stream_id = %stream_id, error = %e, "failed to write response");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(stream_id = %stream_id, error = %e, "failed to handle message");
            }
        }
    }
}

fn log_session_error(stream_id: &str, err: &AgentError) {
    match err {
        AgentError::Truncated(_) => {
            warn!(stream_id = %stream_id, error = %err, "closing session")
        }
        _ => error!(stream_id = %stream_id, error = %err, "closing session"),
    }
}

async fn wait_for_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn transport_precedence_reverse_over_grpc_over_socket() {
        let mut config = RunnerConfig::default();
        assert_eq!(config.transport(), Transport::UnixSocket);

        config.grpc_address = Some("127.0.0.1:50051".to_string());
        assert_eq!(config.transport(), Transport::Grpc);

        config.reverse_address = Some("/run/proxy.sock".to_string());
        assert_eq!(config.transport(), Transport::Reverse);
    }

    #[test]
    fn args_map_onto_config() {
        let args = Args::try_parse_from([
            "agent",
            "--socket",
            "/tmp/test.sock",
            "--grpc",
            "0.0.0.0:50051",
            "--log-level",
            "debug",
            "--drain-timeout",
            "3",
            "--auth-token",
            "secret",
        ])
        .unwrap();
        let config: RunnerConfig = args.into();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.grpc_address.as_deref(), Some("0.0.0.0:50051"));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.drain_timeout, Duration::from_secs(3));
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.transport(), Transport::Grpc);
    }

    struct DrainCounting {
        drains: AtomicU64,
    }

    #[async_trait]
    impl AgentV2 for DrainCounting {
        fn name(&self) -> &str {
            "drain-counting"
        }

        async fn on_drain(&self) {
            self.drains.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn shutdown_handle_is_idempotent() {
        let agent = Arc::new(DrainCounting {
            drains: AtomicU64::new(0),
        });
        let runner = AgentRunner::from_arc(Arc::clone(&agent) as Arc<dyn AgentV2>);
        let handle = runner.handle();

        handle.shutdown().await;
        handle.shutdown().await;

        assert!(handle.is_shutting_down());
        assert!(runner.shutdown.is_cancelled());
        assert_eq!(agent.drains.load(Ordering::SeqCst), 1);
    }
}

//! Transport layer between the external automation client and the editor.
//!
//! Every transport variant implements the [`TransportClient`] capability
//! trait, so the [`TransportManager`] can run any of them as the primary
//! command channel, or run the websocket hub alongside HTTP as a push-only
//! companion.
//!
//! # Architecture
//!
//! ```text
//! TransportClient (trait)
//!     │
//!     ├── StdioTransport      loopback TCP host, one live client,
//!     │   └── StdioBridgeHost  length-prefixed frames (framing)
//!     │
//!     ├── WebSocketTransport  hub client, localhost candidate expansion,
//!     │                       reconnect with backoff (ws)
//!     │
//!     └── HttpTransport       register/verify/command over plain HTTP
//!
//! TransportManager
//!     primary  : Arc<dyn TransportClient>          (selected by TransportMode)
//!     companion: Option<Arc<dyn TransportClient>>  (Http mode only)
//! ```

pub mod client_conn;
pub mod framing;
pub mod http;
pub mod manager;
pub mod stdio;
pub mod websocket;
pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Immutable connection report for one transport.
///
/// Built fresh on every query. A connected state never carries an error;
/// the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportState {
    transport_name: String,
    is_connected: bool,
    port: Option<u16>,
    session_id: Option<String>,
    error: Option<String>,
    details: Option<String>,
}

impl TransportState {
    /// A connected state for the named transport.
    pub fn connected(transport_name: impl Into<String>) -> Self {
        Self {
            transport_name: transport_name.into(),
            is_connected: true,
            port: None,
            session_id: None,
            error: None,
            details: None,
        }
    }

    /// A disconnected state, optionally carrying the last failure reason.
    pub fn disconnected(transport_name: impl Into<String>, error: Option<String>) -> Self {
        Self {
            transport_name: transport_name.into(),
            is_connected: false,
            port: None,
            session_id: None,
            error,
            details: None,
        }
    }

    /// Attach the bound or listening port.
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    /// Attach the opaque client session token.
    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Attach human-readable details.
    pub fn with_details(mut self, details: Option<String>) -> Self {
        self.details = details;
        self
    }

    /// Name of the transport implementation.
    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    /// Whether the transport is established.
    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    /// Bound or listening port, if the transport has one.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Client session token, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Last failure reason. Always `None` while connected.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Human-readable details.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

/// Which primary transport the manager starts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Plain HTTP command channel plus a websocket hub companion for pushes.
    Http,
    /// Websocket hub only.
    HttpPush,
    /// Loopback TCP bridge host with length-prefixed frames.
    Stdio,
}

impl TransportMode {
    /// Name used for state reports when no transport of this mode is live.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::HttpPush => "http-push",
            Self::Stdio => "stdio",
        }
    }

    /// Whether this mode runs the websocket hub as a companion.
    pub fn wants_companion(self) -> bool {
        matches!(self, Self::Http)
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "http-push" | "httppush" | "http_push" => Ok(Self::HttpPush),
            "stdio" => Ok(Self::Stdio),
            other => Err(format!("unknown transport mode: {other}")),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug)]
pub enum TransportError {
    /// The operation is not valid in the current state (e.g. never started).
    InvalidOperation(String),
    /// Failed to establish a connection.
    ConnectionFailed(String),
    /// Failed to send a command or receive its response.
    SendFailed(String),
    /// The peer violated the wire protocol.
    Protocol(String),
    /// The transport was closed while the operation was in flight.
    Closed,
    /// Operation timed out.
    Timeout,
    /// Invalid configuration, detected at construction time.
    Configuration(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Closed => write!(f, "Transport closed"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Configuration(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Uniform contract implemented by every transport variant.
///
/// Expected failures (port taken, connection refused, HTTP error) surface as
/// `false` from [`start`](Self::start)/[`verify`](Self::verify) or a state
/// carrying an error, never as a panic.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Short identifier of the implementation (e.g. `stdio`).
    fn name(&self) -> &str;

    /// Establish the transport. Returns `false` on expected failures.
    async fn start(&self) -> bool;

    /// Release everything `start` acquired. Calling it when stopped is a no-op.
    async fn stop(&self);

    /// Liveness probe, distinct from "start succeeded".
    async fn verify(&self) -> bool;

    /// Send one command and wait for exactly one response.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidOperation` if the transport was never
    /// started, or a send/timeout error from the underlying channel.
    async fn send_command(&self, command_json: &str) -> Result<String, TransportError>;

    /// Current connection snapshot, computed live.
    fn state(&self) -> TransportState;
}

// Re-exports
pub use http::{HttpConfig, HttpTransport, ToolDefinition};
pub use manager::{TransportFactories, TransportFactoriesBuilder, TransportFactory, TransportManager};
pub use stdio::{StdioBridgeHost, StdioConfig, StdioTransport};
pub use websocket::{build_connection_candidates, HubConfig, WebSocketTransport};

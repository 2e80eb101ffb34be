//! Application-wide constants for the bridge.
//!
//! Centralizes the wire-protocol limits, timeouts and port defaults so the
//! transports, the registry and the CLI agree on them.
//!
//! # Categories
//!
//! - **Wire protocol**: framing limits and the handshake line
//! - **Ports**: default bridge port and discovery scan range
//! - **Timeouts**: network and liveness probe timeouts
//! - **Reconnection**: websocket backoff and keep-alive defaults

use std::time::Duration;

// ============================================================================
// Wire protocol
// ============================================================================

/// Size of the big-endian length header that precedes every frame.
pub const FRAME_HEADER_LEN: usize = 8;

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Handshake line written to every accepted bridge connection before any frame.
pub const HANDSHAKE_LINE: &str = "MCP/0.1 FRAMING=1\n";

/// Capability token a client must find in the handshake line.
pub const FRAMING_TOKEN: &str = "FRAMING=1";

/// Upper bound on the handshake line a client is willing to read.
pub const MAX_HANDSHAKE_LEN: u64 = 256;

/// Socket read buffer for the per-connection read task.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Ports
// ============================================================================

/// Port the bridge listens on when nothing else is configured.
pub const DEFAULT_BRIDGE_PORT: u16 = 6400;

/// Number of ports above [`DEFAULT_BRIDGE_PORT`] scanned before asking the OS.
pub const PORT_SCAN_RANGE: u16 = 100;

/// Connect timeout used when checking whether something listens on a port.
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Timeouts
// ============================================================================

/// How long a bridge client waits for the handshake line.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connect + ping budget for discovery probes against a candidate port.
pub const DISCOVERY_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Timeout for a single liveness probe (`verify`).
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(3);

/// HTTP client request timeout for the plain HTTP transport.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket connect + welcome timeout per endpoint candidate.
pub const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a command sent over the hub waits for its response.
pub const HUB_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for a transport's background task to exit on stop.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Reconnection & keep-alive
// ============================================================================

/// First websocket reconnect delay.
pub const INITIAL_BACKOFF_SECS: u64 = 1;

/// Ceiling for the websocket reconnect delay.
pub const MAX_BACKOFF_SECS: u64 = 30;

/// Keep-alive interval used until the hub's welcome says otherwise.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;

/// Server timeout used until the hub's welcome says otherwise.
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Registry
// ============================================================================

/// Directory (under the home directory) holding port and status files.
pub const REGISTRY_DIR_NAME: &str = ".unity-mcp";

/// Legacy single-project port file name.
pub const LEGACY_PORT_FILE: &str = "unity-mcp-port.json";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_advertises_framing() {
        assert!(HANDSHAKE_LINE.contains(FRAMING_TOKEN));
        assert!(HANDSHAKE_LINE.ends_with('\n'));
        assert!((HANDSHAKE_LINE.len() as u64) < MAX_HANDSHAKE_LEN);
    }

    #[test]
    fn test_backoff_bounds() {
        assert!(INITIAL_BACKOFF_SECS < MAX_BACKOFF_SECS);
        assert!(DEFAULT_KEEP_ALIVE_SECS < DEFAULT_SERVER_TIMEOUT_SECS);
    }
}

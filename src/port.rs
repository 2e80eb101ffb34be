//! Port availability probing and discovery for the stdio bridge host.
//!
//! A port is only handed out when it can be bound on loopback *and* nothing
//! answers on it. The bind comes first: a live bridge host evicts its client
//! on every new connection, so a bound port must never see a probe. The
//! connect probe then catches listeners sharing the port through
//! `SO_REUSEADDR`.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use anyhow::{Context, Result};

use crate::constants::{DEFAULT_BRIDGE_PORT, PORT_PROBE_TIMEOUT, PORT_SCAN_RANGE};

/// Whether `port` is free for the bridge on loopback.
///
/// Returns `false` for port 0, for a port something accepts connections on,
/// and for a port that cannot be bound.
pub fn is_port_available(port: u16) -> bool {
    if port == 0 {
        return false;
    }

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpListener::bind(addr) {
        Ok(listener) => drop(listener),
        Err(e) => {
            log::debug!("[Port] {} cannot be bound: {e}", port);
            return false;
        }
    }

    if TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok() {
        log::debug!("[Port] {} is in use (accepted a connection)", port);
        return false;
    }
    true
}

/// Ask the OS for a free ephemeral port on loopback.
fn ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .context("Failed to bind an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Find a port for a new bridge host.
///
/// Tries the default port, then the scan range above it, then an
/// OS-assigned ephemeral port.
pub fn discover_new_port() -> Result<u16> {
    if is_port_available(DEFAULT_BRIDGE_PORT) {
        return Ok(DEFAULT_BRIDGE_PORT);
    }

    let scan_end = DEFAULT_BRIDGE_PORT.saturating_add(PORT_SCAN_RANGE);
    for port in (DEFAULT_BRIDGE_PORT + 1)..=scan_end {
        if is_port_available(port) {
            log::info!("[Port] Default port busy, using {}", port);
            return Ok(port);
        }
    }

    let port = ephemeral_port()?;
    log::info!("[Port] Scan range exhausted, using ephemeral port {}", port);
    Ok(port)
}

/// `preferred` if it is available, otherwise a freshly discovered port.
pub fn port_with_fallback(preferred: u16) -> Result<u16> {
    if is_port_available(preferred) {
        return Ok(preferred);
    }
    log::warn!("[Port] Preferred port {} unavailable, discovering a new one", preferred);
    discover_new_port()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_never_available() {
        assert!(!is_port_available(0));
    }

    #[test]
    fn test_listening_port_is_unavailable() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
    }

    #[test]
    fn test_released_port_is_available() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(is_port_available(port));
    }

    #[test]
    fn test_fallback_skips_busy_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let chosen = port_with_fallback(busy).unwrap();
        assert_ne!(chosen, busy);
        assert_ne!(chosen, 0);
    }

    #[test]
    fn test_discovered_port_is_bindable() {
        let port = discover_new_port().unwrap();
        assert!(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok());
    }
}

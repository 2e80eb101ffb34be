//! Loopback TCP bridge host and its transport wrapper.
//!
//! [`StdioBridgeHost`] listens on `127.0.0.1` and creates a
//! [`BridgeClientConn`] for each accepted connection. Only one client is
//! live at a time: a new connection always replaces the previous one, which
//! is then closed from our side.
//!
//! [`StdioTransport`] adapts the host to the [`TransportClient`] contract,
//! including port fallback and the port registry.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::client_conn::{handle_payload, BridgeClientConn, ClientSlot};
use super::{TransportClient, TransportError, TransportState};
use crate::dispatch::{is_pong, CommandDispatcher};
use crate::port::port_with_fallback;
use crate::registry::PortRegistry;

/// Loopback TCP server speaking the framed bridge protocol.
pub struct StdioBridgeHost {
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    /// The single live client connection.
    slot: Arc<ClientSlot>,
    /// Handler for every request, socket or loopback.
    dispatcher: Arc<dyn CommandDispatcher>,
    /// Handle to the accept loop task.
    accept_handle: JoinHandle<()>,
}

impl std::fmt::Debug for StdioBridgeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioBridgeHost")
            .field("local_addr", &self.local_addr)
            .field("client", &self.slot.current_id())
            .finish_non_exhaustive()
    }
}

impl StdioBridgeHost {
    /// Bind `127.0.0.1:port` and spawn the accept loop.
    ///
    /// Port 0 binds an OS-assigned ephemeral port. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound.
    pub fn start(port: u16, dispatcher: Arc<dyn CommandDispatcher>) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("Failed to bind bridge on {addr}"))?;

        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;

        log::info!("[Bridge] Listening on {}", local_addr);

        let slot = Arc::new(ClientSlot::new());
        let accept_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::clone(&dispatcher),
            Arc::clone(&slot),
        ));

        Ok(Self {
            local_addr,
            slot,
            dispatcher,
            accept_handle,
        })
    }

    /// Accept loop: runs as a tokio task for the host's lifetime.
    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Arc<dyn CommandDispatcher>,
        slot: Arc<ClientSlot>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        log::debug!("[Bridge] Could not disable Nagle for {}: {e}", peer);
                    }

                    let client_id = generate_client_id();
                    log::info!("[Bridge] Client connected: {} ({})", client_id, peer);

                    let conn = BridgeClientConn::spawn(
                        client_id,
                        stream,
                        Arc::clone(&dispatcher),
                        Arc::clone(&slot),
                    );

                    if let Some(previous) = slot.install(conn) {
                        log::info!("[Bridge] Evicting previous client {}", previous.client_id());
                        previous.disconnect();
                    }
                }
                Err(e) => {
                    // Transient (e.g. fd exhaustion); keep accepting.
                    log::error!("[Bridge] Accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Id of the live client, if any.
    pub fn current_client(&self) -> Option<String> {
        self.slot.current_id()
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        !self.accept_handle.is_finished()
    }

    /// Answer a request in-process, exactly as a socket client would be.
    ///
    /// Does not touch the client slot.
    pub async fn execute(&self, payload: &str) -> String {
        handle_payload(payload.as_bytes(), self.dispatcher.as_ref()).await
    }

    /// Stop accepting and close the live client. Idempotent.
    pub fn shutdown(&self) {
        self.accept_handle.abort();
        if let Some(conn) = self.slot.take() {
            conn.disconnect();
        }
    }
}

impl Drop for StdioBridgeHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Generate a unique client ID using a monotonic counter + random suffix.
fn generate_client_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("bridge:{seq:x}{rand:04x}")
}

/// Settings for [`StdioTransport`].
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Preferred port; 0 asks the OS.
    pub port: u16,
    /// Pick another port when the preferred one is taken.
    pub allow_fallback: bool,
    /// Project whose registry entries this host writes.
    pub project_path: String,
    /// Registry to record the port in, if any.
    pub registry: Option<PortRegistry>,
}

/// [`TransportClient`] backed by a [`StdioBridgeHost`].
pub struct StdioTransport {
    config: StdioConfig,
    dispatcher: Arc<dyn CommandDispatcher>,
    host: Mutex<Option<Arc<StdioBridgeHost>>>,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("config", &self.config)
            .field("host", &self.current_host())
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Create a stopped transport.
    pub fn new(config: StdioConfig, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            host: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    fn current_host(&self) -> Option<Arc<StdioBridgeHost>> {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Port the host listens on, if running.
    pub fn port(&self) -> Option<u16> {
        self.current_host().map(|h| h.port())
    }

    /// Record in the status file that the editor is (or is no longer)
    /// reloading, so clients can retry instead of failing.
    pub fn mark_reloading(&self, reloading: bool) {
        let Some(port) = self.port() else { return };
        let reason = if reloading { "reloading" } else { "ready" };
        self.write_status(port, reloading, reason);
    }

    fn write_status(&self, port: u16, reloading: bool, reason: &str) {
        let Some(registry) = &self.config.registry else { return };
        if let Err(e) = registry.write_status(&self.config.project_path, port, reloading, Some(reason)) {
            log::warn!("[Bridge] Could not write status file: {e:#}");
        }
    }

    async fn resolve_port(&self) -> Result<u16> {
        let preferred = self.config.port;
        if preferred == 0 || !self.config.allow_fallback {
            return Ok(preferred);
        }
        // Probing may scan many ports with blocking connects.
        tokio::task::spawn_blocking(move || port_with_fallback(preferred))
            .await
            .context("Port discovery task failed")?
    }
}

#[async_trait]
impl TransportClient for StdioTransport {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn start(&self) -> bool {
        if self.current_host().is_some_and(|h| h.is_running()) {
            return true;
        }

        let port = match self.resolve_port().await {
            Ok(port) => port,
            Err(e) => {
                log::warn!("[Bridge] No usable port: {e:#}");
                self.set_error(Some(format!("{e:#}")));
                return false;
            }
        };

        let host = match StdioBridgeHost::start(port, Arc::clone(&self.dispatcher)) {
            Ok(host) => Arc::new(host),
            Err(e) => {
                log::warn!("[Bridge] Failed to start stdio bridge: {e:#}");
                self.set_error(Some(format!("{e:#}")));
                return false;
            }
        };

        let bound = host.port();
        if let Some(registry) = &self.config.registry {
            if let Err(e) = registry.write_port(&self.config.project_path, bound) {
                log::warn!("[Bridge] Could not record port {}: {e:#}", bound);
            }
        }
        self.write_status(bound, false, "ready");

        *self.host.lock().unwrap_or_else(PoisonError::into_inner) = Some(host);
        self.set_error(None);
        true
    }

    async fn stop(&self) {
        let host = self
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(host) = host else { return };

        host.shutdown();
        self.write_status(host.port(), false, "stopped");
        log::info!("[Bridge] Stopped listening on {}", host.local_addr());
    }

    async fn verify(&self) -> bool {
        let Some(host) = self.current_host() else {
            return false;
        };
        host.is_running() && is_pong(&host.execute("ping").await)
    }

    async fn send_command(&self, command_json: &str) -> Result<String, TransportError> {
        let host = self
            .current_host()
            .ok_or_else(|| TransportError::InvalidOperation("stdio bridge is not running".into()))?;
        Ok(host.execute(command_json).await)
    }

    fn state(&self) -> TransportState {
        match self.current_host() {
            Some(host) if host.is_running() => {
                let client = host.current_client();
                let details = match &client {
                    Some(id) => format!("listening on {}, client {}", host.local_addr(), id),
                    None => format!("listening on {}, no client", host.local_addr()),
                };
                TransportState::connected(self.name())
                    .with_port(Some(host.port()))
                    .with_session_id(client)
                    .with_details(Some(details))
            }
            Some(host) => TransportState::disconnected(self.name(), Some("accept loop ended".into()))
                .with_port(Some(host.port())),
            None => {
                let error = self
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                TransportState::disconnected(self.name(), error)
            }
        }
    }
}

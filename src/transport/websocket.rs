//! WebSocket hub transport.
//!
//! Connects the editor to the plugin hub, registers this project and then
//! services the hub's `execute` requests through the [`CommandDispatcher`].
//!
//! # Architecture
//!
//! ```text
//! WebSocketTransport
//!     ├── candidates      localhost expanded to localhost, 127.0.0.1, [::1]
//!     ├── run_connection_loop (spawned task)
//!     │       connect → welcome → register → run_message_loop
//!     │       └── exponential backoff with jitter on disconnect
//!     └── HubShared       status, pending requests, ping waiters
//! ```
//!
//! # Hub protocol
//!
//! JSON text frames tagged by `type`:
//!
//! | direction    | message                                                  |
//! |--------------|----------------------------------------------------------|
//! | hub → plugin | `welcome {serverTimeout, keepAliveInterval}`             |
//! | plugin → hub | `register {session_id, project_name, project_hash, unity_version}` |
//! | hub → plugin | `execute {id, name, params, timeout}`                    |
//! | plugin → hub | `command_result {id, result}`                            |
//! | hub → plugin | `ping`, answered by `pong {session_id}`                  |
//! | plugin → hub | `request {id, command}`, answered by `response {id, result}` |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::Uri;

use super::ws::{self, http_to_ws_scheme, WsMessage, WsReader, WsWriter};
use super::{TransportClient, TransportError, TransportState};
use crate::constants::{
    DEFAULT_KEEP_ALIVE_SECS, DEFAULT_SERVER_TIMEOUT_SECS, INITIAL_BACKOFF_SECS, MAX_BACKOFF_SECS,
    SHUTDOWN_GRACE, VERIFY_TIMEOUT,
};
use crate::dispatch::{error_envelope, CommandDispatcher};

/// Hosts tried, in order, when the endpoint host is `localhost`.
const LOCALHOST_ALIASES: [&str; 3] = ["localhost", "127.0.0.1", "[::1]"];

/// Settings for [`WebSocketTransport`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Hub endpoint (`ws://`, `wss://`, or an `http(s)://` URL to convert).
    pub endpoint: String,
    /// Project name sent on register.
    pub project_name: String,
    /// Project hash sent on register.
    pub project_hash: String,
    /// Editor version sent on register.
    pub unity_version: String,
    /// Connect + welcome budget per candidate.
    pub connect_timeout: Duration,
    /// How long `send_command` waits for the hub's response.
    pub command_timeout: Duration,
}

/// Build the ordered list of URIs to try for `endpoint`.
///
/// A `localhost` host expands to `localhost`, `127.0.0.1` and `[::1]`,
/// keeping scheme, port, path and query. Any other host yields exactly the
/// endpoint. The list never holds two URIs equal ignoring ASCII case.
///
/// # Errors
///
/// Returns `TransportError::Configuration` if the endpoint is not an
/// absolute `ws`/`wss` URI with a host.
pub fn build_connection_candidates(endpoint: &str) -> Result<Vec<String>, TransportError> {
    let endpoint = http_to_ws_scheme(endpoint.trim());
    let uri: Uri = endpoint
        .parse()
        .map_err(|e| TransportError::Configuration(format!("invalid hub endpoint '{endpoint}': {e}")))?;

    match uri.scheme_str() {
        Some("ws" | "wss") => {}
        _ => {
            return Err(TransportError::Configuration(format!(
                "hub endpoint must use ws:// or wss://: {endpoint}"
            )))
        }
    }

    let authority = uri
        .authority()
        .ok_or_else(|| TransportError::Configuration(format!("hub endpoint has no host: {endpoint}")))?;
    let host = authority.host();

    if !host.eq_ignore_ascii_case("localhost") {
        return Ok(vec![endpoint]);
    }

    // Splice each alias into the original text so path and query stay byte-identical.
    let auth_str = authority.as_str();
    let auth_start = endpoint
        .find(auth_str)
        .ok_or_else(|| TransportError::Configuration(format!("cannot locate host in {endpoint}")))?;
    let prefix = &endpoint[..auth_start];
    let suffix = &endpoint[auth_start + auth_str.len()..];
    let userinfo = auth_str.rsplit_once('@').map(|(user, _)| format!("{user}@"));
    let port = authority.port_u16().map(|p| format!(":{p}"));

    let mut candidates: Vec<String> = Vec::with_capacity(LOCALHOST_ALIASES.len());
    for alias in LOCALHOST_ALIASES {
        let candidate = format!(
            "{prefix}{}{alias}{}{suffix}",
            userinfo.as_deref().unwrap_or(""),
            port.as_deref().unwrap_or("")
        );
        if !candidates.iter().any(|c| c.eq_ignore_ascii_case(&candidate)) {
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

/// Messages exchanged with the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HubMessage {
    Welcome {
        #[serde(rename = "serverTimeout", default)]
        server_timeout: Option<u64>,
        #[serde(rename = "keepAliveInterval", default)]
        keep_alive_interval: Option<u64>,
    },
    Register {
        session_id: String,
        project_name: String,
        project_hash: String,
        unity_version: String,
    },
    Execute {
        id: String,
        name: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        timeout: Option<f64>,
    },
    CommandResult {
        id: String,
        result: Value,
    },
    Ping,
    Pong {
        session_id: String,
    },
    Request {
        id: String,
        command: Value,
    },
    Response {
        id: String,
        #[serde(default)]
        result: Value,
    },
}

/// Keep-alive timing announced by the hub's welcome.
#[derive(Debug, Clone, Copy)]
struct HubTiming {
    keep_alive: Duration,
    server_timeout: Duration,
}

impl HubTiming {
    fn from_welcome(server_timeout: Option<u64>, keep_alive_interval: Option<u64>) -> Self {
        let keep_alive = keep_alive_interval.filter(|s| *s > 0).unwrap_or(DEFAULT_KEEP_ALIVE_SECS);
        let server_timeout = server_timeout.filter(|s| *s > 0).unwrap_or(DEFAULT_SERVER_TIMEOUT_SECS);
        Self {
            keep_alive: Duration::from_secs(keep_alive),
            server_timeout: Duration::from_secs(server_timeout),
        }
    }
}

/// Connection status visible to `state()`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HubStatus {
    Disconnected,
    Connecting,
    Connected { endpoint: String },
    Reconnecting { attempt: u32, next_retry_ms: u64 },
}

/// Outgoing work for the session loop.
#[derive(Debug)]
enum Outgoing {
    Message(HubMessage),
    Ping(Vec<u8>),
}

/// State shared between the transport and its session task.
#[derive(Debug)]
struct HubShared {
    status: Mutex<HubStatus>,
    last_error: Mutex<Option<String>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    ping_waiters: Mutex<HashMap<Vec<u8>, oneshot::Sender<()>>>,
}

impl HubShared {
    fn new() -> Self {
        Self {
            status: Mutex::new(HubStatus::Disconnected),
            last_error: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            ping_waiters: Mutex::new(HashMap::new()),
        }
    }

    fn status(&self) -> HubStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_status(&self, status: HubStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn is_connected(&self) -> bool {
        matches!(self.status(), HubStatus::Connected { .. })
    }

    fn resolve_request(&self, id: &str, result: Value) {
        let waiter = self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => log::debug!("[Hub] Response for unknown request {}", id),
        }
    }

    fn resolve_ping(&self, payload: &[u8]) {
        let waiter = self
            .ping_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(payload);
        if let Some(tx) = waiter {
            let _ = tx.send(());
        }
    }

    /// Drop every waiter so callers see `Closed` instead of hanging.
    fn fail_pending(&self) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.ping_waiters.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Everything the session task needs, cloned once per `start`.
#[derive(Clone)]
struct SessionContext {
    config: HubConfig,
    candidates: Vec<String>,
    session_id: String,
    dispatcher: Arc<dyn CommandDispatcher>,
    shared: Arc<HubShared>,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
}

/// An established, registered hub connection.
struct Established {
    writer: WsWriter,
    reader: WsReader,
    timing: HubTiming,
    endpoint: String,
}

impl SessionContext {
    /// Try every candidate in order; the first to connect, welcome and
    /// accept our register wins.
    async fn connect_any(&self) -> Result<Established> {
        let mut last_error = None;
        for candidate in &self.candidates {
            match self.connect_one(candidate).await {
                Ok(established) => return Ok(established),
                Err(e) => {
                    log::debug!("[Hub] Candidate {} failed: {e:#}", candidate);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no hub candidates")))
    }

    async fn connect_one(&self, endpoint: &str) -> Result<Established> {
        let (mut writer, mut reader) = ws::connect(endpoint, self.config.connect_timeout).await?;

        let timing = tokio::time::timeout(self.config.connect_timeout, wait_for_welcome(&mut reader))
            .await
            .context("Timeout waiting for welcome")??;

        writer
            .send_json(&HubMessage::Register {
                session_id: self.session_id.clone(),
                project_name: self.config.project_name.clone(),
                project_hash: self.config.project_hash.clone(),
                unity_version: self.config.unity_version.clone(),
            })
            .await
            .context("register failed")?;

        log::info!(
            "[Hub] Registered {} ({}) at {}",
            self.config.project_name,
            self.session_id,
            endpoint
        );

        Ok(Established {
            writer,
            reader,
            timing,
            endpoint: endpoint.to_string(),
        })
    }

    /// Run the command for an `execute` and queue its `command_result`.
    async fn execute(&self, id: String, name: String, params: Value, timeout: Option<f64>) {
        let params = if params.is_null() { json!({}) } else { params };
        let command = json!({ "type": name, "params": params }).to_string();
        let budget = timeout
            .filter(|t| t.is_finite() && *t > 0.0)
            .map_or(self.config.command_timeout, Duration::from_secs_f64);

        let response = match tokio::time::timeout(budget, self.dispatcher.dispatch(&command)).await {
            Ok(response) => response,
            Err(_) => {
                log::warn!("[Hub] Command '{}' ({}) timed out", name, id);
                error_envelope(&format!("Command '{name}' timed out"))
            }
        };

        let result = serde_json::from_str(&response).unwrap_or(Value::String(response));
        if self
            .outgoing_tx
            .send(Outgoing::Message(HubMessage::CommandResult { id, result }))
            .is_err()
        {
            log::debug!("[Hub] Session ended before command result could be sent");
        }
    }
}

async fn wait_for_welcome(reader: &mut WsReader) -> Result<HubTiming> {
    while let Some(message) = reader.recv().await {
        if let WsMessage::Text(text) = message? {
            if let Ok(HubMessage::Welcome {
                server_timeout,
                keep_alive_interval,
            }) = serde_json::from_str::<HubMessage>(&text)
            {
                return Ok(HubTiming::from_welcome(server_timeout, keep_alive_interval));
            }
        }
    }
    bail!("WebSocket closed before welcome")
}

/// Running session: its task plus the handles to talk to it.
struct Session {
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// [`TransportClient`] connected to the plugin hub.
pub struct WebSocketTransport {
    config: HubConfig,
    candidates: Vec<String>,
    session_id: String,
    dispatcher: Arc<dyn CommandDispatcher>,
    shared: Arc<HubShared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("candidates", &self.candidates)
            .field("session_id", &self.session_id)
            .field("status", &self.shared.status())
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Create a stopped transport.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Configuration` for an invalid endpoint.
    pub fn new(config: HubConfig, dispatcher: Arc<dyn CommandDispatcher>) -> Result<Self, TransportError> {
        let candidates = build_connection_candidates(&config.endpoint)?;
        Ok(Self {
            config,
            candidates,
            session_id: uuid::Uuid::new_v4().to_string(),
            dispatcher,
            shared: Arc::new(HubShared::new()),
            session: tokio::sync::Mutex::new(None),
        })
    }

    /// URIs tried on every (re)connect, in order.
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Session id announced on register; stable across reconnects.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run the connection loop with automatic reconnection.
    async fn run_connection_loop(
        ctx: SessionContext,
        initial: Established,
        mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut attempt: u32 = 0;
        let mut next = Some(initial);

        loop {
            let established = match next.take() {
                Some(established) => Some(established),
                None => {
                    ctx.shared.set_status(HubStatus::Connecting);
                    match ctx.connect_any().await {
                        Ok(established) => Some(established),
                        Err(e) => {
                            log::warn!("[Hub] Reconnect failed: {e:#}");
                            ctx.shared.set_error(Some(format!("{e:#}")));
                            None
                        }
                    }
                }
            };

            if let Some(mut conn) = established {
                ctx.shared.set_status(HubStatus::Connected {
                    endpoint: conn.endpoint.clone(),
                });
                ctx.shared.set_error(None);
                backoff_secs = INITIAL_BACKOFF_SECS;
                attempt = 0;

                let shutdown_requested =
                    Self::run_message_loop(&ctx, &mut conn, &mut outgoing_rx, &mut shutdown_rx).await;
                ctx.shared.fail_pending();

                if shutdown_requested {
                    let _ = conn.writer.close().await;
                    log::info!("[Hub] Session closed");
                    break;
                }

                log::warn!("[Hub] Disconnected from {}", conn.endpoint);
                ctx.shared.set_error(Some(format!("disconnected from {}", conn.endpoint)));
            }

            // Exponential backoff with jitter
            attempt = attempt.saturating_add(1);
            let jitter_ms = rand::random::<u64>() % 1000;
            let wait_ms = backoff_secs * 1000 + jitter_ms;
            ctx.shared.set_status(HubStatus::Reconnecting {
                attempt,
                next_retry_ms: wait_ms,
            });

            log::info!("[Hub] Reconnecting in {:.1}s (attempt {})...", wait_ms as f32 / 1000.0, attempt);

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                _ = &mut shutdown_rx => {
                    log::info!("[Hub] Shutdown during reconnect backoff");
                    break;
                }
            }

            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }

        ctx.shared.fail_pending();
        ctx.shared.set_status(HubStatus::Disconnected);
    }

    /// Run the message loop until disconnect.
    ///
    /// Returns `true` if exit was due to shutdown, `false` on close, error or
    /// a stale connection.
    async fn run_message_loop(
        ctx: &SessionContext,
        conn: &mut Established,
        outgoing_rx: &mut mpsc::UnboundedReceiver<Outgoing>,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> bool {
        let mut last_activity = Instant::now();
        let mut keep_alive = tokio::time::interval(conn.timing.keep_alive);
        keep_alive.tick().await;

        loop {
            tokio::select! {
                outgoing = outgoing_rx.recv() => {
                    let sent = match outgoing {
                        Some(Outgoing::Message(message)) => conn.writer.send_json(&message).await,
                        Some(Outgoing::Ping(payload)) => conn.writer.send_ping(payload).await,
                        // Transport dropped without stop().
                        None => return true,
                    };
                    if let Err(e) = sent {
                        log::warn!("[Hub] Send failed: {e:#}");
                        return false;
                    }
                }

                incoming = conn.reader.recv() => {
                    last_activity = Instant::now();
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            if !Self::handle_text(ctx, &mut conn.writer, &text).await {
                                return false;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if conn.writer.send_pong(data).await.is_err() {
                                log::warn!("[Hub] Failed to send pong frame");
                                return false;
                            }
                        }
                        Some(Ok(WsMessage::Pong(data))) => ctx.shared.resolve_ping(&data),
                        Some(Ok(WsMessage::Binary(_))) => {
                            log::debug!("[Hub] Ignoring binary frame");
                        }
                        Some(Ok(WsMessage::Close { code, reason })) => {
                            log::info!("[Hub] Closed by hub ({}): {}", code, reason);
                            return false;
                        }
                        Some(Err(e)) => {
                            log::warn!("[Hub] {e:#}");
                            return false;
                        }
                        None => return false,
                    }
                }

                _ = keep_alive.tick() => {
                    if last_activity.elapsed() > conn.timing.server_timeout {
                        log::warn!("[Hub] Connection stale ({}s), reconnecting", last_activity.elapsed().as_secs());
                        return false;
                    }
                    // The hub never answers the JSON heartbeat; the ping
                    // frame's automatic pong keeps an idle session fresh.
                    let heartbeat = HubMessage::Pong { session_id: ctx.session_id.clone() };
                    if conn.writer.send_json(&heartbeat).await.is_err()
                        || conn.writer.send_ping(Vec::new()).await.is_err()
                    {
                        return false;
                    }
                }

                _ = &mut *shutdown_rx => {
                    return true;
                }
            }
        }
    }

    /// Handle one text frame. Returns `false` if the connection is unusable.
    async fn handle_text(ctx: &SessionContext, writer: &mut WsWriter, text: &str) -> bool {
        let message = match serde_json::from_str::<HubMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("[Hub] Ignoring hub message ({e}): {}", text);
                return true;
            }
        };

        match message {
            HubMessage::Execute { id, name, params, timeout } => {
                log::debug!("[Hub] Execute {} ({})", name, id);
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.execute(id, name, params, timeout).await });
                true
            }
            HubMessage::Ping => {
                let pong = HubMessage::Pong { session_id: ctx.session_id.clone() };
                writer.send_json(&pong).await.is_ok()
            }
            HubMessage::Response { id, result } => {
                ctx.shared.resolve_request(&id, result);
                true
            }
            HubMessage::Welcome { .. } => {
                log::debug!("[Hub] Ignoring repeated welcome");
                true
            }
            other => {
                log::debug!("[Hub] Unexpected message from hub: {:?}", other);
                true
            }
        }
    }

    async fn outgoing_sender(&self) -> Option<mpsc::UnboundedSender<Outgoing>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.outgoing_tx.clone())
    }
}

#[async_trait]
impl TransportClient for WebSocketTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn start(&self) -> bool {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return true;
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            config: self.config.clone(),
            candidates: self.candidates.clone(),
            session_id: self.session_id.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            shared: Arc::clone(&self.shared),
            outgoing_tx: outgoing_tx.clone(),
        };

        self.shared.set_status(HubStatus::Connecting);
        let established = match ctx.connect_any().await {
            Ok(established) => established,
            Err(e) => {
                log::warn!("[Hub] Failed to connect to {}: {e:#}", self.config.endpoint);
                self.shared.set_error(Some(format!("{e:#}")));
                self.shared.set_status(HubStatus::Disconnected);
                return false;
            }
        };
        self.shared.set_status(HubStatus::Connected {
            endpoint: established.endpoint.clone(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Self::run_connection_loop(ctx, established, outgoing_rx, shutdown_rx));

        *session = Some(Session {
            outgoing_tx,
            shutdown_tx: Some(shutdown_tx),
            task,
        });
        true
    }

    async fn stop(&self) {
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };

        if let Some(tx) = session.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut session.task).await.is_err() {
            log::warn!("[Hub] Session task did not exit in time, aborting");
            session.task.abort();
        }

        self.shared.fail_pending();
        self.shared.set_status(HubStatus::Disconnected);
    }

    async fn verify(&self) -> bool {
        if !self.shared.is_connected() {
            return false;
        }
        let Some(outgoing) = self.outgoing_sender().await else {
            return false;
        };

        let payload = rand::random::<u64>().to_be_bytes().to_vec();
        let (tx, rx) = oneshot::channel();
        self.shared
            .ping_waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(payload.clone(), tx);

        if outgoing.send(Outgoing::Ping(payload.clone())).is_err() {
            self.shared.resolve_ping(&payload);
            return false;
        }

        let answered = matches!(tokio::time::timeout(VERIFY_TIMEOUT, rx).await, Ok(Ok(())));
        if !answered {
            self.shared
                .ping_waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&payload);
            log::warn!("[Hub] Verify ping was not answered");
        }
        answered
    }

    async fn send_command(&self, command_json: &str) -> Result<String, TransportError> {
        let outgoing = self
            .outgoing_sender()
            .await
            .ok_or_else(|| TransportError::InvalidOperation("websocket transport is not started".into()))?;
        if !self.shared.is_connected() {
            return Err(TransportError::SendFailed("hub is not connected".into()));
        }

        let command = serde_json::from_str::<Value>(command_json)
            .unwrap_or_else(|_| Value::String(command_json.to_string()));
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);

        if outgoing
            .send(Outgoing::Message(HubMessage::Request { id: id.clone(), command }))
            .is_err()
        {
            self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.config.command_timeout, rx).await {
            Ok(Ok(result)) => Ok(match result {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    fn state(&self) -> TransportState {
        match self.shared.status() {
            HubStatus::Connected { endpoint } => TransportState::connected(self.name())
                .with_session_id(Some(self.session_id.clone()))
                .with_details(Some(format!("connected to {endpoint}"))),
            HubStatus::Reconnecting { attempt, next_retry_ms } => TransportState::disconnected(
                self.name(),
                Some(self.shared.last_error().unwrap_or_else(|| "reconnecting".into())),
            )
            .with_session_id(Some(self.session_id.clone()))
            .with_details(Some(format!("reconnect attempt {attempt} in {next_retry_ms}ms"))),
            HubStatus::Connecting => TransportState::disconnected(self.name(), self.shared.last_error())
                .with_details(Some("connecting".into())),
            HubStatus::Disconnected => TransportState::disconnected(self.name(), self.shared.last_error()),
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.task.abort();
        }
    }
}

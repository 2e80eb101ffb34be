//! Command dispatch seam between the transports and the editor.
//!
//! Transports never interpret commands: they hand the raw JSON string to a
//! [`CommandDispatcher`] and write back whatever JSON string it returns.
//!
//! Two building blocks live here:
//!
//! - [`CommandRouter`] maps the command's `type` to a registered handler and
//!   wraps the outcome in the `{"status": ..., "result"|"error": ...}`
//!   envelope clients expect.
//! - [`MainThreadQueue`] / [`MainThreadPump`] marshal commands from the
//!   network tasks onto the single loop that is allowed to touch editor
//!   state. The loop drives the pump; the transports only see a dispatcher.
//!
//! ```text
//! read task ──dispatch()──▶ MainThreadQueue ──mpsc──▶ MainThreadPump ──▶ CommandRouter
//!     ▲                                                      │
//!     └───────────────────── oneshot reply ◀─────────────────┘
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

/// Receives raw command JSON and returns a JSON result string.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Process one command. Failures are reported inside the returned JSON.
    async fn dispatch(&self, command_json: &str) -> String;
}

/// Handler for a single command type.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = Result<Value, String>>`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command with its `params` object.
    async fn handle(&self, params: Value) -> Result<Value, String>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send,
{
    async fn handle(&self, params: Value) -> Result<Value, String> {
        (self)(params).await
    }
}

/// Wrap a successful result in the response envelope.
pub fn success_envelope(result: Value) -> String {
    json!({ "status": "success", "result": result }).to_string()
}

/// Wrap a failure message in the response envelope.
pub fn error_envelope(message: &str) -> String {
    json!({ "status": "error", "error": message }).to_string()
}

/// Response to a liveness ping.
pub fn pong_response() -> String {
    success_envelope(json!({ "message": "pong" }))
}

/// Whether a response string is the pong envelope.
pub fn is_pong(response: &str) -> bool {
    serde_json::from_str::<Value>(response)
        .ok()
        .and_then(|v| {
            v.get("result")
                .and_then(|r| r.get("message"))
                .and_then(Value::as_str)
                .map(|m| m == "pong")
        })
        .unwrap_or(false)
}

/// Whether a payload is a liveness ping.
///
/// Accepts the bare text `ping` and JSON objects with `"type": "ping"`.
pub fn is_ping(payload: &str) -> bool {
    let trimmed = payload.trim();
    if trimmed.eq_ignore_ascii_case("ping") {
        return true;
    }
    if !trimmed.starts_with('{') {
        return false;
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "ping"))
        .unwrap_or(false)
}

/// Routes commands by their `type` field to registered handlers.
pub struct CommandRouter {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("CommandRouter")
            .field("handlers", &names)
            .finish()
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    /// Create a router with the built-in `ping` handler.
    pub fn new() -> Self {
        let mut router = Self {
            handlers: HashMap::new(),
        };
        router.register("ping", |_params: Value| async { Ok(json!({ "message": "pong" })) });
        router
    }

    /// Register (or replace) the handler for a command type.
    pub fn register<H>(&mut self, command_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(command_type.into(), Arc::new(handler));
        self
    }
}

#[async_trait]
impl CommandDispatcher for CommandRouter {
    async fn dispatch(&self, command_json: &str) -> String {
        let command: Value = match serde_json::from_str(command_json) {
            Ok(value) => value,
            Err(e) => return error_envelope(&format!("Invalid JSON format: {e}")),
        };

        let Some(command_type) = command.get("type").and_then(Value::as_str) else {
            return error_envelope("Command is missing a 'type' field");
        };

        let Some(handler) = self.handlers.get(command_type).cloned() else {
            return error_envelope(&format!("Unknown command type: {command_type}"));
        };

        let params = command.get("params").cloned().unwrap_or_else(|| json!({}));
        match handler.handle(params).await {
            Ok(result) => success_envelope(result),
            Err(e) => {
                log::warn!("[Dispatch] Command '{}' failed: {}", command_type, e);
                error_envelope(&e)
            }
        }
    }
}

/// A command waiting for the editor loop.
#[derive(Debug)]
struct QueuedCommand {
    command: String,
    reply: oneshot::Sender<String>,
}

/// Dispatcher half handed to the transports.
///
/// Cloneable; every clone feeds the same [`MainThreadPump`].
#[derive(Debug, Clone)]
pub struct MainThreadQueue {
    tx: mpsc::UnboundedSender<QueuedCommand>,
}

/// Consumer half driven by the editor loop.
pub struct MainThreadPump {
    rx: mpsc::UnboundedReceiver<QueuedCommand>,
    inner: Arc<dyn CommandDispatcher>,
}

impl std::fmt::Debug for MainThreadPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadPump").finish_non_exhaustive()
    }
}

/// Create a queue/pump pair in front of `inner`.
pub fn main_thread_queue(inner: Arc<dyn CommandDispatcher>) -> (MainThreadQueue, MainThreadPump) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MainThreadQueue { tx }, MainThreadPump { rx, inner })
}

#[async_trait]
impl CommandDispatcher for MainThreadQueue {
    async fn dispatch(&self, command_json: &str) -> String {
        let (reply, reply_rx) = oneshot::channel();
        let queued = QueuedCommand {
            command: command_json.to_string(),
            reply,
        };
        if self.tx.send(queued).is_err() {
            return error_envelope("Editor main loop is not running");
        }
        match reply_rx.await {
            Ok(response) => response,
            Err(_) => error_envelope("Editor main loop dropped the command"),
        }
    }
}

impl MainThreadPump {
    /// Run every command queued right now, in arrival order.
    ///
    /// Call once per editor tick. Returns the number of commands processed.
    pub async fn run_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(queued) = self.rx.try_recv() {
            self.process(queued).await;
            processed += 1;
        }
        processed
    }

    /// Run commands until every [`MainThreadQueue`] clone is dropped.
    pub async fn run(mut self) {
        while let Some(queued) = self.rx.recv().await {
            self.process(queued).await;
        }
        log::debug!("[Dispatch] Main-thread queue closed");
    }

    async fn process(&self, queued: QueuedCommand) {
        let response = self.inner.dispatch(&queued.command).await;
        // The requester may have given up (connection evicted); nothing to do.
        let _ = queued.reply.send(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn test_is_ping_variants() {
        assert!(is_ping("ping"));
        assert!(is_ping("  PING\n"));
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping(r#"{"type":"manage_scene"}"#));
        assert!(!is_ping("pong"));
        assert!(!is_ping("{not json"));
    }

    #[test]
    fn test_pong_response_shape() {
        let v = parse(&pong_response());
        assert_eq!(v["status"], "success");
        assert_eq!(v["result"]["message"], "pong");
        assert!(is_pong(&pong_response()));
        assert!(!is_pong(&success_envelope(json!({ "message": "ok" }))));
        assert!(!is_pong("pong"));
    }

    #[tokio::test]
    async fn test_router_builtin_ping() {
        let router = CommandRouter::new();
        let v = parse(&router.dispatch(r#"{"type":"ping"}"#).await);
        assert_eq!(v["result"]["message"], "pong");
    }

    #[tokio::test]
    async fn test_router_passes_params_to_handler() {
        let mut router = CommandRouter::new();
        router.register("echo", |params: Value| async move { Ok(params) });

        let v = parse(&router.dispatch(r#"{"type":"echo","params":{"x":1}}"#).await);
        assert_eq!(v["status"], "success");
        assert_eq!(v["result"]["x"], 1);
    }

    #[tokio::test]
    async fn test_router_handler_error_is_enveloped() {
        let mut router = CommandRouter::new();
        router.register("fail", |_: Value| async { Err("boom".to_string()) });

        let v = parse(&router.dispatch(r#"{"type":"fail"}"#).await);
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"], "boom");
    }

    #[tokio::test]
    async fn test_router_rejects_unknown_and_malformed() {
        let router = CommandRouter::new();

        let v = parse(&router.dispatch(r#"{"type":"nope"}"#).await);
        assert_eq!(v["status"], "error");
        assert!(v["error"].as_str().unwrap().contains("nope"));

        let v = parse(&router.dispatch("{oops").await);
        assert!(v["error"].as_str().unwrap().starts_with("Invalid JSON"));

        let v = parse(&router.dispatch(r#"{"params":{}}"#).await);
        assert_eq!(v["status"], "error");
    }

    #[tokio::test]
    async fn test_main_thread_queue_round_trip() {
        let (queue, pump) = main_thread_queue(Arc::new(CommandRouter::new()));
        let pump_task = tokio::spawn(pump.run());

        let v = parse(&queue.dispatch(r#"{"type":"ping"}"#).await);
        assert_eq!(v["result"]["message"], "pong");

        drop(queue);
        pump_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_pending_drains_in_order() {
        let (queue, mut pump) = main_thread_queue(Arc::new(CommandRouter::new()));

        let q1 = queue.clone();
        let q2 = queue.clone();
        let first = tokio::spawn(async move { q1.dispatch(r#"{"type":"ping"}"#).await });
        let second = tokio::spawn(async move { q2.dispatch(r#"{"type":"nope"}"#).await });

        // Let both requests reach the queue.
        let mut processed = 0;
        while processed < 2 {
            tokio::task::yield_now().await;
            processed += pump.run_pending().await;
        }

        assert_eq!(parse(&first.await.unwrap())["status"], "success");
        assert_eq!(parse(&second.await.unwrap())["status"], "error");
    }

    #[tokio::test]
    async fn test_dropped_pump_reports_error() {
        let (queue, pump) = main_thread_queue(Arc::new(CommandRouter::new()));
        drop(pump);

        let v = parse(&queue.dispatch(r#"{"type":"ping"}"#).await);
        assert_eq!(v["status"], "error");
    }
}

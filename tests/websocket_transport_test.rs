//! Integration tests for the websocket hub transport.
//!
//! A small in-process hub built on `tokio-tungstenite` plays the server
//! side: welcome, register, execute/command_result and request/response.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use unity_mcp_bridge::transport::{HubConfig, WebSocketTransport};
use unity_mcp_bridge::{CommandRouter, TransportClient, TransportError};

const WAIT: Duration = Duration::from_secs(5);

/// Text the test can push to the hub's live connection.
enum HubCommand {
    Send(Value),
    Close,
}

/// In-process hub accepting plugin connections.
struct MockHub {
    port: u16,
    received: mpsc::UnboundedReceiver<Value>,
    inject: mpsc::UnboundedSender<HubCommand>,
    connections: Arc<AtomicUsize>,
}

impl MockHub {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (inject, inject_rx) = mpsc::unbounded_channel();
        let inject_rx = Arc::new(Mutex::new(inject_rx));
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let received_tx = received_tx.clone();
                let inject_rx = Arc::clone(&inject_rx);
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    serve_connection(ws, received_tx, inject_rx).await;
                });
            }
        });

        Self {
            port,
            received,
            inject,
            connections,
        }
    }

    fn endpoint(&self) -> String {
        format!("ws://127.0.0.1:{}/hub/plugin", self.port)
    }

    /// Next message from the plugin with the given type, skipping heartbeats.
    async fn expect(&mut self, message_type: &str) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, self.received.recv())
                .await
                .unwrap_or_else(|_| panic!("no {message_type} from plugin"))
                .unwrap();
            if message["type"] == message_type {
                return message;
            }
        }
    }

    fn send(&self, message: Value) {
        assert!(self.inject.send(HubCommand::Send(message)).is_ok());
    }
}

async fn serve_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    received_tx: mpsc::UnboundedSender<Value>,
    inject_rx: Arc<Mutex<mpsc::UnboundedReceiver<HubCommand>>>,
) {
    let (mut sink, mut stream) = ws.split();
    let welcome = json!({"type": "welcome", "serverTimeout": 30, "keepAliveInterval": 15});
    if sink.send(Message::Text(welcome.to_string())).await.is_err() {
        return;
    }

    let mut inject_rx = inject_rx.lock().await;
    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else { return };
                let Message::Text(text) = message else { continue };
                let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };

                if value["type"] == "request" {
                    let response = json!({
                        "type": "response",
                        "id": value["id"],
                        "result": {"handled": value["command"]["type"]},
                    });
                    if sink.send(Message::Text(response.to_string())).await.is_err() {
                        return;
                    }
                }
                let _ = received_tx.send(value);
            }
            command = inject_rx.recv() => {
                match command {
                    Some(HubCommand::Send(value)) => {
                        if sink.send(Message::Text(value.to_string())).await.is_err() {
                            return;
                        }
                    }
                    Some(HubCommand::Close) | None => {
                        let _ = sink.close().await;
                        return;
                    }
                }
            }
        }
    }
}

fn transport(endpoint: String) -> WebSocketTransport {
    let mut router = CommandRouter::new();
    router.register("echo", |params: Value| async move { Ok::<_, String>(params) });
    router.register("slow", |_params: Value| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, String>(json!({}))
    });

    WebSocketTransport::new(
        HubConfig {
            endpoint,
            project_name: "Game".into(),
            project_hash: "0123456789abcdef".into(),
            unity_version: "6000.0.1f1".into(),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(2),
        },
        Arc::new(router),
    )
    .unwrap()
}

#[tokio::test]
async fn test_start_registers_with_hub() {
    let mut hub = MockHub::start().await;
    let transport = transport(hub.endpoint());

    assert!(transport.start().await);
    let register = hub.expect("register").await;
    assert_eq!(register["session_id"], transport.session_id());
    assert_eq!(register["project_name"], "Game");
    assert_eq!(register["project_hash"], "0123456789abcdef");
    assert_eq!(register["unity_version"], "6000.0.1f1");

    let state = transport.state();
    assert!(state.is_connected());
    assert_eq!(state.transport_name(), "websocket");
    assert_eq!(state.session_id(), Some(transport.session_id()));

    transport.stop().await;
    assert!(!transport.state().is_connected());
}

#[tokio::test]
async fn test_execute_returns_command_result() {
    let mut hub = MockHub::start().await;
    let transport = transport(hub.endpoint());
    assert!(transport.start().await);
    hub.expect("register").await;

    hub.send(json!({"type": "execute", "id": "cmd-1", "name": "echo", "params": {"x": 1}}));
    let result = hub.expect("command_result").await;
    assert_eq!(result["id"], "cmd-1");
    assert_eq!(result["result"]["status"], "success");
    assert_eq!(result["result"]["result"]["x"], 1);

    hub.send(json!({"type": "execute", "id": "cmd-2", "name": "nope"}));
    let result = hub.expect("command_result").await;
    assert_eq!(result["id"], "cmd-2");
    assert_eq!(result["result"]["status"], "error");

    transport.stop().await;
}

#[tokio::test]
async fn test_execute_timeout_reports_error() {
    let mut hub = MockHub::start().await;
    let transport = transport(hub.endpoint());
    assert!(transport.start().await);
    hub.expect("register").await;

    hub.send(json!({"type": "execute", "id": "cmd-slow", "name": "slow", "timeout": 0.2}));
    let result = hub.expect("command_result").await;
    assert_eq!(result["id"], "cmd-slow");
    assert_eq!(result["result"]["status"], "error");
    assert!(result["result"]["error"].as_str().unwrap().contains("timed out"));

    transport.stop().await;
}

#[tokio::test]
async fn test_hub_ping_is_answered_with_session_pong() {
    let mut hub = MockHub::start().await;
    let transport = transport(hub.endpoint());
    assert!(transport.start().await);
    hub.expect("register").await;

    hub.send(json!({"type": "ping"}));
    let pong = hub.expect("pong").await;
    assert_eq!(pong["session_id"], transport.session_id());

    transport.stop().await;
}

#[tokio::test]
async fn test_verify_round_trips_ping_frame() {
    let mut hub = MockHub::start().await;
    let transport = transport(hub.endpoint());

    assert!(!transport.verify().await, "not started");
    assert!(transport.start().await);
    hub.expect("register").await;
    assert!(transport.verify().await);

    transport.stop().await;
    assert!(!transport.verify().await);
}

#[tokio::test]
async fn test_send_command_uses_request_response() {
    let mut hub = MockHub::start().await;
    let transport = transport(hub.endpoint());

    assert!(matches!(
        transport.send_command(r#"{"type":"bake"}"#).await,
        Err(TransportError::InvalidOperation(_))
    ));

    assert!(transport.start().await);
    hub.expect("register").await;

    let response = transport.send_command(r#"{"type":"bake"}"#).await.unwrap();
    let response: Value = serde_json::from_str(&response).unwrap();
    assert_eq!(response["handled"], "bake");

    let request = hub.expect("request").await;
    assert_eq!(request["command"]["type"], "bake");

    transport.stop().await;
}

#[tokio::test]
async fn test_reconnects_with_same_session_after_hub_drop() {
    let mut hub = MockHub::start().await;
    let transport = transport(hub.endpoint());
    assert!(transport.start().await);
    let first = hub.expect("register").await;

    assert!(hub.inject.send(HubCommand::Close).is_ok());

    // Backoff starts at one second plus jitter.
    let second = hub.expect("register").await;
    assert_eq!(first["session_id"], second["session_id"]);
    assert_eq!(hub.connections.load(Ordering::SeqCst), 2);

    tokio::time::timeout(WAIT, async {
        while !transport.state().is_connected() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    transport.stop().await;
}

#[tokio::test]
async fn test_idle_hub_connection_is_not_stale() {
    // A hub that only welcomes and then reads, never sending a frame itself.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let welcome = json!({"type": "welcome", "serverTimeout": 2, "keepAliveInterval": 1});
                if ws.send(Message::Text(welcome.to_string())).await.is_err() {
                    return;
                }
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    let transport = transport(format!("ws://127.0.0.1:{port}/hub/plugin"));
    assert!(transport.start().await);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert!(transport.state().is_connected());

    transport.stop().await;
}

#[tokio::test]
async fn test_start_fails_without_hub() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = transport(format!("ws://127.0.0.1:{port}/hub/plugin"));
    assert!(!transport.start().await);

    let state = transport.state();
    assert!(!state.is_connected());
    assert!(state.error().is_some());
}

#[test]
fn test_invalid_endpoint_is_rejected_at_construction() {
    let result = WebSocketTransport::new(
        HubConfig {
            endpoint: "ftp://localhost/hub".into(),
            project_name: "Game".into(),
            project_hash: "0".into(),
            unity_version: "unknown".into(),
            connect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
        },
        Arc::new(CommandRouter::new()),
    );
    assert!(matches!(result, Err(TransportError::Configuration(_))));
}

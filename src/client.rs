//! Out-of-process client for the stdio bridge.
//!
//! Connects to the loopback host, checks that the handshake line advertises
//! `FRAMING=1` and then exchanges length-prefixed frames. Used by port
//! discovery, the `ping` subcommand and the integration tests.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;

use crate::constants::{HANDSHAKE_TIMEOUT, MAX_HANDSHAKE_LEN};
use crate::dispatch::is_pong;
use crate::transport::framing::{handshake_advertises_framing, read_frame, write_frame};

/// A connected, handshaken bridge client.
#[derive(Debug)]
pub struct BridgeClient {
    reader: BufReader<TcpStream>,
    handshake: String,
    port: u16,
}

impl BridgeClient {
    /// Connect to `127.0.0.1:port` and perform the handshake.
    ///
    /// `timeout` bounds the TCP connect; the handshake read is bounded by
    /// [`HANDSHAKE_TIMEOUT`].
    pub async fn connect(port: u16, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port)))
            .await
            .with_context(|| format!("Timed out connecting to bridge on port {port}"))?
            .with_context(|| format!("Failed to connect to bridge on port {port}"))?;
        stream.set_nodelay(true)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        let mut limited = (&mut reader).take(MAX_HANDSHAKE_LEN);
        let read = tokio::time::timeout(HANDSHAKE_TIMEOUT, limited.read_line(&mut line))
            .await
            .context("Timed out waiting for bridge handshake")?
            .context("Failed to read bridge handshake")?;

        if read == 0 {
            bail!("Bridge closed the connection before the handshake");
        }
        if !handshake_advertises_framing(&line) {
            bail!("Bridge handshake does not advertise FRAMING=1: {:?}", line.trim_end());
        }

        log::debug!("[Client] Connected to bridge on port {}: {}", port, line.trim_end());
        Ok(Self {
            reader,
            handshake: line.trim_end().to_string(),
            port,
        })
    }

    /// The handshake line the host sent, without the newline.
    pub fn handshake(&self) -> &str {
        &self.handshake
    }

    /// Port this client is connected to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one payload and wait for its response frame.
    pub async fn request(&mut self, payload: &str) -> Result<String> {
        write_frame(self.reader.get_mut(), payload.as_bytes()).await?;
        let response = read_frame(&mut self.reader).await?;
        String::from_utf8(response).context("Bridge response is not valid UTF-8")
    }

    /// Send a `{"type", "params"}` command and parse the JSON response.
    pub async fn send_command(&mut self, command_type: &str, params: Value) -> Result<Value> {
        let command = json!({ "type": command_type, "params": params });
        let response = self.request(&command.to_string()).await?;
        serde_json::from_str(&response).context("Bridge response is not valid JSON")
    }

    /// Liveness ping. Returns whether the host answered with a pong.
    pub async fn ping(&mut self) -> Result<bool> {
        let response = self.request("ping").await?;
        Ok(is_pong(&response))
    }
}

/// Whether a bridge on `port` answers a framed ping within `timeout`.
pub async fn probe_bridge(port: u16, timeout: Duration) -> bool {
    let attempt = async {
        let mut client = BridgeClient::connect(port, timeout).await?;
        client.ping().await
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(answered)) => answered,
        Ok(Err(e)) => {
            log::debug!("[Client] Probe of port {} failed: {e:#}", port);
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_rejects_handshake_without_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"MCP/0.1\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let err = BridgeClient::connect(port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("FRAMING=1"), "{err}");
    }

    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        assert!(BridgeClient::connect(port, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_false() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!probe_bridge(port, Duration::from_millis(200)).await);
    }
}

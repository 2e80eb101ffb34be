//! Per-connection state for stdio bridge clients (host side).
//!
//! Each accepted TCP connection gets a [`BridgeClientConn`] that owns a read
//! task and a write task. The read task decodes frames, answers them through
//! [`handle_payload`] and queues the framed reply for the write task.
//!
//! The host keeps at most one connection in a [`ClientSlot`]. Installing a new
//! connection hands back the previous one so the caller can close it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use super::framing::{encode_frame, FrameDecoder, HANDSHAKE_LINE};
use crate::constants::READ_BUFFER_SIZE;
use crate::dispatch::{error_envelope, is_ping, pong_response, CommandDispatcher};

/// Answer one request payload.
///
/// Pings are answered locally; everything else goes to the dispatcher.
/// Shared by socket clients and the host's in-process loopback.
pub(crate) async fn handle_payload(payload: &[u8], dispatcher: &dyn CommandDispatcher) -> String {
    let Ok(text) = std::str::from_utf8(payload) else {
        return error_envelope("Payload is not valid UTF-8");
    };
    if is_ping(text) {
        return pong_response();
    }
    dispatcher.dispatch(text).await
}

/// Host-side connection state for a single bridge client.
pub struct BridgeClientConn {
    /// Unique identifier for this client.
    client_id: String,
    /// Write channel; the write task exits once this and the read task's
    /// clone are dropped.
    #[allow(dead_code, reason = "held only to keep the write channel open")]
    frame_tx: UnboundedSender<Vec<u8>>,
    /// Set by the read task before it releases the slot.
    closed: Arc<AtomicBool>,
    /// Handle to the read task (for cleanup).
    read_handle: JoinHandle<()>,
    /// Handle to the write task (for cleanup).
    write_handle: JoinHandle<()>,
}

impl std::fmt::Debug for BridgeClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClientConn")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl BridgeClientConn {
    /// Spawn the read and write tasks for an accepted connection.
    ///
    /// The handshake line is queued before anything else, so it is always
    /// the first thing the client reads. When the connection ends, the read
    /// task releases `slot` for this client id.
    pub(crate) fn spawn(
        client_id: String,
        stream: TcpStream,
        dispatcher: Arc<dyn CommandDispatcher>,
        slot: Arc<ClientSlot>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Receiver is alive, the write task has not started yet.
        let _ = frame_tx.send(HANDSHAKE_LINE.as_bytes().to_vec());

        let closed = Arc::new(AtomicBool::new(false));
        let read_handle = tokio::spawn(Self::read_loop(
            client_id.clone(),
            read_half,
            frame_tx.clone(),
            dispatcher,
            slot,
            Arc::clone(&closed),
        ));

        let write_handle = tokio::spawn(Self::write_loop(client_id.clone(), write_half, frame_rx));

        Self {
            client_id,
            frame_tx,
            closed,
            read_handle,
            write_handle,
        }
    }

    /// Client identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Disconnect this client, aborting read/write tasks.
    ///
    /// Dropping the socket halves closes the connection from our side.
    pub fn disconnect(self) {
        log::debug!("[Bridge] Closing client {}", self.client_id);
        self.read_handle.abort();
        self.write_handle.abort();
    }

    /// Read loop: decodes frames, answers each one in order.
    async fn read_loop(
        client_id: String,
        mut reader: OwnedReadHalf,
        frame_tx: UnboundedSender<Vec<u8>>,
        dispatcher: Arc<dyn CommandDispatcher>,
        slot: Arc<ClientSlot>,
        closed: Arc<AtomicBool>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        'read: loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    log::info!("[Bridge] Client disconnected: {}", client_id);
                    break;
                }
                Ok(n) => match decoder.feed(&buf[..n]) {
                    Ok(payloads) => {
                        for payload in payloads {
                            let response = handle_payload(&payload, dispatcher.as_ref()).await;
                            let frame = match encode_frame(response.as_bytes()) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::error!("[Bridge] Cannot frame response for {}: {e}", client_id);
                                    continue;
                                }
                            };
                            if frame_tx.send(frame).is_err() {
                                log::debug!("[Bridge] Write side gone for {}", client_id);
                                break 'read;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("[Bridge] Protocol violation from {}: {e}", client_id);
                        break;
                    }
                },
                Err(e) => {
                    log::warn!("[Bridge] Read error for {}: {e}", client_id);
                    break;
                }
            }
        }

        // Dropping our own entry closes the frame channel; the write task
        // flushes what is queued and shuts the socket down.
        closed.store(true, Ordering::Release);
        drop(slot.release(&client_id));
    }

    /// Write loop: receives queued bytes and writes them to the socket.
    async fn write_loop(
        client_id: String,
        mut writer: OwnedWriteHalf,
        mut frame_rx: UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(data) = frame_rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                log::warn!("[Bridge] Write error for {}: {e}", client_id);
                break;
            }
        }
        let _ = writer.shutdown().await;
    }
}

/// Holder for the single live bridge connection.
///
/// Every operation is one short critical section, so readers never see a
/// half-replaced connection.
#[derive(Debug, Default)]
pub struct ClientSlot {
    current: Mutex<Option<BridgeClientConn>>,
}

impl ClientSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `conn` as the live client, returning the one it replaces.
    ///
    /// A connection that already closed is dropped instead of installed, so
    /// its write task can flush and exit.
    pub fn install(&self, conn: BridgeClientConn) -> Option<BridgeClientConn> {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if conn.closed.load(Ordering::Acquire) {
            log::debug!("[Bridge] Client {} closed before it was installed", conn.client_id);
            return guard.take();
        }
        guard.replace(conn)
    }

    /// Clear the slot only if it still holds `client_id`.
    pub fn release(&self, client_id: &str) -> Option<BridgeClientConn> {
        let mut guard = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.as_ref().is_some_and(|c| c.client_id == client_id) {
            guard.take()
        } else {
            None
        }
    }

    /// Remove whatever connection is installed.
    pub fn take(&self) -> Option<BridgeClientConn> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Id of the live client, if any.
    pub fn current_id(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.client_id.clone())
    }
}

//! Wire protocol codec for the stdio bridge.
//!
//! Every message in either direction is a length-prefixed frame:
//!
//! ```text
//! [u64 BE length] [payload: length bytes]
//! ```
//!
//! A length of zero or above [`MAX_FRAME_SIZE`] is a protocol violation.
//! There is no resync: the connection carrying it is dropped.
//!
//! Before any frame, the host writes one newline-terminated handshake line
//! ([`HANDSHAKE_LINE`]) advertising `FRAMING=1`.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{FRAMING_TOKEN, FRAME_HEADER_LEN, MAX_FRAME_SIZE};

pub use crate::constants::HANDSHAKE_LINE;

/// Validate a payload length against the protocol limits.
fn check_length(length: u64) -> Result<()> {
    if length == 0 {
        bail!("Invalid frame: zero length");
    }
    if length > MAX_FRAME_SIZE {
        bail!("Frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
    }
    Ok(())
}

/// Encode a payload into a wire-format frame.
///
/// # Errors
///
/// Returns an error for an empty payload or one above the size limit.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let length = payload.len() as u64;
    check_length(length)?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Returns true if a handshake line advertises the framing capability.
pub fn handshake_advertises_framing(line: &str) -> bool {
    line.contains(FRAMING_TOKEN)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete payloads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete payloads.
    ///
    /// Incomplete data is buffered for the next call. The length header is
    /// validated as soon as it is complete, so an oversized frame is rejected
    /// before its payload arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if a header announces a zero or oversized payload.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                break;
            }

            let mut header = [0u8; FRAME_HEADER_LEN];
            header.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
            let length = u64::from_be_bytes(header);
            check_length(length)?;

            // Bounded by MAX_FRAME_SIZE, fits in usize.
            let total = FRAME_HEADER_LEN + length as usize;
            if self.buf.len() < total {
                break;
            }

            payloads.push(self.buf[FRAME_HEADER_LEN..total].to_vec());
            self.buf.drain(..total);
        }

        Ok(payloads)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Read exactly one frame from a stream.
///
/// # Errors
///
/// Returns an error on EOF, I/O failure, or a length outside the limits.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut header)
        .await
        .context("Connection closed before frame header")?;
    let length = u64::from_be_bytes(header);
    check_length(length)?;

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("Connection closed before frame payload")?;
    Ok(payload)
}

/// Write one frame to a stream and flush it.
///
/// # Errors
///
/// Returns an error for an invalid payload length or an I/O failure.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await.context("Frame write failed")?;
    writer.flush().await.context("Frame flush failed")?;
    Ok(())
}

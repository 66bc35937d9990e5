//! Stream access for the modem AT channel
//!
//! The modem speaks a text protocol: lines terminated by CR/LF, no framing
//! markers and no request identifiers. This module only deals with turning
//! the byte stream into lines; classification happens in the session layer.

use async_trait::async_trait;
use gsmgw_core::{ModemError, ModemResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Command written during the startup flush; enables command echo
pub const FLUSH_COMMAND: &[u8] = b"\rATE1\r";

/// Window of silence that ends the startup flush
pub const FLUSH_WINDOW: Duration = Duration::from_millis(500);

/// Transport layer trait
///
/// Opens the physical channel to the modem and hands back a bidirectional
/// byte stream. The serial implementation is [`crate::SerialTransport`];
/// tests plug in in-memory pipes.
#[async_trait]
pub trait TransportLayer: Send {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open the physical layer connection
    async fn open(&mut self) -> ModemResult<Self::Stream>;
}

/// Line reader over the receive half of the modem channel
///
/// Partially received lines survive a timed-out read, so a later call picks
/// up where the previous one stopped.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Create a new line reader
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            pending: Vec::new(),
        }
    }

    /// Read one line, stripped of surrounding whitespace
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for the line terminator. None waits forever.
    ///
    /// # Errors
    ///
    /// * `ModemError::TransportTimeout` if no complete line arrived in time
    /// * `ModemError::Connection` on IO errors or end of stream
    pub async fn read_line(&mut self, timeout: Option<Duration>) -> ModemResult<String> {
        let n = match timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, self.inner.read_until(b'\n', &mut self.pending))
                    .await
                    .map_err(|_| ModemError::TransportTimeout)??
            }
            None => self.inner.read_until(b'\n', &mut self.pending).await?,
        };

        if n == 0 && self.pending.is_empty() {
            return Err(ModemError::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Modem channel closed",
            )));
        }

        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        Ok(line)
    }

    /// Discard everything received until `window` passes without data
    pub async fn drain(&mut self, window: Duration) -> ModemResult<usize> {
        let mut discarded = self.pending.len();
        self.pending.clear();

        let mut buf = [0u8; 256];
        loop {
            match tokio::time::timeout(window, self.inner.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    return Err(ModemError::Connection(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "Modem channel closed during flush",
                    )));
                }
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(ModemError::Connection(e)),
            }
        }
        Ok(discarded)
    }
}

/// Clear stale bytes buffered by the modem before framing begins
///
/// Sends a benign command, waits `window` and then drains the channel until
/// it has been silent for `window`.
pub async fn blind_flush<R, W>(
    reader: &mut LineReader<R>,
    writer: &mut W,
    window: Duration,
) -> ModemResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(FLUSH_COMMAND).await?;
    writer.flush().await?;
    tokio::time::sleep(window).await;

    let discarded = reader.drain(window).await?;
    log::debug!("Flushed {} stale bytes from modem channel", discarded);
    Ok(())
}

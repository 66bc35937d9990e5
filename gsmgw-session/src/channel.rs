//! AT channel assembly
//!
//! Splits the modem stream into the framer (read side) and the correlator
//! (write side) and wires the two queues between them.

use crate::correlator::Correlator;
use crate::framer::{CommandRound, Framer};
use crate::statistics::SessionStatistics;
use gsmgw_core::ModemResult;
use gsmgw_transport::{blind_flush, LineReader, FLUSH_WINDOW};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, watch, Mutex};

/// Write half of the modem channel, shared by the correlator and the framer's probe
pub(crate) type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Write one command terminated by a carriage return
pub(crate) async fn write_command(writer: &SharedWriter, command: &[u8]) -> ModemResult<()> {
    let mut writer = writer.lock().await;
    writer.write_all(command).await?;
    writer.write_all(b"\r").await?;
    writer.flush().await?;
    Ok(())
}

/// An assembled AT channel
///
/// - `framer` must be spawned (or polled) for anything to arrive
/// - `correlator` issues commands
/// - `notifications` yields URCs in arrival order
pub struct AtChannel<R> {
    pub framer: Framer<R>,
    pub correlator: Correlator,
    pub notifications: mpsc::UnboundedReceiver<String>,
}

impl<S> AtChannel<ReadHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Flush stale modem output, then assemble the channel
    pub async fn open(stream: S) -> ModemResult<Self> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = LineReader::new(read_half);
        blind_flush(&mut reader, &mut write_half, FLUSH_WINDOW).await?;
        Ok(Self::assemble(reader, write_half))
    }

    /// Assemble the channel without the startup flush
    pub fn from_stream(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::assemble(LineReader::new(read_half), write_half)
    }

    fn assemble<W>(reader: LineReader<ReadHalf<S>>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let (last_tx, last_rx) = watch::channel(CommandRound::default());
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let statistics = Arc::new(SessionStatistics::new());

        let framer = Framer::new(
            reader,
            writer.clone(),
            last_rx,
            response_tx,
            notification_tx,
            statistics.clone(),
        );
        let correlator = Correlator::new(writer, last_tx, response_rx, statistics);

        Self {
            framer,
            correlator,
            notifications: notification_rx,
        }
    }
}

//! Transport framer
//!
//! The modem channel carries command echoes, command responses and
//! unsolicited result codes (URCs) interleaved on one text stream, without
//! framing markers or request identifiers. The framer tells them apart:
//!
//! - a line starting with the bytes of the outstanding command is its echo
//!   and opens a response;
//! - any other non-empty line is a URC, including every line received while
//!   no command is outstanding.
//!
//! A response ends on an `OK`/`ERROR` line. The modem does not terminate
//! every response, so when the line goes silent the framer sends a liveness
//! probe (`AT`). An `AT` echo followed by `OK` proves the channel is idle and
//! closes the response; anything else read during the probe round is
//! response content and accumulation resumes.

use crate::channel::{write_command, SharedWriter};
use crate::statistics::SessionStatistics;
use bytes::Bytes;
use gsmgw_core::{ModemError, ModemResult};
use gsmgw_transport::LineReader;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};

/// Silence window that ends response accumulation
pub const SILENCE_TIMEOUT: Duration = Duration::from_millis(200);

/// No-op command used to probe whether the modem finished responding
pub const PROBE_COMMAND: &str = "AT";

/// Final result lines that close a response
pub const SENTINELS: [&str; 2] = ["OK", "ERROR"];

/// Outstanding command register shared with the correlator
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandRound {
    /// Issue counter of the command; 0 when nothing is outstanding
    pub round: u64,
    pub command: Bytes,
}

/// A framed response tagged with the round whose echo opened it
#[derive(Debug)]
pub(crate) struct FramedResponse {
    pub round: u64,
    pub result: ModemResult<String>,
}

/// Classification of a single received line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Blank line, discarded
    Empty,
    /// Echo of the outstanding command; a response follows
    Echo,
    /// Unsolicited result code
    Notification,
}

/// Classify a line against the outstanding command
///
/// An empty `last_command` means no command is outstanding.
pub fn classify(line: &str, last_command: &[u8]) -> LineClass {
    if line.is_empty() {
        LineClass::Empty
    } else if last_command.is_empty() || !line.as_bytes().starts_with(last_command) {
        LineClass::Notification
    } else {
        LineClass::Echo
    }
}

fn is_sentinel(line: &str) -> bool {
    SENTINELS.contains(&line)
}

/// Reads the modem channel and feeds the response and notification queues
///
/// The framer is the only reader of the channel. It runs as its own task
/// until the channel closes.
pub struct Framer<R> {
    reader: LineReader<R>,
    writer: SharedWriter,
    last_command: watch::Receiver<CommandRound>,
    responses: mpsc::UnboundedSender<FramedResponse>,
    notifications: mpsc::UnboundedSender<String>,
    silence: Duration,
    statistics: Arc<SessionStatistics>,
}

impl<R: AsyncRead + Unpin> Framer<R> {
    pub(crate) fn new(
        reader: LineReader<R>,
        writer: SharedWriter,
        last_command: watch::Receiver<CommandRound>,
        responses: mpsc::UnboundedSender<FramedResponse>,
        notifications: mpsc::UnboundedSender<String>,
        statistics: Arc<SessionStatistics>,
    ) -> Self {
        Self {
            reader,
            writer,
            last_command,
            responses,
            notifications,
            silence: SILENCE_TIMEOUT,
            statistics,
        }
    }

    /// Override the silence window
    pub fn with_silence_timeout(mut self, silence: Duration) -> Self {
        self.silence = silence;
        self
    }

    /// Run until the channel closes
    ///
    /// # Errors
    ///
    /// Returns `ModemError::Connection` when the channel reaches end of stream
    /// or fails; this is the only way the framer stops.
    pub async fn run(mut self) -> ModemResult<()> {
        loop {
            let line = self.reader.read_line(None).await?;
            let (class, round) = {
                let outstanding = self.last_command.borrow();
                (classify(&line, &outstanding.command), outstanding.round)
            };

            match class {
                LineClass::Empty => continue,
                LineClass::Notification => {
                    log::debug!("URC <- {:?}", line);
                    self.statistics.increment_notifications();
                    if self.notifications.send(line).is_err() {
                        log::debug!("Notification queue closed, dropping URC");
                    }
                }
                LineClass::Echo => {
                    let result = match self.read_response().await {
                        Err(ModemError::Connection(e)) => return Err(ModemError::Connection(e)),
                        other => other,
                    };
                    self.statistics.increment_responses_framed();
                    if self.responses.send(FramedResponse { round, result }).is_err() {
                        log::debug!("Response queue closed, dropping response");
                    }
                }
            }
        }
    }

    /// Accumulate the lines of one response after its echo
    async fn read_response(&mut self) -> ModemResult<String> {
        let mut lines: Vec<String> = Vec::new();

        loop {
            loop {
                match self.reader.read_line(Some(self.silence)).await {
                    Ok(line) if line.is_empty() => continue,
                    Ok(line) => {
                        let done = is_sentinel(&line);
                        lines.push(line);
                        if done {
                            return Ok(lines.join("\n"));
                        }
                    }
                    Err(ModemError::TransportTimeout) => break,
                    Err(e) => return Err(e),
                }
            }

            // Silence without a sentinel: probe the modem
            self.statistics.increment_probes_sent();
            write_command(&self.writer, PROBE_COMMAND.as_bytes()).await?;

            let probed = self.read_probe_line().await?;
            if probed == PROBE_COMMAND {
                let confirm = self.read_probe_line().await?;
                if confirm == "OK" {
                    return Ok(lines.join("\n"));
                }
                log::debug!("Probe answered with {:?}, response continues", confirm);
                lines.push(confirm);
            } else {
                log::debug!("Probe interrupted by {:?}, response continues", probed);
                lines.push(probed);
            }
        }
    }

    /// Read one non-blank line inside the probe round
    async fn read_probe_line(&mut self) -> ModemResult<String> {
        loop {
            let line = self.reader.read_line(Some(self.silence)).await?;
            if !line.is_empty() {
                return Ok(line);
            }
        }
    }
}

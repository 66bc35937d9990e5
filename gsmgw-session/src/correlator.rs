//! Command correlator
//!
//! Issues AT commands and pairs each with the response the framer
//! assembles. At most one command is outstanding: the response queue
//! receiver doubles as the issue lock, so a second `issue` waits until the
//! first one has drained its response or timed out.
//!
//! Every issue gets a new round number. The framer tags each response with
//! the round whose echo opened it, so a response that lands after its
//! issuer timed out or was cancelled is discarded instead of being handed
//! to the next command.

use crate::channel::{write_command, SharedWriter};
use crate::framer::{CommandRound, FramedResponse};
use crate::statistics::{SessionStatistics, StatisticsSnapshot};
use bytes::Bytes;
use gsmgw_core::{ModemError, ModemResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// Default response timeout for a command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outstanding-command register entry; cleared on drop, including when the
/// issuing future is cancelled
struct Outstanding<'a>(&'a watch::Sender<CommandRound>);

impl<'a> Outstanding<'a> {
    fn set(register: &'a watch::Sender<CommandRound>, round: u64, command: &str) -> Self {
        register.send_replace(CommandRound {
            round,
            command: Bytes::copy_from_slice(command.as_bytes()),
        });
        Self(register)
    }
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.0.send_replace(CommandRound::default());
    }
}

/// Serializes AT command issuance over the shared channel
pub struct Correlator {
    writer: SharedWriter,
    last_command: watch::Sender<CommandRound>,
    responses: Mutex<mpsc::UnboundedReceiver<FramedResponse>>,
    rounds: AtomicU64,
    statistics: Arc<SessionStatistics>,
}

impl Correlator {
    pub(crate) fn new(
        writer: SharedWriter,
        last_command: watch::Sender<CommandRound>,
        responses: mpsc::UnboundedReceiver<FramedResponse>,
        statistics: Arc<SessionStatistics>,
    ) -> Self {
        Self {
            writer,
            last_command,
            responses: Mutex::new(responses),
            rounds: AtomicU64::new(0),
            statistics,
        }
    }

    /// Issue a command and wait for its response
    ///
    /// The command text is recorded as the outstanding command before it is
    /// written, so the framer can recognise its echo. The record is cleared
    /// once the round trip ends.
    ///
    /// # Arguments
    /// * `command` - Command text without the trailing carriage return
    /// * `timeout` - Maximum time to wait for the framed response
    ///
    /// # Errors
    /// * `ModemError::CommandTimeout` if no response was framed in time
    /// * `ModemError::TransportTimeout` if the framer's probe round timed out
    /// * `ModemError::Connection` if the channel is gone
    pub async fn issue(&self, command: &str, timeout: Duration) -> ModemResult<String> {
        let mut responses = self.responses.lock().await;
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;

        let outstanding = Outstanding::set(&self.last_command, round, command);
        self.statistics.increment_commands_issued();

        let result = match write_command(&self.writer, command.as_bytes()).await {
            Err(e) => Err(e),
            Ok(()) => self.await_round(&mut responses, round, command, timeout).await,
        };

        drop(outstanding);

        match &result {
            Ok(response) => log::debug!("{} -> {:?}", command, response),
            Err(e) => log::debug!("{} -> {}", command, e),
        }
        result
    }

    /// Wait for the response of `round`, discarding responses of earlier rounds
    async fn await_round(
        &self,
        responses: &mut mpsc::UnboundedReceiver<FramedResponse>,
        round: u64,
        command: &str,
        timeout: Duration,
    ) -> ModemResult<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, responses.recv()).await {
                Err(_) => {
                    self.statistics.increment_command_timeouts();
                    return Err(ModemError::CommandTimeout(command.to_string()));
                }
                Ok(None) => {
                    return Err(ModemError::Connection(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "Framer stopped",
                    )));
                }
                Ok(Some(framed)) if framed.round != round => {
                    log::warn!(
                        "Discarding stale response of round {}: {:?}",
                        framed.round,
                        framed.result
                    );
                }
                Ok(Some(framed)) => return framed.result,
            }
        }
    }

    /// Issue a command with [`DEFAULT_COMMAND_TIMEOUT`]
    pub async fn cmd(&self, command: &str) -> ModemResult<String> {
        self.issue(command, DEFAULT_COMMAND_TIMEOUT).await
    }

    /// Issue a command and require an `OK` final line
    pub async fn cmd_ok(&self, command: &str) -> ModemResult<String> {
        let response = self.cmd(command).await?;
        Self::verify_ok(&response)?;
        Ok(response)
    }

    /// Check that a response ends with an `OK` line
    ///
    /// # Errors
    /// Returns `ModemError::CommandError` carrying the raw response otherwise
    pub fn verify_ok(response: &str) -> ModemResult<()> {
        match response.lines().last().map(str::trim) {
            Some("OK") => Ok(()),
            _ => Err(ModemError::CommandError(response.to_string())),
        }
    }

    /// Snapshot of the session counters
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }
}

//! In-memory modem for tests
//!
//! [`FakeModem`] sits on one end of a `tokio::io::duplex` pipe and behaves
//! like an echoing AT modem: every command is echoed, then the responder's
//! reply is written. URCs can be injected at any time.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Format response lines the way the modem does (`\r\n<line>\r\n`)
pub fn lines(lines: &[&str]) -> Option<String> {
    Some(lines.iter().map(|line| format!("\r\n{}\r\n", line)).collect())
}

/// Scripted echoing modem
pub struct FakeModem {
    commands: Arc<Mutex<Vec<String>>>,
    urcs: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl FakeModem {
    /// Spawn the modem task and return the host end of the pipe
    ///
    /// `responder` maps each received command to the raw text written after
    /// its echo. `None` echoes the command and then stays silent.
    pub fn spawn<F>(mut responder: F) -> (FakeModem, DuplexStream)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        let (host, modem) = tokio::io::duplex(64 * 1024);
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (urc_tx, mut urc_rx) = mpsc::unbounded_channel::<String>();

        let recorded = commands.clone();
        let task = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(modem);
            let mut reader = BufReader::new(read_half);
            let mut buf = Vec::new();

            loop {
                tokio::select! {
                    read = reader.read_until(b'\r', &mut buf) => {
                        match read {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        let command = String::from_utf8_lossy(&buf)
                            .trim_matches(|c| c == '\r' || c == '\n')
                            .to_string();
                        buf.clear();
                        if command.is_empty() {
                            continue;
                        }

                        recorded.lock().unwrap().push(command.clone());
                        let reply = responder(&command).unwrap_or_else(|| "\r\n".to_string());
                        let out = format!("{}\r{}", command, reply);
                        if write_half.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    urc = urc_rx.recv() => {
                        let Some(urc) = urc else { continue };
                        let out = format!("\r\n{}\r\n", urc);
                        if write_half.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        (
            FakeModem {
                commands,
                urcs: urc_tx,
                task,
            },
            host,
        )
    }

    /// Every command received so far, probes included
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Received commands without the `AT` liveness probes
    pub fn commands_without_probes(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|command| command != "AT")
            .collect()
    }

    /// Write an unsolicited result code to the host
    pub fn send_urc(&self, urc: &str) {
        let _ = self.urcs.send(urc.to_string());
    }
}

impl Drop for FakeModem {
    fn drop(&mut self) {
        self.task.abort();
    }
}

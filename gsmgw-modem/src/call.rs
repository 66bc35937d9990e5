//! Incoming call handling
//!
//! A `RING` while idle is resolved against the active call list
//! (`AT+CLCC`). A mobile-terminated voice call in the incoming state is handed
//! to the [`CallForwarder`] as its own task, which the dispatcher cancels when
//! the network reports a disconnect. However the task ends, the call is hung
//! up and the active flag cleared before it terminates.

use crate::forwarder::CallForwarder;
use gsmgw_core::ModemResult;
use gsmgw_session::Correlator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `+CLCC` direction: mobile terminated
pub const DIRECTION_MT: u8 = 1;
/// `+CLCC` state: incoming
pub const STATE_INCOMING: u8 = 4;
/// `+CLCC` mode: voice
pub const MODE_VOICE: u8 = 0;

/// One row of the active call list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCall {
    pub index: u32,
    pub direction: u8,
    pub state: u8,
    pub mode: u8,
    pub multiparty: bool,
    /// Caller number with quoting removed
    pub number: String,
    pub number_type: u16,
}

impl ActiveCall {
    /// Parse a `+CLCC: <idx>,<dir>,<stat>,<mode>,<mpty>,<number>,<type>` row
    ///
    /// Returns None for rows without exactly seven fields or with
    /// non-numeric codes.
    pub fn parse(line: &str) -> Option<Self> {
        let body = line.strip_prefix("+CLCC:")?.trim();
        let fields: Vec<&str> = body.split(',').map(str::trim).collect();
        if fields.len() != 7 {
            return None;
        }

        Some(Self {
            index: fields[0].parse().ok()?,
            direction: fields[1].parse().ok()?,
            state: fields[2].parse().ok()?,
            mode: fields[3].parse().ok()?,
            multiparty: fields[4] == "1",
            number: fields[5].replace('"', ""),
            number_type: fields[6].parse().ok()?,
        })
    }

    /// Voice call, mobile terminated, still ringing
    pub fn is_incoming_voice(&self) -> bool {
        self.mode == MODE_VOICE && self.direction == DIRECTION_MT && self.state == STATE_INCOMING
    }
}

/// Find the first incoming voice call in an `AT+CLCC` response
///
/// Malformed rows are logged and skipped.
pub fn find_incoming(response: &str) -> Option<ActiveCall> {
    response
        .lines()
        .filter(|line| line.starts_with("+CLCC"))
        .filter_map(|line| {
            let call = ActiveCall::parse(line);
            if call.is_none() {
                log::warn!("Skipping malformed call row: {:?}", line);
            }
            call
        })
        .find(ActiveCall::is_incoming_voice)
}

/// Handle given to the call forwarder for one call
pub struct CallSession {
    number: String,
    correlator: Arc<Correlator>,
    active: Arc<AtomicBool>,
    ended: AtomicBool,
}

impl CallSession {
    fn new(number: String, correlator: Arc<Correlator>, active: Arc<AtomicBool>) -> Self {
        Self {
            number,
            correlator,
            active,
            ended: AtomicBool::new(false),
        }
    }

    /// Caller number
    pub fn number(&self) -> &str {
        &self.number
    }

    /// Answer the call (`ATA`)
    ///
    /// # Errors
    /// Returns `ModemError::CommandError` if the modem refused to answer
    pub async fn connected(&self) -> ModemResult<()> {
        log::info!("Call from {} connected, answering", self.number);
        self.correlator.cmd_ok("ATA").await?;
        Ok(())
    }

    /// Hang up (`ATH0`) and clear the active-call flag
    ///
    /// Only the first call has any effect.
    pub async fn ended(&self) -> ModemResult<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.active.store(false, Ordering::SeqCst);
        log::info!("Call from {} ended, hanging up", self.number);
        self.correlator.cmd_ok("ATH0").await?;
        Ok(())
    }

    /// Check if the call has been hung up
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

struct CallTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Call handler
///
/// Owns the active-call flag; at most one call is forwarded at a time.
pub struct CallHandler {
    correlator: Arc<Correlator>,
    forwarder: Arc<dyn CallForwarder>,
    active: Arc<AtomicBool>,
    task: Option<CallTask>,
}

impl CallHandler {
    pub fn new(correlator: Arc<Correlator>, forwarder: Arc<dyn CallForwarder>) -> Self {
        Self {
            correlator,
            forwarder,
            active: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Check if a call is being forwarded
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Handle a `RING` notification
    ///
    /// Returns `true` if a forwarding task was started. A ring while a call
    /// is active, or one without a matching incoming call, is ignored.
    ///
    /// # Errors
    /// Returns the error of the `AT+CLCC` round trip
    pub async fn handle_ring(&mut self) -> ModemResult<bool> {
        if self.is_active() {
            log::debug!("RING during active call ignored");
            return Ok(false);
        }

        let response = self.correlator.cmd("AT+CLCC").await?;
        let Some(call) = find_incoming(&response) else {
            log::warn!("Tried to handle a bad call: {:?}", response);
            return Ok(false);
        };

        log::info!(
            "Got call! #{}, number: {}, type: {}",
            call.index,
            call.number,
            call.number_type
        );
        self.active.store(true, Ordering::SeqCst);
        self.spawn(call.number);
        Ok(true)
    }

    fn spawn(&mut self, number: String) {
        let cancel = CancellationToken::new();
        let session = CallSession::new(number, self.correlator.clone(), self.active.clone());
        let forwarder = self.forwarder.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = forwarder.forward(session.number(), &session) => {
                    if let Err(e) = result {
                        log::warn!("Call forwarder for {} failed: {:#}", session.number(), e);
                    }
                }
                _ = token.cancelled() => {
                    log::info!("Call from {} cancelled by network hangup", session.number());
                }
            }

            if let Err(e) = session.ended().await {
                log::warn!("Hangup of call from {} failed: {}", session.number(), e);
            }
        });

        self.task = Some(CallTask { cancel, handle });
    }

    /// Handle a `NO CARRIER` notification
    ///
    /// Returns `true` if an active call was cancelled.
    pub fn handle_hangup(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        match &self.task {
            Some(task) => {
                log::info!("Got GSM hangup. Cancelling call task!");
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for the current call task, if any, to finish
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.handle.await {
                log::error!("Call task panicked: {}", e);
            }
        }
    }

    /// Cancel the current call task and wait for its cleanup
    pub async fn shutdown(&mut self) {
        if let Some(task) = &self.task {
            task.cancel.cancel();
        }
        self.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gsmgw_session::testing::{lines, FakeModem};
    use gsmgw_session::AtChannel;
    use std::sync::Mutex;
    use std::time::Duration;

    const CLCC_INCOMING: &str = "+CLCC: 1,1,4,0,0,\"+15550001234\",145";

    #[derive(Clone, Copy)]
    enum Behaviour {
        Answer,
        AnswerAndWait,
        Fail,
        HangUpItself,
    }

    struct TestForwarder {
        behaviour: Behaviour,
        numbers: Mutex<Vec<String>>,
    }

    impl TestForwarder {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                numbers: Mutex::new(Vec::new()),
            })
        }

        fn numbers(&self) -> Vec<String> {
            self.numbers.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CallForwarder for TestForwarder {
        async fn forward(&self, number: &str, session: &CallSession) -> anyhow::Result<()> {
            self.numbers.lock().unwrap().push(number.to_string());
            match self.behaviour {
                Behaviour::Answer => session.connected().await?,
                Behaviour::AnswerAndWait => {
                    session.connected().await?;
                    std::future::pending::<()>().await;
                }
                Behaviour::Fail => anyhow::bail!("SIP peer unreachable"),
                Behaviour::HangUpItself => session.ended().await?,
            }
            Ok(())
        }
    }

    fn responder(command: &str) -> Option<String> {
        match command {
            "AT+CLCC" => lines(&[CLCC_INCOMING, "OK"]),
            "ATA" | "ATH0" | "AT" => lines(&["OK"]),
            _ => None,
        }
    }

    fn setup(forwarder: Arc<TestForwarder>) -> (FakeModem, CallHandler) {
        let (modem, stream) = FakeModem::spawn(responder);
        let channel = AtChannel::from_stream(stream);
        tokio::spawn(channel.framer.run());
        let handler = CallHandler::new(Arc::new(channel.correlator), forwarder);
        (modem, handler)
    }

    #[test]
    fn test_parse_clcc_row() {
        let call = ActiveCall::parse(CLCC_INCOMING).unwrap();
        assert_eq!(call.index, 1);
        assert_eq!(call.number, "+15550001234");
        assert_eq!(call.number_type, 145);
        assert!(!call.multiparty);
        assert!(call.is_incoming_voice());
    }

    #[test]
    fn test_parse_rejects_malformed_rows() {
        assert!(ActiveCall::parse("+CLCC: 1,1,4,0,0").is_none());
        assert!(ActiveCall::parse("+CLCC: x,1,4,0,0,\"1\",129").is_none());
        assert!(ActiveCall::parse("RING").is_none());
    }

    #[test]
    fn test_find_incoming_skips_other_calls() {
        let response = "+CLCC: 1,0,0,0,0,\"+15550009999\",145\n\
                        +CLCC: 2,1,4,1,0,\"+15550008888\",145\n\
                        +CLCC: garbage\n\
                        +CLCC: 3,1,4,0,0,\"0501234567\",129\n\
                        OK";
        let call = find_incoming(response).unwrap();
        assert_eq!(call.index, 3);
        assert_eq!(call.number, "0501234567");

        assert!(find_incoming("OK").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_starts_forwarder_and_hangs_up() {
        let forwarder = TestForwarder::new(Behaviour::Answer);
        let (modem, mut handler) = setup(forwarder.clone());

        assert!(handler.handle_ring().await.unwrap());
        handler.join().await;

        assert_eq!(forwarder.numbers(), vec!["+15550001234"]);
        assert_eq!(modem.commands_without_probes(), vec!["AT+CLCC", "ATA", "ATH0"]);
        assert!(!handler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_while_active_is_ignored() {
        let forwarder = TestForwarder::new(Behaviour::AnswerAndWait);
        let (modem, mut handler) = setup(forwarder.clone());

        assert!(handler.handle_ring().await.unwrap());
        assert!(handler.is_active());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!handler.handle_ring().await.unwrap());
        assert_eq!(forwarder.numbers().len(), 1);
        assert_eq!(modem.commands_without_probes(), vec!["AT+CLCC", "ATA"]);
        assert!(handler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_cancels_and_cleans_up() {
        let forwarder = TestForwarder::new(Behaviour::AnswerAndWait);
        let (modem, mut handler) = setup(forwarder);

        handler.handle_ring().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(handler.handle_hangup());
        handler.join().await;

        assert!(!handler.is_active());
        assert_eq!(modem.commands_without_probes(), vec!["AT+CLCC", "ATA", "ATH0"]);
        assert!(!handler.handle_hangup());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarder_error_still_hangs_up() {
        let forwarder = TestForwarder::new(Behaviour::Fail);
        let (modem, mut handler) = setup(forwarder);

        handler.handle_ring().await.unwrap();
        handler.join().await;

        assert!(!handler.is_active());
        assert_eq!(modem.commands_without_probes(), vec!["AT+CLCC", "ATH0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_is_idempotent() {
        let forwarder = TestForwarder::new(Behaviour::HangUpItself);
        let (modem, mut handler) = setup(forwarder);

        handler.handle_ring().await.unwrap();
        handler.join().await;

        // One hangup from the forwarder, none from the task wrapper
        assert_eq!(modem.commands_without_probes(), vec!["AT+CLCC", "ATH0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spurious_ring_is_ignored() {
        let (modem, stream) = FakeModem::spawn(|command: &str| match command {
            "AT+CLCC" => lines(&["+CLCC: 1,0,2,0,0,\"+15550001234\",145", "OK"]),
            _ => lines(&["OK"]),
        });
        let channel = AtChannel::from_stream(stream);
        tokio::spawn(channel.framer.run());
        let forwarder = TestForwarder::new(Behaviour::Answer);
        let mut handler = CallHandler::new(Arc::new(channel.correlator), forwarder.clone());

        assert!(!handler.handle_ring().await.unwrap());
        assert!(!handler.is_active());
        assert!(forwarder.numbers().is_empty());
        assert_eq!(modem.commands(), vec!["AT+CLCC"]);
    }
}

//! Unsolicited-event dispatcher
//!
//! Consumes notifications in arrival order once the engine is registered
//! and routes them to the call and SMS handlers. SIM state changes are
//! fatal; anything unrecognised is logged.

use crate::call::CallHandler;
use crate::sms::SmsHandler;
use gsmgw_core::{ModemError, ModemResult};
use gsmgw_session::Correlator;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// IMS status polls before VoLTE is declared unavailable
pub const IMS_CHECK_ATTEMPTS: usize = 20;

/// Delay between IMS status polls
pub const IMS_CHECK_INTERVAL: Duration = Duration::from_secs(3);

static IMS_STATUS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\+QCFG: "ims",(\d+),(\d+)"#).unwrap());

/// Parse the VoLTE state field of `+QCFG: "ims",<enabled>,<volte_state>`
pub fn parse_volte_state(response: &str) -> Option<u8> {
    IMS_STATUS.captures(response)?[2].parse().ok()
}

/// Notification kinds the dispatcher acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Ring,
    NoCarrier,
    NewMessage,
    /// `+CPIN: SIM PIN` or `+CPIN: NOT READY` after bootstrap
    SimStateChanged,
    Unhandled,
}

impl Notification {
    /// Classify a notification line
    pub fn classify(urc: &str) -> Self {
        if urc == "RING" {
            Self::Ring
        } else if urc.contains("NO CARRIER") {
            Self::NoCarrier
        } else if urc.contains("+CMTI:") {
            Self::NewMessage
        } else if urc.contains("+CPIN: SIM PIN") || urc.contains("+CPIN: NOT READY") {
            Self::SimStateChanged
        } else {
            Self::Unhandled
        }
    }
}

/// Routes notifications to the call and SMS handlers
pub struct Dispatcher {
    correlator: Arc<Correlator>,
    calls: CallHandler,
    sms: SmsHandler,
    volte_check: bool,
}

impl Dispatcher {
    /// Create a dispatcher
    ///
    /// # Arguments
    /// * `volte_check` - Wait for IMS registration at startup
    pub fn new(
        correlator: Arc<Correlator>,
        calls: CallHandler,
        sms: SmsHandler,
        volte_check: bool,
    ) -> Self {
        Self {
            correlator,
            calls,
            sms,
            volte_check,
        }
    }

    /// Check if a call is being forwarded
    pub fn in_call(&self) -> bool {
        self.calls.is_active()
    }

    /// Poll IMS status until VoLTE is registered
    ///
    /// # Errors
    /// Returns `ModemError::NetworkError` after [`IMS_CHECK_ATTEMPTS`] polls
    /// without VoLTE
    pub async fn wait_for_ims(&self) -> ModemResult<()> {
        for attempt in 1..=IMS_CHECK_ATTEMPTS {
            let response = self.correlator.cmd("AT+QCFG=\"ims\"").await?;
            match parse_volte_state(&response) {
                Some(1) => {
                    log::info!("VoLTE registered");
                    return Ok(());
                }
                state => log::info!(
                    "Waiting for VoLTE ({}/{}), state: {:?}",
                    attempt,
                    IMS_CHECK_ATTEMPTS,
                    state
                ),
            }
            if attempt < IMS_CHECK_ATTEMPTS {
                tokio::time::sleep(IMS_CHECK_INTERVAL).await;
            }
        }

        Err(ModemError::NetworkError(format!(
            "VoLTE not registered after {} attempts",
            IMS_CHECK_ATTEMPTS
        )))
    }

    /// Work done before the first notification is handled
    ///
    /// Delivers messages stored while the engine was down, then waits for
    /// VoLTE if required. A sweep that fails on a single command is logged
    /// and left for the next `+CMTI`.
    pub async fn startup(&mut self) -> ModemResult<()> {
        if let Err(e) = self.sms.sweep().await {
            if e.is_fatal() {
                return Err(e);
            }
            log::warn!("Startup SMS sweep failed: {}", e);
        }
        if self.volte_check {
            self.wait_for_ims().await?;
        }
        Ok(())
    }

    /// Handle one notification
    ///
    /// # Errors
    /// * `ModemError::RegistrationError` if the SIM changed state
    /// * errors of the call and SMS handlers
    pub async fn handle(&mut self, urc: &str) -> ModemResult<()> {
        log::info!("URC -> {:?}", urc);

        match Notification::classify(urc) {
            Notification::Ring => {
                if self.calls.is_active() {
                    log::debug!("RING during active call");
                } else {
                    self.calls.handle_ring().await?;
                }
            }
            Notification::NoCarrier => {
                if !self.calls.handle_hangup() {
                    log::debug!("NO CARRIER without active call");
                }
            }
            Notification::NewMessage => {
                self.sms.sweep().await?;
            }
            Notification::SimStateChanged => {
                return Err(ModemError::RegistrationError(urc.to_string()));
            }
            Notification::Unhandled => log::warn!("Unhandled URC: {:?}", urc),
        }
        Ok(())
    }

    /// Run until shutdown or a fatal error
    ///
    /// Errors local to one command are logged and the loop continues. The
    /// active call, if any, is hung up before returning.
    pub async fn run(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<String>,
        shutdown: CancellationToken,
    ) -> ModemResult<()> {
        let result = self.dispatch(&mut notifications, &shutdown).await;
        self.calls.shutdown().await;
        result
    }

    async fn dispatch(
        &mut self,
        notifications: &mut mpsc::UnboundedReceiver<String>,
        shutdown: &CancellationToken,
    ) -> ModemResult<()> {
        self.startup().await?;

        loop {
            let urc = tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Dispatcher stopping");
                    return Ok(());
                }
                urc = notifications.recv() => urc,
            };

            let Some(urc) = urc else {
                return Err(ModemError::Connection(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "Notification queue closed",
                )));
            };

            match self.handle(&urc).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => log::warn!("Handling {:?} failed: {}", urc, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::{LogSmsForwarder, RejectingCallForwarder};
    use gsmgw_session::testing::{lines, FakeModem};
    use gsmgw_session::AtChannel;

    fn dispatcher(
        responder: impl FnMut(&str) -> Option<String> + Send + 'static,
        volte_check: bool,
    ) -> (FakeModem, Dispatcher, mpsc::UnboundedReceiver<String>) {
        let (modem, stream) = FakeModem::spawn(responder);
        let channel = AtChannel::from_stream(stream);
        tokio::spawn(channel.framer.run());

        let correlator = Arc::new(channel.correlator);
        let calls = CallHandler::new(correlator.clone(), Arc::new(RejectingCallForwarder::new()));
        let sms = SmsHandler::new(correlator.clone(), Arc::new(LogSmsForwarder));
        (
            modem,
            Dispatcher::new(correlator, calls, sms, volte_check),
            channel.notifications,
        )
    }

    fn responder(command: &str) -> Option<String> {
        match command {
            "AT+CLCC" => lines(&["+CLCC: 1,1,4,0,0,\"+15550001234\",145", "OK"]),
            "AT+QCFG=\"ims\"" => lines(&["+QCFG: \"ims\",1,1", "OK"]),
            _ => lines(&["OK"]),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(Notification::classify("RING"), Notification::Ring);
        assert_eq!(Notification::classify("NO CARRIER"), Notification::NoCarrier);
        assert_eq!(Notification::classify("+CMTI: \"ME\",3"), Notification::NewMessage);
        assert_eq!(
            Notification::classify("+CPIN: NOT READY"),
            Notification::SimStateChanged
        );
        assert_eq!(Notification::classify("+CPIN: SIM PIN"), Notification::SimStateChanged);
        assert_eq!(Notification::classify("+QIND: \"csq\",20,99"), Notification::Unhandled);
        assert_eq!(Notification::classify("RINGING"), Notification::Unhandled);
    }

    #[test]
    fn test_parse_volte_state() {
        assert_eq!(parse_volte_state("+QCFG: \"ims\",1,1\nOK"), Some(1));
        assert_eq!(parse_volte_state("+QCFG: \"ims\",1,0\nOK"), Some(0));
        assert_eq!(parse_volte_state("ERROR"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ims_check_retries_until_registered() {
        let mut polls = 0;
        let (modem, dispatcher, _urcs) = dispatcher(
            move |command: &str| match command {
                "AT+QCFG=\"ims\"" => {
                    polls += 1;
                    let state = if polls < 3 { 0 } else { 1 };
                    let status = format!("+QCFG: \"ims\",1,{}", state);
                    lines(&[status.as_str(), "OK"])
                }
                _ => lines(&["OK"]),
            },
            true,
        );

        dispatcher.wait_for_ims().await.unwrap();
        assert_eq!(modem.commands().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ims_check_exhaustion_is_network_error() {
        let (modem, dispatcher, _urcs) = dispatcher(
            |command: &str| match command {
                "AT+QCFG=\"ims\"" => lines(&["+QCFG: \"ims\",1,0", "OK"]),
                _ => lines(&["OK"]),
            },
            true,
        );

        assert!(matches!(
            dispatcher.wait_for_ims().await,
            Err(ModemError::NetworkError(_))
        ));
        assert_eq!(modem.commands().len(), IMS_CHECK_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_sweeps_then_checks_ims() {
        let (modem, mut dispatcher, _urcs) = dispatcher(responder, true);

        dispatcher.startup().await.unwrap();
        let commands = modem.commands();
        assert_eq!(commands.len(), 21);
        assert_eq!(commands[0], "AT+QCMGR=0");
        assert_eq!(commands[20], "AT+QCFG=\"ims\"");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ring_while_active_does_not_query_calls() {
        let (modem, mut dispatcher, _urcs) = dispatcher(responder, false);

        dispatcher.handle("RING").await.unwrap();
        assert!(dispatcher.in_call());
        dispatcher.handle("RING").await.unwrap();

        let clcc = modem.commands().iter().filter(|c| *c == "AT+CLCC").count();
        assert_eq!(clcc, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_carrier_hangs_up_active_call() {
        let (modem, mut dispatcher, _urcs) = dispatcher(responder, false);

        dispatcher.handle("RING").await.unwrap();
        dispatcher.handle("NO CARRIER").await.unwrap();
        dispatcher.calls.join().await;

        assert!(!dispatcher.in_call());
        assert_eq!(modem.commands_without_probes(), vec!["AT+CLCC", "ATH0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_state_change_is_fatal() {
        let (_modem, mut dispatcher, _urcs) = dispatcher(responder, false);

        let err = dispatcher.handle("+CPIN: NOT READY").await.unwrap_err();
        assert!(matches!(err, ModemError::RegistrationError(ref urc) if urc == "+CPIN: NOT READY"));
        assert!(err.is_fatal());
        assert!(dispatcher.handle("+QIND: \"csq\",20,99").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_routes_until_shutdown() {
        let (modem, dispatcher, urcs) = dispatcher(responder, false);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(urcs, shutdown.clone()));

        modem.send_urc("+CMTI: \"ME\",0");
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        // Startup sweep plus the one triggered by +CMTI
        let reads = modem.commands().iter().filter(|c| *c == "AT+QCMGR=0").count();
        assert_eq!(reads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_fatal_notification() {
        let (modem, dispatcher, urcs) = dispatcher(responder, false);
        modem.send_urc("+CPIN: SIM PIN");

        let result = dispatcher.run(urcs, CancellationToken::new()).await;
        assert!(matches!(result, Err(ModemError::RegistrationError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_failed_command() {
        let mut deletes = 0;
        let (modem, dispatcher, urcs) = dispatcher(
            move |command: &str| match command {
                "AT+QCMGR=0" => lines(&[
                    "+QCMGR: \"REC UNREAD\",\"+15550001234\",,\"24/01/01\",\"12:00:00+00\"",
                    "Hello",
                    "OK",
                ]),
                "AT+CMGD=0,0" => {
                    deletes += 1;
                    if deletes < 3 {
                        lines(&["+CMS ERROR: 321", "ERROR"])
                    } else {
                        lines(&["OK"])
                    }
                }
                _ => lines(&["OK"]),
            },
            false,
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(urcs, shutdown.clone()));

        // The delete of the startup sweep and of the first +CMTI both fail
        modem.send_urc("+CMTI: \"ME\",0");
        modem.send_urc("+CMTI: \"ME\",0");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!task.is_finished());
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let commands = modem.commands();
        let reads = commands.iter().filter(|c| *c == "AT+QCMGR=0").count();
        let deletes = commands.iter().filter(|c| *c == "AT+CMGD=0,0").count();
        assert_eq!(reads, 3);
        assert_eq!(deletes, 3);
    }
}

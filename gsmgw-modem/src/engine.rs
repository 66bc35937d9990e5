//! Modem engine
//!
//! Owns the AT channel and every handler built on it. A run goes through:
//!
//! 1. Open the transport and flush stale output
//! 2. Spawn the framer
//! 3. Bootstrap: channel reset, extra initializer, radio restart, SMS
//!    configuration, network selection
//! 4. Dispatch notifications until shutdown or a fatal error
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use gsmgw_core::ModemConfig;
//! use gsmgw_modem::EngineBuilder;
//!
//! # async fn example() -> gsmgw_core::ModemResult<()> {
//! let engine = EngineBuilder::new(ModemConfig::load("gsmgw.toml")?).build()?;
//! let mut ready = engine.ready_signal();
//! tokio::spawn(async move {
//!     if ready.wait_ready().await.is_ok() {
//!         log::info!("Modem registered");
//!     }
//! });
//! engine.run().await
//! # }
//! ```

use crate::call::CallHandler;
use crate::dispatcher::Dispatcher;
use crate::forwarder::{
    CallForwarder, ExtraInitializer, LogSmsForwarder, RejectingCallForwarder, SmsForwarder,
};
use crate::registration::{ReadySignal, RegistrationController};
use crate::sms::SmsHandler;
use gsmgw_core::{ModemConfig, ModemError, ModemResult, RegistrationState};
use gsmgw_session::{AtChannel, Correlator};
use gsmgw_transport::{SerialSettings, SerialTransport, TransportLayer};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Builder for [`Engine`]
///
/// Calls are rejected and messages only logged unless other collaborators
/// are set.
pub struct EngineBuilder {
    config: ModemConfig,
    call_forwarder: Arc<dyn CallForwarder>,
    sms_forwarder: Arc<dyn SmsForwarder>,
    extra_initializer: Option<Arc<dyn ExtraInitializer>>,
}

impl EngineBuilder {
    pub fn new(config: ModemConfig) -> Self {
        Self {
            config,
            call_forwarder: Arc::new(RejectingCallForwarder::new()),
            sms_forwarder: Arc::new(LogSmsForwarder),
            extra_initializer: None,
        }
    }

    /// Set the collaborator incoming calls are handed to
    pub fn call_forwarder(mut self, forwarder: Arc<dyn CallForwarder>) -> Self {
        self.call_forwarder = forwarder;
        self
    }

    /// Set the collaborator received messages are delivered to
    pub fn sms_forwarder(mut self, forwarder: Arc<dyn SmsForwarder>) -> Self {
        self.sms_forwarder = forwarder;
        self
    }

    /// Run an extra step before network selection
    pub fn extra_initializer(mut self, initializer: Arc<dyn ExtraInitializer>) -> Self {
        self.extra_initializer = Some(initializer);
        self
    }

    /// Build the engine
    ///
    /// # Errors
    /// Returns `ModemError::Config` if the configuration is invalid
    pub fn build(self) -> ModemResult<Engine> {
        self.config.validate()?;
        let (state, _) = watch::channel(RegistrationState::default());

        Ok(Engine {
            config: self.config,
            call_forwarder: self.call_forwarder,
            sms_forwarder: self.sms_forwarder,
            extra_initializer: self.extra_initializer,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Modem protocol engine
pub struct Engine {
    config: ModemConfig,
    call_forwarder: Arc<dyn CallForwarder>,
    sms_forwarder: Arc<dyn SmsForwarder>,
    extra_initializer: Option<Arc<dyn ExtraInitializer>>,
    state: Arc<watch::Sender<RegistrationState>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    /// Signal that completes once the modem is registered
    ///
    /// A failed run moves the state to `Stopped`, which wakes waiters with
    /// an error.
    pub fn ready_signal(&self) -> ReadySignal {
        ReadySignal::new(self.state.subscribe())
    }

    /// Token that stops a running engine when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run on the configured serial device
    pub async fn run(&self) -> ModemResult<()> {
        self.run_with(SerialTransport::new(SerialSettings::from_config(&self.config)))
            .await
    }

    /// Run on the stream opened by `transport`
    pub async fn run_with<T: TransportLayer>(&self, mut transport: T) -> ModemResult<()> {
        let stream = transport.open().await?;
        self.run_on_stream(stream).await
    }

    /// Run on an already open modem stream
    ///
    /// Returns `Ok` when stopped through [`Self::shutdown_token`] or by an
    /// extra initializer; any fatal error ends the run.
    pub async fn run_on_stream<S>(&self, stream: S) -> ModemResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let AtChannel {
            framer,
            correlator,
            notifications,
        } = AtChannel::open(stream).await?;
        log::info!("Got AT shell to modem. Resetting");

        let correlator = Arc::new(correlator);
        let mut framer_task = tokio::spawn(framer.run());

        let result = tokio::select! {
            result = self.drive(correlator.clone(), notifications) => result,
            joined = &mut framer_task => match joined {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(ModemError::Connection(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Framer stopped",
                ))),
                Err(e) => Err(ModemError::Connection(std::io::Error::other(e))),
            },
        };
        framer_task.abort();

        let stats = correlator.statistics();
        log::info!(
            "Engine stopped after {} commands ({} timeouts, {:.2} probes per response)",
            stats.commands_issued,
            stats.command_timeouts,
            stats.probes_per_response()
        );
        if let Err(e) = &result {
            log::error!("Engine failed: {}", e);
            self.state.send_replace(RegistrationState::Stopped);
        }
        result
    }

    async fn drive(
        &self,
        correlator: Arc<Correlator>,
        mut notifications: mpsc::UnboundedReceiver<String>,
    ) -> ModemResult<()> {
        if !self.bootstrap(&correlator, &mut notifications).await? {
            log::info!("Extra initializer requested stop");
            return Ok(());
        }

        let calls = CallHandler::new(correlator.clone(), self.call_forwarder.clone());
        let sms = SmsHandler::new(correlator.clone(), self.sms_forwarder.clone());
        let dispatcher = Dispatcher::new(correlator, calls, sms, self.config.requires_volte());
        dispatcher.run(notifications, self.shutdown.clone()).await
    }

    /// Bring the modem from reset to a registered network
    ///
    /// Returns the extra initializer's verdict on whether to continue.
    async fn bootstrap(
        &self,
        correlator: &Arc<Correlator>,
        notifications: &mut mpsc::UnboundedReceiver<String>,
    ) -> ModemResult<bool> {
        correlator.cmd_ok("AT").await?;
        correlator.cmd_ok("AT+QURCCFG=\"urcport\",\"all\"").await?;
        correlator.cmd_ok("ATH0").await?;

        let proceed = match &self.extra_initializer {
            Some(initializer) => initializer.run(correlator, notifications).await?,
            None => true,
        };

        let mut registration =
            RegistrationController::new(correlator.clone(), &self.config, self.state.clone());
        registration.restart_radio(notifications).await?;
        SmsHandler::new(correlator.clone(), self.sms_forwarder.clone())
            .configure()
            .await?;
        registration.select_network().await?;

        Ok(proceed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gsmgw_session::testing::{lines, FakeModem};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    struct PipeTransport(Option<DuplexStream>);

    #[async_trait]
    impl TransportLayer for PipeTransport {
        type Stream = DuplexStream;

        async fn open(&mut self) -> ModemResult<DuplexStream> {
            self.0.take().ok_or_else(|| {
                ModemError::Connection(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "Pipe already taken",
                ))
            })
        }
    }

    struct StopAfterBootstrap;

    #[async_trait]
    impl ExtraInitializer for StopAfterBootstrap {
        async fn run(
            &self,
            correlator: &Correlator,
            _notifications: &mut mpsc::UnboundedReceiver<String>,
        ) -> ModemResult<bool> {
            correlator.cmd_ok("AT+QSIMDET?").await?;
            Ok(false)
        }
    }

    fn modem_responder(sim_pin_required: bool) -> impl FnMut(&str) -> Option<String> + Send + 'static {
        move |command: &str| match command {
            "ATE1" => None,
            "AT+CFUN=1" if sim_pin_required => {
                Some("\r\nOK\r\n\r\n+CPIN: SIM PIN\r\n".to_string())
            }
            "AT+CFUN=1" => Some("\r\nOK\r\n\r\nPB DONE\r\n".to_string()),
            "AT+QPINC?" => lines(&["+QPINC: \"SC\",3,3", "OK"]),
            "AT+COPS?" => lines(&["+COPS: 0,0,\"Partner\",7", "OK"]),
            "AT+CSQ" => lines(&["+CSQ: 18,99", "OK"]),
            "AT+QCFG=\"ims\"" => lines(&["+QCFG: \"ims\",1,1", "OK"]),
            "AT+CLCC" => lines(&["+CLCC: 1,1,4,0,0,\"+15550001234\",145", "OK"]),
            _ => lines(&["OK"]),
        }
    }

    fn engine(builder: EngineBuilder) -> Arc<Engine> {
        Arc::new(builder.build().unwrap())
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        assert!(matches!(
            EngineBuilder::new(ModemConfig::new("")).build(),
            Err(ModemError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_and_dispatch() {
        let (modem, stream) = FakeModem::spawn(modem_responder(false));
        let engine = engine(EngineBuilder::new(ModemConfig::new("/dev/null")));
        let mut ready = engine.ready_signal();
        let shutdown = engine.shutdown_token();

        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.run_with(PipeTransport(Some(stream))).await });

        ready.wait_ready().await.unwrap();
        modem.send_urc("RING");
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let commands = modem.commands_without_probes();
        let bootstrap: Vec<&str> = commands.iter().take(14).map(String::as_str).collect();
        assert_eq!(
            bootstrap,
            vec![
                "ATE1",
                "AT+QURCCFG=\"urcport\",\"all\"",
                "ATH0",
                "AT+COPS=2",
                "AT+CFUN=0",
                "AT+CFUN=1",
                "AT+CMGF=1",
                "AT+CSDH=1",
                "AT+CPMS=\"ME\",\"ME\",\"ME\"",
                "AT+QCFG=\"nwscanmode\",3",
                "AT+COPS=0",
                "AT+COPS?",
                "AT+CSQ",
                "AT+QCMGR=0",
            ]
        );
        assert!(commands.contains(&"AT+QCFG=\"ims\"".to_string()));

        // The rejected call is looked up and hung up
        let clcc = commands.iter().position(|c| c == "AT+CLCC").unwrap();
        assert_eq!(commands[clcc + 1], "ATH0");
        assert!(ready.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_pin_without_configured_pin_is_fatal() {
        let (modem, stream) = FakeModem::spawn(modem_responder(true));
        let engine = engine(EngineBuilder::new(ModemConfig::new("/dev/null")));

        let mut ready = engine.ready_signal();

        let result = engine.run_on_stream(stream).await;
        assert!(matches!(result, Err(ModemError::RegistrationError(_))));
        assert!(!modem.commands().iter().any(|c| c.starts_with("AT+CPIN=")));

        assert_eq!(ready.state(), RegistrationState::Stopped);
        assert!(matches!(
            ready.wait_ready().await,
            Err(ModemError::RegistrationError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_initializer_can_stop_engine() {
        let (modem, stream) = FakeModem::spawn(modem_responder(false));
        let engine = engine(
            EngineBuilder::new(ModemConfig::new("/dev/null"))
                .extra_initializer(Arc::new(StopAfterBootstrap)),
        );
        let ready = engine.ready_signal();

        engine.run_on_stream(stream).await.unwrap();

        let commands = modem.commands_without_probes();
        let init = commands.iter().position(|c| c == "AT+QSIMDET?").unwrap();
        assert_eq!(commands[init - 1], "ATH0");
        assert_eq!(commands[init + 1], "AT+COPS=2");
        assert!(!commands.iter().any(|c| c.starts_with("AT+QCMGR")));
        assert_eq!(ready.state(), RegistrationState::Registered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_loss_ends_run() {
        let (modem, stream) = FakeModem::spawn(modem_responder(false));
        let mut config = ModemConfig::new("/dev/null");
        config.volte_check = false;
        let engine = engine(EngineBuilder::new(config));
        let mut ready = engine.ready_signal();

        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.run_on_stream(stream).await });

        ready.wait_ready().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(modem);

        assert!(matches!(
            task.await.unwrap(),
            Err(ModemError::Connection(_))
        ));
        assert!(!ready.is_ready());
        assert_eq!(ready.state(), RegistrationState::Stopped);
    }
}

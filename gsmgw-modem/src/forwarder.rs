//! Collaborator capabilities
//!
//! The engine hands calls and messages to external collaborators (a SIP
//! stack, a chat notifier, a smartcard relay). Each role is one trait,
//! injected when the engine is built.

use crate::call::CallSession;
use async_trait::async_trait;
use gsmgw_core::ModemResult;
use gsmgw_session::Correlator;
use std::time::Duration;
use tokio::sync::mpsc;

/// Delay before [`RejectingCallForwarder`] hangs up
pub const REJECT_DELAY: Duration = Duration::from_secs(1);

/// Forwards an incoming call
///
/// `forward` runs as the call task. It may answer through
/// [`CallSession::connected`] and may hang up through
/// [`CallSession::ended`]; the engine hangs up on its behalf when `forward`
/// returns, fails or is cancelled by a network-side disconnect.
#[async_trait]
pub trait CallForwarder: Send + Sync {
    /// Handle the call from `number`
    ///
    /// # Errors
    /// Any error is logged by the engine; the call is hung up either way.
    async fn forward(&self, number: &str, session: &CallSession) -> anyhow::Result<()>;
}

/// Delivers a received SMS
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SmsForwarder: Send + Sync {
    /// Deliver `text` received from `number`
    ///
    /// # Errors
    /// On error the message stays in modem storage and delivery is retried
    /// on the next sweep.
    async fn forward(&self, number: &str, text: &str) -> anyhow::Result<()>;
}

/// Extra bootstrap step run before network selection
#[async_trait]
pub trait ExtraInitializer: Send + Sync {
    /// Run the step
    ///
    /// The initializer may issue commands and consume notifications. Returning
    /// `false` stops the engine once bootstrap completes.
    async fn run(
        &self,
        correlator: &Correlator,
        notifications: &mut mpsc::UnboundedReceiver<String>,
    ) -> ModemResult<bool>;
}

/// SMS forwarder that only logs the message
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSmsForwarder;

#[async_trait]
impl SmsForwarder for LogSmsForwarder {
    async fn forward(&self, number: &str, text: &str) -> anyhow::Result<()> {
        log::info!("SMS from {}: {:?}", number, text);
        Ok(())
    }
}

/// Call forwarder that hangs up every call after a short delay
#[derive(Debug, Clone, Copy)]
pub struct RejectingCallForwarder {
    delay: Duration,
}

impl RejectingCallForwarder {
    pub fn new() -> Self {
        Self { delay: REJECT_DELAY }
    }

    /// Override the delay before hanging up
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for RejectingCallForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallForwarder for RejectingCallForwarder {
    async fn forward(&self, number: &str, session: &CallSession) -> anyhow::Result<()> {
        log::info!("Rejecting call from {}", number);
        tokio::time::sleep(self.delay).await;
        session.ended().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_forwarder_accepts_everything() {
        let forwarder = LogSmsForwarder;
        assert!(forwarder.forward("+15550001234", "Hello").await.is_ok());
        assert!(forwarder.forward("Unknown", "").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_sms_forwarder() {
        let mut mock = MockSmsForwarder::new();
        mock.expect_forward()
            .withf(|number, text| number.to_string() == "+15550001234" && text.ends_with("Hello"))
            .times(1)
            .returning(|_, _| Ok(()));

        mock.forward("+15550001234", "24/01/01 12:00:00+00\nHello")
            .await
            .unwrap();
    }
}

//! Serial port transport implementation

use crate::stream::TransportLayer;
use async_trait::async_trait;
use gsmgw_core::{ModemConfig, ModemError, ModemResult};
use tokio_serial::SerialStream;

/// Line settings of the modem AT port
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
    pub parity: tokio_serial::Parity,
    pub flow_control: tokio_serial::FlowControl,
}

impl SerialSettings {
    /// Create new serial settings with 8N1 framing and no flow control
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            data_bits: tokio_serial::DataBits::Eight,
            stop_bits: tokio_serial::StopBits::One,
            parity: tokio_serial::Parity::None,
            flow_control: tokio_serial::FlowControl::None,
        }
    }

    /// Create serial settings for the modem AT port named in the configuration
    pub fn from_config(config: &ModemConfig) -> Self {
        Self::new(config.device.clone(), config.baud_rate)
    }

    pub fn with_flow_control(mut self, flow_control: tokio_serial::FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// Opens the modem AT port
///
/// The transport holds no stream itself; each [`TransportLayer::open`]
/// hands a fresh port to the session layer.
#[derive(Debug)]
pub struct SerialTransport {
    settings: SerialSettings,
}

impl SerialTransport {
    /// Create a new serial transport layer
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[async_trait]
impl TransportLayer for SerialTransport {
    type Stream = SerialStream;

    async fn open(&mut self) -> ModemResult<SerialStream> {
        let builder = tokio_serial::new(&self.settings.port_name, self.settings.baud_rate)
            .data_bits(self.settings.data_bits)
            .stop_bits(self.settings.stop_bits)
            .parity(self.settings.parity)
            .flow_control(self.settings.flow_control);

        let stream = SerialStream::open(&builder).map_err(|e| {
            ModemError::Connection(std::io::Error::other(format!(
                "Failed to open modem port {}: {}",
                self.settings.port_name, e
            )))
        })?;

        log::info!(
            "Opened {} at {} baud",
            self.settings.port_name,
            self.settings.baud_rate
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_settings() {
        let settings = SerialSettings::new("/dev/ttyUSB2".to_string(), 115200);
        assert_eq!(settings.port_name, "/dev/ttyUSB2");
        assert_eq!(settings.baud_rate, 115200);
        assert_eq!(settings.flow_control, tokio_serial::FlowControl::None);
    }

    #[test]
    fn test_settings_from_config() {
        let config = ModemConfig::new("/dev/ttyUSB3");
        let settings = SerialSettings::from_config(&config);
        assert_eq!(settings.port_name, "/dev/ttyUSB3");
        assert_eq!(settings.baud_rate, gsmgw_core::DEFAULT_BAUD_RATE);
    }
}

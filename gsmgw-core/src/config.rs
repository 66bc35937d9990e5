//! Engine configuration
//!
//! Argument parsing lives outside the engine; whatever front end is used
//! produces a fully-resolved [`ModemConfig`], either directly or by loading
//! a TOML file:
//!
//! ```toml
//! device = "/dev/ttyUSB2"
//! sim_pin = "1234"
//! preferred_network = "LTE"
//! volte_check = false
//! ```

use crate::error::{ModemError, ModemResult};
use crate::network::AccessTechnology;
use serde::Deserialize;
use std::path::Path;

/// Default serial baud rate of the modem AT port
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_preferred_network() -> AccessTechnology {
    AccessTechnology::Lte
}

fn default_volte_check() -> bool {
    true
}

/// Fully-resolved engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModemConfig {
    /// Modem AT device path (e.g. "/dev/ttyUSB2")
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// SIM card PIN, used only when the SIM asks for it
    #[serde(default)]
    pub sim_pin: Option<String>,
    #[serde(default = "default_preferred_network")]
    pub preferred_network: AccessTechnology,
    /// Wait for IMS registration when LTE is preferred
    #[serde(default = "default_volte_check")]
    pub volte_check: bool,
    /// APN for PDP context 1, written before the radio restart
    #[serde(default)]
    pub apn: Option<String>,
}

impl ModemConfig {
    /// Create a configuration with defaults for everything but the device
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            sim_pin: None,
            preferred_network: default_preferred_network(),
            volte_check: default_volte_check(),
            apn: None,
        }
    }

    pub fn with_sim_pin(mut self, pin: impl Into<String>) -> Self {
        self.sim_pin = Some(pin.into());
        self
    }

    pub fn with_preferred_network(mut self, technology: AccessTechnology) -> Self {
        self.preferred_network = technology;
        self
    }

    pub fn with_volte_check(mut self, enabled: bool) -> Self {
        self.volte_check = enabled;
        self
    }

    pub fn with_apn(mut self, apn: impl Into<String>) -> Self {
        self.apn = Some(apn.into());
        self
    }

    /// Whether IMS registration must be confirmed before serving
    pub fn requires_volte(&self) -> bool {
        self.volte_check && self.preferred_network == AccessTechnology::Lte
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(s: &str) -> ModemResult<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| ModemError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> ModemResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Validate field values
    pub fn validate(&self) -> ModemResult<()> {
        if self.device.trim().is_empty() {
            return Err(ModemError::Config("Modem device path is empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(ModemError::Config("Baud rate must be > 0".to_string()));
        }
        if let Some(pin) = &self.sim_pin {
            if pin.is_empty() || !pin.chars().all(|c| c.is_ascii_digit()) {
                return Err(ModemError::Config(format!("Invalid SIM PIN: {:?}", pin)));
            }
        }
        Ok(())
    }
}

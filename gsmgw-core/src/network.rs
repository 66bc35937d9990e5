//! Network registration types shared by the engine crates

use crate::error::{ModemError, ModemResult};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Radio access technology as reported in `+COPS` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessTechnology {
    Gsm,
    Umts,
    Lte,
}

impl AccessTechnology {
    /// All supported technologies in descending `<AcT>` order
    pub const ALL: [AccessTechnology; 3] =
        [AccessTechnology::Lte, AccessTechnology::Umts, AccessTechnology::Gsm];

    /// Create from the `<AcT>` field of `+COPS`
    pub fn from_act(act: u8) -> Option<Self> {
        match act {
            0 => Some(Self::Gsm),
            2 => Some(Self::Umts),
            7 => Some(Self::Lte),
            _ => None,
        }
    }

    /// The `<AcT>` value used in `+COPS` commands and responses
    pub fn act(self) -> u8 {
        match self {
            Self::Gsm => 0,
            Self::Umts => 2,
            Self::Lte => 7,
        }
    }

    /// The Quectel `nwscanmode` value restricting the scan to this technology
    pub fn scan_mode(self) -> u8 {
        match self {
            Self::Gsm => 1,
            Self::Umts => 2,
            Self::Lte => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gsm => "GSM",
            Self::Umts => "UMTS",
            Self::Lte => "LTE",
        }
    }
}

impl fmt::Display for AccessTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessTechnology {
    type Err = ModemError;

    fn from_str(s: &str) -> ModemResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GSM" => Ok(Self::Gsm),
            "UMTS" => Ok(Self::Umts),
            "LTE" => Ok(Self::Lte),
            other => Err(ModemError::Config(format!(
                "Unknown access technology: {} (expected GSM/UMTS/LTE)",
                other
            ))),
        }
    }
}

/// Network registration state
///
/// # State Transitions
/// ```text
/// Unregistered -> PinLocked (on "+CPIN: SIM PIN")
/// PinLocked -> Unregistered (after a successful unlock)
/// Unregistered -> Scanning (automatic registration failed)
/// Unregistered | Scanning -> Registered
/// Scanning -> Rejected (all candidates exhausted)
/// any -> Stopped (the engine run failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    PinLocked,
    Scanning,
    Registered,
    Rejected,
    Stopped,
}

impl RegistrationState {
    /// Check if no further transitions are expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Registered | Self::Rejected | Self::Stopped)
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unregistered => "Unregistered",
            Self::PinLocked => "PinLocked",
            Self::Scanning => "Scanning",
            Self::Registered => "Registered",
            Self::Rejected => "Rejected",
            Self::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operator found by a passive `AT+COPS=?` scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCandidate {
    pub long_name: String,
    pub short_name: String,
    pub numeric: String,
    pub technology: AccessTechnology,
}

impl fmt::Display for NetworkCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) ({}) type: {}",
            self.long_name, self.short_name, self.numeric, self.technology
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_act_codes() {
        for tech in AccessTechnology::ALL {
            assert_eq!(AccessTechnology::from_act(tech.act()), Some(tech));
        }
        assert_eq!(AccessTechnology::from_act(100), None);
        assert_eq!(AccessTechnology::Lte.scan_mode(), 3);
    }

    #[test]
    fn test_parse_technology() {
        assert_eq!("lte".parse::<AccessTechnology>().unwrap(), AccessTechnology::Lte);
        assert_eq!("UMTS".parse::<AccessTechnology>().unwrap(), AccessTechnology::Umts);
        assert!("5G".parse::<AccessTechnology>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(RegistrationState::Registered.is_terminal());
        assert!(RegistrationState::Rejected.is_terminal());
        assert!(RegistrationState::Stopped.is_terminal());
        assert!(!RegistrationState::Scanning.is_terminal());
        assert_eq!(RegistrationState::default(), RegistrationState::Unregistered);
    }
}

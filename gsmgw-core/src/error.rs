use thiserror::Error;

/// Main error type for modem engine operations
#[derive(Error, Debug)]
pub enum ModemError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// No data arrived within a read or probe window
    #[error("Transport timeout")]
    TransportTimeout,

    /// No response was queued for the command within its timeout
    #[error("Command timeout: {0}")]
    CommandTimeout(String),

    /// The response did not end in `OK`; carries the raw response
    #[error("Command error: {0:?}")]
    CommandError(String),

    #[error("Registration error: {0}")]
    RegistrationError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ModemError {
    /// Check if the error ends the engine run
    ///
    /// Timeouts and command errors are local to the command that produced
    /// them; callers decide whether the current operation can continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ModemError::Connection(_)
                | ModemError::RegistrationError(_)
                | ModemError::NetworkError(_)
                | ModemError::Config(_)
        )
    }
}

/// Result type alias for modem engine operations
pub type ModemResult<T> = Result<T, ModemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!ModemError::TransportTimeout.is_fatal());
        assert!(!ModemError::CommandError("ERROR".to_string()).is_fatal());
        assert!(!ModemError::CommandTimeout("AT".to_string()).is_fatal());
        assert!(ModemError::RegistrationError("no pin".to_string()).is_fatal());
        assert!(ModemError::NetworkError("exhausted".to_string()).is_fatal());
    }

    #[test]
    fn test_command_error_keeps_raw_response() {
        let err = ModemError::CommandError("+CME ERROR: 10\nERROR".to_string());
        assert_eq!(err.to_string(), "Command error: \"+CME ERROR: 10\\nERROR\"");
    }
}

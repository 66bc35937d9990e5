//! gsmgw - modem side of a GSM-to-SIP gateway
//!
//! This library drives an LTE modem over its AT command channel and hands
//! incoming calls and SMS to pluggable forwarders.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `gsmgw-core`: Error taxonomy, configuration and network types
//! - `gsmgw-transport`: Serial transport and line reading
//! - `gsmgw-session`: AT framing and command/response correlation
//! - `gsmgw-modem`: Registration, calls, SMS and the engine
//!
//! # Usage
//!
//! ```no_run
//! use gsmgw::{EngineBuilder, ModemConfig};
//!
//! # async fn example() -> gsmgw::ModemResult<()> {
//! let config = ModemConfig::new("/dev/ttyUSB2").with_sim_pin("1234");
//! let engine = EngineBuilder::new(config).build()?;
//! engine.run().await
//! # }
//! ```

// Re-export core types
pub use gsmgw_core::{AccessTechnology, ModemConfig, ModemError, ModemResult, RegistrationState};

// Re-export the engine API
pub use gsmgw_modem::{
    CallForwarder, CallSession, Engine, EngineBuilder, ExtraInitializer, ReadySignal,
    SmsForwarder,
};

pub mod modem {
    pub use gsmgw_modem::*;
}

pub mod session {
    pub use gsmgw_session::*;
}

pub mod transport {
    pub use gsmgw_transport::*;
}

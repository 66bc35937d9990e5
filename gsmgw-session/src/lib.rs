//! Session layer for the GSM gateway modem engine
//!
//! This crate turns the modem's interleaved text stream into two ordered
//! queues: framed command responses and unsolicited notifications.
//!
//! - [`framer`]: the only reader of the channel, classifies and frames lines
//! - [`correlator`]: serializes command issuance and pairs commands with responses
//! - [`channel`]: wires the two together over one stream
//! - [`statistics`]: counters shared by both sides

pub mod channel;
pub mod correlator;
pub mod framer;
pub mod statistics;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use channel::AtChannel;
pub use correlator::{Correlator, DEFAULT_COMMAND_TIMEOUT};
pub use framer::{classify, Framer, LineClass, PROBE_COMMAND, SENTINELS, SILENCE_TIMEOUT};
pub use statistics::{SessionStatistics, StatisticsSnapshot};

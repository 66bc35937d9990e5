//! Transport layer module for the GSM gateway modem engine
//!
//! This crate provides the serial port transport and the line-oriented
//! stream helpers the AT session layer is built on.

pub mod serial;
pub mod stream;

pub use serial::{SerialSettings, SerialTransport};
pub use stream::{blind_flush, LineReader, TransportLayer, FLUSH_COMMAND, FLUSH_WINDOW};

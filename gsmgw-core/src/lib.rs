//! Core types and utilities for the GSM gateway modem engine
//!
//! This crate provides the error taxonomy, configuration and network
//! registration types used throughout the engine crates.

pub mod config;
pub mod error;
pub mod network;

pub use config::{ModemConfig, DEFAULT_BAUD_RATE};
pub use error::{ModemError, ModemResult};
pub use network::{AccessTechnology, NetworkCandidate, RegistrationState};

//! Modem engine for the GSM gateway
//!
//! This crate drives a Quectel-style LTE modem over its AT channel: it
//! brings the modem up, registers on a network and turns notifications
//! into call and SMS work for the injected collaborators.
//!
//! - [`engine`]: bootstrap sequence and lifecycle
//! - [`registration`]: SIM unlock and network selection
//! - [`dispatcher`]: notification routing
//! - [`call`]: incoming call tracking
//! - [`sms`]: stored message reading, decoding and reassembly
//! - [`forwarder`]: collaborator traits

pub mod call;
pub mod dispatcher;
pub mod engine;
pub mod forwarder;
pub mod registration;
pub mod sms;

pub use call::{ActiveCall, CallHandler, CallSession};
pub use dispatcher::{Dispatcher, Notification};
pub use engine::{Engine, EngineBuilder};
pub use forwarder::{
    CallForwarder, ExtraInitializer, LogSmsForwarder, RejectingCallForwarder, SmsForwarder,
};
pub use registration::{CandidatePlan, ReadySignal, RegistrationController};
pub use sms::{SmsHandler, SmsMessage};

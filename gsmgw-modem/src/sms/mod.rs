//! SMS handling
//!
//! Messages are read from modem storage in text mode, decoded, reassembled
//! when segmented and handed to the [`crate::forwarder::SmsForwarder`].
//!
//! - [`header`]: header line and stored message parsing
//! - [`decode`]: sender and body decoding
//! - [`segment`]: multi-part reassembly
//! - [`handler`]: the storage sweep

pub mod decode;
pub mod handler;
pub mod header;
pub mod segment;

pub use handler::{SmsHandler, SMS_STORAGE_SLOTS};
pub use header::{SegmentInfo, SmsHeader, StoredSms};
pub use segment::{SegmentGroup, SmsMessage};

//! Stored-message sweep and delivery

use super::header::{SegmentInfo, StoredSms};
use super::segment::{SegmentGroup, SmsMessage};
use crate::forwarder::SmsForwarder;
use gsmgw_core::{ModemError, ModemResult};
use gsmgw_session::Correlator;
use std::collections::HashMap;
use std::sync::Arc;

/// Storage slots read on every sweep
pub const SMS_STORAGE_SLOTS: u32 = 20;

/// SMS handler
///
/// Reads every storage slot, delivers complete messages through the
/// [`SmsForwarder`] and deletes their slots. Parts of segmented messages are
/// kept across sweeps until the set is complete.
pub struct SmsHandler {
    correlator: Arc<Correlator>,
    forwarder: Arc<dyn SmsForwarder>,
    groups: HashMap<u32, SegmentGroup>,
}

impl SmsHandler {
    pub fn new(correlator: Arc<Correlator>, forwarder: Arc<dyn SmsForwarder>) -> Self {
        Self {
            correlator,
            forwarder,
            groups: HashMap::new(),
        }
    }

    /// Select text mode, header details and modem storage
    pub async fn configure(&self) -> ModemResult<()> {
        self.correlator.cmd_ok("AT+CMGF=1").await?;
        self.correlator.cmd_ok("AT+CSDH=1").await?;
        self.correlator.cmd_ok("AT+CPMS=\"ME\",\"ME\",\"ME\"").await?;
        Ok(())
    }

    /// Segment sets still waiting for parts
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Read all storage slots and deliver what is complete
    ///
    /// Returns the number of messages delivered.
    ///
    /// # Errors
    /// Returns transport errors of the read and delete commands. Slots the
    /// modem refuses to read are skipped.
    pub async fn sweep(&mut self) -> ModemResult<usize> {
        let mut delivered = 0;

        for index in 0..SMS_STORAGE_SLOTS {
            let Some(sms) = self.read_slot(index).await? else {
                continue;
            };

            let (message, group) = match sms.segment {
                None => (Some(SmsMessage::from(sms)), None),
                Some(segment) => (self.add_segment(sms, segment), Some(segment.id)),
            };

            if let Some(message) = message {
                if self.deliver(&message).await? {
                    if let Some(id) = group {
                        self.groups.remove(&id);
                    }
                    delivered += 1;
                }
            }
        }

        if delivered > 0 {
            log::info!("Delivered {} SMS", delivered);
        }
        Ok(delivered)
    }

    async fn read_slot(&self, index: u32) -> ModemResult<Option<StoredSms>> {
        let response = self.correlator.cmd(&format!("AT+QCMGR={}", index)).await?;
        if let Err(ModemError::CommandError(_)) = Correlator::verify_ok(&response) {
            log::debug!("Skipping unreadable SMS slot {}", index);
            return Ok(None);
        }
        Ok(StoredSms::from_response(index, &response))
    }

    /// Add a part to its group; returns the assembled message once complete
    fn add_segment(&mut self, sms: StoredSms, segment: SegmentInfo) -> Option<SmsMessage> {
        let SegmentInfo { id, total, .. } = segment;
        let Some(slot) = segment.slot() else {
            log::warn!("SMS segment in slot {} of set {} out of range", sms.index, id);
            return None;
        };

        let group = self
            .groups
            .entry(id)
            .or_insert_with(|| SegmentGroup::new(id, total));
        if group.total() != total {
            log::warn!(
                "SMS segment in slot {} claims {} parts, set {} has {}",
                sms.index,
                total,
                id,
                group.total()
            );
            return None;
        }

        group.insert(slot, sms);
        log::debug!("SMS set {}: {}/{} parts", id, group.filled(), group.total());
        group.assemble()
    }

    /// Forward a message and delete its slots
    ///
    /// Returns false if the forwarder failed; the slots then stay stored and
    /// the message is retried on the next sweep.
    async fn deliver(&self, message: &SmsMessage) -> ModemResult<bool> {
        log::info!("SMS from {} (slots {:?})", message.sender, message.indices);

        if let Err(e) = self
            .forwarder
            .forward(&message.sender, &message.forwarded_text())
            .await
        {
            log::warn!("SMS forwarding failed, keeping message stored: {:#}", e);
            return Ok(false);
        }

        for index in &message.indices {
            self.correlator
                .cmd_ok(&format!("AT+CMGD={},0", index))
                .await?;
        }
        Ok(true)
    }
}

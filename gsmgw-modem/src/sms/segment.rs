//! Multi-part message reassembly

use super::header::StoredSms;

/// A message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    /// Storage slots holding the message, deleted after delivery
    pub indices: Vec<u32>,
    pub sender: String,
    pub date: String,
    pub time: String,
    pub body: String,
}

impl SmsMessage {
    /// Text handed to the forwarder: `"<date> <time>\n<body>"`
    ///
    /// Messages with an unparsable header carry no timestamp and are
    /// forwarded as the bare body.
    pub fn forwarded_text(&self) -> String {
        if self.date.is_empty() && self.time.is_empty() {
            self.body.clone()
        } else {
            format!("{} {}\n{}", self.date, self.time, self.body)
        }
    }
}

impl From<StoredSms> for SmsMessage {
    fn from(sms: StoredSms) -> Self {
        Self {
            indices: vec![sms.index],
            sender: sms.sender,
            date: sms.date,
            time: sms.time,
            body: sms.body,
        }
    }
}

/// Parts of one segmented message collected so far
#[derive(Debug, Clone)]
pub struct SegmentGroup {
    id: u32,
    slots: Vec<Option<StoredSms>>,
}

impl SegmentGroup {
    pub fn new(id: u32, total: usize) -> Self {
        Self {
            id,
            slots: vec![None; total],
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots filled so far
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Store a part in its 0-based slot
    ///
    /// A part read again on a later sweep replaces the earlier copy.
    /// Returns false if the slot is out of range.
    pub fn insert(&mut self, slot: usize, sms: StoredSms) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) => {
                *entry = Some(sms);
                true
            }
            None => false,
        }
    }

    /// Check if every slot is filled
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Concatenate the parts in slot order
    ///
    /// Sender and timestamp come from the first part. Returns None until the
    /// group is complete.
    pub fn assemble(&self) -> Option<SmsMessage> {
        let parts: Vec<&StoredSms> = self.slots.iter().map(Option::as_ref).collect::<Option<_>>()?;
        let first = parts.first()?;

        Some(SmsMessage {
            indices: parts.iter().map(|part| part.index).collect(),
            sender: first.sender.clone(),
            date: first.date.clone(),
            time: first.time.clone(),
            body: parts.iter().map(|part| part.body.as_str()).collect(),
        })
    }
}

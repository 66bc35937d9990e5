//! Stored message header parsing
//!
//! The header line of `AT+QCMGR` (or `AT+CMGR`) in text mode has a fixed
//! shape per field count:
//!
//! | Fields | Layout                                                        |
//! |--------|---------------------------------------------------------------|
//! | 5      | stat, sender, alpha, date, time                               |
//! | 8      | base + segment-set id, segment number, total                  |
//! | 12     | base + `+CSDH` block (tooa, fo, pid, dcs, sca, tosca, length) |
//! | 15     | base + `+CSDH` block + segment fields                         |

use super::decode::{decode_body, decode_sender};

/// Header line prefixes of a stored message
pub const HEADER_PREFIXES: [&str; 2] = ["+QCMGR:", "+CMGR:"];

/// Sender used when the header could not be parsed
pub const UNKNOWN_SENDER: &str = "Unknown";

const BASE_FIELDS: usize = 5;
const DETAIL_FIELDS: usize = 7;
const SEGMENT_FIELDS: usize = 3;

/// Concatenation fields of a segmented message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment-set id shared by all parts
    pub id: u32,
    /// Segment number as reported, 1-based
    pub number: usize,
    pub total: usize,
}

impl SegmentInfo {
    /// 0-based slot of this segment; None if the number is out of range
    pub fn slot(&self) -> Option<usize> {
        if self.number >= 1 && self.number <= self.total {
            Some(self.number - 1)
        } else {
            None
        }
    }
}

/// Parsed header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsHeader {
    pub status: String,
    /// Raw sender field, quotes stripped
    pub sender: String,
    pub date: String,
    pub time: String,
    /// Declared body length, present with the `+CSDH` block
    pub size: Option<usize>,
    pub segment: Option<SegmentInfo>,
}

impl SmsHeader {
    /// Parse a header line
    ///
    /// Returns None for lines without a header prefix, for unknown field
    /// counts and for non-numeric segment or size fields.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = HEADER_PREFIXES
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))?
            .trim();
        let fields: Vec<String> = rest
            .split(',')
            .map(|field| field.trim().replace('"', ""))
            .collect();

        let (has_detail, has_segment) = match fields.len() {
            n if n == BASE_FIELDS => (false, false),
            n if n == BASE_FIELDS + SEGMENT_FIELDS => (false, true),
            n if n == BASE_FIELDS + DETAIL_FIELDS => (true, false),
            n if n == BASE_FIELDS + DETAIL_FIELDS + SEGMENT_FIELDS => (true, true),
            _ => return None,
        };

        let size = if has_detail {
            Some(fields[BASE_FIELDS + DETAIL_FIELDS - 1].parse().ok()?)
        } else {
            None
        };

        let segment = if has_segment {
            let at = fields.len() - SEGMENT_FIELDS;
            Some(SegmentInfo {
                id: fields[at].parse().ok()?,
                number: fields[at + 1].parse().ok()?,
                total: fields[at + 2].parse().ok()?,
            })
        } else {
            None
        };

        Some(Self {
            status: fields[0].clone(),
            sender: fields[1].clone(),
            date: fields[3].clone(),
            time: fields[4].clone(),
            size,
            segment,
        })
    }
}

/// One message read from a storage slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSms {
    pub index: u32,
    /// Decoded sender
    pub sender: String,
    pub date: String,
    pub time: String,
    pub segment: Option<SegmentInfo>,
    /// Decoded body
    pub body: String,
}

impl StoredSms {
    /// Build a message from a verified read response
    ///
    /// Returns None for an empty slot (no lines besides `OK`). A header line
    /// that does not parse leaves the sender unknown and is kept as body
    /// text.
    pub fn from_response(index: u32, response: &str) -> Option<Self> {
        let lines: Vec<&str> = response
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != "OK")
            .collect();
        let (first, rest) = lines.split_first()?;

        let Some(header) = SmsHeader::parse(first) else {
            log::warn!("Unparsable SMS header in slot {}: {:?}", index, first);
            return Some(Self {
                index,
                sender: UNKNOWN_SENDER.to_string(),
                date: String::new(),
                time: String::new(),
                segment: None,
                body: lines.join("\n"),
            });
        };

        Some(Self {
            index,
            sender: decode_sender(&header.sender),
            date: header.date,
            time: header.time,
            segment: header.segment,
            body: decode_body(&rest.join("\n"), header.size),
        })
    }
}

// Telemetry frame decoder
//
// The controller script prints, at the polling rate:
//   D H ? <values of query 1> ? <values of query 2> ? ... \r
// where each group is a ':'-separated list of integers. A single read may hold
// several frames and a partial one at the end, so the newest complete frame wins.

use tracing::{error, warn};

const FRAME_MARKER: char = 'D';
const FRAME_HEADER: &str = "H";
const GROUP_SEPARATOR: char = '?';
const VALUE_SEPARATOR: char = ':';

/// Decoded values for one registered channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub slot_index: usize,
    pub values: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty data: {{{raw}}}")]
    MissingFrameMarker { raw: String },

    #[error("No complete frame with {expected} groups in: {{{raw}}}")]
    NoCompleteFrame { raw: String, expected: usize },
}

/// Strip '\r' and '+' padding
fn clean(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .chars()
        .filter(|&c| c != '\r' && c != '+')
        .collect()
}

/// Split a cleaned buffer into `D`-delimited fields
fn fields(text: &str) -> Vec<&str> {
    text.split(FRAME_MARKER).collect()
}

/// `?`-delimited groups of every `H` field, oldest first
fn candidates<'a>(fields: &'a [&'a str]) -> impl DoubleEndedIterator<Item = Vec<&'a str>> + 'a {
    fields
        .iter()
        .filter(|field| field.starts_with(FRAME_HEADER))
        .map(|field| field.split(GROUP_SEPARATOR).collect::<Vec<_>>())
}

/// Turns raw reads into per-channel records
#[derive(Debug, Clone, Copy)]
pub struct TelemetryDecoder {
    channel_count: usize,
}

impl TelemetryDecoder {
    pub fn new(channel_count: usize) -> Self {
        Self { channel_count }
    }

    /// A frame is complete when it has the header plus one group per channel
    fn is_complete(&self, groups: &[&str]) -> bool {
        groups.first() == Some(&FRAME_HEADER) && groups.len() >= self.channel_count + 1
    }

    /// Decode one read into exactly `channel_count` records, in slot order
    ///
    /// Groups past the last channel are trailing artifacts and are ignored.
    /// A value that is not an integer is dropped from its record.
    pub fn decode(&self, raw: &[u8]) -> Result<Vec<TelemetryRecord>, DecodeError> {
        let text = clean(raw);
        let fields = fields(&text);

        if fields.len() < 2 {
            return Err(DecodeError::MissingFrameMarker { raw: text.clone() });
        }

        let groups = candidates(&fields)
            .rev()
            .find(|groups| self.is_complete(groups))
            .ok_or_else(|| DecodeError::NoCompleteFrame {
                raw: text.clone(),
                expected: self.channel_count + 1,
            })?;

        let records = groups[1..=self.channel_count]
            .iter()
            .enumerate()
            .map(|(slot_index, group)| TelemetryRecord {
                slot_index,
                values: parse_values(group, &text),
            })
            .collect();

        Ok(records)
    }

    /// Like [`decode`](Self::decode), but logs failures and yields no records instead
    pub fn decode_or_log(&self, raw: &[u8]) -> Vec<TelemetryRecord> {
        match self.decode(raw) {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to decode telemetry: {}", e);
                Vec::new()
            }
        }
    }
}

fn parse_values(group: &str, frame: &str) -> Vec<i32> {
    group
        .split(VALUE_SEPARATOR)
        .filter_map(|token| match token.parse::<i32>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Invalid data on serial: {:?} in {:?} ({})", token, frame, e);
                None
            }
        })
        .collect()
}

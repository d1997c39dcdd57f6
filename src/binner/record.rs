//! Binary bin-record layouts
//!
//! The binning tools write fixed-width records in native byte order. The
//! stream is not self-describing, so the reader must be told which layout
//! is in effect.
//!
//! | Layout | Fields | Size |
//! |--------|--------|------|
//! | `Tagged` | `i32 channel`, 4 pad bytes, `u64 start`, `u32 count`, `u32 lost` | 24 |
//! | `PerChannel` | `u64 start`, `u16 count` | 10 |

use crate::types::{ticks_to_seconds, Bin, ChannelId};
use serde::{Deserialize, Serialize};

/// Size of a tagged record, including alignment padding after the channel
pub const TAGGED_RECORD_SIZE: usize = 24;

/// Size of a per-channel record
pub const PER_CHANNEL_RECORD_SIZE: usize = 10;

/// Which record layout a binner emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordLayout {
    /// Every record carries its channel id and loss count
    #[default]
    Tagged,
    /// Channels were split upstream; every record belongs to `channel`
    PerChannel { channel: ChannelId },
}

impl RecordLayout {
    /// Width of one record in bytes
    pub fn record_size(&self) -> usize {
        match self {
            RecordLayout::Tagged => TAGGED_RECORD_SIZE,
            RecordLayout::PerChannel { .. } => PER_CHANNEL_RECORD_SIZE,
        }
    }

    /// Decode one record. Returns `None` if `buf` is shorter than a record.
    pub fn decode(&self, buf: &[u8]) -> Option<BinRecord> {
        if buf.len() < self.record_size() {
            return None;
        }
        let record = match *self {
            RecordLayout::Tagged => BinRecord {
                channel: i32::from_ne_bytes(array(&buf[0..4])),
                start_ticks: u64::from_ne_bytes(array(&buf[8..16])),
                count: u32::from_ne_bytes(array(&buf[16..20])),
                lost: u32::from_ne_bytes(array(&buf[20..24])),
            },
            RecordLayout::PerChannel { channel } => BinRecord {
                channel,
                start_ticks: u64::from_ne_bytes(array(&buf[0..8])),
                count: u32::from(u16::from_ne_bytes(array(&buf[8..10]))),
                lost: 0,
            },
        };
        Some(record)
    }

    /// Encode one record. Per-channel records drop the channel and loss
    /// fields and saturate the count at `u16::MAX`.
    pub fn encode(&self, record: &BinRecord) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.record_size());
        match self {
            RecordLayout::Tagged => {
                out.extend_from_slice(&record.channel.to_ne_bytes());
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(&record.start_ticks.to_ne_bytes());
                out.extend_from_slice(&record.count.to_ne_bytes());
                out.extend_from_slice(&record.lost.to_ne_bytes());
            }
            RecordLayout::PerChannel { .. } => {
                let count = u16::try_from(record.count).unwrap_or(u16::MAX);
                out.extend_from_slice(&record.start_ticks.to_ne_bytes());
                out.extend_from_slice(&count.to_ne_bytes());
            }
        }
        out
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// One record as it appears on the wire, before time conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinRecord {
    pub channel: ChannelId,
    pub start_ticks: u64,
    pub count: u32,
    pub lost: u32,
}

impl BinRecord {
    pub fn new(channel: ChannelId, start_ticks: u64, count: u32, lost: u32) -> Self {
        Self {
            channel,
            start_ticks,
            count,
            lost,
        }
    }

    /// Convert to a [`Bin`] using the hardware clock rate
    pub fn to_bin(&self, clockrate: u64) -> Bin {
        Bin {
            channel: self.channel,
            start_ticks: self.start_ticks,
            time: ticks_to_seconds(self.start_ticks, clockrate),
            count: self.count,
            lost: self.lost,
        }
    }
}

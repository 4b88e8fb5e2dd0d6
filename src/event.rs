//! Core data model: packed items, input events, grouped records.
//!
//! An item is a packed `u64`: the low 8 bits carry the field id, bits 8..32
//! the value id. Field 0 is the timestamp field, which makes a valid encoded
//! delta (`delta << 8`) an ordinary field-0 item.
//!
//! A grouped record's timestamp low byte doubles as the record
//! discriminator: 0 valid, 1 invalid (delta exceeded 24 bits). Downstream
//! passes filter invalid records with a single mask; decoders rely on this
//! layout verbatim.
//!
//! Grouped record spill format (little-endian, 20 bytes):
//!
//! ```text
//! cookie_id:  u32
//! item_zero:  u64
//! num_items:  u32
//! timestamp:  u32    // encoded delta, or 1 for invalid
//! ```

use std::io::{self, ErrorKind, Read};

pub type Item = u64;

/// Field id reserved for timestamp deltas.
pub const TIMESTAMP_FIELD: u8 = 0;

pub fn item_field(item: Item) -> u8 {
    (item & 0xff) as u8
}

pub fn item_val(item: Item) -> u32 {
    (item >> 8) as u32
}

/// Pack a field and a value id into an item. Value ids must fit in 24 bits.
pub fn make_item(field: u8, val: u32) -> Item {
    (u64::from(val) << 8) | u64::from(field)
}

/// One input event. `prev_event_idx` is 0 for the first event of an actor,
/// otherwise 1 + the index of the actor's previous event.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub timestamp: u32,
    pub item_zero: u64,
    pub num_items: u32,
    pub prev_event_idx: u64,
}

/// The packed event graph the encoder consumes. `cookie_pointers[c]` is the
/// index of the last event of actor `c`; events of different actors may be
/// interleaved in `events`.
pub struct EventGraph {
    pub events: Vec<Event>,
    pub items: Vec<Item>,
    pub cookie_pointers: Vec<u64>,
    /// Number of fields including the timestamp field. Field ids are packed
    /// into 8 bits, so this must not exceed 256.
    pub num_fields: u32,
    /// Maximum value id per field, indexed by field id. Slot 0 is unused;
    /// the timestamp field is bounded by the maximum delta instead.
    pub field_cardinalities: Vec<u64>,
}

/// One record of the grouped temp file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupedRecord {
    pub cookie_id: u32,
    pub item_zero: u64,
    pub num_items: u32,
    pub timestamp: u32,
}

impl GroupedRecord {
    pub const SIZE: usize = 20;

    pub fn is_valid(&self) -> bool {
        self.timestamp & 0xff == 0
    }

    pub fn write_to(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..4].copy_from_slice(&self.cookie_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.item_zero.to_le_bytes());
        buf[12..16].copy_from_slice(&self.num_items.to_le_bytes());
        buf[16..20].copy_from_slice(&self.timestamp.to_le_bytes());
    }

    pub fn read_from(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            cookie_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            item_zero: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            num_items: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            timestamp: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }

    /// Read the next record from a grouped stream, or `None` at EOF.
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Option<Self>> {
        let mut buf = [0u8; Self::SIZE];
        match reader.read_exact(&mut buf) {
            Ok(()) => Ok(Some(Self::read_from(&buf))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

//! Entries and their wraparound sequence numbers.

use std::fmt;

use serde::Serialize;

use crate::value::{Value, ValueType};

/// Wire value of an id that the server has not assigned yet.
pub const UNASSIGNED_ID: u16 = 0xFFFF;

const HALF_SPACE: u16 = 0x8000;

/// 16-bit version counter compared on a circle.
///
/// `a` is newer than `b` when `a - b (mod 65536)` lies in `1..=32767`. At the
/// exact antipode neither value is newer than the other, so updates at that
/// distance are rejected in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct SequenceNumber(pub u16);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    pub fn is_newer_than(self, other: SequenceNumber) -> bool {
        let distance = self.0.wrapping_sub(other.0);
        distance != 0 && distance < HALF_SPACE
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named, typed, versioned value.
///
/// The type is the type of `value` and never changes once the entry exists.
/// `id` is `None` on a client until the server has assigned one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub id: Option<u16>,
    pub name: String,
    pub sequence: SequenceNumber,
    pub value: Value,
}

impl Entry {
    pub fn new(id: Option<u16>, name: impl Into<String>, sequence: SequenceNumber, value: Value) -> Self {
        Self {
            id,
            name: name.into(),
            sequence,
            value,
        }
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }

    pub fn wire_id(&self) -> u16 {
        self.id.unwrap_or(UNASSIGNED_ID)
    }
}

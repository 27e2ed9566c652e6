//! Error types shared by the codec, the framer and the entry table.
//!
//! The split follows who has to react:
//!
//! - [`EncodingError`] and [`TableError`] are local misuse. They fail the call
//!   that caused them and leave every other entry untouched.
//! - [`BadMessage`] is a malformed message from the peer. The read loop logs
//!   it and keeps going.
//! - [`ProtocolError::Io`] means the connection is gone.

use std::{io, string::FromUtf8Error, sync::Arc, time::Duration};

use thiserror::Error;

use crate::value::ValueType;

/// A value could not be written with the requested type tag.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("cannot encode a {actual} value as {expected}")]
    TypeMismatch {
        expected: ValueType,
        actual: ValueType,
    },
    #[error("array of {len} elements exceeds the 255 element limit")]
    ArrayTooLong { len: usize },
    #[error("string of {len} bytes exceeds the 65535 byte limit")]
    StringTooLong { len: usize },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unknown value type tag 0x{0:02x}")]
pub struct UnknownTypeError(pub u8);

/// A message from the peer that cannot be applied.
///
/// Only the current read iteration is lost; the connection stays up.
#[derive(Debug, Error)]
pub enum BadMessage {
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),
    #[error(transparent)]
    UnknownValueType(#[from] UnknownTypeError),
    #[error("update references unknown entry id {0}")]
    UnknownEntryId(u16),
    #[error("string is not valid utf-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("entry {name:?} is {current}, refusing to change it to {incoming}")]
    TypeChanged {
        name: String,
        current: ValueType,
        incoming: ValueType,
    },
    #[error("unexpected {message} {context}")]
    Unexpected {
        message: &'static str,
        context: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad message: {0}")]
    BadMessage(#[from] BadMessage),
    #[error("failed to encode message: {0}")]
    Encoding(#[from] EncodingError),
    #[error("connection i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the connection has to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}

impl From<UnknownTypeError> for ProtocolError {
    fn from(err: UnknownTypeError) -> Self {
        ProtocolError::BadMessage(err.into())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("entry {0:?} already exists")]
    DuplicateName(String),
    #[error("entry {name:?} holds a {expected} value, not {actual}")]
    TypeMismatch {
        name: String,
        expected: ValueType,
        actual: ValueType,
    },
    #[error("no entry named {0:?}")]
    NotFound(String),
    #[error("every entry id is in use")]
    IdSpaceExhausted,
    #[error("{0} is only available on the server")]
    WrongRole(&'static str),
}

/// Why a connection stopped. Sessions use it to decide whether to reconnect.
#[derive(Debug, Clone, Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("connection stopped locally")]
    Cancelled,
    #[error("connection i/o failed: {0}")]
    Io(Arc<io::Error>),
    #[error("protocol revision mismatch: local 0x{ours:04x}, peer 0x{theirs:04x}")]
    ProtocolMismatch { ours: u16, theirs: u16 },
    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),
    #[error("fell {0} outbound messages behind")]
    Lagged(u64),
}

impl From<io::Error> for CloseReason {
    fn from(err: io::Error) -> Self {
        CloseReason::Io(Arc::new(err))
    }
}

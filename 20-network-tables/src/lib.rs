//! Entry table synchronisation between one server and many clients.
//!
//! A server owns the authoritative table of named, typed, versioned entries
//! and every client mirrors it over a TCP connection. Each module focuses on
//! one concern:
//!
//! - [`value`] and [`entry`] define the typed values, their wire encoding and
//!   the wraparound sequence numbers that order updates.
//! - [`message`] frames the six protocol messages on a byte stream.
//! - [`table`] is the shared entry table with its listeners and the outbound
//!   fan-out channel.
//! - [`connection`], [`adapter`] and [`monitor`] run one connection: the
//!   locked write side, the role-specific handshake and the read loop.
//! - [`server`] and [`client`] tie these together into sessions, and
//!   [`network_table`] is the path-addressed view applications use.
//! - [`cli`], [`config`] and [`console`] back the `network-tables` binary.
//!
//! Integration tests drive real sessions over loopback TCP through this crate.

pub mod adapter;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod console;
pub mod entry;
pub mod error;
pub mod message;
pub mod monitor;
pub mod network_table;
pub mod server;
pub mod table;
pub mod value;

pub use client::Client;
pub use entry::{Entry, SequenceNumber};
pub use error::{BadMessage, CloseReason, EncodingError, ProtocolError, TableError};
pub use network_table::NetworkTable;
pub use server::{Server, ServerHandle};
pub use table::{EntryTable, Role};
pub use value::{Value, ValueType};

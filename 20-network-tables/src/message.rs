//! Message framing on top of a duplex byte stream.
//!
//! Every message starts with a one-byte type marker followed by a fixed,
//! type-specific payload. Multi-byte integers are big-endian.
//!
//! | type                          | byte   | payload                                  |
//! |-------------------------------|--------|------------------------------------------|
//! | keep alive                    | `0x00` | none                                     |
//! | client hello                  | `0x01` | revision `u16`                           |
//! | protocol version unsupported  | `0x02` | revision `u16`                           |
//! | server hello complete         | `0x03` | none                                     |
//! | entry assignment              | `0x10` | name, type tag, id, sequence, value      |
//! | entry update                  | `0x11` | id, sequence, value                      |
//!
//! Writes go through [`MessageWriter`], which serialises whole messages under
//! a lock. Reads ([`read_message`]) take no lock so one task can read while
//! others write.

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter},
    sync::Mutex,
};
use tracing::trace;

use crate::{
    entry::{Entry, SequenceNumber, UNASSIGNED_ID},
    error::{BadMessage, ProtocolError},
    value::{self, Value, ValueType},
};

/// Protocol revision spoken by this build. Peers must match exactly.
pub const PROTOCOL_REVISION: u16 = 0x0200;

pub mod kind {
    pub const KEEP_ALIVE: u8 = 0x00;
    pub const CLIENT_HELLO: u8 = 0x01;
    pub const PROTOCOL_VERSION_UNSUPPORTED: u8 = 0x02;
    pub const SERVER_HELLO_COMPLETE: u8 = 0x03;
    pub const ENTRY_ASSIGNMENT: u8 = 0x10;
    pub const ENTRY_UPDATE: u8 = 0x11;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    ClientHello { revision: u16 },
    ProtocolVersionUnsupported { revision: u16 },
    ServerHelloComplete,
    EntryAssignment(Entry),
    EntryUpdate {
        id: u16,
        sequence: SequenceNumber,
        value: Value,
    },
}

impl Message {
    pub fn update(entry: &Entry) -> Self {
        Message::EntryUpdate {
            id: entry.wire_id(),
            sequence: entry.sequence,
            value: entry.value.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep alive",
            Message::ClientHello { .. } => "client hello",
            Message::ProtocolVersionUnsupported { .. } => "protocol version unsupported",
            Message::ServerHelloComplete => "server hello complete",
            Message::EntryAssignment(_) => "entry assignment",
            Message::EntryUpdate { .. } => "entry update",
        }
    }

    /// Appends the full wire form of this message to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            Message::KeepAlive => buf.push(kind::KEEP_ALIVE),
            Message::ClientHello { revision } => {
                buf.push(kind::CLIENT_HELLO);
                buf.extend_from_slice(&revision.to_be_bytes());
            }
            Message::ProtocolVersionUnsupported { revision } => {
                buf.push(kind::PROTOCOL_VERSION_UNSUPPORTED);
                buf.extend_from_slice(&revision.to_be_bytes());
            }
            Message::ServerHelloComplete => buf.push(kind::SERVER_HELLO_COMPLETE),
            Message::EntryAssignment(entry) => {
                buf.push(kind::ENTRY_ASSIGNMENT);
                value::write_string(buf, &entry.name)?;
                buf.push(entry.value_type().tag());
                buf.extend_from_slice(&entry.wire_id().to_be_bytes());
                buf.extend_from_slice(&entry.sequence.0.to_be_bytes());
                value::encode(entry.value_type(), &entry.value, buf)?;
            }
            Message::EntryUpdate {
                id,
                sequence,
                value,
            } => {
                buf.push(kind::ENTRY_UPDATE);
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(&sequence.0.to_be_bytes());
                value::encode(value.value_type(), value, buf)?;
            }
        }
        Ok(())
    }
}

/// Resolves the value type of an entry id while decoding an update, which
/// carries no type tag of its own.
pub trait EntryLookup {
    fn value_type(&self, id: u16) -> Option<ValueType>;
}

/// Reads exactly one message.
///
/// Returns `Ok(None)` when the stream ends cleanly on a message boundary. An
/// end of stream inside a message is an I/O error.
pub async fn read_message<R, L>(reader: &mut R, lookup: &L) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin,
    L: EntryLookup + ?Sized,
{
    let marker = match reader.read_u8().await {
        Ok(marker) => marker,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let message = match marker {
        kind::KEEP_ALIVE => Message::KeepAlive,
        kind::CLIENT_HELLO => Message::ClientHello {
            revision: reader.read_u16().await?,
        },
        kind::PROTOCOL_VERSION_UNSUPPORTED => Message::ProtocolVersionUnsupported {
            revision: reader.read_u16().await?,
        },
        kind::SERVER_HELLO_COMPLETE => Message::ServerHelloComplete,
        kind::ENTRY_ASSIGNMENT => {
            let name = value::read_string(reader).await?;
            let value_type = ValueType::try_from(reader.read_u8().await?)?;
            let id = reader.read_u16().await?;
            let sequence = SequenceNumber(reader.read_u16().await?);
            let value = value::decode(value_type, reader).await?;
            let id = (id != UNASSIGNED_ID).then_some(id);
            Message::EntryAssignment(Entry::new(id, name, sequence, value))
        }
        kind::ENTRY_UPDATE => {
            let id = reader.read_u16().await?;
            let sequence = SequenceNumber(reader.read_u16().await?);
            let value_type = lookup
                .value_type(id)
                .ok_or(BadMessage::UnknownEntryId(id))?;
            let value = value::decode(value_type, reader).await?;
            Message::EntryUpdate {
                id,
                sequence,
                value,
            }
        }
        other => return Err(BadMessage::UnknownMessageType(other).into()),
    };

    trace!(message = message.name(), "read message");
    Ok(Some(message))
}

/// Write side of a connection.
///
/// Each send encodes the complete message first, then writes and flushes it
/// while holding the lock, so concurrent senders never interleave bytes.
pub struct MessageWriter<W> {
    inner: Mutex<BufWriter<W>>,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(BufWriter::new(writer)),
        }
    }

    pub async fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        let mut encoded = Vec::new();
        message.encode(&mut encoded)?;

        let mut writer = self.inner.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        trace!(message = message.name(), bytes = encoded.len(), "sent message");
        Ok(())
    }

    pub async fn send_keep_alive(&self) -> Result<(), ProtocolError> {
        self.send(&Message::KeepAlive).await
    }

    pub async fn send_client_hello(&self) -> Result<(), ProtocolError> {
        self.send(&Message::ClientHello {
            revision: PROTOCOL_REVISION,
        })
        .await
    }

    pub async fn send_server_hello_complete(&self) -> Result<(), ProtocolError> {
        self.send(&Message::ServerHelloComplete).await
    }

    /// Tells a client which revision this server speaks.
    pub async fn send_protocol_version_unsupported(&self) -> Result<(), ProtocolError> {
        self.send(&Message::ProtocolVersionUnsupported {
            revision: PROTOCOL_REVISION,
        })
        .await
    }

    pub async fn send_entry_assignment(&self, entry: &Entry) -> Result<(), ProtocolError> {
        self.send(&Message::EntryAssignment(entry.clone())).await
    }

    pub async fn send_entry_update(&self, entry: &Entry) -> Result<(), ProtocolError> {
        self.send(&Message::update(entry)).await
    }

    /// Flushes anything left in the buffer. Sends already flush on their own.
    pub async fn flush(&self) -> Result<(), ProtocolError> {
        self.inner.lock().await.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.inner.lock().await.shutdown().await?;
        Ok(())
    }
}

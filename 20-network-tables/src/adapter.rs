//! Role-specific handling of decoded messages.
//!
//! Both roles share the framer and the monitor; they differ in the handshake
//! and in where accepted changes go next. The server answers a client hello
//! with its entries and fans client changes out to the other connections. The
//! client waits for the server's entries and only then starts sending its own.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, spawn_forwarder},
    entry::Entry,
    error::{BadMessage, CloseReason, ProtocolError},
    message::{EntryLookup, Message, PROTOCOL_REVISION},
    table::EntryTable,
    value::ValueType,
};

/// What the read loop should do after a message has been handled.
#[derive(Debug)]
pub enum Flow {
    Continue,
    Close(CloseReason),
}

/// Handshake progress of a client session.
#[derive(Debug, Clone)]
pub enum SyncState {
    /// Connected, waiting for the server's entries.
    Synchronizing,
    /// The server's entries are in, local changes go out as they happen.
    Live,
    Closed(CloseReason),
}

impl SyncState {
    pub fn is_live(&self) -> bool {
        matches!(self, SyncState::Live)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SyncState::Closed(_))
    }
}

pub enum Adapter {
    Server(ServerAdapter),
    Client(ClientAdapter),
}

pub struct ServerAdapter {
    table: Arc<EntryTable>,
    connection: Arc<Connection>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

pub struct ClientAdapter {
    table: Arc<EntryTable>,
    connection: Arc<Connection>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<SyncState>,
}

fn unexpected(message: &Message, context: &'static str) -> ProtocolError {
    BadMessage::Unexpected {
        message: message.name(),
        context,
    }
    .into()
}

impl Adapter {
    pub fn server(table: Arc<EntryTable>, connection: Arc<Connection>) -> Self {
        Adapter::Server(ServerAdapter {
            table,
            connection,
            forwarder: Mutex::new(None),
        })
    }

    pub fn client(
        table: Arc<EntryTable>,
        connection: Arc<Connection>,
    ) -> (Self, watch::Receiver<SyncState>) {
        let (state, rx) = watch::channel(SyncState::Synchronizing);
        let adapter = Adapter::Client(ClientAdapter {
            table,
            connection,
            forwarder: Mutex::new(None),
            state,
        });
        (adapter, rx)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        match self {
            Adapter::Server(server) => &server.connection,
            Adapter::Client(client) => &client.connection,
        }
    }

    pub fn table(&self) -> &Arc<EntryTable> {
        match self {
            Adapter::Server(server) => &server.table,
            Adapter::Client(client) => &client.table,
        }
    }

    /// The entry behind a wire id, if this session knows it.
    pub fn get_entry(&self, id: u16) -> Option<Entry> {
        self.table().entry_by_id(id)
    }

    pub async fn handle(&self, message: Message) -> Result<Flow, ProtocolError> {
        match self {
            Adapter::Server(server) => server.handle(message).await,
            Adapter::Client(client) => client.handle(message).await,
        }
    }

    /// Releases everything the adapter started once its connection is gone.
    pub(crate) fn detach(&self, reason: &CloseReason) {
        let forwarder = match self {
            Adapter::Server(server) => &server.forwarder,
            Adapter::Client(client) => {
                client.state.send_replace(SyncState::Closed(reason.clone()));
                &client.forwarder
            }
        };
        if let Some(task) = forwarder.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

impl EntryLookup for Adapter {
    fn value_type(&self, id: u16) -> Option<ValueType> {
        self.table().value_type(id)
    }
}

impl ServerAdapter {
    fn is_synchronized(&self) -> bool {
        self.forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn handle(&self, message: Message) -> Result<Flow, ProtocolError> {
        let origin = self.connection.id();
        match message {
            Message::KeepAlive => {}
            Message::ClientHello { revision } if self.is_synchronized() => {
                return Err(unexpected(&Message::ClientHello { revision }, "after the handshake"));
            }
            Message::ClientHello { revision } if revision != PROTOCOL_REVISION => {
                warn!(connection = origin, revision, "client speaks an unsupported revision");
                self.connection
                    .writer()
                    .send_protocol_version_unsupported()
                    .await?;
                return Ok(Flow::Close(CloseReason::ProtocolMismatch {
                    ours: PROTOCOL_REVISION,
                    theirs: revision,
                }));
            }
            Message::ClientHello { .. } => {
                let (entries, outbound) = self.table.snapshot_and_subscribe();
                let writer = self.connection.writer();
                for entry in &entries {
                    writer.send_entry_assignment(entry).await?;
                }
                writer.send_server_hello_complete().await?;

                let task = spawn_forwarder(Arc::clone(&self.connection), outbound);
                *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
                info!(connection = origin, entries = entries.len(), "client synchronized");
            }
            message @ (Message::EntryAssignment(_) | Message::EntryUpdate { .. })
                if !self.is_synchronized() =>
            {
                return Err(unexpected(&message, "before the client hello"));
            }
            Message::EntryAssignment(entry) => {
                debug!(connection = origin, name = %entry.name, "assignment from client");
                self.table.accept_assignment_request(entry, origin)?;
            }
            Message::EntryUpdate {
                id,
                sequence,
                value,
            } => {
                self.table
                    .apply_incoming_update(id, sequence, value, Some(origin))?;
            }
            message @ (Message::ProtocolVersionUnsupported { .. }
            | Message::ServerHelloComplete) => {
                return Err(unexpected(&message, "from a client"));
            }
        }
        Ok(Flow::Continue)
    }
}

impl ClientAdapter {
    async fn handle(&self, message: Message) -> Result<Flow, ProtocolError> {
        match message {
            Message::KeepAlive => {}
            Message::ProtocolVersionUnsupported { revision } => {
                warn!(ours = PROTOCOL_REVISION, theirs = revision, "server rejected our revision");
                return Ok(Flow::Close(CloseReason::ProtocolMismatch {
                    ours: PROTOCOL_REVISION,
                    theirs: revision,
                }));
            }
            Message::ServerHelloComplete => {
                if self.state.borrow().is_live() {
                    return Err(unexpected(&Message::ServerHelloComplete, "after the handshake"));
                }
                let (pending, outbound) = self.table.go_live();
                let writer = self.connection.writer();
                for message in &pending {
                    writer.send(message).await?;
                }

                let task = spawn_forwarder(Arc::clone(&self.connection), outbound);
                *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
                self.state.send_replace(SyncState::Live);
                info!(
                    entries = self.table.len(),
                    pending = pending.len(),
                    "synchronized with server"
                );
            }
            Message::EntryAssignment(entry) => {
                self.table.apply_incoming_assignment(entry)?;
            }
            Message::EntryUpdate {
                id,
                sequence,
                value,
            } => {
                self.table.apply_incoming_update(id, sequence, value, None)?;
            }
            message @ Message::ClientHello { .. } => {
                return Err(unexpected(&message, "from the server"));
            }
        }
        Ok(Flow::Continue)
    }
}

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, split},
    net::TcpStream,
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    adapter::{Adapter, SyncState},
    config::{ClientConfig, SessionConfig},
    connection::{Connection, spawn_keep_alive},
    error::{CloseReason, ProtocolError},
    monitor::ConnectionMonitor,
    network_table::NetworkTable,
    table::{EntryTable, Role},
};

/// A client session: one upstream connection and the table it mirrors.
///
/// The table belongs to the connection. Once the connection closes the table
/// stops syncing; reconnecting means building a new `Client`.
pub struct Client {
    table: Arc<EntryTable>,
    connection: Arc<Connection>,
    state: watch::Receiver<SyncState>,
    monitor: Mutex<Option<ConnectionMonitor>>,
    keep_alive: Option<JoinHandle<()>>,
}

impl Client {
    pub async fn connect(config: &ClientConfig) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(config.server).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        info!(server = %config.server, "connected");
        Self::from_stream(stream, peer, &config.session).await
    }

    /// Starts the handshake over an already open stream.
    pub async fn from_stream<S>(
        stream: S,
        peer: Option<SocketAddr>,
        session: &SessionConfig,
    ) -> Result<Self, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let table = Arc::new(EntryTable::with_outbound_capacity(
            Role::Client,
            session.outbound_capacity,
        ));
        let (reader, writer) = split(stream);
        let connection = Arc::new(Connection::new(0, peer, writer));
        connection.writer().send_client_hello().await?;

        let (adapter, state) = Adapter::client(Arc::clone(&table), Arc::clone(&connection));
        let keep_alive = spawn_keep_alive(Arc::clone(&connection), session.keep_alive_interval);
        let monitor = ConnectionMonitor::spawn(reader, Arc::new(adapter), session.idle_timeout);

        Ok(Self {
            table,
            connection,
            state,
            monitor: Mutex::new(Some(monitor)),
            keep_alive,
        })
    }

    pub fn table(&self) -> &Arc<EntryTable> {
        &self.table
    }

    pub fn root(&self) -> NetworkTable {
        NetworkTable::root(Arc::clone(&self.table))
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Resolves once the server's entries are in, or with the reason the
    /// connection closed first.
    pub async fn wait_until_live(&self) -> Result<(), CloseReason> {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|state| !matches!(state, SyncState::Synchronizing))
            .await
            .map(|state| state.clone());
        match result {
            Ok(SyncState::Live) => Ok(()),
            Ok(SyncState::Closed(reason)) => Err(reason),
            Ok(SyncState::Synchronizing) | Err(_) => Err(self.fallback_reason()),
        }
    }

    /// Resolves with the reason once the connection has closed.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.state.clone();
        let result = state
            .wait_for(SyncState::is_closed)
            .await
            .map(|state| state.clone());
        match result {
            Ok(SyncState::Closed(reason)) => reason,
            _ => self.fallback_reason(),
        }
    }

    /// Stops the session and waits until the connection is fully shut down.
    pub async fn close(&self) -> CloseReason {
        self.connection.close(CloseReason::Cancelled);
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match monitor {
            Some(monitor) => monitor.join().await,
            None => self.closed().await,
        }
    }

    fn fallback_reason(&self) -> CloseReason {
        self.connection
            .close_reason()
            .unwrap_or(CloseReason::Cancelled)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.close(CloseReason::Cancelled);
        if let Some(task) = self.keep_alive.take() {
            task.abort();
        }
        debug!("client dropped");
    }
}

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use futures::future::join_all;
use tokio::{
    io::{AsyncRead, AsyncWrite, split},
    net::{TcpListener, TcpStream},
    select,
    sync::Mutex,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    adapter::Adapter,
    config::{ServerConfig, SessionConfig},
    connection::{Connection, spawn_keep_alive},
    error::CloseReason,
    monitor::ConnectionMonitor,
    network_table::NetworkTable,
    table::{ConnectionId, EntryTable, Role},
};

/// Accepts clients and keeps them in sync with one shared entry table.
pub struct Server {
    listener: TcpListener,
    handle: ServerHandle,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(Self::new(listener, config.session.clone()))
    }

    pub fn new(listener: TcpListener, session: SessionConfig) -> Self {
        Self {
            listener,
            handle: ServerHandle::new(session),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle that stays usable while [`Server::run_until`] owns the server.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, handle } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    handle.shutdown().await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &handle).await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    handle: &ServerHandle,
) {
    match result {
        Ok((stream, peer)) => {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = ?err, "failed to disable nagle");
            }
            handle.attach(stream, Some(peer)).await;
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

struct ServerState {
    table: Arc<EntryTable>,
    session: SessionConfig,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    /// One cleanup task per connection, finished ones pruned on attach.
    cleanups: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl ServerHandle {
    /// Server state without a listener. Streams are added with [`attach`].
    ///
    /// [`attach`]: ServerHandle::attach
    pub fn new(session: SessionConfig) -> Self {
        let table = EntryTable::with_outbound_capacity(Role::Server, session.outbound_capacity);
        Self {
            state: Arc::new(ServerState {
                table: Arc::new(table),
                session,
                connections: Mutex::new(HashMap::new()),
                cleanups: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn table(&self) -> &Arc<EntryTable> {
        &self.state.table
    }

    pub fn root(&self) -> NetworkTable {
        NetworkTable::root(Arc::clone(&self.state.table))
    }

    pub async fn connection_count(&self) -> usize {
        self.state.connections.lock().await.len()
    }

    /// Serves a client over any duplex byte stream.
    pub async fn attach<S>(&self, stream: S, peer: Option<SocketAddr>) -> ConnectionId
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let state = &self.state;
        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = split(stream);
        let connection = Arc::new(Connection::new(id, peer, writer));
        state
            .connections
            .lock()
            .await
            .insert(id, Arc::clone(&connection));

        let adapter = Arc::new(Adapter::server(
            Arc::clone(&state.table),
            Arc::clone(&connection),
        ));
        let keep_alive = spawn_keep_alive(Arc::clone(&connection), state.session.keep_alive_interval);
        let monitor = ConnectionMonitor::spawn(reader, adapter, state.session.idle_timeout);
        info!(connection = id, ?peer, "client connected");

        let cleanup_state = Arc::clone(state);
        let cleanup = tokio::spawn(async move {
            let state = cleanup_state;
            let reason = monitor.join().await;
            if let Some(task) = keep_alive {
                task.abort();
            }
            state.connections.lock().await.remove(&id);
            debug!(connection = id, %reason, "client removed");
        });

        let mut cleanups = state.cleanups.lock().await;
        cleanups.retain(|task| !task.is_finished());
        cleanups.push(cleanup);

        id
    }

    /// Stops every connected client and waits for their connections to
    /// wind down. The table is kept.
    pub async fn shutdown(&self) {
        for connection in self.state.connections.lock().await.values() {
            connection.close(CloseReason::Cancelled);
        }

        let cleanups = std::mem::take(&mut *self.state.cleanups.lock().await);
        for result in join_all(cleanups).await {
            if let Err(err) = result {
                warn!(error = ?err, "connection cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncWriteExt, duplex},
        time,
    };

    use super::*;
    use crate::{
        message::{Message, PROTOCOL_REVISION},
        value::Value,
    };

    #[tokio::test]
    async fn closed_streams_are_removed() {
        let handle = ServerHandle::new(SessionConfig::default());
        let (ours, theirs) = duplex(64);
        handle.attach(ours, None).await;
        assert_eq!(handle.connection_count().await, 1);

        drop(theirs);
        time::timeout(Duration::from_secs(5), async {
            while handle.connection_count().await != 0 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection should be removed");
    }

    #[tokio::test]
    async fn shutdown_keeps_the_table() {
        let handle = ServerHandle::new(SessionConfig::default());
        handle.root().put_number("speed", 1.0).unwrap();
        let (ours, _theirs) = duplex(64);
        handle.attach(ours, None).await;

        handle.shutdown().await;
        assert_eq!(handle.connection_count().await, 0);
        assert_eq!(handle.table().get_value("speed"), Some(Value::Double(1.0)));
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_on_a_peer_that_stopped_reading() {
        let handle = ServerHandle::new(SessionConfig::default());
        for i in 0..200 {
            handle
                .table()
                .assign(&format!("sensor/{i}"), Value::Double(i as f64))
                .unwrap();
        }

        let (ours, mut theirs) = duplex(256);
        handle.attach(ours, None).await;
        let mut hello = Vec::new();
        Message::ClientHello {
            revision: PROTOCOL_REVISION,
        }
        .encode(&mut hello)
        .unwrap();
        theirs.write_all(&hello).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;

        time::timeout(Duration::from_secs(3), handle.shutdown())
            .await
            .expect("shutdown should not wait for a stalled reader");
        assert_eq!(handle.connection_count().await, 0);
    }
}

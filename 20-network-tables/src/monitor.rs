//! The per-connection read loop.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, BufReader},
    select,
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use crate::{
    adapter::{Adapter, Flow},
    connection::{Connection, wait_closed},
    error::{CloseReason, ProtocolError},
    message::read_message,
};

/// How long a closing connection may spend flushing and shutting down its
/// write half.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    Stopped,
}

/// Reads messages from one connection and hands them to its adapter until the
/// connection fails or is stopped.
///
/// Malformed messages are logged and skipped. The monitor never reconnects;
/// whoever owns the session decides what to do with the [`CloseReason`].
pub struct ConnectionMonitor {
    connection: Arc<Connection>,
    task: JoinHandle<CloseReason>,
}

impl ConnectionMonitor {
    pub fn spawn<R>(reader: R, adapter: Arc<Adapter>, idle_timeout: Option<Duration>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let connection = Arc::clone(adapter.connection());
        let task = tokio::spawn(read_loop(BufReader::new(reader), adapter, idle_timeout));
        Self { connection, task }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> MonitorState {
        if self.task.is_finished() {
            MonitorState::Stopped
        } else {
            MonitorState::Running
        }
    }

    /// Requests a cooperative stop. A read in flight is abandoned.
    pub fn stop(&self) {
        self.connection.close(CloseReason::Cancelled);
    }

    /// Waits for the loop to finish and returns why it did.
    pub async fn join(self) -> CloseReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(err) => {
                warn!(connection = self.connection.id(), error = %err, "connection monitor failed");
                self.connection.close_reason().unwrap_or(CloseReason::Cancelled)
            }
        }
    }
}

async fn read_loop<R>(
    mut reader: BufReader<R>,
    adapter: Arc<Adapter>,
    idle_timeout: Option<Duration>,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    let connection = Arc::clone(adapter.connection());
    let id = connection.id();
    let mut closed = connection.close_signal();

    let reason = loop {
        let next = async {
            let read = read_message(&mut reader, adapter.as_ref());
            match idle_timeout {
                Some(limit) => time::timeout(limit, read)
                    .await
                    .map_err(|_| CloseReason::IdleTimeout(limit)),
                None => Ok(read.await),
            }
        };

        let read = select! {
            _ = wait_closed(&mut closed) => {
                break connection.close_reason().unwrap_or(CloseReason::Cancelled);
            }
            read = next => read,
        };

        let message = match read {
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => break CloseReason::PeerClosed,
            Ok(Err(ProtocolError::Io(err))) => break err.into(),
            Ok(Err(err)) => {
                warn!(connection = id, error = %err, "skipping bad message");
                continue;
            }
            Err(idle) => break idle,
        };

        // Handling may write, and a write to a peer that stopped reading only
        // ends with the close signal.
        let handled = select! {
            _ = wait_closed(&mut closed) => {
                break connection.close_reason().unwrap_or(CloseReason::Cancelled);
            }
            handled = adapter.handle(message) => handled,
        };

        match handled {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close(reason)) => break reason,
            Err(ProtocolError::Io(err)) => break err.into(),
            Err(err) => warn!(connection = id, error = %err, "could not apply message"),
        }
    };

    connection.close(reason);
    let reason = connection
        .close_reason()
        .unwrap_or(CloseReason::Cancelled);
    adapter.detach(&reason);

    match time::timeout(SHUTDOWN_GRACE, connection.writer().shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(connection = id, error = %err, "write half already gone"),
        Err(_) => debug!(connection = id, "gave up shutting down the write half"),
    }

    info!(connection = id, peer = ?connection.peer(), reason = %reason, "connection closed");
    reason
}

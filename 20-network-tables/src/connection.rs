//! One end of a session: the locked write side, the stop flag, and the
//! background tasks that write on the connection's behalf.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::AsyncWrite,
    select,
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    error::{CloseReason, ProtocolError},
    message::MessageWriter,
    table::{ConnectionId, Outbound},
};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    writer: MessageWriter<BoxedWriter>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl Connection {
    pub fn new<W>(id: ConnectionId, peer: Option<SocketAddr>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(None);
        Self {
            id,
            peer,
            writer: MessageWriter::new(Box::new(writer)),
            closed,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn writer(&self) -> &MessageWriter<BoxedWriter> {
        &self.writer
    }

    /// Asks every task serving this connection to stop. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    pub(crate) fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed.subscribe()
    }

    fn close_after(&self, err: ProtocolError) {
        match err {
            ProtocolError::Io(err) => self.close(err.into()),
            other => warn!(connection = self.id, error = %other, "dropping unsendable message"),
        }
    }
}

/// Resolves once `signal` carries a close reason.
pub(crate) async fn wait_closed(signal: &mut watch::Receiver<Option<CloseReason>>) {
    // An error means the sender is gone, which only happens with the connection.
    let _ = signal.wait_for(Option::is_some).await;
}

/// Sends a keep-alive every `interval` until the connection closes. A zero
/// interval disables keep-alives.
pub(crate) fn spawn_keep_alive(
    connection: Arc<Connection>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut closed = connection.close_signal();
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = wait_closed(&mut closed) => break,
                _ = ticker.tick() => {}
            }

            // A peer that stopped reading blocks the write; the close signal still ends it.
            let sent = select! {
                _ = wait_closed(&mut closed) => break,
                sent = connection.writer().send_keep_alive() => sent,
            };
            if let Err(err) = sent {
                debug!(connection = connection.id(), error = %err, "keep-alive failed");
                connection.close_after(err);
            }
        }
    }))
}

/// Writes every outbound message routed to this connection until it closes.
pub(crate) fn spawn_forwarder(
    connection: Arc<Connection>,
    mut outbound: broadcast::Receiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut closed = connection.close_signal();
        loop {
            let next = select! {
                _ = wait_closed(&mut closed) => break,
                next = outbound.recv() => next,
            };

            match next {
                Ok(Outbound { route, message }) => {
                    if !route.includes(connection.id()) {
                        continue;
                    }
                    let sent = select! {
                        _ = wait_closed(&mut closed) => break,
                        sent = connection.writer().send(&message) => sent,
                    };
                    if let Err(err) = sent {
                        debug!(connection = connection.id(), error = %err, "failed to forward message");
                        connection.close_after(err);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection = connection.id(), skipped, "connection fell behind, closing it");
                    connection.close(CloseReason::Lagged(skipped));
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

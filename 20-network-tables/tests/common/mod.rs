//! Harness shared by the integration tests: a server on an ephemeral port and
//! a raw protocol peer that speaks the wire format by hand.

#![allow(dead_code)]

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use network_tables::{
    Server,
    ServerHandle,
    ValueType,
    config::SessionConfig,
    message::{EntryLookup, Message, PROTOCOL_REVISION, read_message},
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener,
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

pub const WAIT: Duration = Duration::from_secs(3);

/// Session settings without keep-alives, so raw peers only see real traffic.
pub fn quiet_session() -> SessionConfig {
    SessionConfig {
        keep_alive_interval: Duration::ZERO,
        ..SessionConfig::default()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start(session: SessionConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener, session);
        let addr = server.local_addr()?;
        let handle = server.handle();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        Ok(Self {
            addr,
            handle,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        timeout(WAIT, &mut self.task)
            .await
            .context("server did not stop")???;
        Ok(())
    }
}

/// Entry types learned from assignments, for decoding updates.
#[derive(Default)]
pub struct KnownTypes(HashMap<u16, ValueType>);

impl EntryLookup for KnownTypes {
    fn value_type(&self, id: u16) -> Option<ValueType> {
        self.0.get(&id).copied()
    }
}

/// A peer that writes and reads protocol messages directly.
pub struct RawPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    types: KnownTypes,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
            types: KnownTypes::default(),
        })
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let mut bytes = Vec::new();
        message.encode(&mut bytes)?;
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Half-closes the connection; the server sees end of stream.
    pub async fn finish(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// The next message other than a keep-alive, or `None` once the server
    /// has closed the connection.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        loop {
            let message = timeout(WAIT, read_message(&mut self.reader, &self.types))
                .await
                .context("timed out waiting for a message")??;
            match message {
                Some(Message::KeepAlive) => continue,
                Some(Message::EntryAssignment(entry)) => {
                    if let Some(id) = entry.id {
                        self.types.0.insert(id, entry.value_type());
                    }
                    return Ok(Some(Message::EntryAssignment(entry)));
                }
                other => return Ok(other),
            }
        }
    }

    pub async fn expect(&mut self) -> Result<Message> {
        self.next()
            .await?
            .context("connection closed while a message was expected")
    }

    /// Completes the handshake and returns the assignments received.
    pub async fn handshake(&mut self) -> Result<Vec<Message>> {
        self.send(&Message::ClientHello {
            revision: PROTOCOL_REVISION,
        })
        .await?;
        let mut assignments = Vec::new();
        loop {
            match self.expect().await? {
                Message::ServerHelloComplete => return Ok(assignments),
                message @ Message::EntryAssignment(_) => assignments.push(message),
                other => anyhow::bail!("unexpected message during handshake: {other:?}"),
            }
        }
    }
}

pub async fn wait_for<F>(what: &str, condition: F) -> Result<()>
where
    F: Fn() -> bool,
{
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}

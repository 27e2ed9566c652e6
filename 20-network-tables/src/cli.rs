use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{ClientConfig, DEFAULT_KEEP_ALIVE_INTERVAL, ServerConfig, SessionConfig};
use crate::table::DEFAULT_OUTBOUND_CAPACITY;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve an entry table to clients over TCP.
    Server(ServerArgs),
    /// Connect to a server and mirror its entry table.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:1735")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:1735")]
    pub server: SocketAddr,

    #[command(flatten)]
    pub session: SessionArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Milliseconds between keep-alive messages. 0 disables them.
    #[arg(long, default_value_t = DEFAULT_KEEP_ALIVE_INTERVAL.as_millis() as u64)]
    pub keep_alive_ms: u64,

    /// Close a connection after this many milliseconds without traffic.
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Outbound messages buffered per connection before it is dropped as lagging.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,
}

impl From<&SessionArgs> for SessionConfig {
    fn from(args: &SessionArgs) -> Self {
        Self {
            keep_alive_interval: Duration::from_millis(args.keep_alive_ms),
            idle_timeout: args.idle_timeout_ms.map(Duration::from_millis),
            outbound_capacity: args.outbound_capacity,
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            listen: args.listen,
            session: (&args.session).into(),
        }
    }
}

impl From<&ClientArgs> for ClientConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            server: args.server,
            session: (&args.session).into(),
        }
    }
}

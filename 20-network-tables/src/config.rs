//! Session settings for servers and clients.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use crate::table::DEFAULT_OUTBOUND_CAPACITY;

pub const DEFAULT_PORT: u16 = 1735;
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

pub fn default_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT))
}

/// Per-connection behaviour shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How often each side sends a keep-alive.
    pub keep_alive_interval: Duration,
    /// Close a connection that has been silent this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Outbound messages buffered per connection before it counts as lagging.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            idle_timeout: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_address(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_address(),
            session: SessionConfig::default(),
        }
    }
}

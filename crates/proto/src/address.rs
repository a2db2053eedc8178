use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::topology::StreamId;

/// Bitmask describing peer service capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Services(pub u64);

impl Services {
    pub const NODE_NETWORK: Services = Services(1 << 0);

    pub fn contains(self, other: Services) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Services {
    fn default() -> Self {
        Services::NODE_NETWORK
    }
}

/// A peer endpoint known to serve `stream`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub stream: StreamId,
    pub services: Services,
    /// Unix seconds at which the peer was last known to be reachable.
    pub last_seen: i64,
}

impl NetworkAddress {
    pub fn new(socket: SocketAddr, stream: StreamId, services: Services, last_seen: i64) -> Self {
        Self {
            ip: socket.ip(),
            port: socket.port(),
            stream,
            services,
            last_seen,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Records for the same `(ip, port)` replace each other within a stream.
    pub fn key(&self) -> (IpAddr, u16) {
        (self.ip, self.port)
    }
}

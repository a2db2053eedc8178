use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use proto::{InventoryVector, NetworkAddress, Services, StreamId};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};

/// Protocol revision spoken by this node. Peers must match it exactly.
pub const PROTOCOL_VERSION: u32 = 3;
/// Largest `inv`/`getdata` list a peer may send.
pub const MAX_INV_ITEMS: usize = 50_000;
/// Largest `addr` list a peer may send.
pub const MAX_ADDR_ITEMS: usize = 1_000;
pub const MAX_USER_AGENT_LEN: usize = 5_000;

/// Node-local identifier of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Random nonce identifying this node's session in version messages.
pub fn session_nonce() -> u64 {
    OsRng.next_u64()
}

/// Which side opened the TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Version handshake describing peer properties.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: u32,
    pub services: Services,
    pub timestamp: i64,
    pub receiver: NetworkAddress,
    pub sender: NetworkAddress,
    /// Session nonce of the sender, used to detect connections to ourselves.
    pub nonce: u64,
    pub user_agent: String,
    pub streams: Vec<StreamId>,
}

impl Version {
    pub fn new(
        nonce: u64,
        user_agent: impl Into<String>,
        streams: Vec<StreamId>,
        services: Services,
        sender: Option<SocketAddr>,
        receiver: SocketAddr,
    ) -> Self {
        let timestamp = chrono::Utc::now().timestamp();
        let stream = streams.first().copied().unwrap_or(1);
        let sender = sender.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        Self {
            version: PROTOCOL_VERSION,
            services,
            timestamp,
            receiver: NetworkAddress::new(receiver, stream, Services(0), timestamp),
            sender: NetworkAddress::new(sender, stream, services, timestamp),
            nonce,
            user_agent: user_agent.into(),
            streams,
        }
    }
}

/// Top-level wire messages exchanged across peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMessage {
    Version(Version),
    VerAck,
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    Addr(Vec<NetworkAddress>),
    Object(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl NetMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetMessage::Version(_) => "version",
            NetMessage::VerAck => "verack",
            NetMessage::Inv(_) => "inv",
            NetMessage::GetData(_) => "getdata",
            NetMessage::Addr(_) => "addr",
            NetMessage::Object(_) => "object",
        }
    }
}

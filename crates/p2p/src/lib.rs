//! Peer sessions for the gossip network.
//!
//! Messages are framed as a varint length prefix followed by a CBOR body.
//! Each [`connection`] runs the version/verack handshake and then the
//! steady-state `inv`/`getdata`/`addr`/`object` exchange, reporting what it
//! learns to its owner as [`ConnectionEvent`]s.

mod config;
pub mod connection;
mod error;
mod framing;
mod handshake;
mod types;

pub use config::ConnectionConfig;
pub use connection::{
    ConnectionContext, ConnectionEvent, ConnectionHandle, ConnectionState, accept, connect,
    spawn_connection,
};
pub use error::{ConnectionError, ProtocolViolation};
pub use framing::{read_message, write_message};
pub use types::{
    ConnectionId, MAX_ADDR_ITEMS, MAX_INV_ITEMS, MAX_USER_AGENT_LEN, NetMessage, PROTOCOL_VERSION,
    Role, Version, session_nonce,
};

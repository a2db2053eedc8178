use std::time::Duration;

use proto::{Services, StreamId};

/// Runtime configuration shared by every connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Time allowed for the TCP dial.
    pub connect_timeout: Duration,
    /// Longest a connection waits on its socket before rechecking its stop
    /// flag and deadlines.
    pub read_timeout: Duration,
    /// Time allowed for the version/verack exchange.
    pub handshake_timeout: Duration,
    /// Maximum bytes per message frame.
    pub max_message_size: usize,
    /// Maximum messages queued per connection before disconnecting.
    pub outbound_queue: usize,
    pub user_agent: String,
    pub services: Services,
    /// Streams this node serves.
    pub streams: Vec<StreamId>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(20),
            max_message_size: 2 * 1024 * 1024,
            outbound_queue: 256,
            user_agent: concat!("/gossip-node:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            services: Services::NODE_NETWORK,
            streams: vec![1],
        }
    }
}

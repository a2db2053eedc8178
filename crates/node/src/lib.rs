//! Node runtime: the network manager that owns every connection, the
//! pending-request table, the background message parser and the pieces the
//! binary needs to configure them.

pub mod cfg;
pub mod compose;
pub mod error;
pub mod manager;
pub mod parser;
pub mod pending;

pub use cfg::{NodeConfig, PowConfig, TuningState, append_identity, load_identities};
pub use compose::seal_message;
pub use error::{ComposeError, NetworkError, ParserError};
pub use manager::{ManagerConfig, NetworkManager};
pub use parser::{MessageListener, ObjectParser, ReceivedMessage};
pub use pending::PendingRequests;

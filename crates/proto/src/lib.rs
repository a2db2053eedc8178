//! Shared data model for the gossip network.
//!
//! Streams form an implicit binary tree (`parent = id / 2`), objects are
//! content addressed by their [`InventoryVector`], and peers are described by
//! [`NetworkAddress`] records that are replaced wholesale when a newer one
//! arrives.

mod address;
mod inventory;
mod message;
mod object;
pub mod topology;

pub use address::{NetworkAddress, Services};
pub use inventory::InventoryVector;
pub use message::MessageContent;
pub use object::{MAX_OBJECT_TTL, ObjectError, ObjectKind, ObjectRecord, ObjectTemplate};
pub use topology::{StreamId, path, perimeter, perimeter_of};

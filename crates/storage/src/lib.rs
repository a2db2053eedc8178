//! Node-local knowledge: who we can talk to, which objects we hold, and which
//! identities we can open messages for.
//!
//! [`Datastore`] is shared by every connection task. Address updates are
//! last-writer-wins per `(ip, port)` and stream; objects are only accepted
//! after their inventory vector was marked known by a request of ours.

mod address_book;
pub mod config;
mod datastore;
mod errors;
mod objects;
mod persistent;

pub use address_book::AddressBook;
pub use config::StoreConfig;
pub use datastore::Datastore;
pub use errors::StorageError;
pub use persistent::{FileStore, MemoryStore, ObjectMeta, PersistentStore};

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

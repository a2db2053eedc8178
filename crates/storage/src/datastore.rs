use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crypto::{PrivateIdentity, Ripe};
use parking_lot::{Mutex, RwLock};
use proto::{InventoryVector, NetworkAddress, ObjectRecord, StreamId};
use tracing::{debug, info, warn};

use crate::address_book::AddressBook;
use crate::config::StoreConfig;
use crate::errors::StorageError;
use crate::objects::ObjectIndex;
use crate::persistent::{MemoryStore, PersistentStore};
use crate::unix_now;

/// Shared node state: address book, object index and cache, identities.
///
/// Every method takes `&self`; the address book and the object index are
/// guarded by their own locks so connections only contend per structure.
pub struct Datastore {
    config: StoreConfig,
    addresses: AddressBook,
    objects: Mutex<ObjectIndex>,
    store: Arc<dyn PersistentStore>,
    identities: RwLock<Vec<Arc<PrivateIdentity>>>,
    stopped: AtomicBool,
}

impl Datastore {
    /// Opens a datastore over `store`, indexing everything it already holds.
    pub fn new(config: StoreConfig, store: Arc<dyn PersistentStore>) -> Result<Self, StorageError> {
        let config = config.validate_and_clamp();
        let mut index = ObjectIndex::new(config.cache_capacity);
        let existing = store.index()?;
        let loaded = existing.len();
        for meta in existing {
            index.load(meta);
        }
        info!(objects = loaded, "datastore opened");
        Ok(Self {
            config,
            addresses: AddressBook::new(),
            objects: Mutex::new(index),
            store,
            identities: RwLock::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn in_memory(config: StoreConfig) -> Self {
        let config = config.validate_and_clamp();
        Self {
            objects: Mutex::new(ObjectIndex::new(config.cache_capacity)),
            config,
            addresses: AddressBook::new(),
            store: Arc::new(MemoryStore::new()),
            identities: RwLock::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- objects ---

    /// Vectors from `vectors` we do not hold yet, without duplicates.
    ///
    /// Vectors that were requested but never answered count as new so they
    /// can be asked for again from another peer.
    pub fn filter_new_objects(&self, vectors: &[InventoryVector]) -> Vec<InventoryVector> {
        let index = self.objects.lock();
        let mut seen = HashSet::new();
        vectors
            .iter()
            .filter(|vector| !index.is_stored(vector) && seen.insert(**vector))
            .copied()
            .collect()
    }

    pub fn has_object(&self, inventory: &InventoryVector) -> bool {
        self.objects.lock().is_stored(inventory)
    }

    /// Records that we solicited `vectors`, allowing [`Datastore::put`] to
    /// accept them.
    pub fn mark_known(&self, vectors: &[InventoryVector]) {
        let now = unix_now();
        let mut index = self.objects.lock();
        for vector in vectors {
            index.mark_requested(*vector, now);
        }
    }

    /// Accepts a received object.
    ///
    /// Returns `true` exactly once per solicited vector. Unsolicited objects,
    /// duplicates and anything arriving after [`Datastore::stop`] are refused
    /// and not cached.
    pub fn put(&self, object: &ObjectRecord) -> bool {
        if self.is_stopped() {
            return false;
        }
        if !self.objects.lock().accept(object) {
            debug!(inventory = %object.inventory(), "refusing unsolicited or duplicate object");
            return false;
        }
        self.persist(object);
        true
    }

    /// Stores an object sealed by this node.
    pub fn store_local(&self, object: &ObjectRecord) -> bool {
        if self.is_stopped() {
            return false;
        }
        if !self.objects.lock().store(object) {
            return false;
        }
        self.persist(object);
        true
    }

    fn persist(&self, object: &ObjectRecord) {
        if let Err(err) = self.store.put_object(object) {
            warn!(inventory = %object.inventory(), error = ?err, "failed to persist object");
        }
    }

    /// Objects we hold among `vectors`: cache first, then the persistent store.
    pub fn get_objects(&self, vectors: &[InventoryVector]) -> Vec<ObjectRecord> {
        let mut found = Vec::new();
        let mut cold = Vec::new();
        {
            let index = self.objects.lock();
            for vector in vectors {
                if let Some(object) = index.cached(vector) {
                    found.push(object.clone());
                } else if index.is_stored(vector) {
                    cold.push(*vector);
                }
            }
        }
        for vector in cold {
            match self.store.get_object(&vector) {
                Ok(Some(object)) => found.push(object),
                Ok(None) => debug!(inventory = %vector, "indexed object missing from store"),
                Err(err) => warn!(inventory = %vector, error = ?err, "failed to load object"),
            }
        }
        found
    }

    /// Vectors of stored objects in any of `streams`.
    pub fn inventory(&self, streams: &[StreamId]) -> Vec<InventoryVector> {
        self.objects.lock().stored_in(streams)
    }

    /// Drops expired objects and requests nobody answered in time.
    pub fn expire_objects(&self, now: i64) -> usize {
        let horizon = now.saturating_sub(self.config.request_retention_secs as i64);
        let dropped = self.objects.lock().expire(now, horizon);
        if dropped.is_empty() {
            return 0;
        }
        if let Err(err) = self.store.remove_objects(&dropped) {
            warn!(error = ?err, "failed to remove expired objects");
        }
        debug!(count = dropped.len(), "expired objects");
        dropped.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().stored_count()
    }

    // --- addresses ---

    pub fn filter_new_addresses(&self, list: &[NetworkAddress]) -> Vec<NetworkAddress> {
        self.addresses.filter_new(list)
    }

    /// Stores `list` last-writer-wins; returns the records that changed.
    pub fn put_addresses(&self, list: &[NetworkAddress]) -> Vec<NetworkAddress> {
        if self.is_stopped() {
            return Vec::new();
        }
        self.addresses.put(list)
    }

    pub fn addresses(&self, streams: &[StreamId], limit: usize) -> Vec<NetworkAddress> {
        self.addresses.addresses(streams, limit)
    }

    pub fn candidates(
        &self,
        streams: &[StreamId],
        exclude: &HashSet<SocketAddr>,
        limit: usize,
    ) -> Vec<NetworkAddress> {
        self.addresses.candidates(streams, exclude, limit)
    }

    /// Drops addresses not refreshed within the retention horizon.
    pub fn expire_addresses(&self, now: i64) -> usize {
        let horizon = now.saturating_sub(self.config.address_retention_secs as i64);
        self.addresses.expire(horizon)
    }

    pub fn address_count(&self) -> usize {
        self.addresses.len()
    }

    // --- identities ---

    pub fn add_identity(&self, identity: PrivateIdentity) -> Arc<PrivateIdentity> {
        let identity = Arc::new(identity);
        let mut identities = self.identities.write();
        if let Some(existing) = identities.iter().find(|held| held.ripe() == identity.ripe()) {
            return Arc::clone(existing);
        }
        identities.push(Arc::clone(&identity));
        identity
    }

    pub fn identities(&self) -> Vec<Arc<PrivateIdentity>> {
        self.identities.read().clone()
    }

    pub fn find_identity(&self, ripe: &Ripe) -> Option<Arc<PrivateIdentity>> {
        self.identities
            .read()
            .iter()
            .find(|identity| identity.ripe() == *ripe)
            .cloned()
    }

    // --- lifecycle ---

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("objects", &self.object_count())
            .field("addresses", &self.address_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

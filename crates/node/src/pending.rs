use std::collections::{HashMap, HashSet};

use p2p::ConnectionId;
use parking_lot::Mutex;
use proto::InventoryVector;

#[derive(Debug, Default)]
struct Inner {
    owners: HashMap<InventoryVector, ConnectionId>,
    by_owner: HashMap<ConnectionId, HashSet<InventoryVector>>,
}

/// Outstanding `getdata` requests, at most one per vector across the node.
///
/// An entry leaves the map exactly once: when the object arrives
/// ([`PendingRequests::complete`]) or when its owner goes away
/// ([`PendingRequests::release_owner`]).
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `owner` as the connection asked for each unclaimed vector.
    /// Returns the vectors it now owns, in input order.
    pub fn claim(&self, owner: ConnectionId, vectors: &[InventoryVector]) -> Vec<InventoryVector> {
        let mut inner = self.inner.lock();
        let mut claimed = Vec::new();
        for vector in vectors {
            if inner.owners.contains_key(vector) {
                continue;
            }
            inner.owners.insert(*vector, owner);
            claimed.push(*vector);
        }
        if !claimed.is_empty() {
            inner
                .by_owner
                .entry(owner)
                .or_default()
                .extend(claimed.iter().copied());
        }
        claimed
    }

    /// Clears the request for `vector`, returning who owned it.
    pub fn complete(&self, vector: &InventoryVector) -> Option<ConnectionId> {
        let mut inner = self.inner.lock();
        let owner = inner.owners.remove(vector)?;
        if let Some(owned) = inner.by_owner.get_mut(&owner) {
            owned.remove(vector);
            if owned.is_empty() {
                inner.by_owner.remove(&owner);
            }
        }
        Some(owner)
    }

    /// Drops every request owned by `owner` so others may ask for them.
    pub fn release_owner(&self, owner: ConnectionId) -> Vec<InventoryVector> {
        let mut inner = self.inner.lock();
        let released: Vec<InventoryVector> = inner
            .by_owner
            .remove(&owner)
            .map(|owned| owned.into_iter().collect())
            .unwrap_or_default();
        for vector in &released {
            inner.owners.remove(vector);
        }
        released
    }

    pub fn owner(&self, vector: &InventoryVector) -> Option<ConnectionId> {
        self.inner.lock().owners.get(vector).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

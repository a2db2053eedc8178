use std::collections::{HashMap, VecDeque};

use proto::{InventoryVector, ObjectRecord, StreamId};

use crate::persistent::ObjectMeta;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ObjectState {
    /// We asked a peer for it and are waiting for the object.
    Requested { at: i64 },
    Stored { stream: StreamId, expires: i64 },
}

/// What the node knows about each inventory vector, plus a FIFO cache of
/// recently stored objects.
///
/// The only transitions are absent -> requested -> stored, absent -> stored
/// (local objects and the startup load) and removal on expiry.
#[derive(Debug)]
pub(crate) struct ObjectIndex {
    states: HashMap<InventoryVector, ObjectState>,
    cache: HashMap<InventoryVector, ObjectRecord>,
    order: VecDeque<InventoryVector>,
    capacity: usize,
}

impl ObjectIndex {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            cache: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn load(&mut self, meta: ObjectMeta) {
        self.states.insert(
            meta.inventory,
            ObjectState::Stored {
                stream: meta.stream,
                expires: meta.expires,
            },
        );
    }

    pub(crate) fn is_stored(&self, inventory: &InventoryVector) -> bool {
        matches!(
            self.states.get(inventory),
            Some(ObjectState::Stored { .. })
        )
    }

    /// Marks `inventory` as solicited. Stored vectors are left alone.
    pub(crate) fn mark_requested(&mut self, inventory: InventoryVector, now: i64) {
        match self.states.get_mut(&inventory) {
            Some(ObjectState::Stored { .. }) => {}
            Some(ObjectState::Requested { at }) => *at = now,
            None => {
                self.states.insert(inventory, ObjectState::Requested { at: now });
            }
        }
    }

    /// The requested -> stored transition. Succeeds at most once per vector.
    pub(crate) fn accept(&mut self, object: &ObjectRecord) -> bool {
        let inventory = object.inventory();
        if !matches!(
            self.states.get(&inventory),
            Some(ObjectState::Requested { .. })
        ) {
            return false;
        }
        self.insert_stored(object);
        true
    }

    /// Stores a locally created object. Returns false if it was already stored.
    pub(crate) fn store(&mut self, object: &ObjectRecord) -> bool {
        if self.is_stored(&object.inventory()) {
            return false;
        }
        self.insert_stored(object);
        true
    }

    fn insert_stored(&mut self, object: &ObjectRecord) {
        let inventory = object.inventory();
        self.states.insert(
            inventory,
            ObjectState::Stored {
                stream: object.stream(),
                expires: object.expires(),
            },
        );
        while self.cache.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.cache.remove(&oldest);
                }
                None => break,
            }
        }
        self.cache.insert(inventory, object.clone());
        self.order.push_back(inventory);
    }

    pub(crate) fn cached(&self, inventory: &InventoryVector) -> Option<&ObjectRecord> {
        self.cache.get(inventory)
    }

    /// Stored vectors in any of `streams`.
    pub(crate) fn stored_in(&self, streams: &[StreamId]) -> Vec<InventoryVector> {
        self.states
            .iter()
            .filter_map(|(inventory, state)| match state {
                ObjectState::Stored { stream, .. } if streams.contains(stream) => Some(*inventory),
                _ => None,
            })
            .collect()
    }

    /// Drops stored objects that expired before `now` and requests older than
    /// `request_horizon`. Returns the vectors of the dropped stored objects.
    pub(crate) fn expire(&mut self, now: i64, request_horizon: i64) -> Vec<InventoryVector> {
        let mut dropped = Vec::new();
        self.states.retain(|inventory, state| match *state {
            ObjectState::Stored { expires, .. } => {
                let keep = expires >= now;
                if !keep {
                    dropped.push(*inventory);
                }
                keep
            }
            ObjectState::Requested { at } => at >= request_horizon,
        });
        for inventory in &dropped {
            self.cache.remove(inventory);
        }
        let cache = &self.cache;
        self.order.retain(|inventory| cache.contains_key(inventory));
        dropped
    }

    pub(crate) fn stored_count(&self) -> usize {
        self.states
            .values()
            .filter(|state| matches!(state, ObjectState::Stored { .. }))
            .count()
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

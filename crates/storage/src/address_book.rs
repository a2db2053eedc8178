use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use parking_lot::RwLock;
use proto::{NetworkAddress, StreamId};
use rand::seq::SliceRandom;

type StreamBook = HashMap<(IpAddr, u16), NetworkAddress>;

/// Known peer addresses, grouped by stream.
#[derive(Debug, Default)]
pub struct AddressBook {
    streams: RwLock<HashMap<StreamId, StreamBook>>,
}

fn is_newer(book: Option<&StreamBook>, address: &NetworkAddress) -> bool {
    match book.and_then(|entries| entries.get(&address.key())) {
        Some(existing) => address.last_seen > existing.last_seen,
        None => true,
    }
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses from `list` that are unknown or fresher than what we hold.
    pub fn filter_new(&self, list: &[NetworkAddress]) -> Vec<NetworkAddress> {
        let streams = self.streams.read();
        list.iter()
            .filter(|address| is_newer(streams.get(&address.stream), address))
            .cloned()
            .collect()
    }

    /// Stores `list`, replacing older records for the same endpoint.
    ///
    /// Returns the records that changed the book.
    pub fn put(&self, list: &[NetworkAddress]) -> Vec<NetworkAddress> {
        let mut streams = self.streams.write();
        let mut changed = Vec::new();
        for address in list {
            if address.stream == 0 || address.port == 0 {
                continue;
            }
            let book = streams.entry(address.stream).or_default();
            if is_newer(Some(book), address) {
                book.insert(address.key(), address.clone());
                changed.push(address.clone());
            }
        }
        changed
    }

    /// Drops records last seen before `horizon` (unix seconds).
    pub fn expire(&self, horizon: i64) -> usize {
        let mut streams = self.streams.write();
        let mut removed = 0;
        for book in streams.values_mut() {
            let before = book.len();
            book.retain(|_, address| address.last_seen >= horizon);
            removed += before - book.len();
        }
        streams.retain(|_, book| !book.is_empty());
        removed
    }

    /// Most recently seen addresses serving any of `streams`.
    pub fn addresses(&self, streams: &[StreamId], limit: usize) -> Vec<NetworkAddress> {
        let guard = self.streams.read();
        let mut out: Vec<NetworkAddress> = streams
            .iter()
            .filter_map(|stream| guard.get(stream))
            .flat_map(|book| book.values().cloned())
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out.truncate(limit);
        out
    }

    /// Random dial candidates in `streams`, skipping endpoints in `exclude`.
    pub fn candidates(
        &self,
        streams: &[StreamId],
        exclude: &HashSet<SocketAddr>,
        limit: usize,
    ) -> Vec<NetworkAddress> {
        let guard = self.streams.read();
        let mut seen = HashSet::new();
        let pool: Vec<&NetworkAddress> = streams
            .iter()
            .filter_map(|stream| guard.get(stream))
            .flat_map(|book| book.values())
            .filter(|address| !exclude.contains(&address.socket_addr()))
            .filter(|address| seen.insert(address.socket_addr()))
            .collect();
        pool.choose_multiple(&mut rand::thread_rng(), limit)
            .map(|address| (*address).clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

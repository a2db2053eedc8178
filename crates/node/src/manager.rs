//! Connection pool, one-hop gossip relay and request deduplication.
//!
//! The manager owns three long-running tasks: the event loop that consumes
//! [`ConnectionEvent`]s from every connection, the maintenance loop that
//! expires stale state and tops the pool up from the address book, and (when
//! listening) the accept loop.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crypto::CryptManager;
use p2p::{
    ConnectionConfig, ConnectionContext, ConnectionError, ConnectionEvent, ConnectionHandle,
    ConnectionId, ConnectionState, MAX_INV_ITEMS, NetMessage, ProtocolViolation, Role,
};
use parking_lot::{Mutex, RwLock};
use proto::{InventoryVector, NetworkAddress, ObjectKind, ObjectRecord, Services, StreamId};
use storage::Datastore;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::parser::ObjectParser;
use crate::pending::PendingRequests;

const EVENT_QUEUE: usize = 1024;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Where to accept peers. `None` runs the node in passive mode.
    pub listen: Option<SocketAddr>,
    /// Addresses added to the address book at startup.
    pub seeds: Vec<SocketAddr>,
    /// Pool size while accepting inbound connections.
    pub max_connections_active: usize,
    /// Pool size when only dialing out.
    pub max_connections_passive: usize,
    pub maintenance_interval: Duration,
    /// How long a failed dial keeps an address out of the candidate set.
    pub dial_cooldown: Duration,
    pub connection: ConnectionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            seeds: Vec::new(),
            max_connections_active: 64,
            max_connections_passive: 8,
            maintenance_interval: Duration::from_secs(1),
            dial_cooldown: Duration::from_secs(60),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Handle to the running network layer. Cheap to clone.
#[derive(Clone)]
pub struct NetworkManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    ctx: Arc<ConnectionContext>,
    datastore: Arc<Datastore>,
    parser: Arc<ObjectParser>,
    pending: PendingRequests,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    connection_tasks: Mutex<Vec<JoinHandle<()>>>,
    service_tasks: Mutex<Vec<JoinHandle<()>>>,
    failed_dials: Mutex<HashMap<SocketAddr, Instant>>,
    /// Connections that completed the handshake.
    sessions: Mutex<HashSet<ConnectionId>>,
    /// Endpoints that turned out to be this node.
    self_addresses: Mutex<HashSet<SocketAddr>>,
    next_id: AtomicU64,
    events: mpsc::Sender<ConnectionEvent>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    local_addr: Option<SocketAddr>,
}

impl NetworkManager {
    /// Binds the listener (if configured) and starts the manager tasks.
    pub async fn start(
        config: ManagerConfig,
        datastore: Arc<Datastore>,
        crypt: Arc<dyn CryptManager>,
        parser: Arc<ObjectParser>,
    ) -> Result<Self, NetworkError> {
        let listener = match config.listen {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let local_addr = listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let nonce = p2p::session_nonce();
        let ctx = Arc::new(ConnectionContext::new(
            config.connection.clone(),
            nonce,
            local_addr,
            Arc::clone(&datastore),
            crypt,
        ));

        let now = chrono::Utc::now().timestamp();
        let home_stream = config.connection.streams.first().copied().unwrap_or(1);
        let seeds: Vec<NetworkAddress> = config
            .seeds
            .iter()
            .map(|seed| NetworkAddress::new(*seed, home_stream, Services::NODE_NETWORK, now))
            .collect();
        datastore.put_addresses(&seeds);

        let (events, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            ctx,
            datastore,
            parser,
            pending: PendingRequests::new(),
            connections: RwLock::new(HashMap::new()),
            connection_tasks: Mutex::new(Vec::new()),
            service_tasks: Mutex::new(Vec::new()),
            failed_dials: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashSet::new()),
            self_addresses: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            events,
            shutdown,
            stopped: AtomicBool::new(false),
            local_addr,
        });

        let mut tasks = vec![
            tokio::spawn(Arc::clone(&inner).event_loop(event_rx)),
            tokio::spawn(Arc::clone(&inner).maintenance_loop()),
        ];
        if let Some(listener) = listener {
            tasks.push(tokio::spawn(Arc::clone(&inner).accept_loop(listener)));
        }
        *inner.service_tasks.lock() = tasks;

        info!(listen = ?local_addr, nonce = %format!("{nonce:016x}"), "network manager started");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn nonce(&self) -> u64 {
        self.inner.ctx.nonce
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.inner.datastore
    }

    pub fn parser(&self) -> &Arc<ObjectParser> {
        &self.inner.parser
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn established_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .values()
            .filter(|handle| handle.is_established())
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Endpoints found to loop back to this node. They are never dialed again.
    pub fn self_addresses(&self) -> Vec<SocketAddr> {
        self.inner.self_addresses.lock().iter().copied().collect()
    }

    /// Dials `remote` now instead of waiting for the maintenance loop.
    pub fn connect_to(&self, remote: SocketAddr) -> Result<ConnectionId, NetworkError> {
        if self.is_stopped() {
            return Err(NetworkError::Stopped);
        }
        Ok(self.inner.dial(remote))
    }

    /// Stores a locally sealed object and advertises it to every peer that
    /// serves its stream. Returns false if it was already known.
    pub fn publish(&self, object: &ObjectRecord) -> bool {
        if !self.inner.datastore.store_local(object) {
            return false;
        }
        let sent = self
            .inner
            .relay_inventory(None, object.stream(), vec![object.inventory()]);
        info!(inventory = %object.inventory(), peers = sent, "published object");
        true
    }

    /// Signals every component to stop without waiting for any of them.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stops everything and waits for all tasks and the parser thread.
    pub async fn shutdown(&self) {
        self.inner.stop();
        let services: Vec<_> = self.inner.service_tasks.lock().drain(..).collect();
        for task in services {
            let _ = task.await;
        }
        let connections: Vec<_> = self.inner.connection_tasks.lock().drain(..).collect();
        for task in connections {
            let _ = task.await;
        }
        let parser = Arc::clone(&self.inner.parser);
        if tokio::task::spawn_blocking(move || parser.join())
            .await
            .is_err()
        {
            warn!("object parser join task failed");
        }
        info!("network manager shut down");
    }
}

impl Inner {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping network manager");
        self.shutdown.send_replace(true);
        self.parser.stop();
        self.datastore.stop();
        for handle in self.connections.read().values() {
            handle.stop();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        if self.local_addr.is_some() {
            self.config.max_connections_active
        } else {
            self.config.max_connections_passive
        }
    }

    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, handle: ConnectionHandle, task: JoinHandle<()>) {
        if self.is_stopped() {
            handle.stop();
        }
        self.connections.write().insert(handle.id(), handle);
        self.connection_tasks.lock().push(task);
    }

    fn dial(&self, remote: SocketAddr) -> ConnectionId {
        let id = self.allocate_id();
        debug!(%id, %remote, "dialing");
        let (handle, task) = p2p::connect(id, remote, Arc::clone(&self.ctx), self.events.clone());
        self.register(handle, task);
        id
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<ConnectionEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_stopped() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
        debug!("event loop exiting");
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if self.is_stopped() {
                break;
            }
            self.maintain();
        }
        debug!("maintenance loop exiting");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_stopped() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if self.connections.read().len() >= self.capacity() {
                            debug!(%remote, "pool full, rejecting inbound connection");
                            continue;
                        }
                        let id = self.allocate_id();
                        let (handle, task) = p2p::accept(
                            id,
                            stream,
                            remote,
                            Arc::clone(&self.ctx),
                            self.events.clone(),
                        );
                        self.register(handle, task);
                    }
                    Err(err) => {
                        warn!(error = ?err, "listener accept failed");
                        sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        debug!("accept loop exiting");
    }

    fn maintain(&self) {
        let now = chrono::Utc::now().timestamp();
        let addresses = self.datastore.expire_addresses(now);
        let objects = self.datastore.expire_objects(now);
        if addresses > 0 || objects > 0 {
            debug!(addresses, objects, "expired stale entries");
        }
        self.replenish();
        // Drops handles registered after their terminal event was handled.
        // Runs after replenish so an unhandled abort still excludes its address.
        self.connections
            .write()
            .retain(|_, handle| handle.state() != ConnectionState::Aborted);
        self.connection_tasks
            .lock()
            .retain(|task| !task.is_finished());
    }

    fn replenish(&self) {
        let capacity = self.capacity();
        let (count, mut exclude) = {
            let connections = self.connections.read();
            let remotes: HashSet<SocketAddr> =
                connections.values().map(ConnectionHandle::remote).collect();
            (connections.len(), remotes)
        };
        if count >= capacity {
            return;
        }
        exclude.extend(self.local_addr);
        exclude.extend(self.self_addresses.lock().iter().copied());
        {
            let mut failed = self.failed_dials.lock();
            failed.retain(|_, at| at.elapsed() < self.config.dial_cooldown);
            exclude.extend(failed.keys().copied());
        }
        for address in self
            .datastore
            .candidates(self.ctx.perimeter(), &exclude, capacity - count)
        {
            self.dial(address.socket_addr());
        }
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Established {
                id,
                remote,
                role,
                streams,
                ..
            } => {
                debug!(%id, %remote, ?role, ?streams, "peer established");
                self.sessions.lock().insert(id);
                if role == Role::Initiator {
                    self.refresh_address(remote, &streams);
                }
            }
            ConnectionEvent::AdvertisedObjects { id, vectors } => {
                self.request_objects(id, &vectors);
            }
            ConnectionEvent::ReceivedObject { id, object } => {
                self.accept_object(id, object).await;
            }
            ConnectionEvent::ReceivedNodes { id, addresses } => {
                self.accept_addresses(id, addresses);
            }
            ConnectionEvent::CouldNotConnect { id, remote, error } => {
                debug!(%id, %remote, error = %error, "dial failed");
                // Recorded before the handle goes so replenish cannot redial in between.
                self.failed_dials.lock().insert(remote, Instant::now());
                self.connections.write().remove(&id);
                self.pending.release_owner(id);
            }
            ConnectionEvent::Aborted {
                id,
                remote,
                role,
                reason,
            } => {
                let was_established = self.sessions.lock().remove(&id);
                let dialed = role == Role::Initiator;
                if dialed
                    && matches!(
                        reason,
                        ConnectionError::Protocol(ProtocolViolation::SelfConnection)
                    )
                {
                    info!(%remote, "address points back at this node");
                    self.self_addresses.lock().insert(remote);
                } else if dialed && !was_established {
                    debug!(%id, %remote, reason = %reason, "handshake with dialed peer failed");
                    self.failed_dials.lock().insert(remote, Instant::now());
                }
                self.connections.write().remove(&id);
                let released = self.pending.release_owner(id);
                if !released.is_empty() {
                    debug!(%id, count = released.len(), "released pending requests");
                }
            }
        }
    }

    fn refresh_address(&self, remote: SocketAddr, streams: &[StreamId]) {
        let now = chrono::Utc::now().timestamp();
        let records: Vec<NetworkAddress> = streams
            .iter()
            .filter(|stream| self.ctx.perimeter().contains(*stream))
            .map(|stream| NetworkAddress::new(remote, *stream, Services::NODE_NETWORK, now))
            .collect();
        self.datastore.put_addresses(&records);
    }

    fn request_objects(&self, id: ConnectionId, vectors: &[InventoryVector]) {
        let fresh = self.datastore.filter_new_objects(vectors);
        if fresh.is_empty() {
            return;
        }
        let claimed = self.pending.claim(id, &fresh);
        if claimed.is_empty() {
            return;
        }
        self.datastore.mark_known(&claimed);
        let Some(handle) = self.connections.read().get(&id).cloned() else {
            return;
        };
        debug!(%id, count = claimed.len(), "requesting objects");
        for chunk in claimed.chunks(MAX_INV_ITEMS) {
            handle.send(NetMessage::GetData(chunk.to_vec()));
        }
    }

    async fn accept_object(&self, id: ConnectionId, object: ObjectRecord) {
        let inventory = object.inventory();
        self.pending.complete(&inventory);
        if !self.datastore.put(&object) {
            debug!(%id, %inventory, "ignoring unsolicited or duplicate object");
            return;
        }
        let relayed = self.relay_inventory(Some(id), object.stream(), vec![inventory]);
        debug!(%id, %inventory, kind = ?object.kind(), relayed, "accepted object");
        if object.kind() == ObjectKind::Msg
            && let Err(err) = self.parser.submit(object).await
        {
            debug!(%inventory, error = %err, "object parser unavailable");
        }
    }

    fn accept_addresses(&self, id: ConnectionId, addresses: Vec<NetworkAddress>) {
        let now = chrono::Utc::now().timestamp();
        let usable: Vec<NetworkAddress> = addresses
            .into_iter()
            .filter(|address| self.ctx.perimeter().contains(&address.stream))
            .map(|mut address| {
                address.last_seen = address.last_seen.min(now);
                address
            })
            .collect();
        let fresh = self.datastore.filter_new_addresses(&usable);
        let changed = self.datastore.put_addresses(&fresh);
        if changed.is_empty() {
            return;
        }
        debug!(%id, count = changed.len(), "learned addresses");
        self.broadcast(Some(id), NetMessage::Addr(changed), |_| true);
    }

    fn relay_inventory(
        &self,
        source: Option<ConnectionId>,
        stream: StreamId,
        vectors: Vec<InventoryVector>,
    ) -> usize {
        self.broadcast(source, NetMessage::Inv(vectors), |handle| handle.serves(stream))
    }

    /// Queues `message` on every established connection except `except`.
    fn broadcast(
        &self,
        except: Option<ConnectionId>,
        message: NetMessage,
        filter: impl Fn(&ConnectionHandle) -> bool,
    ) -> usize {
        let connections = self.connections.read();
        let mut sent = 0;
        for handle in connections.values() {
            if Some(handle.id()) == except || !handle.is_established() || !filter(handle) {
                continue;
            }
            if handle.send(message.clone()) {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use crypto::{PowParams, PowSettings, StandardCrypt};
    use p2p::{Version, read_message, write_message};
    use proto::ObjectTemplate;
    use storage::StoreConfig;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use super::*;

    const MAX: usize = 1024 * 1024;

    fn easy_crypt() -> Arc<StandardCrypt> {
        Arc::new(StandardCrypt::new(PowSettings {
            params: PowParams {
                trials_per_byte: 1,
                extra_bytes: 0,
            },
            workers: 1,
            target_load: 1.0,
            batch_size: 256,
        }))
    }

    async fn start_manager() -> NetworkManager {
        start_manager_on(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    async fn start_manager_on(listen: SocketAddr) -> NetworkManager {
        let crypt = easy_crypt();
        let datastore = Arc::new(Datastore::in_memory(StoreConfig::default()));
        let parser = Arc::new(
            ObjectParser::start(Arc::clone(&datastore), crypt.clone(), 16).expect("parser"),
        );
        let config = ManagerConfig {
            listen: Some(listen),
            maintenance_interval: Duration::from_millis(50),
            connection: ConnectionConfig {
                read_timeout: Duration::from_millis(20),
                max_message_size: MAX,
                ..ConnectionConfig::default()
            },
            ..ManagerConfig::default()
        };
        NetworkManager::start(config, datastore, crypt, parser)
            .await
            .expect("start manager")
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Hand-driven peer speaking the wire protocol to the manager.
    struct ScriptedPeer {
        stream: TcpStream,
    }

    impl ScriptedPeer {
        async fn connect(addr: SocketAddr, nonce: u64) -> Self {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            let version = Version::new(
                nonce,
                "/scripted/",
                vec![1],
                Services::NODE_NETWORK,
                None,
                addr,
            );
            write_message(&mut stream, &NetMessage::Version(version), MAX)
                .await
                .expect("version");
            assert_eq!(
                read_message(&mut stream, MAX).await.expect("verack"),
                NetMessage::VerAck
            );
            assert!(matches!(
                read_message(&mut stream, MAX).await.expect("version"),
                NetMessage::Version(_)
            ));
            write_message(&mut stream, &NetMessage::VerAck, MAX)
                .await
                .expect("verack");
            Self { stream }
        }

        async fn send(&mut self, message: NetMessage) {
            write_message(&mut self.stream, &message, MAX)
                .await
                .expect("send");
        }

        async fn recv(&mut self) -> Option<NetMessage> {
            timeout(Duration::from_millis(400), read_message(&mut self.stream, MAX))
                .await
                .ok()
                .and_then(Result::ok)
        }
    }

    fn sealed(crypt: &StandardCrypt, kind: ObjectKind, tag: u8) -> ObjectRecord {
        let template = ObjectTemplate {
            expires: chrono::Utc::now().timestamp() + 3600,
            kind,
            stream: 1,
            payload: vec![tag; 32],
        };
        let nonce = crypt
            .do_pow(&template.pow_payload().expect("body"))
            .expect("pow");
        template.seal(nonce).expect("seal")
    }

    #[tokio::test]
    async fn one_getdata_per_vector_across_connections() {
        let manager = start_manager().await;
        let addr = manager.local_addr().expect("listening");
        let mut a = ScriptedPeer::connect(addr, 101).await;
        let mut b = ScriptedPeer::connect(addr, 102).await;
        wait_for("two established peers", || manager.established_count() == 2).await;

        let vector = InventoryVector([7; 32]);
        a.send(NetMessage::Inv(vec![vector])).await;
        b.send(NetMessage::Inv(vec![vector])).await;
        let (from_a, from_b) = tokio::join!(a.recv(), b.recv());
        let request = Some(NetMessage::GetData(vec![vector]));
        let requests = [&from_a, &from_b]
            .into_iter()
            .filter(|received| **received == request)
            .count();
        assert_eq!(requests, 1);
        assert_eq!(manager.pending_count(), 1);

        // The owner leaves without answering; the other peer may now be asked.
        let (owner, mut other) = if from_a == request { (a, b) } else { (b, a) };
        drop(owner);
        wait_for("pending release", || manager.pending_count() == 0).await;
        other.send(NetMessage::Inv(vec![vector])).await;
        assert_eq!(other.recv().await, request);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn accepted_objects_are_relayed_to_other_peers_only() {
        let manager = start_manager().await;
        let addr = manager.local_addr().expect("listening");
        let mut a = ScriptedPeer::connect(addr, 201).await;
        let mut b = ScriptedPeer::connect(addr, 202).await;
        wait_for("two established peers", || manager.established_count() == 2).await;

        let object = sealed(&easy_crypt(), ObjectKind::Broadcast, 1);
        a.send(NetMessage::Inv(vec![object.inventory()])).await;
        assert_eq!(
            a.recv().await,
            Some(NetMessage::GetData(vec![object.inventory()]))
        );
        a.send(NetMessage::Object(object.as_bytes().to_vec())).await;

        assert_eq!(b.recv().await, Some(NetMessage::Inv(vec![object.inventory()])));
        assert_eq!(a.recv().await, None);
        assert!(manager.datastore().has_object(&object.inventory()));
        assert_eq!(manager.pending_count(), 0);

        b.send(NetMessage::GetData(vec![object.inventory()])).await;
        assert_eq!(
            b.recv().await,
            Some(NetMessage::Object(object.as_bytes().to_vec()))
        );

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unsolicited_objects_are_not_stored_or_relayed() {
        let manager = start_manager().await;
        let addr = manager.local_addr().expect("listening");
        let mut a = ScriptedPeer::connect(addr, 301).await;
        let mut b = ScriptedPeer::connect(addr, 302).await;
        wait_for("two established peers", || manager.established_count() == 2).await;

        let object = sealed(&easy_crypt(), ObjectKind::Broadcast, 2);
        a.send(NetMessage::Object(object.as_bytes().to_vec())).await;
        assert_eq!(b.recv().await, None);
        assert!(!manager.datastore().has_object(&object.inventory()));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn published_objects_reach_established_peers() {
        let manager = start_manager().await;
        let addr = manager.local_addr().expect("listening");
        let mut a = ScriptedPeer::connect(addr, 401).await;
        wait_for("established peer", || manager.established_count() == 1).await;

        let object = sealed(&easy_crypt(), ObjectKind::Msg, 3);
        assert!(manager.publish(&object));
        assert!(!manager.publish(&object));
        assert_eq!(a.recv().await, Some(NetMessage::Inv(vec![object.inventory()])));

        manager.shutdown().await;
    }

    fn aborted(remote: SocketAddr, role: Role, reason: ConnectionError) -> ConnectionEvent {
        ConnectionEvent::Aborted {
            id: ConnectionId(999),
            remote,
            role,
            reason,
        }
    }

    #[tokio::test]
    async fn failed_dial_cools_down_after_its_handle_was_pruned() {
        let manager = start_manager().await;
        let dialed = SocketAddr::from(([10, 0, 0, 1], 8444));
        let inbound = SocketAddr::from(([10, 0, 0, 2], 8444));

        manager
            .inner
            .handle_event(aborted(dialed, Role::Initiator, ConnectionError::Closed))
            .await;
        manager
            .inner
            .handle_event(aborted(inbound, Role::Responder, ConnectionError::Closed))
            .await;

        let failed = manager.inner.failed_dials.lock().clone();
        assert!(failed.contains_key(&dialed));
        assert!(!failed.contains_key(&inbound));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn dialed_self_connection_is_remembered_after_its_handle_was_pruned() {
        let manager = start_manager().await;
        let remote = SocketAddr::from(([10, 0, 0, 3], 8444));
        let reason = ConnectionError::Protocol(ProtocolViolation::SelfConnection);

        manager
            .inner
            .handle_event(aborted(remote, Role::Initiator, reason))
            .await;

        assert_eq!(manager.self_addresses(), vec![remote]);
        assert!(manager.inner.failed_dials.lock().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn dialing_our_own_listener_marks_the_address() {
        let manager = start_manager_on(SocketAddr::from(([0, 0, 0, 0], 0))).await;
        let port = manager.local_addr().expect("listening").port();
        let loopback = SocketAddr::from(([127, 0, 0, 1], port));

        manager.connect_to(loopback).expect("dial");
        wait_for("self address", || manager.self_addresses().contains(&loopback)).await;
        assert_eq!(manager.established_count(), 0);
        assert!(!manager.inner.failed_dials.lock().contains_key(&loopback));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_cascades_to_every_component() {
        let manager = start_manager().await;
        let addr = manager.local_addr().expect("listening");
        let mut a = ScriptedPeer::connect(addr, 501).await;
        wait_for("established peer", || manager.established_count() == 1).await;

        manager.stop();
        assert!(manager.is_stopped());
        assert!(manager.datastore().is_stopped());
        assert!(manager.parser().is_stopped());

        let closed = timeout(Duration::from_secs(5), read_message(&mut a.stream, MAX))
            .await
            .expect("connection closes in time");
        assert!(closed.is_err());

        manager.shutdown().await;
        assert!(matches!(manager.connect_to(addr), Err(NetworkError::Stopped)));
    }
}

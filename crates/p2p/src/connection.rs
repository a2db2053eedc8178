//! Per-peer protocol state machine.
//!
//! Every connection runs as one tokio task that owns the socket writer and
//! all protocol state, plus a reader task that is the single consumer of the
//! socket's read half. The reader forwards decoded frames over a channel so
//! the protocol task can wait on peer messages, queued outbound messages and a
//! `read_timeout` tick at the same time; the tick is where the stop flag and
//! the handshake deadline are checked.
//!
//! ```text
//! Connecting ──dial fails──────────────▶ Aborted   (CouldNotConnect)
//!     │
//!     ▼
//! Connected ──version+verack both ways─▶ Established
//!     │                                     │
//!     └──────violation / io / stop─────────▶ Aborted   (Aborted)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crypto::CryptManager;
use parking_lot::RwLock;
use proto::{InventoryVector, NetworkAddress, ObjectRecord, StreamId, perimeter_of};
use storage::Datastore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, ProtocolViolation};
use crate::framing::{read_message, write_message};
use crate::handshake::Handshake;
use crate::types::{ConnectionId, MAX_ADDR_ITEMS, MAX_INV_ITEMS, NetMessage, Role, Version};

/// Seconds an object's expiry may exceed the TTL limit, for clock skew.
const EXPIRY_GRACE_SECS: i64 = 3 * 60 * 60;
const INBOUND_QUEUE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Established,
    Aborted,
}

/// Everything a connection needs from the node, shared by all connections.
pub struct ConnectionContext {
    pub config: ConnectionConfig,
    /// Session nonce placed in every version we send.
    pub nonce: u64,
    /// Address we accept peers on, advertised in our version.
    pub listen: Option<SocketAddr>,
    pub datastore: Arc<Datastore>,
    pub crypt: Arc<dyn CryptManager>,
    perimeter: Vec<StreamId>,
}

impl ConnectionContext {
    pub fn new(
        config: ConnectionConfig,
        nonce: u64,
        listen: Option<SocketAddr>,
        datastore: Arc<Datastore>,
        crypt: Arc<dyn CryptManager>,
    ) -> Self {
        let perimeter = perimeter_of(&config.streams);
        Self {
            config,
            nonce,
            listen,
            datastore,
            crypt,
            perimeter,
        }
    }

    /// Our streams plus their parents and children.
    pub fn perimeter(&self) -> &[StreamId] {
        &self.perimeter
    }

    fn local_version(&self, remote: SocketAddr) -> Version {
        Version::new(
            self.nonce,
            self.config.user_agent.clone(),
            self.config.streams.clone(),
            self.config.services,
            self.listen,
            remote,
        )
    }
}

/// What a connection reports to its owner.
///
/// Each connection emits exactly one terminal event, `CouldNotConnect` or
/// `Aborted`, and nothing after it.
#[derive(Debug)]
pub enum ConnectionEvent {
    Established {
        id: ConnectionId,
        remote: SocketAddr,
        role: Role,
        streams: Vec<StreamId>,
        user_agent: String,
    },
    AdvertisedObjects {
        id: ConnectionId,
        vectors: Vec<InventoryVector>,
    },
    ReceivedObject {
        id: ConnectionId,
        object: ObjectRecord,
    },
    ReceivedNodes {
        id: ConnectionId,
        addresses: Vec<NetworkAddress>,
    },
    CouldNotConnect {
        id: ConnectionId,
        remote: SocketAddr,
        error: ConnectionError,
    },
    Aborted {
        id: ConnectionId,
        remote: SocketAddr,
        role: Role,
        reason: ConnectionError,
    },
}

impl ConnectionEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Established { id, .. }
            | ConnectionEvent::AdvertisedObjects { id, .. }
            | ConnectionEvent::ReceivedObject { id, .. }
            | ConnectionEvent::ReceivedNodes { id, .. }
            | ConnectionEvent::CouldNotConnect { id, .. }
            | ConnectionEvent::Aborted { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::CouldNotConnect { .. } | ConnectionEvent::Aborted { .. }
        )
    }
}

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    state: RwLock<ConnectionState>,
    streams: RwLock<Vec<StreamId>>,
}

/// Owner-side view of a running connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: SocketAddr,
    role: Role,
    outbound: mpsc::Sender<NetMessage>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    fn new(
        id: ConnectionId,
        remote: SocketAddr,
        role: Role,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<NetMessage>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            state: RwLock::new(ConnectionState::Connecting),
            streams: RwLock::new(Vec::new()),
        });
        (
            Self {
                id,
                remote,
                role,
                outbound,
                shared,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// Streams the peer declared, empty until established.
    pub fn streams(&self) -> Vec<StreamId> {
        self.shared.streams.read().clone()
    }

    pub fn serves(&self, stream: StreamId) -> bool {
        self.shared.streams.read().contains(&stream)
    }

    /// Queues `message` for the peer without waiting.
    ///
    /// A peer that lets its queue fill up is disconnected.
    pub fn send(&self, message: NetMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(
                    id = %self.id,
                    remote = %self.remote,
                    command = message.command(),
                    "outbound queue full, disconnecting"
                );
                self.stop();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the connection to close. Takes effect at its next loop iteration.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }
}

/// Dials `remote` and runs the initiator side of the protocol.
pub fn connect(
    id: ConnectionId,
    remote: SocketAddr,
    ctx: Arc<ConnectionContext>,
    events: mpsc::Sender<ConnectionEvent>,
) -> (ConnectionHandle, JoinHandle<()>) {
    let (handle, outbound) =
        ConnectionHandle::new(id, remote, Role::Initiator, ctx.config.outbound_queue);
    let shared = Arc::clone(&handle.shared);
    let task = tokio::spawn(async move {
        let dial = timeout(ctx.config.connect_timeout, TcpStream::connect(remote)).await;
        let error = match dial {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%id, %remote, error = ?err, "failed to set TCP_NODELAY");
                }
                let session = Session::new(id, remote, Role::Initiator, ctx, shared, events);
                session.run(stream, outbound).await;
                return;
            }
            Ok(Err(err)) => ConnectionError::Io(err),
            Err(_) => ConnectionError::ConnectTimeout,
        };
        *shared.state.write() = ConnectionState::Aborted;
        debug!(%id, %remote, error = %error, "could not connect");
        let _ = events
            .send(ConnectionEvent::CouldNotConnect { id, remote, error })
            .await;
    });
    (handle, task)
}

/// Runs the responder side on an accepted socket.
pub fn accept(
    id: ConnectionId,
    stream: TcpStream,
    remote: SocketAddr,
    ctx: Arc<ConnectionContext>,
    events: mpsc::Sender<ConnectionEvent>,
) -> (ConnectionHandle, JoinHandle<()>) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%id, %remote, error = ?err, "failed to set TCP_NODELAY");
    }
    spawn_connection(id, remote, Role::Responder, stream, ctx, events)
}

/// Runs a connection over an already established byte stream.
pub fn spawn_connection<S>(
    id: ConnectionId,
    remote: SocketAddr,
    role: Role,
    stream: S,
    ctx: Arc<ConnectionContext>,
    events: mpsc::Sender<ConnectionEvent>,
) -> (ConnectionHandle, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (handle, outbound) = ConnectionHandle::new(id, remote, role, ctx.config.outbound_queue);
    let session = Session::new(id, remote, role, ctx, Arc::clone(&handle.shared), events);
    let task = tokio::spawn(session.run(stream, outbound));
    (handle, task)
}

struct Session {
    id: ConnectionId,
    remote: SocketAddr,
    role: Role,
    ctx: Arc<ConnectionContext>,
    shared: Arc<Shared>,
    events: mpsc::Sender<ConnectionEvent>,
    handshake: Handshake,
}

impl Session {
    fn new(
        id: ConnectionId,
        remote: SocketAddr,
        role: Role,
        ctx: Arc<ConnectionContext>,
        shared: Arc<Shared>,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let handshake = Handshake::new(role, ctx.nonce, ctx.perimeter().to_vec());
        Self {
            id,
            remote,
            role,
            ctx,
            shared,
            events,
            handshake,
        }
    }

    async fn run<S>(mut self, stream: S, outbound: mpsc::Receiver<NetMessage>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        *self.shared.state.write() = ConnectionState::Connected;
        debug!(id = %self.id, remote = %self.remote, role = ?self.role, "connected");

        let (reader, mut writer) = tokio::io::split(stream);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let reader_task = tokio::spawn(read_loop(
            reader,
            self.ctx.config.max_message_size,
            inbound_tx,
        ));

        let reason = match self.drive(&mut writer, inbound, outbound).await {
            Ok(()) => ConnectionError::Stopped,
            Err(err) => err,
        };
        reader_task.abort();
        let _ = writer.shutdown().await;

        *self.shared.state.write() = ConnectionState::Aborted;
        if matches!(reason, ConnectionError::Stopped | ConnectionError::Closed) {
            debug!(id = %self.id, remote = %self.remote, reason = %reason, "connection closed");
        } else {
            info!(id = %self.id, remote = %self.remote, reason = %reason, "connection aborted");
        }
        let _ = self
            .events
            .send(ConnectionEvent::Aborted {
                id: self.id,
                remote: self.remote,
                role: self.role,
                reason,
            })
            .await;
    }

    /// Returns `Ok(())` when stopped locally, the abort reason otherwise.
    async fn drive<W>(
        &mut self,
        writer: &mut W,
        mut inbound: mpsc::Receiver<Result<NetMessage, ConnectionError>>,
        mut outbound: mpsc::Receiver<NetMessage>,
    ) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        let max = self.ctx.config.max_message_size;
        let opening = self
            .handshake
            .start(|| self.ctx.local_version(self.remote));
        for message in opening {
            write_message(writer, &message, max).await?;
        }

        let deadline = Instant::now() + self.ctx.config.handshake_timeout;
        let mut tick = interval(self.ctx.config.read_timeout);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            tokio::select! {
                received = inbound.recv() => match received {
                    Some(Ok(message)) => self.handle(message, writer).await?,
                    Some(Err(err)) => return Err(err),
                    None => return Err(ConnectionError::Closed),
                },
                queued = outbound.recv() => match queued {
                    Some(message) if self.handshake.is_complete() => {
                        write_message(writer, &message, max).await?;
                    }
                    Some(message) => {
                        debug!(
                            id = %self.id,
                            command = message.command(),
                            "dropping message queued before handshake"
                        );
                    }
                    None => return Ok(()),
                },
                _ = tick.tick() => {
                    if !self.handshake.is_complete() && Instant::now() >= deadline {
                        return Err(ConnectionError::HandshakeTimeout);
                    }
                }
            }
        }
    }

    async fn handle<W>(
        &mut self,
        message: NetMessage,
        writer: &mut W,
    ) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        let max = self.ctx.config.max_message_size;
        match message {
            NetMessage::Version(version) => {
                debug!(
                    id = %self.id,
                    agent = %version.user_agent,
                    streams = ?version.streams,
                    "received version"
                );
                let replies = match self
                    .handshake
                    .on_version(version, || self.ctx.local_version(self.remote))
                {
                    Ok(replies) => replies,
                    Err(ProtocolViolation::SelfConnection) if self.role == Role::Responder => {
                        // Echo our version so the dialing side sees its own nonce.
                        let echo = NetMessage::Version(self.ctx.local_version(self.remote));
                        let _ = write_message(writer, &echo, max).await;
                        return Err(ProtocolViolation::SelfConnection.into());
                    }
                    Err(violation) => return Err(violation.into()),
                };
                for reply in replies {
                    write_message(writer, &reply, max).await?;
                }
                self.check_established(writer).await
            }
            NetMessage::VerAck => {
                self.handshake.on_verack()?;
                self.check_established(writer).await
            }
            other if !self.handshake.is_complete() => {
                Err(ProtocolViolation::NotEstablished(other.command()).into())
            }
            NetMessage::Inv(vectors) => {
                check_len("inv", vectors.len(), MAX_INV_ITEMS)?;
                if vectors.is_empty() {
                    return Ok(());
                }
                self.emit(ConnectionEvent::AdvertisedObjects { id: self.id, vectors })
                    .await
            }
            NetMessage::GetData(vectors) => {
                check_len("getdata", vectors.len(), MAX_INV_ITEMS)?;
                for object in self.ctx.datastore.get_objects(&vectors) {
                    write_message(writer, &NetMessage::Object(object.into_bytes()), max).await?;
                }
                Ok(())
            }
            NetMessage::Addr(addresses) => {
                check_len("addr", addresses.len(), MAX_ADDR_ITEMS)?;
                if addresses.is_empty() {
                    return Ok(());
                }
                self.emit(ConnectionEvent::ReceivedNodes {
                    id: self.id,
                    addresses,
                })
                .await
            }
            NetMessage::Object(bytes) => self.on_object(bytes).await,
        }
    }

    async fn on_object(&mut self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        let object = ObjectRecord::from_bytes(bytes).map_err(ProtocolViolation::from)?;
        let inventory = object.inventory();
        let now = chrono::Utc::now().timestamp();
        if !self.ctx.perimeter().contains(&object.stream()) {
            debug!(
                id = %self.id,
                %inventory,
                stream = object.stream(),
                "dropping object outside our streams"
            );
            return Ok(());
        }
        if object.is_expired(now) || object.exceeds_ttl(now, EXPIRY_GRACE_SECS) {
            debug!(
                id = %self.id,
                %inventory,
                expires = object.expires(),
                "dropping object with bad expiry"
            );
            return Ok(());
        }
        if !object.has_valid_pow(self.ctx.crypt.as_ref()) {
            debug!(id = %self.id, %inventory, "dropping object with insufficient proof of work");
            return Ok(());
        }
        self.emit(ConnectionEvent::ReceivedObject {
            id: self.id,
            object,
        })
        .await
    }

    async fn check_established<W>(&mut self, writer: &mut W) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.handshake.is_complete() {
            return Ok(());
        }
        let Some(peer) = self.handshake.peer() else {
            return Ok(());
        };
        let streams = peer.streams.clone();
        let user_agent = peer.user_agent.clone();
        *self.shared.streams.write() = streams.clone();
        *self.shared.state.write() = ConnectionState::Established;
        info!(id = %self.id, remote = %self.remote, agent = %user_agent, "connection established");

        self.emit(ConnectionEvent::Established {
            id: self.id,
            remote: self.remote,
            role: self.role,
            streams: streams.clone(),
            user_agent,
        })
        .await?;

        let shared: Vec<StreamId> = streams
            .into_iter()
            .filter(|stream| self.ctx.perimeter().contains(stream))
            .collect();
        let max = self.ctx.config.max_message_size;
        let addresses = self.ctx.datastore.addresses(&shared, MAX_ADDR_ITEMS);
        if !addresses.is_empty() {
            write_message(writer, &NetMessage::Addr(addresses), max).await?;
        }
        let inventory = self.ctx.datastore.inventory(&shared);
        for chunk in inventory.chunks(MAX_INV_ITEMS) {
            write_message(writer, &NetMessage::Inv(chunk.to_vec()), max).await?;
        }
        Ok(())
    }

    async fn emit(&self, event: ConnectionEvent) -> Result<(), ConnectionError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ConnectionError::Stopped)
    }
}

fn check_len(command: &'static str, count: usize, limit: usize) -> Result<(), ProtocolViolation> {
    if count > limit {
        return Err(ProtocolViolation::TooManyItems { command, count });
    }
    Ok(())
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    max_len: usize,
    messages: mpsc::Sender<Result<NetMessage, ConnectionError>>,
) where
    S: AsyncRead,
{
    loop {
        let message = read_message(&mut reader, max_len).await;
        let failed = message.is_err();
        if messages.send(message).await.is_err() || failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crypto::{PowParams, PowSettings, StandardCrypt};
    use proto::{ObjectKind, ObjectTemplate, Services};
    use storage::StoreConfig;
    use tokio::io::{DuplexStream, duplex};

    use super::*;

    const MAX: usize = 64 * 1024;

    fn remote() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    fn easy_crypt() -> StandardCrypt {
        StandardCrypt::new(PowSettings {
            params: PowParams {
                trials_per_byte: 1,
                extra_bytes: 0,
            },
            workers: 1,
            target_load: 1.0,
            batch_size: 1024,
        })
    }

    fn context(nonce: u64) -> Arc<ConnectionContext> {
        let config = ConnectionConfig {
            read_timeout: Duration::from_millis(20),
            handshake_timeout: Duration::from_secs(5),
            max_message_size: MAX,
            ..ConnectionConfig::default()
        };
        Arc::new(ConnectionContext::new(
            config,
            nonce,
            None,
            Arc::new(Datastore::in_memory(StoreConfig::default())),
            Arc::new(easy_crypt()),
        ))
    }

    fn peer_version(nonce: u64) -> Version {
        Version::new(
            nonce,
            "/scripted/",
            vec![1],
            Services::NODE_NETWORK,
            None,
            remote(),
        )
    }

    async fn next_event(events: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    async fn expect_silence(peer: &mut DuplexStream) {
        assert!(
            timeout(Duration::from_millis(150), read_message(peer, MAX))
                .await
                .is_err(),
            "connection sent an unexpected message"
        );
    }

    fn responder(
        ctx: Arc<ConnectionContext>,
    ) -> (
        ConnectionHandle,
        JoinHandle<()>,
        DuplexStream,
        mpsc::Receiver<ConnectionEvent>,
    ) {
        let (ours, theirs) = duplex(MAX);
        let (events_tx, events) = mpsc::channel(16);
        let (handle, task) =
            spawn_connection(ConnectionId(1), remote(), Role::Responder, ours, ctx, events_tx);
        (handle, task, theirs, events)
    }

    /// Drives the initiator side by hand until the responder is established.
    async fn establish(peer: &mut DuplexStream, events: &mut mpsc::Receiver<ConnectionEvent>) {
        write_message(peer, &NetMessage::Version(peer_version(1)), MAX)
            .await
            .expect("write version");
        assert_eq!(read_message(peer, MAX).await.expect("verack"), NetMessage::VerAck);
        assert!(matches!(
            read_message(peer, MAX).await.expect("version"),
            NetMessage::Version(_)
        ));
        write_message(peer, &NetMessage::VerAck, MAX)
            .await
            .expect("write verack");
        assert!(matches!(
            next_event(events).await,
            ConnectionEvent::Established { .. }
        ));
    }

    fn sealed(crypt: &StandardCrypt, stream: StreamId, tag: u8) -> ObjectRecord {
        let template = ObjectTemplate {
            expires: chrono::Utc::now().timestamp() + 3600,
            kind: ObjectKind::Broadcast,
            stream,
            payload: vec![tag; 24],
        };
        let body = template.pow_payload().expect("body");
        let nonce = crypt.do_pow(&body).expect("pow");
        template.seal(nonce).expect("seal")
    }

    #[tokio::test]
    async fn responder_handshake_trace() {
        let (handle, task, mut peer, mut events) = responder(context(2));

        write_message(&mut peer, &NetMessage::Version(peer_version(1)), MAX)
            .await
            .expect("write version");
        assert_eq!(read_message(&mut peer, MAX).await.expect("read"), NetMessage::VerAck);
        match read_message(&mut peer, MAX).await.expect("read") {
            NetMessage::Version(version) => {
                assert_eq!(version.nonce, 2);
                assert_eq!(version.streams, vec![1]);
            }
            other => panic!("expected version, got {}", other.command()),
        }
        assert_eq!(handle.state(), ConnectionState::Connected);
        write_message(&mut peer, &NetMessage::VerAck, MAX)
            .await
            .expect("write verack");

        match next_event(&mut events).await {
            ConnectionEvent::Established { role, streams, .. } => {
                assert_eq!(role, Role::Responder);
                assert_eq!(streams, vec![1]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(handle.is_established());
        assert!(handle.serves(1));
        expect_silence(&mut peer).await;

        handle.stop();
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Aborted {
                reason: ConnectionError::Stopped,
                ..
            }
        ));
        task.await.expect("task");
        assert!(events.recv().await.is_none());
        assert_eq!(handle.state(), ConnectionState::Aborted);
    }

    #[tokio::test]
    async fn initiator_handshake_trace() {
        let (ours, mut peer) = duplex(MAX);
        let (events_tx, mut events) = mpsc::channel(16);
        let (handle, _task) = spawn_connection(
            ConnectionId(3),
            remote(),
            Role::Initiator,
            ours,
            context(1),
            events_tx,
        );

        assert!(matches!(
            read_message(&mut peer, MAX).await.expect("read"),
            NetMessage::Version(_)
        ));
        write_message(&mut peer, &NetMessage::VerAck, MAX)
            .await
            .expect("write");
        write_message(&mut peer, &NetMessage::Version(peer_version(2)), MAX)
            .await
            .expect("write");
        assert_eq!(read_message(&mut peer, MAX).await.expect("read"), NetMessage::VerAck);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Established {
                role: Role::Initiator,
                ..
            }
        ));
        assert!(handle.is_established());
        expect_silence(&mut peer).await;
    }

    #[tokio::test]
    async fn two_connections_establish_each_other() {
        let (a, b) = duplex(MAX);
        let (a_tx, mut a_events) = mpsc::channel(16);
        let (b_tx, mut b_events) = mpsc::channel(16);
        let (a_handle, _a) =
            spawn_connection(ConnectionId(1), remote(), Role::Initiator, a, context(11), a_tx);
        let (b_handle, _b) =
            spawn_connection(ConnectionId(2), remote(), Role::Responder, b, context(22), b_tx);

        assert!(matches!(
            next_event(&mut a_events).await,
            ConnectionEvent::Established { .. }
        ));
        assert!(matches!(
            next_event(&mut b_events).await,
            ConnectionEvent::Established { .. }
        ));
        assert!(a_handle.is_established() && b_handle.is_established());
    }

    #[tokio::test]
    async fn equal_nonces_abort_on_both_sides() {
        let (a, b) = duplex(MAX);
        let (a_tx, mut a_events) = mpsc::channel(16);
        let (b_tx, mut b_events) = mpsc::channel(16);
        let (_, a_task) =
            spawn_connection(ConnectionId(1), remote(), Role::Initiator, a, context(7), a_tx);
        let (_, b_task) =
            spawn_connection(ConnectionId(2), remote(), Role::Responder, b, context(7), b_tx);

        assert!(matches!(
            next_event(&mut b_events).await,
            ConnectionEvent::Aborted {
                reason: ConnectionError::Protocol(ProtocolViolation::SelfConnection),
                ..
            }
        ));
        assert!(matches!(
            next_event(&mut a_events).await,
            ConnectionEvent::Aborted {
                role: Role::Initiator,
                reason: ConnectionError::Protocol(ProtocolViolation::SelfConnection),
                ..
            }
        ));
        a_task.await.expect("task");
        b_task.await.expect("task");
        assert!(a_events.recv().await.is_none());
        assert!(b_events.recv().await.is_none());
    }

    #[tokio::test]
    async fn responder_echoes_its_version_before_rejecting_its_own_nonce() {
        let (_handle, _task, mut peer, mut events) = responder(context(2));
        write_message(&mut peer, &NetMessage::Version(peer_version(2)), MAX)
            .await
            .expect("write");
        match read_message(&mut peer, MAX).await.expect("echo") {
            NetMessage::Version(version) => assert_eq!(version.nonce, 2),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Aborted {
                role: Role::Responder,
                reason: ConnectionError::Protocol(ProtocolViolation::SelfConnection),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn steady_state_before_handshake_aborts() {
        let (_handle, _task, mut peer, mut events) = responder(context(2));
        write_message(&mut peer, &NetMessage::Inv(vec![InventoryVector([1; 32])]), MAX)
            .await
            .expect("write");
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Aborted {
                reason: ConnectionError::Protocol(ProtocolViolation::NotEstablished("inv")),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn mismatched_version_aborts() {
        let (_handle, _task, mut peer, mut events) = responder(context(2));
        let mut version = peer_version(1);
        version.version += 1;
        write_message(&mut peer, &NetMessage::Version(version), MAX)
            .await
            .expect("write");
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Aborted {
                reason: ConnectionError::Protocol(ProtocolViolation::VersionMismatch { .. }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn silent_peer_hits_the_handshake_deadline() {
        let config = ConnectionConfig {
            read_timeout: Duration::from_millis(10),
            handshake_timeout: Duration::from_millis(100),
            max_message_size: MAX,
            ..ConnectionConfig::default()
        };
        let ctx = Arc::new(ConnectionContext::new(
            config,
            2,
            None,
            Arc::new(Datastore::in_memory(StoreConfig::default())),
            Arc::new(easy_crypt()),
        ));
        let (_handle, _task, _peer, mut events) = responder(ctx);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Aborted {
                reason: ConnectionError::HandshakeTimeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn established_connection_shares_what_it_knows() {
        let ctx = context(2);
        let crypt = easy_crypt();
        let object = sealed(&crypt, 1, 1);
        ctx.datastore.store_local(&object);
        let address = NetworkAddress::new(
            SocketAddr::from(([10, 0, 0, 5], 8444)),
            1,
            Services::NODE_NETWORK,
            chrono::Utc::now().timestamp(),
        );
        ctx.datastore.put_addresses(std::slice::from_ref(&address));

        let (_handle, _task, mut peer, mut events) = responder(ctx);
        establish(&mut peer, &mut events).await;
        assert_eq!(
            read_message(&mut peer, MAX).await.expect("addr"),
            NetMessage::Addr(vec![address])
        );
        assert_eq!(
            read_message(&mut peer, MAX).await.expect("inv"),
            NetMessage::Inv(vec![object.inventory()])
        );
    }

    #[tokio::test]
    async fn steady_state_messages_are_surfaced_and_served() {
        let ctx = context(2);
        let crypt = easy_crypt();
        let (_handle, _task, mut peer, mut events) = responder(Arc::clone(&ctx));
        establish(&mut peer, &mut events).await;

        let advertised = InventoryVector([5; 32]);
        write_message(&mut peer, &NetMessage::Inv(vec![advertised]), MAX)
            .await
            .expect("write");
        match next_event(&mut events).await {
            ConnectionEvent::AdvertisedObjects { vectors, .. } => {
                assert_eq!(vectors, vec![advertised]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let held = sealed(&crypt, 1, 2);
        ctx.datastore.store_local(&held);
        write_message(
            &mut peer,
            &NetMessage::GetData(vec![advertised, held.inventory()]),
            MAX,
        )
        .await
        .expect("write");
        assert_eq!(
            read_message(&mut peer, MAX).await.expect("object"),
            NetMessage::Object(held.as_bytes().to_vec())
        );

        let good = sealed(&crypt, 1, 3);
        let template = ObjectTemplate {
            expires: good.expires(),
            kind: good.kind(),
            stream: 1,
            payload: good.payload().to_vec(),
        };
        let body = template.pow_payload().expect("body");
        let bad_nonce = (0u64..)
            .find(|nonce| !crypt.check_pow(&body, *nonce))
            .expect("some nonce fails");
        let bad = template.seal(bad_nonce).expect("seal");
        let foreign = sealed(&crypt, 9, 4);

        for object in [&bad, &foreign, &good] {
            write_message(&mut peer, &NetMessage::Object(object.as_bytes().to_vec()), MAX)
                .await
                .expect("write");
        }
        match next_event(&mut events).await {
            ConnectionEvent::ReceivedObject { object, .. } => assert_eq!(object, good),
            other => panic!("unexpected event {other:?}"),
        }

        let address = NetworkAddress::new(
            SocketAddr::from(([10, 0, 0, 9], 8444)),
            1,
            Services::NODE_NETWORK,
            chrono::Utc::now().timestamp(),
        );
        write_message(&mut peer, &NetMessage::Addr(vec![address.clone()]), MAX)
            .await
            .expect("write");
        match next_event(&mut events).await {
            ConnectionEvent::ReceivedNodes { addresses, .. } => {
                assert_eq!(addresses, vec![address]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_object_aborts() {
        let (_handle, _task, mut peer, mut events) = responder(context(2));
        establish(&mut peer, &mut events).await;
        write_message(&mut peer, &NetMessage::Object(vec![1, 2, 3]), MAX)
            .await
            .expect("write");
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Aborted {
                reason: ConnectionError::Protocol(ProtocolViolation::MalformedObject(_)),
                ..
            }
        ));
    }

    #[test]
    fn full_outbound_queue_stops_the_connection() {
        let (handle, _outbound) =
            ConnectionHandle::new(ConnectionId(4), remote(), Role::Responder, 1);
        assert!(handle.send(NetMessage::VerAck));
        assert!(!handle.is_stopped());
        assert!(!handle.send(NetMessage::VerAck));
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn refused_dial_reports_could_not_connect_once() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let (events_tx, mut events) = mpsc::channel(4);
        let (handle, task) = connect(ConnectionId(9), addr, context(1), events_tx);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::CouldNotConnect { .. }
        ));
        task.await.expect("task");
        assert!(events.recv().await.is_none());
        assert_eq!(handle.state(), ConnectionState::Aborted);
    }
}

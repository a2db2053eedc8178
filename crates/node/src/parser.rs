//! Off-path decryption of `Msg` objects.
//!
//! Objects are queued by the network manager and opened on one dedicated
//! thread, so the time spent trying identities is unrelated to the
//! connection that delivered the object. The queue is bounded; a full queue
//! makes [`ObjectParser::submit`] wait for space.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crypto::{CryptManager, Envelope, PublicIdentity, Ripe};
use parking_lot::{Mutex, RwLock};
use proto::{InventoryVector, MessageContent, ObjectRecord, StreamId};
use storage::Datastore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ParserError;

/// A message addressed to one of our identities, decrypted and verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub inventory: InventoryVector,
    pub stream: StreamId,
    pub recipient: Ripe,
    pub sender: PublicIdentity,
    pub body: Vec<u8>,
}

/// Receives messages opened by the [`ObjectParser`]. Called on the parser
/// thread; implementations should return quickly.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &ReceivedMessage);
}

type Listeners = Arc<RwLock<Vec<Arc<dyn MessageListener>>>>;

pub struct ObjectParser {
    queue: Mutex<Option<mpsc::Sender<ObjectRecord>>>,
    listeners: Listeners,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ObjectParser {
    /// Spawns the consumer thread with room for `capacity` queued objects.
    pub fn start(
        datastore: Arc<Datastore>,
        crypt: Arc<dyn CryptManager>,
        capacity: usize,
    ) -> Result<Self, ParserError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            datastore,
            crypt,
            listeners: Arc::clone(&listeners),
            stopped: Arc::clone(&stopped),
        };
        let handle = thread::Builder::new()
            .name("object-parser".into())
            .spawn(move || worker.run(rx))
            .map_err(ParserError::Spawn)?;
        Ok(Self {
            queue: Mutex::new(Some(tx)),
            listeners,
            stopped,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.write().push(listener);
    }

    /// Queues `object`, waiting while the queue is full.
    pub async fn submit(&self, object: ObjectRecord) -> Result<(), ParserError> {
        let sender = self.queue.lock().clone().ok_or(ParserError::Stopped)?;
        sender.send(object).await.map_err(|_| ParserError::Stopped)
    }

    /// Stops accepting objects and lets the thread exit after its current item.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.queue.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Blocks until the consumer thread has exited. Call after [`stop`].
    ///
    /// [`stop`]: ObjectParser::stop
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("object parser thread panicked");
        }
    }
}

impl Drop for ObjectParser {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    datastore: Arc<Datastore>,
    crypt: Arc<dyn CryptManager>,
    listeners: Listeners,
    stopped: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, mut queue: mpsc::Receiver<ObjectRecord>) {
        debug!("object parser started");
        while let Some(object) = queue.blocking_recv() {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if let Some(message) = self.open(&object) {
                info!(
                    inventory = %message.inventory,
                    recipient = %hex::encode(message.recipient),
                    "received message"
                );
                for listener in self.listeners.read().iter() {
                    listener.on_message(&message);
                }
            }
        }
        debug!("object parser exiting");
    }

    /// Tries every identity we hold. Not being the recipient is the normal case.
    fn open(&self, object: &ObjectRecord) -> Option<ReceivedMessage> {
        let envelope: Envelope = match codec::from_slice(object.payload()) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(
                    inventory = %object.inventory(),
                    error = %err,
                    "msg payload is not an envelope"
                );
                return None;
            }
        };
        for identity in self.datastore.identities() {
            if !self.crypt.check_mac(&identity, &envelope) {
                continue;
            }
            let plaintext = match self.crypt.decrypt(&identity, &envelope) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    debug!(
                        inventory = %object.inventory(),
                        error = %err,
                        "decryption failed after mac matched"
                    );
                    continue;
                }
            };
            let content: MessageContent = match codec::from_slice(&plaintext) {
                Ok(content) => content,
                Err(err) => {
                    warn!(
                        inventory = %object.inventory(),
                        error = %err,
                        "undecodable message plaintext"
                    );
                    continue;
                }
            };
            if content.destination != identity.ripe() {
                warn!(
                    inventory = %object.inventory(),
                    "message destination does not match the decrypting identity"
                );
                continue;
            }
            if !self
                .crypt
                .verify(&content.sender, &content.preimage(), &content.signature)
            {
                warn!(inventory = %object.inventory(), "message signature invalid");
                continue;
            }
            return Some(ReceivedMessage {
                inventory: object.inventory(),
                stream: object.stream(),
                recipient: content.destination,
                sender: content.sender,
                body: content.body,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crypto::{CryptoError, PowParams, PowSettings, PrivateIdentity, StandardCrypt};
    use proto::{ObjectKind, ObjectTemplate};
    use storage::StoreConfig;

    use super::*;
    use crate::compose::seal_message;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ReceivedMessage>>);

    impl MessageListener for Collect {
        fn on_message(&self, message: &ReceivedMessage) {
            self.0.lock().push(message.clone());
        }
    }

    fn crypt() -> Arc<StandardCrypt> {
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

    /// Counts tag checks and decryptions, delegating the work.
    struct CountingCrypt {
        inner: Arc<StandardCrypt>,
        mac_checks: AtomicUsize,
        decryptions: AtomicUsize,
    }

    impl CountingCrypt {
        fn new(inner: Arc<StandardCrypt>) -> Self {
            Self {
                inner,
                mac_checks: AtomicUsize::new(0),
                decryptions: AtomicUsize::new(0),
            }
        }
    }

    impl CryptManager for CountingCrypt {
        fn check_pow(&self, data: &[u8], nonce: u64) -> bool {
            self.inner.check_pow(data, nonce)
        }

        fn pow_target(&self, len: usize) -> i64 {
            self.inner.pow_target(len)
        }

        fn do_pow(&self, payload: &[u8]) -> Result<u64, CryptoError> {
            self.inner.do_pow(payload)
        }

        fn sign(&self, identity: &PrivateIdentity, data: &[u8]) -> Vec<u8> {
            self.inner.sign(identity, data)
        }

        fn verify(&self, public: &PublicIdentity, data: &[u8], signature: &[u8]) -> bool {
            self.inner.verify(public, data, signature)
        }

        fn encrypt(
            &self,
            recipient: &PublicIdentity,
            plaintext: &[u8],
        ) -> Result<Envelope, CryptoError> {
            self.inner.encrypt(recipient, plaintext)
        }

        fn check_mac(&self, identity: &PrivateIdentity, envelope: &Envelope) -> bool {
            self.mac_checks.fetch_add(1, Ordering::Relaxed);
            self.inner.check_mac(identity, envelope)
        }

        fn decrypt(
            &self,
            identity: &PrivateIdentity,
            envelope: &Envelope,
        ) -> Result<Vec<u8>, CryptoError> {
            self.decryptions.fetch_add(1, Ordering::Relaxed);
            self.inner.decrypt(identity, envelope)
        }
    }

    async fn wait_for_messages(collect: &Collect, count: usize) {
        for _ in 0..100 {
            if collect.0.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} messages, got {}", collect.0.lock().len());
    }

    #[tokio::test]
    async fn only_messages_for_our_identities_are_delivered() {
        let crypt = crypt();
        let datastore = Arc::new(Datastore::in_memory(StoreConfig::default()));
        let ours = datastore.add_identity(PrivateIdentity::generate());
        let stranger = PrivateIdentity::generate();
        let sender = PrivateIdentity::generate();

        let parser = ObjectParser::start(Arc::clone(&datastore), crypt.clone(), 4).expect("start");
        let collect = Arc::new(Collect::default());
        parser.add_listener(collect.clone());

        let ttl = Duration::from_secs(600);
        let for_stranger =
            seal_message(crypt.as_ref(), &sender, stranger.public(), b"not yours", 1, ttl)
                .expect("seal");
        let for_us =
            seal_message(crypt.as_ref(), &sender, ours.public(), b"yours", 1, ttl).expect("seal");

        parser.submit(for_stranger).await.expect("submit");
        parser.submit(for_us.clone()).await.expect("submit");
        wait_for_messages(&collect, 1).await;

        let received = collect.0.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, b"yours");
        assert_eq!(received[0].inventory, for_us.inventory());
        assert_eq!(received[0].recipient, ours.ripe());
        assert_eq!(&received[0].sender, sender.public());

        parser.stop();
        assert!(matches!(
            parser.submit(for_us).await,
            Err(ParserError::Stopped)
        ));
        tokio::task::spawn_blocking(move || parser.join())
            .await
            .expect("join");
    }

    #[tokio::test]
    async fn foreign_messages_are_never_decrypted() {
        let counting = Arc::new(CountingCrypt::new(crypt()));
        let datastore = Arc::new(Datastore::in_memory(StoreConfig::default()));
        let ours = datastore.add_identity(PrivateIdentity::generate());
        datastore.add_identity(PrivateIdentity::generate());
        let stranger = PrivateIdentity::generate();
        let sender = PrivateIdentity::generate();

        let parser =
            ObjectParser::start(Arc::clone(&datastore), counting.clone(), 4).expect("start");
        let collect = Arc::new(Collect::default());
        parser.add_listener(collect.clone());

        let ttl = Duration::from_secs(600);
        let standard = counting.inner.as_ref();
        let foreign =
            seal_message(standard, &sender, stranger.public(), b"x", 1, ttl).expect("seal");
        let for_us = seal_message(standard, &sender, ours.public(), b"y", 1, ttl).expect("seal");
        parser.submit(foreign).await.expect("submit");
        parser.submit(for_us).await.expect("submit");
        wait_for_messages(&collect, 1).await;

        // Both identities rejected the foreign tag; only our message was opened.
        assert!(counting.mac_checks.load(Ordering::Relaxed) >= 3);
        assert_eq!(counting.decryptions.load(Ordering::Relaxed), 1);

        parser.stop();
        tokio::task::spawn_blocking(move || parser.join())
            .await
            .expect("join");
    }

    #[tokio::test]
    async fn mismatched_destination_is_not_delivered() {
        let counting = Arc::new(CountingCrypt::new(crypt()));
        let crypt = counting.inner.as_ref();
        let datastore = Arc::new(Datastore::in_memory(StoreConfig::default()));
        let ours = datastore.add_identity(PrivateIdentity::generate());
        let elsewhere = PrivateIdentity::generate();
        let sender = PrivateIdentity::generate();

        let parser =
            ObjectParser::start(Arc::clone(&datastore), counting.clone(), 4).expect("start");
        let collect = Arc::new(Collect::default());
        parser.add_listener(collect.clone());

        // Encrypted to our key but naming someone else inside.
        let destination = elsewhere.ripe();
        let body = b"redirected".to_vec();
        let preimage = MessageContent::signing_preimage(&destination, sender.public(), &body);
        let content = MessageContent {
            destination,
            sender: sender.public().clone(),
            body,
            signature: crypt.sign(&sender, &preimage),
        };
        let envelope = crypt
            .encrypt(ours.public(), &codec::to_vec(&content).expect("encode"))
            .expect("encrypt");
        let redirected = ObjectTemplate {
            expires: chrono::Utc::now().timestamp() + 600,
            kind: ObjectKind::Msg,
            stream: 1,
            payload: codec::to_vec(&envelope).expect("encode"),
        }
        .seal(0)
        .expect("seal");

        let ttl = Duration::from_secs(600);
        let genuine =
            seal_message(crypt, &sender, ours.public(), b"genuine", 1, ttl).expect("seal");
        parser.submit(redirected).await.expect("submit");
        parser.submit(genuine.clone()).await.expect("submit");
        wait_for_messages(&collect, 1).await;

        let received = collect.0.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, b"genuine");
        assert_eq!(received[0].inventory, genuine.inventory());
        assert_eq!(counting.decryptions.load(Ordering::Relaxed), 2);

        parser.stop();
        tokio::task::spawn_blocking(move || parser.join())
            .await
            .expect("join");
    }

    #[tokio::test]
    async fn garbage_payloads_are_ignored() {
        let crypt = crypt();
        let datastore = Arc::new(Datastore::in_memory(StoreConfig::default()));
        datastore.add_identity(PrivateIdentity::generate());
        let parser = ObjectParser::start(datastore, crypt, 1).expect("start");
        let collect = Arc::new(Collect::default());
        parser.add_listener(collect.clone());

        let junk = proto::ObjectTemplate {
            expires: chrono::Utc::now().timestamp() + 60,
            kind: proto::ObjectKind::Msg,
            stream: 1,
            payload: vec![0xff; 10],
        }
        .seal(0)
        .expect("seal");
        for _ in 0..3 {
            parser.submit(junk.clone()).await.expect("submit");
        }
        parser.stop();
        tokio::task::spawn_blocking(move || parser.join())
            .await
            .expect("join");
        assert!(collect.0.lock().is_empty());
    }
}

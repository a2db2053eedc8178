use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use pow::{PowParams, SearchOptions};

use crate::envelope::{self, Envelope};
use crate::error::CryptoError;
use crate::identity::{PrivateIdentity, PublicIdentity};
use crate::{Context, context};

/// Crypto operations the networking core depends on.
///
/// Passed around as `Arc<dyn CryptManager>` so connections, the network
/// manager and the object parser can be wired to a test double.
pub trait CryptManager: Send + Sync {
    /// Whether `nonce` is an acceptable proof of work for `data`.
    fn check_pow(&self, data: &[u8], nonce: u64) -> bool;
    /// Target a payload of `len` bytes must reach.
    fn pow_target(&self, len: usize) -> i64;
    /// Searches for a nonce sealing `payload`. Blocks the calling thread.
    fn do_pow(&self, payload: &[u8]) -> Result<u64, CryptoError>;
    fn sign(&self, identity: &PrivateIdentity, data: &[u8]) -> Vec<u8>;
    fn verify(&self, public: &PublicIdentity, data: &[u8], signature: &[u8]) -> bool;
    fn encrypt(&self, recipient: &PublicIdentity, plaintext: &[u8])
    -> Result<Envelope, CryptoError>;
    /// Cheap tag check run before [`CryptManager::decrypt`].
    fn check_mac(&self, identity: &PrivateIdentity, envelope: &Envelope) -> bool;
    fn decrypt(&self, identity: &PrivateIdentity, envelope: &Envelope)
    -> Result<Vec<u8>, CryptoError>;
}

/// Proof-of-work tuning handed to [`StandardCrypt`].
#[derive(Clone, Debug)]
pub struct PowSettings {
    pub params: PowParams,
    pub workers: usize,
    pub target_load: f64,
    /// Trials per duty cycle; updated after every search.
    pub batch_size: u64,
}

impl Default for PowSettings {
    fn default() -> Self {
        let search = SearchOptions::default();
        Self {
            params: PowParams::default(),
            workers: search.workers,
            target_load: search.target_load,
            batch_size: search.batch_size,
        }
    }
}

/// Production [`CryptManager`].
#[derive(Debug)]
pub struct StandardCrypt {
    params: PowParams,
    workers: usize,
    target_load: f64,
    batch_size: AtomicU64,
    cancel: Arc<AtomicBool>,
    signing_context: Context,
}

impl StandardCrypt {
    pub fn new(settings: PowSettings) -> Self {
        Self {
            params: settings.params,
            workers: settings.workers.max(1),
            target_load: settings.target_load,
            batch_size: AtomicU64::new(settings.batch_size),
            cancel: Arc::new(AtomicBool::new(false)),
            signing_context: context::MESSAGE,
        }
    }

    pub fn params(&self) -> &PowParams {
        &self.params
    }

    /// Batch size the throttles settled on during the last search.
    pub fn learned_batch_size(&self) -> u64 {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Abandons every running and future search.
    pub fn cancel_pow(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

impl Default for StandardCrypt {
    fn default() -> Self {
        Self::new(PowSettings::default())
    }
}

impl CryptManager for StandardCrypt {
    fn check_pow(&self, data: &[u8], nonce: u64) -> bool {
        pow::valid(data, nonce, &self.params)
    }

    fn pow_target(&self, len: usize) -> i64 {
        pow::target(len, &self.params)
    }

    fn do_pow(&self, payload: &[u8]) -> Result<u64, CryptoError> {
        let options = SearchOptions {
            workers: self.workers,
            target_load: self.target_load,
            batch_size: self.learned_batch_size(),
            cancel: Some(Arc::clone(&self.cancel)),
        };
        let solution = pow::solve(payload, &self.params, &options)?;
        self.batch_size.store(solution.batch_size, Ordering::Relaxed);
        Ok(solution.nonce)
    }

    fn sign(&self, identity: &PrivateIdentity, data: &[u8]) -> Vec<u8> {
        identity.sign(self.signing_context, data)
    }

    fn verify(&self, public: &PublicIdentity, data: &[u8], signature: &[u8]) -> bool {
        public.verify(self.signing_context, data, signature)
    }

    fn encrypt(
        &self,
        recipient: &PublicIdentity,
        plaintext: &[u8],
    ) -> Result<Envelope, CryptoError> {
        envelope::seal(recipient, plaintext)
    }

    fn check_mac(&self, identity: &PrivateIdentity, envelope: &Envelope) -> bool {
        envelope::mac_matches(identity, envelope)
    }

    fn decrypt(
        &self,
        identity: &PrivateIdentity,
        envelope: &Envelope,
    ) -> Result<Vec<u8>, CryptoError> {
        envelope::open(identity, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> StandardCrypt {
        StandardCrypt::new(PowSettings {
            params: PowParams {
                trials_per_byte: 2,
                extra_bytes: 16,
            },
            workers: 2,
            target_load: 1.0,
            batch_size: 512,
        })
    }

    #[test]
    fn do_pow_produces_a_nonce_check_pow_accepts() {
        let crypt = cheap();
        let payload = vec![42u8; 128];
        let nonce = crypt.do_pow(&payload).expect("pow");
        assert!(crypt.check_pow(&payload, nonce));
        assert!(crypt.pow_target(payload.len()) > 0);
    }

    #[test]
    fn cancelled_manager_refuses_to_search() {
        let crypt = StandardCrypt::default();
        crypt.cancel_pow();
        let err = crypt.do_pow(&[0u8; 4096]).expect_err("cancelled");
        assert!(matches!(err, CryptoError::Pow(pow::PowError::Cancelled)));
    }

    #[test]
    fn sign_and_verify_through_the_trait() {
        let crypt: Arc<dyn CryptManager> = Arc::new(cheap());
        let identity = PrivateIdentity::generate();
        let signature = crypt.sign(&identity, b"body");
        assert!(crypt.verify(identity.public(), b"body", &signature));
        assert!(!crypt.verify(identity.public(), b"other", &signature));
    }

    #[test]
    fn encrypt_check_mac_and_decrypt_through_the_trait() {
        let crypt = cheap();
        let identity = PrivateIdentity::generate();
        let envelope = crypt.encrypt(identity.public(), b"body").expect("encrypt");
        assert!(crypt.check_mac(&identity, &envelope));
        assert_eq!(crypt.decrypt(&identity, &envelope).expect("decrypt"), b"body");
    }
}

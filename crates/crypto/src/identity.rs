use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as AgreementKey, StaticSecret};
use zeroize::Zeroizing;

use crate::Context;

pub const RIPE_LEN: usize = 20;

/// Short fingerprint naming an identity on the network.
pub type Ripe = [u8; RIPE_LEN];

/// Public half of an identity, as shared with correspondents.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicIdentity {
    #[serde(with = "serde_bytes")]
    pub signing_key: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub encryption_key: [u8; 32],
}

impl PublicIdentity {
    /// First 20 bytes of `sha512(signing_key ‖ encryption_key)`.
    pub fn ripe(&self) -> Ripe {
        let mut preimage = [0u8; 64];
        preimage[..32].copy_from_slice(&self.signing_key);
        preimage[32..].copy_from_slice(&self.encryption_key);
        let digest = pow::sha512(&preimage);
        let mut ripe = [0u8; RIPE_LEN];
        ripe.copy_from_slice(&digest[..RIPE_LEN]);
        ripe
    }

    pub(crate) fn verify(&self, context: Context, data: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signing_key) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        key.verify(&preimage(context, data), &Signature::from_bytes(&bytes))
            .is_ok()
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicIdentity")
            .field("ripe", &hex::encode(self.ripe()))
            .finish()
    }
}

/// Locally held keypair used to sign outgoing and open incoming messages.
pub struct PrivateIdentity {
    signing: SigningKey,
    encryption: StaticSecret,
    public: PublicIdentity,
    ripe: Ripe,
}

impl PrivateIdentity {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let encryption = StaticSecret::random_from_rng(OsRng);
        Self::from_keys(signing, encryption)
    }

    pub fn from_secret_bytes(signing: [u8; 32], encryption: [u8; 32]) -> Self {
        Self::from_keys(
            SigningKey::from_bytes(&signing),
            StaticSecret::from(encryption),
        )
    }

    fn from_keys(signing: SigningKey, encryption: StaticSecret) -> Self {
        let public = PublicIdentity {
            signing_key: signing.verifying_key().to_bytes(),
            encryption_key: AgreementKey::from(&encryption).to_bytes(),
        };
        let ripe = public.ripe();
        Self {
            signing,
            encryption,
            public,
            ripe,
        }
    }

    /// Secret key bytes `(signing, encryption)` for persistence.
    pub fn secret_bytes(&self) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
        (
            Zeroizing::new(self.signing.to_bytes()),
            Zeroizing::new(self.encryption.to_bytes()),
        )
    }

    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    pub fn ripe(&self) -> Ripe {
        self.ripe
    }

    pub(crate) fn agreement_secret(&self) -> &StaticSecret {
        &self.encryption
    }

    pub(crate) fn sign(&self, context: Context, data: &[u8]) -> Vec<u8> {
        self.signing.sign(&preimage(context, data)).to_bytes().to_vec()
    }
}

impl fmt::Debug for PrivateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateIdentity")
            .field("ripe", &hex::encode(self.ripe))
            .finish_non_exhaustive()
    }
}

fn preimage(context: Context, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(context.0.len() + data.len());
    out.extend_from_slice(context.0);
    out.extend_from_slice(data);
    out
}

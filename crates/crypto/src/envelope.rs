use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as AgreementKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{PrivateIdentity, PublicIdentity};

type HmacSha256 = Hmac<Sha256>;

const KDF_INFO: &[u8] = b"GOSSIP|ENVELOPE|v1";

/// Ciphertext addressed to a single public identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "serde_bytes")]
    pub ephemeral: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub nonce: [u8; 12],
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub mac: [u8; 32],
}

struct EnvelopeKeys {
    cipher: Zeroizing<[u8; 32]>,
    mac: Zeroizing<[u8; 32]>,
}

fn derive_keys(shared: &[u8; 32], ephemeral: &[u8; 32]) -> Result<EnvelopeKeys, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(ephemeral), shared);
    let mut okm = Zeroizing::new([0u8; 64]);
    hkdf.expand(KDF_INFO, &mut okm[..])
        .map_err(|_| CryptoError::KeyDerivation)?;
    let mut cipher = Zeroizing::new([0u8; 32]);
    let mut mac = Zeroizing::new([0u8; 32]);
    cipher.copy_from_slice(&okm[..32]);
    mac.copy_from_slice(&okm[32..]);
    Ok(EnvelopeKeys { cipher, mac })
}

fn authenticator(key: &[u8; 32], envelope_parts: [&[u8]; 3]) -> Result<HmacSha256, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    for part in envelope_parts {
        mac.update(part);
    }
    Ok(mac)
}

fn receiver_keys(
    identity: &PrivateIdentity,
    envelope: &Envelope,
) -> Result<EnvelopeKeys, CryptoError> {
    let shared = identity
        .agreement_secret()
        .diffie_hellman(&AgreementKey::from(envelope.ephemeral));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }
    derive_keys(shared.as_bytes(), &envelope.ephemeral)
}

/// Encrypts `plaintext` so that only `recipient` can open it.
pub fn seal(recipient: &PublicIdentity, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = AgreementKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&AgreementKey::from(recipient.encryption_key));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }
    let keys = derive_keys(shared.as_bytes(), &ephemeral_public)?;

    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.cipher[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let tag = authenticator(&keys.mac, [&ephemeral_public[..], &nonce[..], &ciphertext[..]])?
        .finalize()
        .into_bytes();
    let mut mac = [0u8; 32];
    mac.copy_from_slice(&tag);

    Ok(Envelope {
        ephemeral: ephemeral_public,
        nonce,
        ciphertext,
        mac,
    })
}

/// Checks the envelope tag against `identity` without decrypting.
///
/// A mismatch is the normal outcome for every identity that is not the
/// recipient.
pub fn mac_matches(identity: &PrivateIdentity, envelope: &Envelope) -> bool {
    let Ok(keys) = receiver_keys(identity, envelope) else {
        return false;
    };
    authenticator(
        &keys.mac,
        [
            &envelope.ephemeral[..],
            &envelope.nonce[..],
            &envelope.ciphertext[..],
        ],
    )
    .is_ok_and(|mac| mac.verify_slice(&envelope.mac).is_ok())
}

/// Authenticates and decrypts an envelope addressed to `identity`.
pub fn open(identity: &PrivateIdentity, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
    let keys = receiver_keys(identity, envelope)?;
    authenticator(
        &keys.mac,
        [
            &envelope.ephemeral[..],
            &envelope.nonce[..],
            &envelope.ciphertext[..],
        ],
    )?
    .verify_slice(&envelope.mac)
    .map_err(|_| CryptoError::MacMismatch)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.cipher[..]));
    cipher
        .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_ref())
        .map_err(|_| CryptoError::Decryption)
}

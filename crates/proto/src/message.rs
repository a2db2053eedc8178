use crypto::{PublicIdentity, Ripe};
use serde::{Deserialize, Serialize};

/// Decrypted contents of a `Msg` object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Fingerprint of the intended recipient.
    #[serde(with = "serde_bytes")]
    pub destination: Ripe,
    pub sender: PublicIdentity,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl MessageContent {
    /// Bytes the sender signs: destination, sender keys and body.
    pub fn signing_preimage(destination: &Ripe, sender: &PublicIdentity, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(destination.len() + 64 + body.len());
        out.extend_from_slice(destination);
        out.extend_from_slice(&sender.signing_key);
        out.extend_from_slice(&sender.encryption_key);
        out.extend_from_slice(body);
        out
    }

    pub fn preimage(&self) -> Vec<u8> {
        Self::signing_preimage(&self.destination, &self.sender, &self.body)
    }
}

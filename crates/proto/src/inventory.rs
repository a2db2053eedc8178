use std::fmt;

use serde::{Deserialize, Serialize};

/// Content hash naming an object on the network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InventoryVector(#[serde(with = "serde_bytes")] pub [u8; 32]);

impl InventoryVector {
    /// First 32 bytes of `sha512(sha512(bytes))`.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = crypto::double_sha512(bytes);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest[..32]);
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InventoryVector({})", hex::encode(&self.0[..8]))
    }
}

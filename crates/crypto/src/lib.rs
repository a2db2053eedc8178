//! Cryptographic services consumed by the networking core.
//!
//! Everything the core needs from cryptography goes through the
//! [`CryptManager`] trait so that callers receive it by injection and tests can
//! substitute their own implementation. [`StandardCrypt`] is the production
//! implementation:
//!
//! - **Proof of work**: delegated to the `pow` crate, with the learned
//!   throttle batch size kept between searches
//! - **Signatures**: Ed25519 over domain-separated preimages
//! - **Envelopes**: X25519 key agreement, HKDF-SHA256, an HMAC-SHA256 tag that
//!   is checked before any ChaCha20-Poly1305 decryption is attempted
//!
//! Secret keys are zeroized on drop.

mod envelope;
mod error;
mod identity;
mod manager;

pub use envelope::{Envelope, mac_matches, open, seal};
pub use error::CryptoError;
pub use identity::{PrivateIdentity, PublicIdentity, RIPE_LEN, Ripe};
pub use manager::{CryptManager, PowSettings, StandardCrypt};
pub use pow::{PowParams, sha512};

/// Type-safe domain separation tag mixed into signature preimages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context(pub &'static [u8]);

pub mod context {
    use super::Context;

    /// Signatures over person-to-person message plaintext.
    pub const MESSAGE: Context = Context(b"GOSSIP|MSG|v1");
}

/// `sha512(sha512(data))`, the digest inventory vectors are cut from.
pub fn double_sha512(data: &[u8]) -> [u8; 64] {
    sha512(&sha512(data))
}

use sha2::{Digest, Sha512};

/// SHA-512 of `data`.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// Hash of the payload that every trial builds on.
pub fn initial_hash(payload: &[u8]) -> [u8; 64] {
    sha512(payload)
}

/// Value compared against the target for a single nonce.
pub fn trial_value(nonce: u64, initial: &[u8; 64]) -> i64 {
    let mut hasher = Sha512::new();
    hasher.update(nonce.to_be_bytes());
    hasher.update(initial);
    let second = Sha512::digest(hasher.finalize());
    let mut head = [0u8; 8];
    head.copy_from_slice(&second[..8]);
    i64::from_be_bytes(head)
}

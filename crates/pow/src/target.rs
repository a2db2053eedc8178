use crate::hash::{initial_hash, trial_value};

/// Network-wide difficulty constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowParams {
    /// Average number of trials demanded per payload byte.
    pub trials_per_byte: u64,
    /// Bytes added to every payload length so tiny objects still cost work.
    pub extra_bytes: u64,
}

impl Default for PowParams {
    fn default() -> Self {
        Self {
            trials_per_byte: 1000,
            extra_bytes: 1000,
        }
    }
}

/// Largest trial value accepted for a payload of `len` bytes.
///
/// Computed as `2^64 / ((len + extra_bytes + 8) * trials_per_byte)` and
/// clamped so the result always fits in 63 bits.
pub fn target(len: usize, params: &PowParams) -> i64 {
    let trials = u128::from(params.trials_per_byte.max(1));
    let weighted = (len as u128 + u128::from(params.extra_bytes) + 8) * trials;
    let value = (1u128 << 64) / weighted;
    value.min(i64::MAX as u128) as i64
}

/// Returns true when `nonce` satisfies the target for `payload`.
pub fn valid(payload: &[u8], nonce: u64, params: &PowParams) -> bool {
    let value = trial_value(nonce, &initial_hash(payload));
    (0..=target(payload.len(), params)).contains(&value)
}

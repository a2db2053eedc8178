//! CPU bound proof-of-work used as the admission cost of every object.
//!
//! A trial hashes `nonce ‖ sha512(payload)` twice with SHA-512 and reads the
//! first eight bytes as a big-endian signed integer. The object is admitted
//! when that value lands in `0..=target`, where the target shrinks as the
//! payload grows. Searching is split across worker threads that throttle
//! themselves to a configured share of the CPU.

mod error;
mod hash;
mod search;
mod target;
mod throttle;

pub use error::PowError;
pub use hash::{initial_hash, sha512, trial_value};
pub use search::{SearchOptions, Solution, nonce_sequence, search, solve};
pub use target::{PowParams, target, valid};
pub use throttle::{MAX_BATCH, MIN_BATCH, ROUND, Throttle, next_batch_size};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PowError {
    #[error("proof-of-work search cancelled")]
    Cancelled,
    #[error("nonce space exhausted without a solution")]
    Exhausted,
    #[error("invalid target {0}")]
    InvalidTarget(i64),
    #[error("proof-of-work worker panicked")]
    WorkerPanicked,
}

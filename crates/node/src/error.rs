use std::io;

use codec::CodecError;
use crypto::CryptoError;
use proto::ObjectError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("parser error: {0}")]
    Parser(#[from] ParserError),
    #[error("network manager stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("failed to spawn parser thread: {0}")]
    Spawn(io::Error),
    #[error("object parser stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("encoding error: {0}")]
    Codec(#[from] CodecError),
    #[error("object error: {0}")]
    Object(#[from] ObjectError),
    #[error("message lifetime of {0}s is outside the allowed range")]
    InvalidTtl(u64),
}

use std::io;

use codec::CodecError;
use proto::ObjectError;
use thiserror::Error;

/// Why a connection was closed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out connecting")]
    ConnectTimeout,
    #[error("timed out waiting for handshake")]
    HandshakeTimeout,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] CodecError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("peer closed the connection")]
    Closed,
    #[error("connection stopped")]
    Stopped,
}

/// Peer behaviour that aborts the connection.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("duplicate version")]
    DuplicateVersion,
    #[error("duplicate verack")]
    DuplicateVerack,
    #[error("verack before our version was sent")]
    UnexpectedVerack,
    #[error("peer declared no usable streams")]
    NoStreams,
    #[error("peer shares no stream with us")]
    NoCommonStream,
    #[error("user agent of {0} bytes is too long")]
    UserAgentTooLong(usize),
    #[error("{0} before the handshake completed")]
    NotEstablished(&'static str),
    #[error("{command} carries {count} items")]
    TooManyItems { command: &'static str, count: usize },
    #[error("malformed object: {0}")]
    MalformedObject(#[from] ObjectError),
}

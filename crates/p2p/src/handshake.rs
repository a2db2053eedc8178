use proto::StreamId;

use crate::error::ProtocolViolation;
use crate::types::{MAX_USER_AGENT_LEN, NetMessage, PROTOCOL_VERSION, Role, Version};

/// Version/verack bookkeeping for one connection.
///
/// `peer_verified` is set once the peer's version was accepted and
/// acknowledged, `self_verified` once the peer acknowledged ours. The
/// handshake is complete when both are set.
#[derive(Debug)]
pub(crate) struct Handshake {
    role: Role,
    local_nonce: u64,
    local_perimeter: Vec<StreamId>,
    version_sent: bool,
    peer_verified: bool,
    self_verified: bool,
    peer: Option<Version>,
}

impl Handshake {
    pub(crate) fn new(role: Role, local_nonce: u64, local_perimeter: Vec<StreamId>) -> Self {
        Self {
            role,
            local_nonce,
            local_perimeter,
            version_sent: false,
            peer_verified: false,
            self_verified: false,
            peer: None,
        }
    }

    /// Messages the initiator sends as soon as the socket is up.
    pub(crate) fn start(&mut self, local: impl FnOnce() -> Version) -> Vec<NetMessage> {
        match self.role {
            Role::Initiator => {
                self.version_sent = true;
                vec![NetMessage::Version(local())]
            }
            Role::Responder => Vec::new(),
        }
    }

    /// Validates the peer's version and returns the replies to send.
    pub(crate) fn on_version(
        &mut self,
        version: Version,
        local: impl FnOnce() -> Version,
    ) -> Result<Vec<NetMessage>, ProtocolViolation> {
        if self.peer.is_some() {
            return Err(ProtocolViolation::DuplicateVersion);
        }
        if version.version != PROTOCOL_VERSION {
            return Err(ProtocolViolation::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: version.version,
            });
        }
        if version.nonce == self.local_nonce {
            return Err(ProtocolViolation::SelfConnection);
        }
        if version.user_agent.len() > MAX_USER_AGENT_LEN {
            return Err(ProtocolViolation::UserAgentTooLong(version.user_agent.len()));
        }
        if version.streams.is_empty() || version.streams.contains(&0) {
            return Err(ProtocolViolation::NoStreams);
        }
        if !version
            .streams
            .iter()
            .any(|stream| self.local_perimeter.contains(stream))
        {
            return Err(ProtocolViolation::NoCommonStream);
        }

        self.peer = Some(version);
        self.peer_verified = true;
        let mut replies = vec![NetMessage::VerAck];
        if !self.version_sent {
            self.version_sent = true;
            replies.push(NetMessage::Version(local()));
        }
        Ok(replies)
    }

    pub(crate) fn on_verack(&mut self) -> Result<(), ProtocolViolation> {
        if self.self_verified {
            return Err(ProtocolViolation::DuplicateVerack);
        }
        if !self.version_sent {
            return Err(ProtocolViolation::UnexpectedVerack);
        }
        self.self_verified = true;
        Ok(())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.peer_verified && self.self_verified
    }

    pub(crate) fn peer(&self) -> Option<&Version> {
        self.peer.as_ref()
    }
}

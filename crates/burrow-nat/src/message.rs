//! Wire messages exchanged with the rendezvous/relay peer and, during hole
//! punching, directly between peers.
//!
//! Only the semantic fields are defined here; the encoding rides on the
//! peer-to-peer framing (bincode, with a u32-BE length prefix on TCP).
//! Every request carries a caller-supplied `correlation` echoed by the
//! matching reply, so concurrent outstanding requests never block each other.

use crate::error::TraversalError;
use crate::peer::{PeerAddress, PeerId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Reasons a rendezvous or relay peer refuses a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    /// The named target never registered with this peer.
    TargetNotRegistered,
    /// The sender itself is not registered.
    SenderNotRegistered,
    /// Relay session table is full.
    CapacityExceeded,
    /// Session token does not correspond to an active binding.
    UnknownSession,
    /// Request could not be understood.
    Malformed,
}

impl RejectCode {
    /// Map a refusal to the stage-level error taxonomy.
    #[must_use]
    pub fn into_error(self) -> TraversalError {
        match self {
            Self::TargetNotRegistered => {
                TraversalError::Unreachable("target not registered with relay peer".into())
            }
            Self::SenderNotRegistered => {
                TraversalError::ProtocolMismatch("sender not registered".into())
            }
            Self::CapacityExceeded => {
                TraversalError::ResourceExhausted("relay session capacity exceeded".into())
            }
            Self::UnknownSession => TraversalError::ProtocolMismatch("unknown relay session".into()),
            Self::Malformed => TraversalError::ProtocolMismatch("malformed request".into()),
        }
    }
}

/// Messages understood by every Burrow peer taking part in connectivity
/// establishment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RendezvousMessage {
    /// Direct reachability probe.
    Ping {
        /// Request correlation id.
        correlation: u64,
        /// Sender's peer id.
        sender: PeerId,
    },
    /// Reply to [`RendezvousMessage::Ping`].
    Pong {
        /// Echoed correlation id.
        correlation: u64,
        /// Responder's peer id.
        sender: PeerId,
    },

    /// Register the sender's announced address with the rendezvous peer.
    Register {
        /// Request correlation id.
        correlation: u64,
        /// Announced identity and endpoints.
        peer: PeerAddress,
    },
    /// Registration acknowledgment carrying the externally observed endpoint.
    RegisterAck {
        /// Echoed correlation id.
        correlation: u64,
        /// Source address the rendezvous peer observed.
        observed: SocketAddr,
    },

    /// Self-port discovery: ask the rendezvous peer which external endpoint
    /// this datagram arrived from.
    WhoAmI {
        /// Request correlation id.
        correlation: u64,
        /// Sender's peer id.
        sender: PeerId,
    },
    /// Reply to [`RendezvousMessage::WhoAmI`].
    YouAre {
        /// Echoed correlation id.
        correlation: u64,
        /// Externally observed endpoint of the asker.
        observed: SocketAddr,
    },

    /// Initiator asks the rendezvous peer to relay a prepare-to-punch
    /// instruction to `target`.
    PunchRequest {
        /// Request correlation id.
        correlation: u64,
        /// Initiator's externally observed address.
        initiator: PeerAddress,
        /// Initiator's locally bound UDP port (port-preserving guess).
        bind_port: u16,
        /// Peer to punch towards.
        target: PeerId,
        /// Synchronization token shared by both punch sessions.
        sync_token: u64,
    },
    /// Prepare-to-punch instruction forwarded to the target.
    PunchForward {
        /// Correlation id of the originating request.
        correlation: u64,
        /// Initiator's externally observed address.
        initiator: PeerAddress,
        /// Initiator's locally bound UDP port.
        bind_port: u16,
        /// Synchronization token shared by both punch sessions.
        sync_token: u64,
    },
    /// Target's answer, forwarded back to the initiator by the rendezvous
    /// peer. Doubles as the punch start signal for both sides.
    PunchAccept {
        /// Correlation id of the originating request.
        correlation: u64,
        /// Target's externally observed address.
        target: PeerAddress,
        /// Target's locally bound UDP port.
        bind_port: u16,
        /// Synchronization token shared by both punch sessions.
        sync_token: u64,
    },
    /// The rendezvous peer cannot set up the punch.
    PunchReject {
        /// Echoed correlation id.
        correlation: u64,
        /// Refusal reason.
        code: RejectCode,
    },

    /// Hole-punch probe sent to a candidate port of the remote peer.
    Probe {
        /// Synchronization token of the punch session.
        sync_token: u64,
        /// Sender's peer id.
        sender: PeerId,
    },
    /// Acknowledgment of a received probe. Either message kind arriving from
    /// the expected peer completes the punch.
    ProbeAck {
        /// Synchronization token of the punch session.
        sync_token: u64,
        /// Sender's peer id.
        sender: PeerId,
    },

    /// Ask a relay peer to open a forwarding session to `target`.
    RelayStart {
        /// Request correlation id.
        correlation: u64,
        /// Requesting peer.
        initiator: PeerId,
        /// Peer to forward traffic to. Must have registered beforehand.
        target: PeerId,
    },
    /// Relay session established; the token is the capability for all
    /// further forwarding on this path.
    RelayStarted {
        /// Echoed correlation id.
        correlation: u64,
        /// Opaque session token issued by the relay.
        session_token: u64,
    },
    /// Relay session refused.
    RelayDenied {
        /// Echoed correlation id.
        correlation: u64,
        /// Refusal reason.
        code: RejectCode,
    },

    /// Envelope carrying application payload towards the other end of a
    /// relay session.
    RelayForward {
        /// Session token issued at setup.
        session_token: u64,
        /// Sending peer.
        sender: PeerId,
        /// Opaque application payload.
        payload: Vec<u8>,
    },
    /// Envelope delivered by the relay to the receiving end.
    RelayDeliver {
        /// Session token issued at setup.
        session_token: u64,
        /// Originating peer.
        sender: PeerId,
        /// Opaque application payload.
        payload: Vec<u8>,
    },

    /// Periodic liveness signal for a relay session.
    RelayKeepAlive {
        /// Request correlation id.
        correlation: u64,
        /// Session token issued at setup.
        session_token: u64,
    },
    /// Liveness acknowledgment.
    RelayKeepAliveAck {
        /// Echoed correlation id.
        correlation: u64,
        /// Session token issued at setup.
        session_token: u64,
    },
    /// Explicit relay session teardown.
    RelayStop {
        /// Session token issued at setup.
        session_token: u64,
    },
}

impl RendezvousMessage {
    /// Serialize to bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolMismatch` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TraversalError> {
        bincode::serialize(self).map_err(|e| TraversalError::ProtocolMismatch(e.to_string()))
    }

    /// Deserialize from bytes.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolMismatch` if the bytes do not decode to a message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TraversalError> {
        bincode::deserialize(bytes).map_err(|e| TraversalError::ProtocolMismatch(e.to_string()))
    }

    /// The correlation id carried by this message, if any.
    #[must_use]
    pub fn correlation(&self) -> Option<u64> {
        match self {
            Self::Ping { correlation, .. }
            | Self::Pong { correlation, .. }
            | Self::Register { correlation, .. }
            | Self::RegisterAck { correlation, .. }
            | Self::WhoAmI { correlation, .. }
            | Self::YouAre { correlation, .. }
            | Self::PunchRequest { correlation, .. }
            | Self::PunchForward { correlation, .. }
            | Self::PunchAccept { correlation, .. }
            | Self::PunchReject { correlation, .. }
            | Self::RelayStart { correlation, .. }
            | Self::RelayStarted { correlation, .. }
            | Self::RelayDenied { correlation, .. }
            | Self::RelayKeepAlive { correlation, .. }
            | Self::RelayKeepAliveAck { correlation, .. } => Some(*correlation),
            Self::Probe { .. }
            | Self::ProbeAck { .. }
            | Self::RelayForward { .. }
            | Self::RelayDeliver { .. }
            | Self::RelayStop { .. } => None,
        }
    }

    /// Whether this message answers an outstanding request and should be
    /// routed to the waiter registered under its correlation id.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::Pong { .. }
                | Self::RegisterAck { .. }
                | Self::YouAre { .. }
                | Self::PunchAccept { .. }
                | Self::PunchReject { .. }
                | Self::RelayStarted { .. }
                | Self::RelayDenied { .. }
                | Self::RelayKeepAliveAck { .. }
        )
    }

    /// Short name of the message kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::Register { .. } => "Register",
            Self::RegisterAck { .. } => "RegisterAck",
            Self::WhoAmI { .. } => "WhoAmI",
            Self::YouAre { .. } => "YouAre",
            Self::PunchRequest { .. } => "PunchRequest",
            Self::PunchForward { .. } => "PunchForward",
            Self::PunchAccept { .. } => "PunchAccept",
            Self::PunchReject { .. } => "PunchReject",
            Self::Probe { .. } => "Probe",
            Self::ProbeAck { .. } => "ProbeAck",
            Self::RelayStart { .. } => "RelayStart",
            Self::RelayStarted { .. } => "RelayStarted",
            Self::RelayDenied { .. } => "RelayDenied",
            Self::RelayForward { .. } => "RelayForward",
            Self::RelayDeliver { .. } => "RelayDeliver",
            Self::RelayKeepAlive { .. } => "RelayKeepAlive",
            Self::RelayKeepAliveAck { .. } => "RelayKeepAliveAck",
            Self::RelayStop { .. } => "RelayStop",
        }
    }
}

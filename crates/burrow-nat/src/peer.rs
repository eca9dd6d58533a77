//! Peer identity and endpoint model.
//!
//! A [`PeerId`] is a 160-bit identifier, globally unique per peer instance,
//! derived from an arbitrary seed with BLAKE3. A [`PeerAddress`] binds an id
//! to the endpoints the peer announced: reported IP, TCP port and UDP port.
//!
//! Two addresses observed for the same id may legitimately differ before and
//! after traversal (local view vs. externally observed view); routing logic
//! compares by id while connectivity attempts compare the full tuple.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Length of a peer identifier in bytes (160 bits).
pub const PEER_ID_LEN: usize = 20;

/// 160-bit peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Create an id from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive an id from an arbitrary seed (BLAKE3, truncated to 160 bits).
    ///
    /// # Examples
    ///
    /// ```
    /// use burrow_nat::PeerId;
    ///
    /// let a = PeerId::from_seed(b"seed");
    /// let b = PeerId::from_seed(b"seed");
    /// assert_eq!(a, b);
    /// ```
    #[must_use]
    pub fn from_seed(seed: &[u8]) -> Self {
        let hash = blake3::hash(seed);
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..PEER_ID_LEN]);
        Self(bytes)
    }

    /// Generate a random id.
    #[must_use]
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes of the identifier.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short hex prefix is enough to tell peers apart in logs
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Announced identity + endpoints of a peer. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Peer identifier.
    pub id: PeerId,
    /// Reported IP address.
    pub ip: IpAddr,
    /// Reported TCP port.
    pub tcp_port: u16,
    /// Reported UDP port.
    pub udp_port: u16,
}

impl PeerAddress {
    /// Create a new peer address.
    #[must_use]
    pub const fn new(id: PeerId, ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            id,
            ip,
            tcp_port,
            udp_port,
        }
    }

    /// UDP endpoint of this peer.
    #[must_use]
    pub const fn udp_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// TCP endpoint of this peer.
    #[must_use]
    pub const fn tcp_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// Routing comparison: same peer regardless of observed endpoints.
    #[must_use]
    pub fn same_peer(&self, other: &Self) -> bool {
        self.id == other.id
    }

    /// Copy of this address with a different observed UDP endpoint, keeping
    /// the identity. Used to record the external view after traversal.
    #[must_use]
    pub fn with_udp_endpoint(&self, endpoint: SocketAddr) -> Self {
        Self {
            id: self.id,
            ip: endpoint.ip(),
            tcp_port: self.tcp_port,
            udp_port: endpoint.port(),
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:udp{}/tcp{}",
            self.id, self.ip, self.udp_port, self.tcp_port
        )
    }
}

/// Resolves a peer id to its currently known address.
///
/// Implemented by the DHT routing layer (external collaborator); the
/// orchestrator only consumes it.
pub trait PeerLookup: Send + Sync {
    /// Look up the announced address for `id`, if known.
    fn lookup(&self, id: &PeerId) -> Option<PeerAddress>;
}

/// Notification sink the DHT storage layer implements to observe local
/// record changes and decide on replication.
///
/// This is the sibling contract the connectivity layer's consumers rely on
/// once a channel exists; the connectivity core itself never calls it.
pub trait ReplicationListener: Send + Sync {
    /// A record was stored locally under `location_key`.
    fn on_data_inserted(&self, location_key: PeerId, is_replica_copy: bool);

    /// A record stored under `location_key` was removed.
    fn on_data_removed(&self, location_key: PeerId);
}

//! # Burrow NAT
//!
//! Connectivity establishment for peers behind NATs and firewalls.
//!
//! This crate provides:
//! - Peer addressing (160-bit identifiers plus announced endpoints)
//! - A correlated request/reply channel over a shared UDP socket
//! - Automatic port forwarding through UPnP IGD
//! - Rendezvous-coordinated UDP hole punching with port prediction
//! - Relayed forwarding as the terminal fallback
//! - An orchestrator running the stages as a fixed cascade
//!
//! ## Cascade
//!
//! [`ConnectivityOrchestrator::establish`] tries, in order: the announced
//! address directly, direct again after leasing a gateway port mapping, a
//! coordinated hole punch, and finally a relay session. The winning mode is
//! memoized per peer and dropped when the path dies, and concurrent
//! attempts towards the same peer share one running cascade.
//!
//! ## Example
//!
//! ```rust,no_run
//! use burrow_nat::{
//!     ConnectivityOrchestrator, PeerAddress, PeerId, RendezvousChannel, Transport,
//!     TraversalConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), burrow_nat::TraversalError> {
//! let rendezvous = PeerAddress::new(
//!     PeerId::from_seed(b"bootstrap"),
//!     "203.0.113.1".parse().unwrap(),
//!     4700,
//!     4700,
//! );
//!
//! let channel = Arc::new(
//!     RendezvousChannel::bind(
//!         PeerId::random(),
//!         "0.0.0.0:0".parse().unwrap(),
//!         Transport::Udp,
//!     )
//!     .await?,
//! );
//! let local = PeerAddress::new(
//!     channel.local_id(),
//!     "192.0.2.10".parse().unwrap(),
//!     0,
//!     channel.local_udp_addr()?.port(),
//! );
//!
//! let orchestrator =
//!     ConnectivityOrchestrator::new(channel, local, TraversalConfig::new(rendezvous));
//! orchestrator.register().await?;
//!
//! let target = PeerAddress::new(
//!     PeerId::from_seed(b"friend"),
//!     "198.51.100.7".parse().unwrap(),
//!     4800,
//!     4800,
//! );
//! let outcome = orchestrator.establish(target).await?;
//! println!("connected via {:?}", outcome.mode());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod forward;
pub mod message;
pub mod orchestrator;
pub mod peer;
pub mod punch;
pub mod relay;
pub mod rendezvous;

// Re-export commonly used types
pub use config::{StageTimeouts, Transport, TraversalConfig};
pub use error::TraversalError;
pub use forward::{ForwardedPort, PortForwarder};
pub use message::{RejectCode, RendezvousMessage};
pub use orchestrator::{
    ConnectivityMode, ConnectivityOrchestrator, ConnectivityOutcome, ProgressEvent, Stage,
};
pub use peer::{PEER_ID_LEN, PeerAddress, PeerId, PeerLookup, ReplicationListener};
pub use punch::{HolePuncher, PunchConfig, PunchOutcome, PunchRole, PunchState};
pub use relay::{RelayEvent, RelayFallback, RelaySession};
pub use rendezvous::{RendezvousChannel, RendezvousServer, RendezvousServerConfig};

//! UDP hole punching.
//!
//! Both peers, coordinated through a rendezvous peer, probe each other's
//! predicted external ports in synchronized rounds until one probe (or its
//! acknowledgment) makes it through both NATs. The attempt moves through a
//! fixed set of phases; [`PunchState`] tracks them and rejects transitions
//! the protocol never takes.

pub mod puncher;
pub mod session;

pub use puncher::{HolePuncher, PunchOutcome};
pub use session::PunchSession;

use std::time::Duration;

/// Which side of the punch this peer is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchRole {
    /// The peer that asked the rendezvous peer to set up the punch.
    Initiator,
    /// The peer that received the prepare-to-punch instruction.
    Responder,
}

/// Phase of a hole-punch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchState {
    /// Not started.
    Idle,
    /// Discovering the externally observed endpoint.
    Preparing,
    /// Exchanging prepare-to-punch messages through the rendezvous peer.
    Synchronizing,
    /// Sending probe rounds at the remote candidate ports.
    Punching,
    /// A probe or acknowledgment arrived from the remote peer.
    Succeeded,
    /// All rounds exhausted or the exchange was refused.
    Failed,
}

/// Hole-punch tuning.
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Number of candidate ports probed per round.
    pub candidate_count: usize,
    /// Number of probe rounds before giving up.
    pub rounds: u32,
    /// Delay between probes to successive candidates within a round.
    pub probe_spacing: Duration,
    /// Listening window at the end of each round.
    pub round_window: Duration,
    /// Timeout for each control exchange with the rendezvous peer.
    pub prepare_timeout: Duration,
    /// Unconditionally fail the attempt before any traffic goes out. Lets
    /// tests drive the cascade into the relay fallback on hosts where a
    /// real punch would succeed.
    pub force_failure: bool,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            candidate_count: 4,
            rounds: 3,
            probe_spacing: Duration::from_millis(5),
            round_window: Duration::from_millis(250),
            prepare_timeout: Duration::from_secs(2),
            force_failure: false,
        }
    }
}

impl PunchConfig {
    /// Force every punch attempt to fail up front.
    #[must_use]
    pub fn with_forced_failure(mut self) -> Self {
        self.force_failure = true;
        self
    }
}

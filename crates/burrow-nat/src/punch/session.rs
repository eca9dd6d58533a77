//! Per-attempt punch state and candidate port prediction.

use super::{PunchRole, PunchState};
use crate::error::TraversalError;

/// Predict the remote peer's external candidate ports, most likely first.
///
/// A port-preserving NAT maps the local bind port unchanged, so that comes
/// first. The observed external port follows, then sequential increments of
/// it for NATs that allocate ports in order. Duplicates collapse towards the
/// front, so on a port-preserving path the winning candidate is index 0.
#[must_use]
pub fn candidate_ports(bind_port: u16, observed_port: u16, count: usize) -> Vec<u16> {
    fn push(candidates: &mut Vec<u16>, count: usize, port: u16) {
        if port != 0 && !candidates.contains(&port) && candidates.len() < count {
            candidates.push(port);
        }
    }

    let mut candidates = Vec::with_capacity(count);
    push(&mut candidates, count, bind_port);
    push(&mut candidates, count, observed_port);
    let mut next = observed_port;
    while candidates.len() < count {
        match next.checked_add(1) {
            Some(port) => {
                next = port;
                push(&mut candidates, count, port);
            }
            None => break,
        }
    }
    candidates
}

/// State machine of one hole-punch attempt.
///
/// Transitions are strictly forward: Idle, Preparing, Synchronizing,
/// Punching, then Succeeded or Failed. Failed is reachable from any active
/// phase; anything else out of order is a bug in the driver.
#[derive(Debug)]
pub struct PunchSession {
    role: PunchRole,
    sync_token: u64,
    state: PunchState,
}

impl PunchSession {
    /// New idle session for one punch attempt.
    #[must_use]
    pub fn new(role: PunchRole, sync_token: u64) -> Self {
        Self {
            role,
            sync_token,
            state: PunchState::Idle,
        }
    }

    /// Which side of the punch this session drives.
    #[must_use]
    pub fn role(&self) -> PunchRole {
        self.role
    }

    /// Token correlating the two sessions of one punch.
    #[must_use]
    pub fn sync_token(&self) -> u64 {
        self.sync_token
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> PunchState {
        self.state
    }

    /// Move to the next phase.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolMismatch` if the transition is not one the punch
    /// protocol takes.
    pub fn advance(&mut self, next: PunchState) -> Result<(), TraversalError> {
        let valid = matches!(
            (self.state, next),
            (PunchState::Idle, PunchState::Preparing)
                | (PunchState::Preparing, PunchState::Synchronizing)
                | (PunchState::Synchronizing, PunchState::Punching)
                | (PunchState::Punching, PunchState::Succeeded)
                | (
                    PunchState::Preparing | PunchState::Synchronizing | PunchState::Punching,
                    PunchState::Failed
                )
        );
        if !valid {
            return Err(TraversalError::ProtocolMismatch(format!(
                "invalid punch transition {:?} -> {next:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_port_preserving_candidate_first() {
        // Bind port equals observed port: the duplicate collapses and the
        // port-preserving guess sits at index 0.
        let candidates = candidate_ports(4000, 4000, 4);
        assert_eq!(candidates, vec![4000, 4001, 4002, 4003]);
    }

    #[test]
    fn test_rewritten_port_keeps_bind_guess_first() {
        let candidates = candidate_ports(4000, 62000, 4);
        assert_eq!(candidates, vec![4000, 62000, 62001, 62002]);
    }

    #[test]
    fn test_candidates_near_port_space_end() {
        let candidates = candidate_ports(65535, 65534, 4);
        // Increments past 65535 are dropped instead of wrapping.
        assert_eq!(candidates, vec![65535, 65534]);
    }

    #[test]
    fn test_forward_transitions() {
        let mut session = PunchSession::new(PunchRole::Initiator, 7);
        assert_eq!(session.state(), PunchState::Idle);

        session.advance(PunchState::Preparing).unwrap();
        session.advance(PunchState::Synchronizing).unwrap();
        session.advance(PunchState::Punching).unwrap();
        session.advance(PunchState::Succeeded).unwrap();
    }

    #[test]
    fn test_failure_from_active_phases() {
        for reach in [
            PunchState::Preparing,
            PunchState::Synchronizing,
            PunchState::Punching,
        ] {
            let mut session = PunchSession::new(PunchRole::Responder, 1);
            session.advance(PunchState::Preparing).unwrap();
            if reach != PunchState::Preparing {
                session.advance(PunchState::Synchronizing).unwrap();
            }
            if reach == PunchState::Punching {
                session.advance(PunchState::Punching).unwrap();
            }
            session.advance(PunchState::Failed).unwrap();
            assert_eq!(session.state(), PunchState::Failed);
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut session = PunchSession::new(PunchRole::Initiator, 1);
        assert!(session.advance(PunchState::Punching).is_err());
        assert!(session.advance(PunchState::Succeeded).is_err());
        // Idle cannot fail; nothing was attempted.
        assert!(session.advance(PunchState::Failed).is_err());

        session.advance(PunchState::Preparing).unwrap();
        session.advance(PunchState::Failed).unwrap();
        // Terminal states accept nothing further.
        assert!(session.advance(PunchState::Punching).is_err());
    }

    proptest! {
        #[test]
        fn prop_candidates_unique_and_bounded(
            bind in 1u16..,
            observed in 1u16..,
            count in 1usize..16,
        ) {
            let candidates = candidate_ports(bind, observed, count);
            prop_assert!(candidates.len() <= count);
            prop_assert!(!candidates.is_empty());
            prop_assert_eq!(candidates[0], bind);
            let mut deduped = candidates.clone();
            deduped.sort_unstable();
            deduped.dedup();
            prop_assert_eq!(deduped.len(), candidates.len());
        }
    }
}

//! Punch drivers for both sides of a coordinated hole punch.
//!
//! The initiator asks the rendezvous peer to forward a prepare-to-punch
//! instruction; the target answers with its own observed endpoint and both
//! sides start probing simultaneously. Control messages ride the shared
//! channel over UDP so the NAT mapping being punched is the same one the
//! rendezvous peer observed.

use super::session::{PunchSession, candidate_ports};
use super::{PunchConfig, PunchRole, PunchState};
use crate::error::TraversalError;
use crate::message::RendezvousMessage;
use crate::peer::{PeerAddress, PeerId};
use crate::rendezvous::channel::{RendezvousChannel, Subscription};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Result of a successful punch.
#[derive(Debug, Clone, Copy)]
pub struct PunchOutcome {
    /// Remote peer with the endpoint the winning probe actually came from.
    pub remote: PeerAddress,
    /// Local UDP port now holding the punched mapping.
    pub local_port: u16,
    /// Index of the winning port in the candidate list, or the list length
    /// if the NAT rewrote to a port outside the predicted set.
    pub winning_candidate: usize,
}

/// Driver for one peer's side of hole punching.
pub struct HolePuncher {
    channel: Arc<RendezvousChannel>,
    local: PeerAddress,
    config: PunchConfig,
    retries: u32,
}

impl HolePuncher {
    /// New puncher speaking for `local` over `channel`.
    #[must_use]
    pub fn new(
        channel: Arc<RendezvousChannel>,
        local: PeerAddress,
        config: PunchConfig,
        retries: u32,
    ) -> Self {
        Self {
            channel,
            local,
            config,
            retries,
        }
    }

    /// Ask the rendezvous peer which external endpoint our datagrams arrive
    /// from.
    ///
    /// # Errors
    ///
    /// `TimedOut` once the retry budget is spent, or `ProtocolMismatch` on an
    /// unexpected reply kind.
    pub async fn discover_observed(
        &self,
        rendezvous: SocketAddr,
    ) -> Result<SocketAddr, TraversalError> {
        let msg = RendezvousMessage::WhoAmI {
            correlation: rand::random(),
            sender: self.channel.local_id(),
        };
        match self
            .request_udp_retry(rendezvous, msg, self.config.prepare_timeout)
            .await?
        {
            RendezvousMessage::YouAre { observed, .. } => Ok(observed),
            other => Err(TraversalError::ProtocolMismatch(format!(
                "unexpected reply {}",
                other.kind()
            ))),
        }
    }

    /// Run the initiator side: set up the punch through `rendezvous` and
    /// probe until the target answers.
    ///
    /// # Errors
    ///
    /// `Unreachable` if the target is not registered or punching is forcibly
    /// failed, `TimedOut` if no probe gets through, plus the control
    /// exchange failure modes.
    pub async fn initiate(
        &self,
        rendezvous: SocketAddr,
        target: PeerId,
    ) -> Result<PunchOutcome, TraversalError> {
        let mut session = PunchSession::new(PunchRole::Initiator, rand::random());
        if self.config.force_failure {
            return forced_failure(&mut session);
        }
        let result = self.drive_initiate(&mut session, rendezvous, target).await;
        if result.is_err() && session.state() != PunchState::Failed {
            let _ = session.advance(PunchState::Failed);
        }
        result
    }

    async fn drive_initiate(
        &self,
        session: &mut PunchSession,
        rendezvous: SocketAddr,
        target: PeerId,
    ) -> Result<PunchOutcome, TraversalError> {
        session.advance(PunchState::Preparing)?;
        let observed = self.discover_observed(rendezvous).await?;
        let announced = self.local.with_udp_endpoint(observed);
        let bind_port = self.channel.local_udp_addr()?.port();

        // Subscribe before the request goes out; the target may start
        // probing the moment it accepts.
        let mut sub = self.channel.subscribe_punch(session.sync_token());

        session.advance(PunchState::Synchronizing)?;
        let request = RendezvousMessage::PunchRequest {
            correlation: rand::random(),
            initiator: announced,
            bind_port,
            target,
            sync_token: session.sync_token(),
        };
        let reply = self
            .request_udp_retry(rendezvous, request, self.config.prepare_timeout)
            .await?;

        match reply {
            RendezvousMessage::PunchAccept {
                target: remote,
                bind_port: remote_bind_port,
                ..
            } => {
                self.punch_rounds(session, &mut sub, remote, remote_bind_port)
                    .await
            }
            RendezvousMessage::PunchReject { code, .. } => Err(code.into_error()),
            other => Err(TraversalError::ProtocolMismatch(format!(
                "unexpected reply {}",
                other.kind()
            ))),
        }
    }

    /// Run the target side after a prepare-to-punch instruction arrived.
    ///
    /// Sends the accept back through `rendezvous` and probes the initiator.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`HolePuncher::initiate`].
    pub async fn respond(
        &self,
        rendezvous: SocketAddr,
        initiator: PeerAddress,
        initiator_bind_port: u16,
        sync_token: u64,
        correlation: u64,
    ) -> Result<PunchOutcome, TraversalError> {
        let mut session = PunchSession::new(PunchRole::Responder, sync_token);
        if self.config.force_failure {
            return forced_failure(&mut session);
        }
        let result = self
            .drive_respond(
                &mut session,
                rendezvous,
                initiator,
                initiator_bind_port,
                correlation,
            )
            .await;
        if result.is_err() && session.state() != PunchState::Failed {
            let _ = session.advance(PunchState::Failed);
        }
        result
    }

    async fn drive_respond(
        &self,
        session: &mut PunchSession,
        rendezvous: SocketAddr,
        initiator: PeerAddress,
        initiator_bind_port: u16,
        correlation: u64,
    ) -> Result<PunchOutcome, TraversalError> {
        session.advance(PunchState::Preparing)?;
        let observed = self.discover_observed(rendezvous).await?;
        let announced = self.local.with_udp_endpoint(observed);

        let mut sub = self.channel.subscribe_punch(session.sync_token());

        session.advance(PunchState::Synchronizing)?;
        let accept = RendezvousMessage::PunchAccept {
            correlation,
            target: announced,
            bind_port: self.channel.local_udp_addr()?.port(),
            sync_token: session.sync_token(),
        };
        self.channel.send_datagram(rendezvous, &accept).await?;

        self.punch_rounds(session, &mut sub, initiator, initiator_bind_port)
            .await
    }

    /// Probe the remote candidate ports in synchronized rounds until a
    /// probe or acknowledgment arrives from the remote peer.
    async fn punch_rounds(
        &self,
        session: &mut PunchSession,
        sub: &mut Subscription,
        remote: PeerAddress,
        remote_bind_port: u16,
    ) -> Result<PunchOutcome, TraversalError> {
        session.advance(PunchState::Punching)?;
        let remote_observed = remote.udp_socket_addr();
        let candidates = candidate_ports(
            remote_bind_port,
            remote_observed.port(),
            self.config.candidate_count,
        );
        let local_port = self.channel.local_udp_addr()?.port();
        let probe = RendezvousMessage::Probe {
            sync_token: session.sync_token(),
            sender: self.channel.local_id(),
        };

        for round in 0..self.config.rounds {
            for &port in &candidates {
                let dest = SocketAddr::new(remote_observed.ip(), port);
                if let Err(e) = self.channel.send_datagram(dest, &probe).await {
                    tracing::debug!(%dest, round, "probe send failed: {e}");
                }
                tokio::time::sleep(self.config.probe_spacing).await;
            }

            let deadline = tokio::time::Instant::now() + self.config.round_window;
            while let Ok(received) = tokio::time::timeout_at(deadline, sub.recv()).await {
                let Some((from, msg)) = received else {
                    return Err(TraversalError::Unreachable("channel closed".into()));
                };
                let sender = match &msg {
                    RendezvousMessage::Probe { sender, .. }
                    | RendezvousMessage::ProbeAck { sender, .. } => *sender,
                    _ => continue,
                };
                if sender != remote.id {
                    tracing::debug!(%from, "probe from unexpected peer");
                    continue;
                }

                if matches!(msg, RendezvousMessage::Probe { .. }) {
                    let ack = RendezvousMessage::ProbeAck {
                        sync_token: session.sync_token(),
                        sender: self.channel.local_id(),
                    };
                    let _ = self.channel.send_datagram(from, &ack).await;
                }

                session.advance(PunchState::Succeeded)?;
                let winning_candidate = candidates
                    .iter()
                    .position(|&p| p == from.port())
                    .unwrap_or(candidates.len());
                tracing::debug!(
                    remote = %remote.id,
                    %from,
                    winning_candidate,
                    "hole punched"
                );
                return Ok(PunchOutcome {
                    remote: remote.with_udp_endpoint(from),
                    local_port,
                    winning_candidate,
                });
            }
        }

        Err(TraversalError::TimedOut)
    }

    async fn request_udp_retry(
        &self,
        target: SocketAddr,
        msg: RendezvousMessage,
        timeout: Duration,
    ) -> Result<RendezvousMessage, TraversalError> {
        let mut last = TraversalError::TimedOut;
        for attempt in 0..=self.retries {
            match self.channel.request_udp(target, msg.clone(), timeout).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(kind = msg.kind(), %target, attempt, "request timed out");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}

/// The override fails the attempt up front; nothing reaches the wire, so
/// the outcome never depends on the rendezvous peer or real NAT behavior.
fn forced_failure(session: &mut PunchSession) -> Result<PunchOutcome, TraversalError> {
    session.advance(PunchState::Preparing)?;
    session.advance(PunchState::Failed)?;
    Err(TraversalError::Unreachable(
        "hole punching forcibly failed".into(),
    ))
}

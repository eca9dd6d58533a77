//! Client side of relay sessions.

use crate::error::TraversalError;
use crate::message::RendezvousMessage;
use crate::peer::{PeerAddress, PeerId};
use crate::rendezvous::channel::{RendezvousChannel, Subscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lifecycle notifications emitted by relay sessions.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// The session missed too many keep-alive acknowledgments or was
    /// invalidated by the relay peer.
    Lost {
        /// Peer the session forwarded to.
        peer: PeerId,
        /// Token of the dead session.
        session_token: u64,
        /// What the keep-alive loop last observed.
        reason: TraversalError,
    },
    /// The session was closed deliberately.
    Closed {
        /// Peer the session forwarded to.
        peer: PeerId,
        /// Token of the closed session.
        session_token: u64,
    },
}

/// Opens relay sessions through one relay peer.
pub struct RelayFallback {
    channel: Arc<RendezvousChannel>,
    relay: PeerAddress,
    setup_timeout: Duration,
    keepalive_interval: Duration,
    miss_limit: u32,
    retries: u32,
}

impl RelayFallback {
    /// New fallback coordinating through `relay`.
    #[must_use]
    pub fn new(
        channel: Arc<RendezvousChannel>,
        relay: PeerAddress,
        setup_timeout: Duration,
        keepalive_interval: Duration,
        miss_limit: u32,
        retries: u32,
    ) -> Self {
        Self {
            channel,
            relay,
            setup_timeout,
            keepalive_interval,
            miss_limit,
            retries,
        }
    }

    /// Open a forwarding session to `target`, which must already be
    /// registered with the relay peer. Lifecycle notifications go to
    /// `events`.
    ///
    /// # Errors
    ///
    /// `Unreachable` if the target is not registered, `ResourceExhausted`
    /// if the relay is at capacity, `TimedOut` if the relay peer does not
    /// answer.
    pub async fn open(
        &self,
        target: PeerId,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<RelaySession, TraversalError> {
        let request = RendezvousMessage::RelayStart {
            correlation: rand::random(),
            initiator: self.channel.local_id(),
            target,
        };
        let reply = self
            .channel
            .request_with_retry(
                self.channel.control_addr(&self.relay),
                request,
                self.setup_timeout,
                self.retries,
            )
            .await?;

        let session_token = match reply {
            RendezvousMessage::RelayStarted { session_token, .. } => session_token,
            RendezvousMessage::RelayDenied { code, .. } => return Err(code.into_error()),
            other => {
                return Err(TraversalError::ProtocolMismatch(format!(
                    "unexpected reply {}",
                    other.kind()
                )));
            }
        };

        tracing::debug!(%target, session_token, "relay session established");
        let sub = self.channel.subscribe_relay(session_token);
        let keepalive = spawn_keepalive(
            self.channel.clone(),
            self.relay.udp_socket_addr(),
            target,
            session_token,
            self.keepalive_interval,
            self.miss_limit,
            events.clone(),
        );

        Ok(RelaySession {
            channel: self.channel.clone(),
            relay_addr: self.relay.udp_socket_addr(),
            target,
            session_token,
            sub,
            keepalive,
            events,
        })
    }
}

/// One open relay session; envelopes go out and come back over the shared
/// UDP socket.
#[derive(Debug)]
pub struct RelaySession {
    channel: Arc<RendezvousChannel>,
    relay_addr: std::net::SocketAddr,
    target: PeerId,
    session_token: u64,
    sub: Subscription,
    keepalive: JoinHandle<()>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelaySession {
    /// Peer this session forwards to.
    #[must_use]
    pub fn target(&self) -> PeerId {
        self.target
    }

    /// Token issued by the relay peer at setup.
    #[must_use]
    pub fn session_token(&self) -> u64 {
        self.session_token
    }

    /// Forward one payload to the other end.
    ///
    /// # Errors
    ///
    /// `Unreachable` on transport-level send failure.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), TraversalError> {
        let envelope = RendezvousMessage::RelayForward {
            session_token: self.session_token,
            sender: self.channel.local_id(),
            payload,
        };
        self.channel.send_datagram(self.relay_addr, &envelope).await
    }

    /// Receive the next payload delivered on this session.
    ///
    /// # Errors
    ///
    /// `Unreachable` once the channel shuts down.
    pub async fn recv(&mut self) -> Result<(PeerId, Vec<u8>), TraversalError> {
        loop {
            let Some((_, msg)) = self.sub.recv().await else {
                return Err(TraversalError::Unreachable("channel closed".into()));
            };
            if let RendezvousMessage::RelayDeliver {
                sender, payload, ..
            } = msg
            {
                return Ok((sender, payload));
            }
        }
    }

    /// Tear the session down and tell the relay peer to drop the binding.
    pub async fn close(self) {
        self.keepalive.abort();
        let stop = RendezvousMessage::RelayStop {
            session_token: self.session_token,
        };
        let _ = self.channel.send_datagram(self.relay_addr, &stop).await;
        let _ = self.events.send(RelayEvent::Closed {
            peer: self.target,
            session_token: self.session_token,
        });
        tracing::debug!(session_token = self.session_token, "relay session closed");
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_keepalive(
    channel: Arc<RendezvousChannel>,
    relay_addr: std::net::SocketAddr,
    target: PeerId,
    session_token: u64,
    interval: Duration,
    miss_limit: u32,
    events: mpsc::UnboundedSender<RelayEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut misses = 0u32;
        loop {
            ticker.tick().await;

            let request = RendezvousMessage::RelayKeepAlive {
                correlation: rand::random(),
                session_token,
            };
            match channel.request_udp(relay_addr, request, interval).await {
                Ok(RendezvousMessage::RelayKeepAliveAck { .. }) => {
                    misses = 0;
                }
                Ok(RendezvousMessage::RelayDenied { code, .. }) => {
                    // The relay already dropped the binding; no point
                    // counting further misses.
                    let _ = events.send(RelayEvent::Lost {
                        peer: target,
                        session_token,
                        reason: code.into_error(),
                    });
                    return;
                }
                Ok(other) => {
                    tracing::debug!(
                        kind = other.kind(),
                        session_token,
                        "unexpected keep-alive reply"
                    );
                }
                Err(e) => {
                    misses += 1;
                    tracing::debug!(session_token, misses, "keep-alive missed");
                    if misses >= miss_limit {
                        let _ = events.send(RelayEvent::Lost {
                            peer: target,
                            session_token,
                            reason: e,
                        });
                        return;
                    }
                }
            }
        }
    })
}

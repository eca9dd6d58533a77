//! Connectivity establishment cascade.
//!
//! Stages run in a fixed order: direct probe, automatic port forwarding,
//! hole punching, relayed forwarding. The first stage that produces a
//! usable path wins; its mode is memoized per peer so later calls skip the
//! cascade until the path is invalidated. Concurrent attempts towards the
//! same peer coalesce onto one running cascade.

use crate::config::TraversalConfig;
use crate::error::TraversalError;
use crate::forward::{ForwardedPort, PortForwarder};
use crate::message::RendezvousMessage;
use crate::peer::{PeerAddress, PeerId};
use crate::punch::HolePuncher;
use crate::relay::{RelayEvent, RelayFallback, RelaySession};
use crate::rendezvous::channel::RendezvousChannel;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};

/// How a peer ended up reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityMode {
    /// The announced address answered directly.
    Direct,
    /// Reachable after leasing a gateway port mapping.
    PortForwarded,
    /// A punched UDP path.
    HolePunched,
    /// Traffic goes through the relay peer.
    Relayed,
}

/// One stage of the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Probe the announced address as-is.
    Direct,
    /// Lease a gateway mapping, then probe again.
    PortForward,
    /// Coordinated hole punch.
    HolePunch,
    /// Relayed forwarding.
    Relay,
}

/// Progress notifications emitted while a cascade runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A stage began for `target`.
    StageStarted {
        /// Peer being connected to.
        target: PeerId,
        /// Stage that started.
        stage: Stage,
    },
    /// A stage gave up; the cascade moves on.
    StageFailed {
        /// Peer being connected to.
        target: PeerId,
        /// Stage that failed.
        stage: Stage,
        /// Why it failed.
        error: TraversalError,
    },
    /// The cascade found a usable path.
    Established {
        /// Peer now reachable.
        target: PeerId,
        /// Winning mode.
        mode: ConnectivityMode,
    },
    /// Every permitted stage failed.
    Failed {
        /// Peer that stayed unreachable.
        target: PeerId,
        /// The decisive error.
        error: TraversalError,
    },
    /// A previously established path died and its memoized mode was
    /// dropped.
    Lost {
        /// Peer whose path died.
        target: PeerId,
    },
}

/// A usable path produced by the cascade.
#[derive(Clone)]
pub enum ConnectivityOutcome {
    /// The announced address works as-is.
    Direct {
        /// Reachable endpoint.
        remote: PeerAddress,
    },
    /// Direct after leasing a mapping for the local port.
    PortForwarded {
        /// Reachable endpoint.
        remote: PeerAddress,
        /// The leased mapping, for later removal.
        mapping: ForwardedPort,
    },
    /// A punched UDP path.
    HolePunched {
        /// Endpoint the winning probe came from.
        remote: PeerAddress,
        /// Local port holding the punched mapping.
        local_port: u16,
        /// Index of the winning predicted port.
        winning_candidate: usize,
    },
    /// Forwarding through the relay peer.
    Relayed {
        /// The open session. Shared because coalesced callers receive the
        /// same outcome.
        session: Arc<Mutex<RelaySession>>,
        /// Session token issued by the relay.
        session_token: u64,
    },
}

impl ConnectivityOutcome {
    /// The mode this outcome represents.
    #[must_use]
    pub fn mode(&self) -> ConnectivityMode {
        match self {
            Self::Direct { .. } => ConnectivityMode::Direct,
            Self::PortForwarded { .. } => ConnectivityMode::PortForwarded,
            Self::HolePunched { .. } => ConnectivityMode::HolePunched,
            Self::Relayed { .. } => ConnectivityMode::Relayed,
        }
    }
}

impl std::fmt::Debug for ConnectivityOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct { remote } => f.debug_struct("Direct").field("remote", remote).finish(),
            Self::PortForwarded { remote, mapping } => f
                .debug_struct("PortForwarded")
                .field("remote", remote)
                .field("mapping", mapping)
                .finish(),
            Self::HolePunched {
                remote,
                local_port,
                winning_candidate,
            } => f
                .debug_struct("HolePunched")
                .field("remote", remote)
                .field("local_port", local_port)
                .field("winning_candidate", winning_candidate)
                .finish(),
            Self::Relayed { session_token, .. } => f
                .debug_struct("Relayed")
                .field("session_token", session_token)
                .finish(),
        }
    }
}

type AttemptResult = Result<ConnectivityOutcome, TraversalError>;
type AttemptSlot = Option<AttemptResult>;

/// Payload delivered over a relay session this peer is the target of.
pub type RelayedInbound = mpsc::UnboundedReceiver<(PeerId, u64, Vec<u8>)>;

/// Runs the cascade and owns every per-peer connectivity decision.
pub struct ConnectivityOrchestrator {
    channel: Arc<RendezvousChannel>,
    local: PeerAddress,
    config: TraversalConfig,
    resolved: DashMap<PeerId, ConnectivityOutcome>,
    inflight: DashMap<PeerId, watch::Receiver<AttemptSlot>>,
    cancels: DashMap<PeerId, Arc<Notify>>,
    events: broadcast::Sender<ProgressEvent>,
    relay_events_tx: mpsc::UnboundedSender<RelayEvent>,
    relayed_rx: std::sync::Mutex<Option<RelayedInbound>>,
    cascade_runs: AtomicUsize,
}

impl ConnectivityOrchestrator {
    /// Build an orchestrator speaking for `local` and start its background
    /// pumps: the responder for incoming coordination traffic and the
    /// relay lifecycle watcher.
    #[must_use]
    pub fn new(
        channel: Arc<RendezvousChannel>,
        local: PeerAddress,
        config: TraversalConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (relay_events_tx, relay_events_rx) = mpsc::unbounded_channel();
        let (relayed_tx, relayed_rx) = mpsc::unbounded_channel();

        let orchestrator = Arc::new(Self {
            channel,
            local,
            config,
            resolved: DashMap::new(),
            inflight: DashMap::new(),
            cancels: DashMap::new(),
            events,
            relay_events_tx,
            relayed_rx: std::sync::Mutex::new(Some(relayed_rx)),
            cascade_runs: AtomicUsize::new(0),
        });

        orchestrator.spawn_relay_watcher(relay_events_rx);
        orchestrator.spawn_responder(relayed_tx);
        orchestrator
    }

    /// Peer id this orchestrator speaks for.
    #[must_use]
    pub fn local_id(&self) -> PeerId {
        self.local.id
    }

    /// Register with the rendezvous peer so others can punch towards or
    /// relay to this peer, and learn the externally observed endpoint.
    ///
    /// # Errors
    ///
    /// The control exchange failure modes.
    pub async fn register(&self) -> Result<std::net::SocketAddr, TraversalError> {
        let request = RendezvousMessage::Register {
            correlation: rand::random(),
            peer: self.local,
        };
        let reply = self
            .channel
            .request_with_retry(
                self.channel.control_addr(&self.config.rendezvous),
                request,
                self.config.punch.prepare_timeout,
                self.config.retries,
            )
            .await?;
        match reply {
            RendezvousMessage::RegisterAck { observed, .. } => Ok(observed),
            other => Err(TraversalError::ProtocolMismatch(format!(
                "unexpected reply {}",
                other.kind()
            ))),
        }
    }

    /// Subscribe to progress notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Take the stream of payloads relayed to this peer. Yields `None`
    /// after the first call.
    #[must_use]
    pub fn take_relayed(&self) -> Option<RelayedInbound> {
        self.relayed_rx
            .lock()
            .expect("relayed receiver lock poisoned")
            .take()
    }

    /// Memoized mode for a peer, if a path is currently established.
    #[must_use]
    pub fn resolved_mode(&self, peer: &PeerId) -> Option<ConnectivityMode> {
        self.resolved.get(peer).map(|o| o.mode())
    }

    /// How many cascades actually ran, memoized and coalesced calls
    /// excluded.
    #[must_use]
    pub fn cascade_runs(&self) -> usize {
        self.cascade_runs.load(Ordering::Relaxed)
    }

    /// Drop the memoized decision for a peer, forcing the next
    /// [`ConnectivityOrchestrator::establish`] to rerun the cascade.
    pub fn invalidate(&self, peer: &PeerId) {
        if self.resolved.remove(peer).is_some() {
            let _ = self.events.send(ProgressEvent::Lost { target: *peer });
        }
    }

    /// Abort the in-flight attempt towards a peer, if any. Every coalesced
    /// waiter observes `Cancelled`.
    pub fn cancel(&self, peer: &PeerId) {
        if let Some(cancel) = self.cancels.get(peer) {
            cancel.notify_one();
        }
    }

    /// Establish connectivity to `target`, reusing the memoized path when
    /// one exists and joining an already-running cascade when one is in
    /// flight.
    ///
    /// # Errors
    ///
    /// The decisive error of the last permitted stage, `Cancelled` if the
    /// attempt was aborted, or `TimedOut` when the overall ceiling elapsed
    /// before any stage failed.
    pub async fn establish(self: &Arc<Self>, target: PeerAddress) -> AttemptResult {
        if let Some(outcome) = self.resolved.get(&target.id) {
            return Ok(outcome.clone());
        }

        enum Role {
            Leader(watch::Sender<AttemptSlot>),
            Follower(watch::Receiver<AttemptSlot>),
        }

        let role = match self.inflight.entry(target.id) {
            Entry::Occupied(entry) => Role::Follower(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => loop {
                let settled = rx.borrow().clone();
                if let Some(result) = settled {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(TraversalError::Cancelled);
                }
            },
            Role::Leader(tx) => {
                // The guard releases the slot even when this future is
                // dropped mid-cascade (caller-side timeout, task abort);
                // otherwise the stale entry would turn every later attempt
                // into a follower of a cascade that no longer runs.
                let guard = InflightGuard {
                    inflight: &self.inflight,
                    cancels: &self.cancels,
                    peer: target.id,
                };
                let result = self.lead_attempt(target).await;
                if let Ok(outcome) = &result {
                    self.resolved.insert(target.id, outcome.clone());
                }
                // Memoize before releasing the in-flight slot so late
                // callers hit the cache instead of starting a new cascade.
                drop(guard);
                let _ = tx.send(Some(result.clone()));
                result
            }
        }
    }

    /// Resolve `peer` through the routing layer, then establish
    /// connectivity to the returned address.
    ///
    /// # Errors
    ///
    /// `Unreachable` if the routing layer knows no address for the peer,
    /// plus the [`ConnectivityOrchestrator::establish`] failure modes.
    pub async fn establish_by_id(
        self: &Arc<Self>,
        peer: &PeerId,
        lookup: &dyn crate::peer::PeerLookup,
    ) -> AttemptResult {
        let Some(address) = lookup.lookup(peer) else {
            return Err(TraversalError::Unreachable(
                "peer unknown to routing layer".into(),
            ));
        };
        self.establish(address).await
    }

    async fn lead_attempt(self: &Arc<Self>, target: PeerAddress) -> AttemptResult {
        self.cascade_runs.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        self.cancels.insert(target.id, cancel.clone());

        let last_error: Arc<std::sync::Mutex<Option<TraversalError>>> =
            Arc::new(std::sync::Mutex::new(None));
        let overall = self.config.timeouts.overall;

        let cascade = self.run_cascade(target, last_error.clone());
        let result = tokio::select! {
            () = cancel.notified() => Err(TraversalError::Cancelled),
            outcome = tokio::time::timeout(overall, cascade) => {
                match outcome {
                    Ok(result) => result,
                    // The ceiling elapsed; surface the most recent stage
                    // failure as the decisive reason.
                    Err(_) => Err(last_error
                        .lock()
                        .expect("last error lock poisoned")
                        .take()
                        .unwrap_or(TraversalError::TimedOut)),
                }
            }
        };

        match &result {
            Ok(outcome) => {
                tracing::info!(target = %target.id, mode = ?outcome.mode(), "connectivity established");
                let _ = self.events.send(ProgressEvent::Established {
                    target: target.id,
                    mode: outcome.mode(),
                });
            }
            Err(error) => {
                tracing::info!(target = %target.id, %error, "connectivity failed");
                let _ = self.events.send(ProgressEvent::Failed {
                    target: target.id,
                    error: error.clone(),
                });
            }
        }
        result
    }

    async fn run_cascade(
        self: &Arc<Self>,
        target: PeerAddress,
        last_error: Arc<std::sync::Mutex<Option<TraversalError>>>,
    ) -> AttemptResult {
        match self.try_direct(target).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => self.stage_failed(target.id, Stage::Direct, e, &last_error),
        }

        if self.config.port_forward_enabled {
            match self.try_port_forward(target).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => self.stage_failed(target.id, Stage::PortForward, e, &last_error),
            }
        }

        match self.try_hole_punch(target).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => self.stage_failed(target.id, Stage::HolePunch, e, &last_error),
        }

        if self.config.relay_enabled {
            match self.try_relay(target).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => self.stage_failed(target.id, Stage::Relay, e, &last_error),
            }
        }

        let decisive = last_error
            .lock()
            .expect("last error lock poisoned")
            .clone();
        Err(decisive.unwrap_or_else(|| TraversalError::Unreachable("no stage permitted".into())))
    }

    fn stage_failed(
        &self,
        target: PeerId,
        stage: Stage,
        error: TraversalError,
        last_error: &std::sync::Mutex<Option<TraversalError>>,
    ) {
        tracing::debug!(%target, ?stage, %error, "stage failed");
        let _ = self.events.send(ProgressEvent::StageFailed {
            target,
            stage,
            error: error.clone(),
        });
        *last_error.lock().expect("last error lock poisoned") = Some(error);
    }

    fn stage_started(&self, target: PeerId, stage: Stage) {
        tracing::debug!(%target, ?stage, "stage started");
        let _ = self.events.send(ProgressEvent::StageStarted { target, stage });
    }

    /// Probe the announced address with a direct ping.
    async fn ping(&self, target: PeerAddress) -> Result<(), TraversalError> {
        let request = RendezvousMessage::Ping {
            correlation: rand::random(),
            sender: self.local.id,
        };
        let mut last = TraversalError::TimedOut;
        for _ in 0..=self.config.retries {
            match self
                .channel
                .request_udp(
                    target.udp_socket_addr(),
                    request.clone(),
                    self.config.timeouts.direct,
                )
                .await
            {
                Ok(RendezvousMessage::Pong { sender, .. }) if sender == target.id => {
                    return Ok(());
                }
                Ok(other) => {
                    return Err(TraversalError::ProtocolMismatch(format!(
                        "unexpected reply {}",
                        other.kind()
                    )));
                }
                Err(e) if e.is_retryable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    async fn try_direct(&self, target: PeerAddress) -> AttemptResult {
        self.stage_started(target.id, Stage::Direct);
        self.ping(target).await?;
        Ok(ConnectivityOutcome::Direct { remote: target })
    }

    /// Lease a gateway mapping for the local UDP port, then probe again.
    /// The mapping makes this peer reachable for the remote side's own
    /// attempts; if the probe still fails the lease is returned.
    async fn try_port_forward(&self, target: PeerAddress) -> AttemptResult {
        self.stage_started(target.id, Stage::PortForward);

        let forwarder = PortForwarder::discover(
            self.config.timeouts.port_forward,
            self.config.forward_lease_secs,
        )
        .await?;
        let local_port = self.channel.local_udp_addr()?.port();
        let mapping = forwarder.map_udp(local_port).await?;

        match self.ping(target).await {
            Ok(()) => Ok(ConnectivityOutcome::PortForwarded {
                remote: target,
                mapping,
            }),
            Err(e) => {
                if let Err(unmap_err) = forwarder.unmap(mapping).await {
                    tracing::debug!(%unmap_err, "failed to return unused mapping");
                }
                Err(e)
            }
        }
    }

    async fn try_hole_punch(&self, target: PeerAddress) -> AttemptResult {
        self.stage_started(target.id, Stage::HolePunch);

        let puncher = HolePuncher::new(
            self.channel.clone(),
            self.local,
            self.config.punch.clone(),
            self.config.retries,
        );
        let outcome = tokio::time::timeout(
            self.config.timeouts.hole_punch,
            puncher.initiate(self.config.rendezvous.udp_socket_addr(), target.id),
        )
        .await
        .map_err(|_| TraversalError::TimedOut)??;

        Ok(ConnectivityOutcome::HolePunched {
            remote: outcome.remote,
            local_port: outcome.local_port,
            winning_candidate: outcome.winning_candidate,
        })
    }

    async fn try_relay(&self, target: PeerAddress) -> AttemptResult {
        self.stage_started(target.id, Stage::Relay);

        let fallback = RelayFallback::new(
            self.channel.clone(),
            self.config.relay,
            self.config.timeouts.relay,
            self.config.keepalive_interval,
            self.config.keepalive_miss_limit,
            self.config.retries,
        );
        let session = fallback
            .open(target.id, self.relay_events_tx.clone())
            .await?;
        let session_token = session.session_token();

        Ok(ConnectivityOutcome::Relayed {
            session: Arc::new(Mutex::new(session)),
            session_token,
        })
    }

    /// Drop memoized paths whose relay session died.
    fn spawn_relay_watcher(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<RelayEvent>) {
        let orchestrator = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    return;
                };
                match event {
                    RelayEvent::Lost {
                        peer, session_token, ..
                    } => {
                        tracing::info!(%peer, session_token, "relay session lost");
                        orchestrator.invalidate(&peer);
                    }
                    RelayEvent::Closed { peer, .. } => {
                        orchestrator.invalidate(&peer);
                    }
                }
            }
        });
    }

    /// Answer coordination traffic addressed to this peer: direct pings,
    /// prepare-to-punch instructions and relayed deliveries.
    fn spawn_responder(self: &Arc<Self>, relayed_tx: mpsc::UnboundedSender<(PeerId, u64, Vec<u8>)>) {
        let Some(mut inbound) = self.channel.inbound() else {
            // The caller took the raw stream; it answers coordination
            // traffic itself.
            return;
        };
        let orchestrator = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some((from, msg)) = inbound.recv().await {
                let Some(orchestrator) = orchestrator.upgrade() else {
                    return;
                };
                match msg {
                    RendezvousMessage::Ping { correlation, .. } => {
                        let pong = RendezvousMessage::Pong {
                            correlation,
                            sender: orchestrator.local.id,
                        };
                        let _ = orchestrator.channel.send_datagram(from, &pong).await;
                    }
                    RendezvousMessage::PunchForward {
                        correlation,
                        initiator,
                        bind_port,
                        sync_token,
                    } => {
                        let puncher = HolePuncher::new(
                            orchestrator.channel.clone(),
                            orchestrator.local,
                            orchestrator.config.punch.clone(),
                            orchestrator.config.retries,
                        );
                        let rendezvous = orchestrator.config.rendezvous.udp_socket_addr();
                        tokio::spawn(async move {
                            match puncher
                                .respond(rendezvous, initiator, bind_port, sync_token, correlation)
                                .await
                            {
                                Ok(outcome) => {
                                    tracing::debug!(
                                        remote = %outcome.remote.id,
                                        "answered punch"
                                    );
                                }
                                Err(e) => {
                                    tracing::debug!(initiator = %initiator.id, "punch answer failed: {e}");
                                }
                            }
                        });
                    }
                    RendezvousMessage::RelayDeliver {
                        session_token,
                        sender,
                        payload,
                    } => {
                        let _ = relayed_tx.send((sender, session_token, payload));
                    }
                    other => {
                        tracing::debug!(kind = other.kind(), %from, "unhandled inbound message");
                    }
                }
            }
        });
    }
}

/// Removes a leader's in-flight and cancel slots when it settles or is
/// dropped.
struct InflightGuard<'a> {
    inflight: &'a DashMap<PeerId, watch::Receiver<AttemptSlot>>,
    cancels: &'a DashMap<PeerId, Arc<Notify>>,
    peer: PeerId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.peer);
        self.cancels.remove(&self.peer);
    }
}

//! Rendezvous/relay peer implementation.
//!
//! A publicly reachable peer that answers self-port discovery, forwards
//! prepare-to-punch instructions between NATed peers and, as the terminal
//! fallback, forwards application traffic for established relay sessions.
//! Peers must register before they can be punched towards or relayed to;
//! registration is the responsibility of the target peer and happens before
//! any initiator shows up.
//!
//! Runs inside the `rendezvousd` binary and in-process in the integration
//! tests.

use super::{MAX_MESSAGE_SIZE, read_frame, write_frame};
use crate::error::TraversalError;
use crate::message::{RejectCode, RendezvousMessage};
use crate::peer::{PeerAddress, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// A registered peer and where to reach it over UDP.
#[derive(Debug, Clone)]
struct Registration {
    peer: PeerAddress,
    udp_addr: SocketAddr,
    last_seen: Instant,
}

/// A punch request waiting for the target's answer.
#[derive(Debug, Clone)]
struct PendingPunch {
    initiator_addr: SocketAddr,
    correlation: u64,
    created: Instant,
}

/// One active relay binding between an initiator and a target.
#[derive(Debug, Clone)]
struct RelayBinding {
    initiator: PeerId,
    initiator_addr: SocketAddr,
    target: PeerId,
    target_addr: SocketAddr,
    last_alive: Instant,
    forwarded: u64,
}

/// Which listener a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Via {
    Udp,
    Tcp,
}

/// Rendezvous server tuning.
#[derive(Debug, Clone)]
pub struct RendezvousServerConfig {
    /// Maximum number of concurrent relay sessions.
    pub max_relay_sessions: usize,
    /// Registrations older than this are expired.
    pub client_timeout: Duration,
    /// Punch requests unanswered for this long are expired.
    pub punch_pending_timeout: Duration,
    /// Relay sessions without keep-alive or traffic for this long are
    /// expired.
    pub relay_session_timeout: Duration,
    /// Cadence of the expiry sweep.
    pub cleanup_interval: Duration,
}

impl Default for RendezvousServerConfig {
    fn default() -> Self {
        Self {
            max_relay_sessions: 1024,
            client_timeout: Duration::from_secs(120),
            punch_pending_timeout: Duration::from_secs(10),
            relay_session_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Rendezvous and relay peer, listening on UDP and framed TCP.
pub struct RendezvousServer {
    id: PeerId,
    udp: Arc<UdpSocket>,
    tcp: Arc<TcpListener>,
    clients: Arc<RwLock<HashMap<PeerId, Registration>>>,
    punches: Arc<RwLock<HashMap<u64, PendingPunch>>>,
    relays: Arc<RwLock<HashMap<u64, RelayBinding>>>,
    config: RendezvousServerConfig,
}

impl RendezvousServer {
    /// Bind UDP and TCP listeners on `bind_addr` with default tuning.
    ///
    /// # Errors
    ///
    /// Returns an error if either listener cannot be bound.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, TraversalError> {
        Self::bind_with_config(bind_addr, RendezvousServerConfig::default()).await
    }

    /// Bind with custom tuning. With port 0 the UDP and TCP listeners end
    /// up on independent ports; use the `local_*_addr` accessors.
    ///
    /// # Errors
    ///
    /// Returns an error if either listener cannot be bound.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        config: RendezvousServerConfig,
    ) -> Result<Self, TraversalError> {
        let udp = Arc::new(UdpSocket::bind(bind_addr).await?);
        let tcp = Arc::new(TcpListener::bind(bind_addr).await?);

        Ok(Self {
            id: PeerId::random(),
            udp,
            tcp,
            clients: Arc::new(RwLock::new(HashMap::new())),
            punches: Arc::new(RwLock::new(HashMap::new())),
            relays: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    /// This server's peer id.
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Local UDP endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_udp_addr(&self) -> Result<SocketAddr, TraversalError> {
        Ok(self.udp.local_addr()?)
    }

    /// Local TCP endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_tcp_addr(&self) -> Result<SocketAddr, TraversalError> {
        Ok(self.tcp.local_addr()?)
    }

    /// The address other peers should use to coordinate through this
    /// server.
    ///
    /// # Errors
    ///
    /// Returns an error if the local addresses cannot be determined.
    pub fn peer_address(&self) -> Result<PeerAddress, TraversalError> {
        let udp = self.local_udp_addr()?;
        let tcp = self.local_tcp_addr()?;
        Ok(PeerAddress::new(self.id, udp.ip(), tcp.port(), udp.port()))
    }

    /// Number of currently registered peers.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Announced address of a registered peer, if any.
    pub async fn registered(&self, id: &PeerId) -> Option<PeerAddress> {
        self.clients.read().await.get(id).map(|r| r.peer)
    }

    /// Number of active relay sessions.
    pub async fn relay_session_count(&self) -> usize {
        self.relays.read().await.len()
    }

    /// Envelopes forwarded on one relay session, if it exists.
    pub async fn relay_forwarded(&self, session_token: u64) -> Option<u64> {
        self.relays
            .read()
            .await
            .get(&session_token)
            .map(|b| b.forwarded)
    }

    /// Run the server until the task is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move { server.run().await })
    }

    /// Serve the UDP and TCP listeners plus the expiry sweep.
    pub async fn run(&self) {
        self.spawn_tcp_loop();
        self.spawn_cleanup_task();

        tracing::info!(
            id = %self.id,
            udp = ?self.udp.local_addr(),
            tcp = ?self.tcp.local_addr(),
            "rendezvous server listening"
        );

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let (len, from) = match self.udp.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!("receive error: {e}");
                    continue;
                }
            };

            let msg = match RendezvousMessage::from_bytes(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(%from, "dropping undecodable datagram: {e}");
                    continue;
                }
            };

            if let Some(reply) = self.handle(msg, from, Via::Udp).await {
                if let Ok(bytes) = reply.to_bytes() {
                    let _ = self.udp.send_to(&bytes, from).await;
                }
            }
        }
    }

    fn spawn_tcp_loop(&self) {
        let tcp = self.tcp.clone();
        let server = self.clone_refs();

        tokio::spawn(async move {
            loop {
                let (mut stream, peer_addr) = match tcp.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::debug!("accept error: {e}");
                        continue;
                    }
                };

                let server = server.clone_refs();
                tokio::spawn(async move {
                    while let Ok(msg) = read_frame(&mut stream).await {
                        if let Some(reply) = server.handle(msg, peer_addr, Via::Tcp).await {
                            if write_frame(&mut stream, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
    }

    /// Cheap handle sharing the server state, for the accept loop.
    fn clone_refs(&self) -> Self {
        Self {
            id: self.id,
            udp: self.udp.clone(),
            tcp: self.tcp.clone(),
            clients: self.clients.clone(),
            punches: self.punches.clone(),
            relays: self.relays.clone(),
            config: self.config.clone(),
        }
    }

    async fn handle(
        &self,
        msg: RendezvousMessage,
        from: SocketAddr,
        via: Via,
    ) -> Option<RendezvousMessage> {
        match msg {
            RendezvousMessage::Ping { correlation, .. } => Some(RendezvousMessage::Pong {
                correlation,
                sender: self.id,
            }),

            RendezvousMessage::WhoAmI { correlation, .. } => {
                Some(RendezvousMessage::YouAre {
                    correlation,
                    observed: from,
                })
            }

            RendezvousMessage::Register { correlation, peer } => {
                // Over TCP the source port is ephemeral; fall back to the
                // announced UDP endpoint for deliveries.
                let udp_addr = match via {
                    Via::Udp => from,
                    Via::Tcp => peer.udp_socket_addr(),
                };
                self.clients.write().await.insert(
                    peer.id,
                    Registration {
                        peer,
                        udp_addr,
                        last_seen: Instant::now(),
                    },
                );
                tracing::debug!(peer = %peer.id, %udp_addr, "peer registered");
                Some(RendezvousMessage::RegisterAck {
                    correlation,
                    observed: from,
                })
            }

            RendezvousMessage::PunchRequest {
                correlation,
                initiator,
                bind_port,
                target,
                sync_token,
            } => {
                let target_addr = {
                    let clients = self.clients.read().await;
                    clients.get(&target).map(|r| r.udp_addr)
                };
                let Some(target_addr) = target_addr else {
                    return Some(RendezvousMessage::PunchReject {
                        correlation,
                        code: RejectCode::TargetNotRegistered,
                    });
                };

                let initiator_addr = match via {
                    Via::Udp => from,
                    Via::Tcp => initiator.udp_socket_addr(),
                };
                self.punches.write().await.insert(
                    sync_token,
                    PendingPunch {
                        initiator_addr,
                        correlation,
                        created: Instant::now(),
                    },
                );

                let forward = RendezvousMessage::PunchForward {
                    correlation,
                    initiator,
                    bind_port,
                    sync_token,
                };
                self.forward_udp(&forward, target_addr).await;
                tracing::debug!(
                    initiator = %initiator.id,
                    %target,
                    sync_token,
                    "punch instruction forwarded"
                );
                // The initiator's reply is the target's accept, forwarded
                // once it arrives.
                None
            }

            RendezvousMessage::PunchAccept {
                target,
                bind_port,
                sync_token,
                ..
            } => {
                let pending = self.punches.write().await.remove(&sync_token);
                match pending {
                    Some(pending) => {
                        let accept = RendezvousMessage::PunchAccept {
                            correlation: pending.correlation,
                            target,
                            bind_port,
                            sync_token,
                        };
                        self.forward_udp(&accept, pending.initiator_addr).await;
                    }
                    None => {
                        tracing::debug!(sync_token, "accept for unknown punch");
                    }
                }
                None
            }

            RendezvousMessage::RelayStart {
                correlation,
                initiator,
                target,
            } => {
                let (initiator_addr, target_addr) = {
                    let clients = self.clients.read().await;
                    (
                        clients.get(&initiator).map(|r| r.udp_addr),
                        clients.get(&target).map(|r| r.udp_addr),
                    )
                };
                let Some(target_addr) = target_addr else {
                    return Some(RendezvousMessage::RelayDenied {
                        correlation,
                        code: RejectCode::TargetNotRegistered,
                    });
                };
                let Some(initiator_addr) = initiator_addr else {
                    return Some(RendezvousMessage::RelayDenied {
                        correlation,
                        code: RejectCode::SenderNotRegistered,
                    });
                };

                let mut relays = self.relays.write().await;
                if relays.len() >= self.config.max_relay_sessions {
                    return Some(RendezvousMessage::RelayDenied {
                        correlation,
                        code: RejectCode::CapacityExceeded,
                    });
                }

                let session_token = rand::random::<u64>();
                relays.insert(
                    session_token,
                    RelayBinding {
                        initiator,
                        initiator_addr,
                        target,
                        target_addr,
                        last_alive: Instant::now(),
                        forwarded: 0,
                    },
                );
                tracing::debug!(%initiator, %target, session_token, "relay session opened");
                Some(RendezvousMessage::RelayStarted {
                    correlation,
                    session_token,
                })
            }

            RendezvousMessage::RelayForward {
                session_token,
                sender,
                payload,
            } => {
                let dest = {
                    let mut relays = self.relays.write().await;
                    match relays.get_mut(&session_token) {
                        Some(binding) if sender == binding.initiator => {
                            binding.forwarded += 1;
                            binding.last_alive = Instant::now();
                            Some(binding.target_addr)
                        }
                        Some(binding) if sender == binding.target => {
                            binding.forwarded += 1;
                            binding.last_alive = Instant::now();
                            Some(binding.initiator_addr)
                        }
                        _ => None,
                    }
                };
                match dest {
                    Some(dest) => {
                        let deliver = RendezvousMessage::RelayDeliver {
                            session_token,
                            sender,
                            payload,
                        };
                        self.forward_udp(&deliver, dest).await;
                    }
                    None => {
                        tracing::debug!(session_token, "envelope for unknown relay session");
                    }
                }
                None
            }

            RendezvousMessage::RelayKeepAlive {
                correlation,
                session_token,
            } => {
                let mut relays = self.relays.write().await;
                match relays.get_mut(&session_token) {
                    Some(binding) => {
                        binding.last_alive = Instant::now();
                        Some(RendezvousMessage::RelayKeepAliveAck {
                            correlation,
                            session_token,
                        })
                    }
                    None => Some(RendezvousMessage::RelayDenied {
                        correlation,
                        code: RejectCode::UnknownSession,
                    }),
                }
            }

            RendezvousMessage::RelayStop { session_token } => {
                if self.relays.write().await.remove(&session_token).is_some() {
                    tracing::debug!(session_token, "relay session closed");
                }
                None
            }

            other => {
                tracing::debug!(kind = other.kind(), %from, "ignoring unexpected message");
                None
            }
        }
    }

    /// Deliveries always go over UDP to the registered endpoint.
    async fn forward_udp(&self, msg: &RendezvousMessage, dest: SocketAddr) {
        match msg.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.udp.send_to(&bytes, dest).await {
                    tracing::debug!(%dest, "forward failed: {e}");
                }
            }
            Err(e) => tracing::debug!("encoding failed: {e}"),
        }
    }

    fn spawn_cleanup_task(&self) {
        let clients = self.clients.clone();
        let punches = self.punches.clone();
        let relays = self.relays.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cleanup_interval);
            loop {
                ticker.tick().await;
                let now = Instant::now();

                clients
                    .write()
                    .await
                    .retain(|_, reg| now.duration_since(reg.last_seen) < config.client_timeout);
                punches.write().await.retain(|_, p| {
                    now.duration_since(p.created) < config.punch_pending_timeout
                });
                relays.write().await.retain(|_, b| {
                    now.duration_since(b.last_alive) < config.relay_session_timeout
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_server() -> Arc<RendezvousServer> {
        Arc::new(
            RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_bind_and_addresses() {
        let server = loopback_server().await;
        let addr = server.peer_address().unwrap();

        assert_eq!(addr.id, server.id());
        assert_ne!(addr.udp_port, 0);
        assert_ne!(addr.tcp_port, 0);
    }

    #[tokio::test]
    async fn test_whoami_reports_observed_addr() {
        let server = loopback_server().await;
        let from: SocketAddr = "192.0.2.1:5555".parse().unwrap();

        let reply = server
            .handle(
                RendezvousMessage::WhoAmI {
                    correlation: 3,
                    sender: PeerId::random(),
                },
                from,
                Via::Udp,
            )
            .await
            .unwrap();

        assert_eq!(
            reply,
            RendezvousMessage::YouAre {
                correlation: 3,
                observed: from
            }
        );
    }

    #[tokio::test]
    async fn test_register_and_count() {
        let server = loopback_server().await;
        let peer = PeerAddress::new(
            PeerId::from_seed(b"client"),
            "192.0.2.2".parse().unwrap(),
            4000,
            4001,
        );
        let from: SocketAddr = "192.0.2.2:4001".parse().unwrap();

        let reply = server
            .handle(
                RendezvousMessage::Register {
                    correlation: 1,
                    peer,
                },
                from,
                Via::Udp,
            )
            .await
            .unwrap();

        assert!(matches!(reply, RendezvousMessage::RegisterAck { .. }));
        assert_eq!(server.client_count().await, 1);
        assert_eq!(server.registered(&peer.id).await, Some(peer));
    }

    #[tokio::test]
    async fn test_punch_request_for_unknown_target_rejected() {
        let server = loopback_server().await;
        let initiator = PeerAddress::new(
            PeerId::from_seed(b"init"),
            "192.0.2.3".parse().unwrap(),
            4000,
            4001,
        );

        let reply = server
            .handle(
                RendezvousMessage::PunchRequest {
                    correlation: 5,
                    initiator,
                    bind_port: 4001,
                    target: PeerId::from_seed(b"missing"),
                    sync_token: 8,
                },
                "192.0.2.3:4001".parse().unwrap(),
                Via::Udp,
            )
            .await
            .unwrap();

        assert_eq!(
            reply,
            RendezvousMessage::PunchReject {
                correlation: 5,
                code: RejectCode::TargetNotRegistered
            }
        );
    }

    #[tokio::test]
    async fn test_relay_start_requires_both_registrations() {
        let server = loopback_server().await;
        let initiator = PeerId::from_seed(b"init");
        let target = PeerId::from_seed(b"target");

        // Neither registered: target checked first.
        let reply = server
            .handle(
                RendezvousMessage::RelayStart {
                    correlation: 1,
                    initiator,
                    target,
                },
                "192.0.2.4:1000".parse().unwrap(),
                Via::Udp,
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            RendezvousMessage::RelayDenied {
                correlation: 1,
                code: RejectCode::TargetNotRegistered
            }
        );

        // Register the target only; the initiator is still missing.
        let target_addr = PeerAddress::new(target, "192.0.2.5".parse().unwrap(), 4000, 4001);
        server
            .handle(
                RendezvousMessage::Register {
                    correlation: 2,
                    peer: target_addr,
                },
                "192.0.2.5:4001".parse().unwrap(),
                Via::Udp,
            )
            .await;

        let reply = server
            .handle(
                RendezvousMessage::RelayStart {
                    correlation: 3,
                    initiator,
                    target,
                },
                "192.0.2.4:1000".parse().unwrap(),
                Via::Udp,
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            RendezvousMessage::RelayDenied {
                correlation: 3,
                code: RejectCode::SenderNotRegistered
            }
        );
    }

    #[tokio::test]
    async fn test_relay_capacity_limit() {
        let config = RendezvousServerConfig {
            max_relay_sessions: 0,
            ..RendezvousServerConfig::default()
        };
        let server = Arc::new(
            RendezvousServer::bind_with_config("127.0.0.1:0".parse().unwrap(), config)
                .await
                .unwrap(),
        );

        let initiator = PeerId::from_seed(b"init");
        let target = PeerId::from_seed(b"target");
        for (id, port) in [(initiator, 4001u16), (target, 4002u16)] {
            let peer = PeerAddress::new(id, "192.0.2.6".parse().unwrap(), port, port);
            server
                .handle(
                    RendezvousMessage::Register {
                        correlation: 0,
                        peer,
                    },
                    SocketAddr::new("192.0.2.6".parse().unwrap(), port),
                    Via::Udp,
                )
                .await;
        }

        let reply = server
            .handle(
                RendezvousMessage::RelayStart {
                    correlation: 9,
                    initiator,
                    target,
                },
                "192.0.2.6:4001".parse().unwrap(),
                Via::Udp,
            )
            .await
            .unwrap();

        assert_eq!(
            reply,
            RendezvousMessage::RelayDenied {
                correlation: 9,
                code: RejectCode::CapacityExceeded
            }
        );
    }

    #[tokio::test]
    async fn test_keepalive_for_unknown_session_denied() {
        let server = loopback_server().await;

        let reply = server
            .handle(
                RendezvousMessage::RelayKeepAlive {
                    correlation: 4,
                    session_token: 1234,
                },
                "192.0.2.7:1000".parse().unwrap(),
                Via::Udp,
            )
            .await
            .unwrap();

        assert_eq!(
            reply,
            RendezvousMessage::RelayDenied {
                correlation: 4,
                code: RejectCode::UnknownSession
            }
        );
    }
}

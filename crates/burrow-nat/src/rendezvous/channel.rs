//! Correlated request/reply channel shared by every traversal stage.
//!
//! One UDP socket carries all concurrent sessions; inbound datagrams are
//! demultiplexed by correlation id (replies), punch token (probes) or relay
//! token (deliveries) without blocking unrelated waiters. The channel never
//! retries on its own; retry policy belongs to the caller
//! ([`RendezvousChannel::request_with_retry`] implements the bounded
//! timed-out retry used by the stages).

use super::{MAX_MESSAGE_SIZE, read_frame, write_frame};
use crate::config::Transport;
use crate::error::TraversalError;
use crate::message::RendezvousMessage;
use crate::peer::{PeerAddress, PeerId};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Messages that matched no registered waiter: punch forwards, pings from
/// other peers, relay deliveries for unknown tokens. A peer that wants to
/// answer them consumes this stream.
pub type ChannelInbound = mpsc::UnboundedReceiver<(SocketAddr, RendezvousMessage)>;

type RouteMap = Arc<DashMap<u64, mpsc::UnboundedSender<(SocketAddr, RendezvousMessage)>>>;

/// A registration for all probe or delivery traffic carrying one token.
/// Dropping the subscription removes the route.
#[derive(Debug)]
pub struct Subscription {
    token: u64,
    map: RouteMap,
    rx: mpsc::UnboundedReceiver<(SocketAddr, RendezvousMessage)>,
}

impl Subscription {
    /// Receive the next message routed to this token.
    pub async fn recv(&mut self) -> Option<(SocketAddr, RendezvousMessage)> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.map.remove(&self.token);
    }
}

/// Typed message exchange with rendezvous/relay peers and, during punching,
/// with remote peers directly.
#[derive(Debug)]
pub struct RendezvousChannel {
    local_id: PeerId,
    transport: Transport,
    socket: Arc<UdpSocket>,
    pending: Arc<DashMap<u64, oneshot::Sender<RendezvousMessage>>>,
    punch_routes: RouteMap,
    relay_routes: RouteMap,
    inbound_rx: Mutex<Option<ChannelInbound>>,
    recv_task: JoinHandle<()>,
}

impl RendezvousChannel {
    /// Bind the shared UDP socket and start the demultiplexing loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn bind(
        local_id: PeerId,
        bind_addr: SocketAddr,
        transport: Transport,
    ) -> Result<Self, TraversalError> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        let pending: Arc<DashMap<u64, oneshot::Sender<RendezvousMessage>>> =
            Arc::new(DashMap::new());
        let punch_routes: RouteMap = Arc::new(DashMap::new());
        let relay_routes: RouteMap = Arc::new(DashMap::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            pending.clone(),
            punch_routes.clone(),
            relay_routes.clone(),
            inbound_tx,
        ));

        Ok(Self {
            local_id,
            transport,
            socket,
            pending,
            punch_routes,
            relay_routes,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            recv_task,
        })
    }

    /// Peer id this channel speaks for.
    #[must_use]
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Local UDP endpoint of the shared socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    pub fn local_udp_addr(&self) -> Result<SocketAddr, TraversalError> {
        Ok(self.socket.local_addr()?)
    }

    /// Endpoint of `peer` that [`RendezvousChannel::request`] will actually
    /// reach under the configured transport. A peer announces distinct TCP
    /// and UDP ports; dispatching on the wrong one connects to a listener
    /// that is not there.
    #[must_use]
    pub fn control_addr(&self, peer: &PeerAddress) -> SocketAddr {
        match self.transport {
            Transport::Udp => peer.udp_socket_addr(),
            Transport::Tcp => peer.tcp_socket_addr(),
        }
    }

    /// Send one request over the configured transport and await the
    /// correlated reply. No internal retry.
    ///
    /// # Errors
    ///
    /// `TimedOut` if no reply arrives within `timeout`, `Unreachable` on
    /// transport-level send failure, `ProtocolMismatch` if the message
    /// carries no correlation id or (on TCP) the reply correlation differs.
    pub async fn request(
        &self,
        target: SocketAddr,
        msg: RendezvousMessage,
        timeout: Duration,
    ) -> Result<RendezvousMessage, TraversalError> {
        match self.transport {
            Transport::Udp => self.request_udp(target, msg, timeout).await,
            Transport::Tcp => self.request_tcp(target, msg, timeout).await,
        }
    }

    /// Send one request over UDP regardless of the configured transport.
    /// Hole punching and self-port discovery always use this path.
    ///
    /// # Errors
    ///
    /// Same failure conditions as [`RendezvousChannel::request`].
    pub async fn request_udp(
        &self,
        target: SocketAddr,
        msg: RendezvousMessage,
        timeout: Duration,
    ) -> Result<RendezvousMessage, TraversalError> {
        let correlation = msg.correlation().ok_or_else(|| {
            TraversalError::ProtocolMismatch("request without correlation id".into())
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation, tx);

        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pending.remove(&correlation);
                return Err(e);
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, target).await {
            self.pending.remove(&correlation);
            return Err(TraversalError::from_io(&e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.remove(&correlation);
                Err(TraversalError::Unreachable("channel closed".into()))
            }
            Err(_) => {
                self.pending.remove(&correlation);
                Err(TraversalError::TimedOut)
            }
        }
    }

    /// One framed TCP connection per request: connect, write, read reply.
    async fn request_tcp(
        &self,
        target: SocketAddr,
        msg: RendezvousMessage,
        timeout: Duration,
    ) -> Result<RendezvousMessage, TraversalError> {
        let correlation = msg.correlation().ok_or_else(|| {
            TraversalError::ProtocolMismatch("request without correlation id".into())
        })?;

        let exchange = async {
            let mut stream = TcpStream::connect(target)
                .await
                .map_err(|e| TraversalError::from_io(&e))?;
            write_frame(&mut stream, &msg).await?;
            read_frame(&mut stream).await
        };

        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TraversalError::TimedOut)??;

        if reply.correlation() != Some(correlation) {
            return Err(TraversalError::ProtocolMismatch(format!(
                "reply correlation mismatch in {}",
                reply.kind()
            )));
        }
        Ok(reply)
    }

    /// Bounded caller-side retry: repeat the request on `TimedOut` up to
    /// `retries` additional attempts; every other failure escalates at once.
    ///
    /// # Errors
    ///
    /// The last failure once the retry budget is spent.
    pub async fn request_with_retry(
        &self,
        target: SocketAddr,
        msg: RendezvousMessage,
        timeout: Duration,
        retries: u32,
    ) -> Result<RendezvousMessage, TraversalError> {
        let mut last = TraversalError::TimedOut;
        for attempt in 0..=retries {
            match self.request(target, msg.clone(), timeout).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        kind = msg.kind(),
                        %target,
                        attempt,
                        "request timed out"
                    );
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Fire-and-forget UDP send, used for probes and relay envelopes.
    ///
    /// # Errors
    ///
    /// `Unreachable` on transport-level send failure.
    pub async fn send_datagram(
        &self,
        target: SocketAddr,
        msg: &RendezvousMessage,
    ) -> Result<(), TraversalError> {
        let bytes = msg.to_bytes()?;
        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| TraversalError::from_io(&e))?;
        Ok(())
    }

    /// Route all punch probes carrying `sync_token` to the returned
    /// subscription until it is dropped.
    #[must_use]
    pub fn subscribe_punch(&self, sync_token: u64) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.punch_routes.insert(sync_token, tx);
        Subscription {
            token: sync_token,
            map: self.punch_routes.clone(),
            rx,
        }
    }

    /// Route all relay deliveries carrying `session_token` to the returned
    /// subscription until it is dropped.
    #[must_use]
    pub fn subscribe_relay(&self, session_token: u64) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.relay_routes.insert(session_token, tx);
        Subscription {
            token: session_token,
            map: self.relay_routes.clone(),
            rx,
        }
    }

    /// Take the stream of unmatched inbound messages. Yields `None` after
    /// the first call.
    #[must_use]
    pub fn inbound(&self) -> Option<ChannelInbound> {
        self.inbound_rx
            .lock()
            .expect("inbound receiver lock poisoned")
            .take()
    }
}

impl Drop for RendezvousChannel {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    pending: Arc<DashMap<u64, oneshot::Sender<RendezvousMessage>>>,
    punch_routes: RouteMap,
    relay_routes: RouteMap,
    inbound_tx: mpsc::UnboundedSender<(SocketAddr, RendezvousMessage)>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // Transient errors (e.g. ICMP port unreachable surfaced on
                // Linux) must not kill demultiplexing for other sessions.
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

        // Probes and deliveries route by token so concurrent sessions to
        // different targets never contend.
        let route = match &msg {
            RendezvousMessage::Probe { sync_token, .. }
            | RendezvousMessage::ProbeAck { sync_token, .. } => {
                punch_routes.get(sync_token).map(|r| r.value().clone())
            }
            RendezvousMessage::RelayDeliver { session_token, .. } => {
                relay_routes.get(session_token).map(|r| r.value().clone())
            }
            _ => None,
        };
        if let Some(route) = route {
            let _ = route.send((from, msg));
            continue;
        }

        if msg.is_reply() {
            if let Some(correlation) = msg.correlation() {
                if let Some((_, waiter)) = pending.remove(&correlation) {
                    let _ = waiter.send(msg);
                    continue;
                }
            }
        }

        let _ = inbound_tx.send((from, msg));
    }
}

//! End-to-end cascade behavior over loopback: stage ordering, memoization,
//! coalescing, cancellation and invalidation on path loss.

use burrow_nat::{
    ConnectivityMode, ConnectivityOrchestrator, PeerAddress, PeerId, ProgressEvent,
    RendezvousChannel, RendezvousServer, Stage, StageTimeouts, Transport, TraversalConfig,
    TraversalError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

async fn spawn_server() -> (Arc<RendezvousServer>, JoinHandle<()>, PeerAddress) {
    let server = Arc::new(
        RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let handle = server.spawn();
    let addr = server.peer_address().unwrap();
    (server, handle, addr)
}

fn quick_timeouts() -> StageTimeouts {
    StageTimeouts {
        direct: Duration::from_millis(200),
        port_forward: Duration::from_secs(1),
        hole_punch: Duration::from_secs(2),
        relay: Duration::from_secs(1),
        overall: Duration::from_secs(10),
    }
}

fn base_config(rendezvous: PeerAddress) -> TraversalConfig {
    TraversalConfig::new(rendezvous)
        .with_port_forwarding(false)
        .with_timeouts(quick_timeouts())
}

async fn orchestrator(
    name: &[u8],
    config: TraversalConfig,
) -> (Arc<ConnectivityOrchestrator>, PeerAddress) {
    let channel = Arc::new(
        RendezvousChannel::bind(
            PeerId::from_seed(name),
            "127.0.0.1:0".parse().unwrap(),
            Transport::Udp,
        )
        .await
        .unwrap(),
    );
    let addr = channel.local_udp_addr().unwrap();
    let local = PeerAddress::new(channel.local_id(), addr.ip(), 0, addr.port());
    let orchestrator = ConnectivityOrchestrator::new(channel, local, config);
    orchestrator.register().await.unwrap();
    (orchestrator, local)
}

/// An address carrying a real peer's id but an endpoint nobody answers on,
/// to push the cascade past the direct stage.
fn unreachable(peer: PeerAddress) -> PeerAddress {
    let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
    peer.with_udp_endpoint(dead)
}

#[tokio::test]
async fn test_direct_success_skips_remaining_stages() {
    let (_server, _handle, rendezvous) = spawn_server().await;
    let (a, _) = orchestrator(b"a", base_config(rendezvous)).await;
    let (_b, b_local) = orchestrator(b"b", base_config(rendezvous)).await;

    let mut events = a.subscribe();
    let outcome = a.establish(b_local).await.unwrap();

    assert_eq!(outcome.mode(), ConnectivityMode::Direct);
    assert_eq!(a.resolved_mode(&b_local.id), Some(ConnectivityMode::Direct));

    // Only Direct started; nothing else ran.
    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::StageStarted { stage, .. } = event {
            started.push(stage);
        }
    }
    assert_eq!(started, vec![Stage::Direct]);
}

#[tokio::test]
async fn test_established_mode_is_memoized() {
    let (_server, _handle, rendezvous) = spawn_server().await;
    let (a, _) = orchestrator(b"a", base_config(rendezvous)).await;
    let (_b, b_local) = orchestrator(b"b", base_config(rendezvous)).await;

    a.establish(b_local).await.unwrap();
    assert_eq!(a.cascade_runs(), 1);

    a.establish(b_local).await.unwrap();
    a.establish(b_local).await.unwrap();
    assert_eq!(a.cascade_runs(), 1);
}

#[tokio::test]
async fn test_concurrent_attempts_coalesce() {
    let (_server, _handle, rendezvous) = spawn_server().await;
    let (a, _) = orchestrator(b"a", base_config(rendezvous)).await;

    // Nobody is registered under this id and nobody answers its endpoint,
    // so the whole cascade fails, slowly enough for the calls to overlap.
    let ghost = PeerAddress::new(
        PeerId::from_seed(b"ghost"),
        "127.0.0.1".parse().unwrap(),
        1,
        1,
    );

    let (first, second) = tokio::join!(a.establish(ghost), a.establish(ghost));
    assert!(first.is_err());
    assert!(second.is_err());
    assert_eq!(a.cascade_runs(), 1);
}

#[tokio::test]
async fn test_failed_attempts_are_not_memoized() {
    let (_server, _handle, rendezvous) = spawn_server().await;
    let (a, _) = orchestrator(b"a", base_config(rendezvous)).await;

    let ghost = PeerAddress::new(
        PeerId::from_seed(b"ghost"),
        "127.0.0.1".parse().unwrap(),
        1,
        1,
    );

    a.establish(ghost).await.unwrap_err();
    assert_eq!(a.resolved_mode(&ghost.id), None);

    a.establish(ghost).await.unwrap_err();
    assert_eq!(a.cascade_runs(), 2);
}

#[tokio::test]
async fn test_cancel_aborts_inflight_attempt() {
    let (_server, _handle, rendezvous) = spawn_server().await;
    let slow = TraversalConfig::new(rendezvous)
        .with_port_forwarding(false)
        .with_timeouts(StageTimeouts {
            direct: Duration::from_millis(300),
            ..quick_timeouts()
        });
    let (a, _) = orchestrator(b"a", slow).await;

    // A silent socket stands in for the target so the wire can be
    // observed after cancellation.
    let target_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ghost = PeerAddress::new(
        PeerId::from_seed(b"ghost"),
        "127.0.0.1".parse().unwrap(),
        1,
        target_socket.local_addr().unwrap().port(),
    );

    let attempt = {
        let a = a.clone();
        tokio::spawn(async move { a.establish(ghost).await })
    };

    // The direct stage's first ping confirms the attempt is in flight.
    let mut buf = [0u8; 1500];
    tokio::time::timeout(Duration::from_secs(1), target_socket.recv_from(&mut buf))
        .await
        .expect("direct probe never arrived")
        .unwrap();

    a.cancel(&ghost.id);
    let result = attempt.await.unwrap();
    assert_eq!(result.unwrap_err(), TraversalError::Cancelled);
    assert_eq!(a.resolved_mode(&ghost.id), None);

    // Nothing further reaches the wire; an uncancelled attempt would have
    // retried the ping within this window.
    let silent = tokio::time::timeout(
        Duration::from_millis(700),
        target_socket.recv_from(&mut buf),
    )
    .await;
    assert!(silent.is_err(), "traffic observed after cancellation");
}

#[tokio::test]
async fn test_dropped_attempt_releases_inflight_slot() {
    let (_server, _handle, rendezvous) = spawn_server().await;
    let slow = TraversalConfig::new(rendezvous)
        .with_port_forwarding(false)
        .with_timeouts(StageTimeouts {
            direct: Duration::from_secs(10),
            ..quick_timeouts()
        });
    let (a, _) = orchestrator(b"a", slow).await;

    let ghost = PeerAddress::new(
        PeerId::from_seed(b"ghost"),
        "127.0.0.1".parse().unwrap(),
        1,
        1,
    );

    // A caller-side timeout drops the leading future mid-cascade.
    let first = tokio::time::timeout(Duration::from_millis(200), a.establish(ghost)).await;
    assert!(first.is_err());
    assert_eq!(a.cascade_runs(), 1);

    // The slot must be free again: a fresh attempt leads its own cascade
    // instead of joining the dead one and settling instantly.
    let second = tokio::time::timeout(Duration::from_millis(200), a.establish(ghost)).await;
    assert!(
        second.is_err(),
        "second attempt settled without running a cascade: {second:?}"
    );
    assert_eq!(a.cascade_runs(), 2);
    assert_eq!(a.resolved_mode(&ghost.id), None);
}

#[tokio::test]
async fn test_register_over_tcp_reaches_tcp_listener() {
    let (server, _handle, rendezvous) = spawn_server().await;

    // The server's UDP and TCP listeners end up on different ports here,
    // so registration only succeeds if the request connects to the TCP
    // one.
    let channel = Arc::new(
        RendezvousChannel::bind(
            PeerId::from_seed(b"tcp-peer"),
            "127.0.0.1:0".parse().unwrap(),
            Transport::Tcp,
        )
        .await
        .unwrap(),
    );
    let addr = channel.local_udp_addr().unwrap();
    let local = PeerAddress::new(channel.local_id(), addr.ip(), 0, addr.port());
    let config = base_config(rendezvous).with_transport(Transport::Tcp);
    let a = ConnectivityOrchestrator::new(channel, local, config);

    a.register().await.unwrap();
    assert_eq!(server.registered(&local.id).await, Some(local));
}

#[tokio::test]
async fn test_forced_punch_failure_falls_back_to_relay() {
    let (server, _handle, rendezvous) = spawn_server().await;
    let forced = base_config(rendezvous)
        .with_punch(burrow_nat::PunchConfig::default().with_forced_failure());
    let (a, _) = orchestrator(b"a", forced.clone()).await;
    let (_b, b_local) = orchestrator(b"b", forced).await;

    let mut events = a.subscribe();
    let outcome = a.establish(unreachable(b_local)).await.unwrap();

    assert_eq!(outcome.mode(), ConnectivityMode::Relayed);
    assert_eq!(a.resolved_mode(&b_local.id), Some(ConnectivityMode::Relayed));
    assert_eq!(server.relay_session_count().await, 1);

    // Fixed stage order with port forwarding disabled.
    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::StageStarted { stage, .. } = event {
            started.push(stage);
        }
    }
    assert_eq!(started, vec![Stage::Direct, Stage::HolePunch, Stage::Relay]);

    // The memoized path means a second call opens no second session.
    a.establish(unreachable(b_local)).await.unwrap();
    assert_eq!(server.relay_session_count().await, 1);
}

#[tokio::test]
async fn test_relay_loss_invalidates_memoized_mode() {
    let (_server, handle, rendezvous) = spawn_server().await;
    let forced = base_config(rendezvous)
        .with_punch(burrow_nat::PunchConfig::default().with_forced_failure())
        .with_keepalive(Duration::from_millis(50), 2);
    let (a, _) = orchestrator(b"a", forced.clone()).await;
    let (_b, b_local) = orchestrator(b"b", forced).await;

    let outcome = a.establish(unreachable(b_local)).await.unwrap();
    assert_eq!(outcome.mode(), ConnectivityMode::Relayed);

    let mut events = a.subscribe();
    // Kill the relay peer; keep-alives now miss until the path is declared
    // lost.
    handle.abort();

    let lost = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let ProgressEvent::Lost { target } = events.recv().await.unwrap() {
                return target;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(lost, b_local.id);
    assert_eq!(a.resolved_mode(&b_local.id), None);
}

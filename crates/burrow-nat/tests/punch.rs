//! Hole punching and relayed forwarding between two full peers over
//! loopback.

use burrow_nat::{
    ConnectivityMode, ConnectivityOrchestrator, ConnectivityOutcome, PeerAddress, PeerId,
    PunchConfig, RendezvousChannel, RendezvousServer, StageTimeouts, Transport, TraversalConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn spawn_server() -> (Arc<RendezvousServer>, PeerAddress) {
    let server = Arc::new(
        RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    server.spawn();
    let addr = server.peer_address().unwrap();
    (server, addr)
}

fn config(rendezvous: PeerAddress) -> TraversalConfig {
    TraversalConfig::new(rendezvous)
        .with_port_forwarding(false)
        .with_timeouts(StageTimeouts {
            direct: Duration::from_millis(200),
            hole_punch: Duration::from_secs(3),
            relay: Duration::from_secs(1),
            ..StageTimeouts::default()
        })
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

fn unreachable(peer: PeerAddress) -> PeerAddress {
    let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
    peer.with_udp_endpoint(dead)
}

#[tokio::test]
async fn test_punch_stage_establishes_udp_path() {
    let (_server, rendezvous) = spawn_server().await;
    let (a, _) = orchestrator(b"initiator", config(rendezvous)).await;
    let (_b, b_local) = orchestrator(b"target", config(rendezvous)).await;

    // The announced endpoint is dead, so only the punch can win.
    let outcome = a.establish(unreachable(b_local)).await.unwrap();

    assert_eq!(outcome.mode(), ConnectivityMode::HolePunched);
    let ConnectivityOutcome::HolePunched {
        remote,
        local_port,
        winning_candidate,
    } = outcome
    else {
        panic!("expected punched path");
    };
    // Loopback preserves ports: the punched endpoint is the real socket
    // and the port-preserving candidate wins.
    assert_eq!(remote.udp_socket_addr(), b_local.udp_socket_addr());
    assert_eq!(winning_candidate, 0);
    assert_ne!(local_port, 0);
}

#[tokio::test]
async fn test_relayed_payloads_reach_the_target() {
    let (_server, rendezvous) = spawn_server().await;
    let forced =
        config(rendezvous).with_punch(PunchConfig::default().with_forced_failure());
    let (a, _) = orchestrator(b"initiator", forced.clone()).await;
    let (b, b_local) = orchestrator(b"target", forced).await;

    let (session, session_token) = match a.establish(unreachable(b_local)).await.unwrap() {
        ConnectivityOutcome::Relayed {
            session,
            session_token,
        } => (session, session_token),
        other => panic!("expected relayed path, got {other:?}"),
    };

    let mut relayed = b.take_relayed().unwrap();
    session
        .lock()
        .await
        .send(b"through the relay".to_vec())
        .await
        .unwrap();

    let (sender, token, payload) = tokio::time::timeout(Duration::from_secs(1), relayed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sender, a.local_id());
    assert_eq!(token, session_token);
    assert_eq!(payload, b"through the relay");
}

#[tokio::test]
async fn test_punch_attempts_to_distinct_peers_run_concurrently() {
    let (_server, rendezvous) = spawn_server().await;
    let (a, _) = orchestrator(b"initiator", config(rendezvous)).await;
    let (_b, b_local) = orchestrator(b"target-b", config(rendezvous)).await;
    let (_c, c_local) = orchestrator(b"target-c", config(rendezvous)).await;

    let (to_b, to_c) = tokio::join!(
        a.establish(unreachable(b_local)),
        a.establish(unreachable(c_local))
    );

    assert_eq!(to_b.unwrap().mode(), ConnectivityMode::HolePunched);
    assert_eq!(to_c.unwrap().mode(), ConnectivityMode::HolePunched);
    assert_eq!(a.cascade_runs(), 2);
    assert_eq!(
        a.resolved_mode(&b_local.id),
        Some(ConnectivityMode::HolePunched)
    );
    assert_eq!(
        a.resolved_mode(&c_local.id),
        Some(ConnectivityMode::HolePunched)
    );
}

//! Configuration for connectivity establishment.
//!
//! The rendezvous/relay address is explicit configuration, never ambient
//! process-wide state: every orchestrator instance is told which bootstrap
//! peer to coordinate through.

use crate::peer::PeerAddress;
use crate::punch::PunchConfig;
use std::time::Duration;

/// Transport used for correlated request/reply exchanges.
///
/// Hole punching always probes over UDP regardless of this setting; the
/// preference applies to rendezvous and relay control traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Shared UDP socket with correlation-id demultiplexing.
    #[default]
    Udp,
    /// One framed TCP connection per request, for reliability.
    Tcp,
}

/// Per-stage timeout budget of the cascade.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    /// Window for one direct reachability probe.
    pub direct: Duration,
    /// Budget for gateway discovery and port mapping.
    pub port_forward: Duration,
    /// Budget for the whole hole-punch attempt.
    pub hole_punch: Duration,
    /// Window for the relay session setup exchange.
    pub relay: Duration,
    /// Ceiling over the whole cascade.
    pub overall: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            direct: Duration::from_secs(1),
            port_forward: Duration::from_secs(3),
            hole_punch: Duration::from_secs(5),
            relay: Duration::from_secs(3),
            overall: Duration::from_secs(20),
        }
    }
}

/// Configuration handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    /// Rendezvous peer coordinating hole punches and self-port discovery.
    pub rendezvous: PeerAddress,
    /// Relay peer for the terminal fallback. Defaults to the rendezvous peer.
    pub relay: PeerAddress,
    /// Preferred transport for control exchanges.
    pub transport: Transport,
    /// Whether automatic port forwarding is attempted.
    pub port_forward_enabled: bool,
    /// Whether relay fallback is permitted.
    pub relay_enabled: bool,
    /// Per-stage timeout overrides.
    pub timeouts: StageTimeouts,
    /// Bounded retry count for timed-out requests (retries, not attempts).
    pub retries: u32,
    /// Hole-punch tuning, including the test-only force-fail switch.
    pub punch: PunchConfig,
    /// Interval between relay keep-alives.
    pub keepalive_interval: Duration,
    /// Consecutive missed keep-alive acks before the session is torn down.
    pub keepalive_miss_limit: u32,
    /// Lease duration requested for NAT port mappings, in seconds.
    pub forward_lease_secs: u32,
}

impl TraversalConfig {
    /// Create a configuration coordinating through `rendezvous`, which also
    /// serves as the relay peer until overridden.
    #[must_use]
    pub fn new(rendezvous: PeerAddress) -> Self {
        Self {
            rendezvous,
            relay: rendezvous,
            transport: Transport::default(),
            port_forward_enabled: true,
            relay_enabled: true,
            timeouts: StageTimeouts::default(),
            retries: 1,
            punch: PunchConfig::default(),
            keepalive_interval: Duration::from_secs(10),
            keepalive_miss_limit: 3,
            forward_lease_secs: 3600,
        }
    }

    /// Use a dedicated relay peer instead of the rendezvous peer.
    #[must_use]
    pub fn with_relay(mut self, relay: PeerAddress) -> Self {
        self.relay = relay;
        self
    }

    /// Select the control transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Enable or disable the port-forwarding stage.
    #[must_use]
    pub fn with_port_forwarding(mut self, enabled: bool) -> Self {
        self.port_forward_enabled = enabled;
        self
    }

    /// Enable or disable the relay fallback stage.
    #[must_use]
    pub fn with_relay_fallback(mut self, enabled: bool) -> Self {
        self.relay_enabled = enabled;
        self
    }

    /// Override the per-stage timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Override the hole-punch tuning.
    #[must_use]
    pub fn with_punch(mut self, punch: PunchConfig) -> Self {
        self.punch = punch;
        self
    }

    /// Override the relay keep-alive cadence.
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration, miss_limit: u32) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_miss_limit = miss_limit;
        self
    }
}

//! Automatic NAT port forwarding through UPnP IGD.
//!
//! Mapping a local UDP port on the gateway makes the peer directly
//! reachable without punching, so the cascade tries this right after the
//! plain direct probe. Mappings are leased and removed again when the
//! attempt moves on or the connection closes.

use crate::error::TraversalError;
use igd::aio::{Gateway, search_gateway};
use igd::{AddAnyPortError, PortMappingProtocol, RemovePortError, SearchError, SearchOptions};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

const MAPPING_DESCRIPTION: &str = "burrow-nat";

/// Well-known public endpoint the routing table is consulted against when
/// picking the local interface. Nothing is ever sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// One active mapping on the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedPort {
    /// External IP of the gateway.
    pub external_ip: Ipv4Addr,
    /// Port the gateway forwards from.
    pub external_port: u16,
    /// Local UDP port the mapping points at.
    pub internal_port: u16,
}

/// UPnP port mapping client bound to one discovered gateway.
pub struct PortForwarder {
    gateway: Gateway,
    lease_secs: u32,
}

impl PortForwarder {
    /// Discover the gateway on the local network within `budget`.
    ///
    /// # Errors
    ///
    /// `TimedOut` if no gateway answered in time, `Unreachable` for any
    /// other discovery failure.
    pub async fn discover(budget: Duration, lease_secs: u32) -> Result<Self, TraversalError> {
        let options = SearchOptions {
            timeout: Some(budget),
            ..SearchOptions::default()
        };
        // The search honours its own timeout; the outer one covers stalled
        // HTTP exchanges with a gateway that did answer the broadcast.
        let gateway = tokio::time::timeout(budget + Duration::from_secs(1), search_gateway(options))
            .await
            .map_err(|_| TraversalError::TimedOut)?
            .map_err(map_search_error)?;

        tracing::debug!(gateway = %gateway.addr, "gateway discovered");
        Ok(Self {
            gateway,
            lease_secs,
        })
    }

    /// Lease a mapping from some free external port to `internal_port` UDP.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` if the gateway has no ports left or refuses
    /// leased mappings, `Unreachable` for other gateway failures.
    pub async fn map_udp(&self, internal_port: u16) -> Result<ForwardedPort, TraversalError> {
        let local = SocketAddrV4::new(local_ipv4()?, internal_port);
        let external_port = self
            .gateway
            .add_any_port(
                PortMappingProtocol::UDP,
                local,
                self.lease_secs,
                MAPPING_DESCRIPTION,
            )
            .await
            .map_err(map_add_error)?;
        let external_ip = self
            .gateway
            .get_external_ip()
            .await
            .map_err(|e| TraversalError::Unreachable(e.to_string()))?;

        tracing::info!(
            %external_ip,
            external_port,
            internal_port,
            "port mapping leased"
        );
        Ok(ForwardedPort {
            external_ip,
            external_port,
            internal_port,
        })
    }

    /// Remove a mapping. Removing an already-expired mapping is fine.
    ///
    /// # Errors
    ///
    /// `Unreachable` if the gateway rejects the removal for any reason other
    /// than the mapping being gone already.
    pub async fn unmap(&self, forwarded: ForwardedPort) -> Result<(), TraversalError> {
        match self
            .gateway
            .remove_port(PortMappingProtocol::UDP, forwarded.external_port)
            .await
        {
            Ok(()) | Err(RemovePortError::NoSuchPortMapping) => {
                tracing::debug!(
                    external_port = forwarded.external_port,
                    "port mapping removed"
                );
                Ok(())
            }
            Err(e) => Err(TraversalError::Unreachable(e.to_string())),
        }
    }
}

/// Local IPv4 address used to reach the wider network, learned from the
/// routing table via a connected UDP socket. No packet is sent.
pub fn local_ipv4() -> Result<Ipv4Addr, TraversalError> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(ROUTE_PROBE_ADDR)?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(TraversalError::Unreachable(
            "no local IPv4 address".into(),
        )),
    }
}

fn map_search_error(e: SearchError) -> TraversalError {
    match e {
        SearchError::IoError(ref io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            TraversalError::TimedOut
        }
        other => TraversalError::Unreachable(other.to_string()),
    }
}

fn map_add_error(e: AddAnyPortError) -> TraversalError {
    match e {
        AddAnyPortError::NoPortsAvailable => {
            TraversalError::ResourceExhausted("gateway has no free external ports".into())
        }
        AddAnyPortError::OnlyPermanentLeasesSupported => {
            TraversalError::ResourceExhausted("gateway refuses leased mappings".into())
        }
        other => TraversalError::Unreachable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_probe_addr_is_a_valid_endpoint() {
        assert!(ROUTE_PROBE_ADDR.parse::<SocketAddr>().is_ok());
    }

    #[test]
    fn test_search_timeout_maps_to_timed_out() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert_eq!(
            map_search_error(SearchError::IoError(io)),
            TraversalError::TimedOut
        );
        assert!(matches!(
            map_search_error(SearchError::InvalidResponse),
            TraversalError::Unreachable(_)
        ));
    }

    #[test]
    fn test_port_exhaustion_maps_to_resource_exhausted() {
        assert!(matches!(
            map_add_error(AddAnyPortError::NoPortsAvailable),
            TraversalError::ResourceExhausted(_)
        ));
        assert!(matches!(
            map_add_error(AddAnyPortError::OnlyPermanentLeasesSupported),
            TraversalError::ResourceExhausted(_)
        ));
    }

    #[test]
    fn test_refusal_maps_to_unreachable() {
        assert!(matches!(
            map_add_error(AddAnyPortError::ActionNotAuthorized),
            TraversalError::Unreachable(_)
        ));
    }
}

use crate::config::ClusterLoadAssignment;
use crate::error::{config_err, GatewayError};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Weight given to an endpoint that does not declare one.
pub const DEFAULT_WEIGHT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostAddress {
    Socket(SocketAddr),
    /// A DNS name, resolved by the owning cluster.
    Logical { hostname: String, port: u16 },
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddress::Socket(addr) => write!(f, "{}", addr),
            HostAddress::Logical { hostname, port } => write!(f, "{}:{}", hostname, port),
        }
    }
}

/// One upstream endpoint. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    address: HostAddress,
    weight: u32,
}

impl Host {
    pub fn new(address: HostAddress, weight: u32) -> Self {
        Self { address, weight }
    }

    pub fn socket(addr: SocketAddr, weight: u32) -> Self {
        Self::new(HostAddress::Socket(addr), weight)
    }

    pub fn address(&self) -> &HostAddress {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.address {
            HostAddress::Socket(addr) => Some(addr),
            HostAddress::Logical { .. } => None,
        }
    }

    /// `host:port` form used as the upstream URI authority.
    pub fn authority(&self) -> String {
        self.address.to_string()
    }
}

/// Point-in-time member list of a cluster.
pub type HostSet = Vec<Host>;

/// Build a host set from a load assignment. With `allow_logical`, endpoints
/// that are not IP literals are kept as DNS names; otherwise they are a
/// configuration error.
pub fn hosts_from_assignment(
    cla: &ClusterLoadAssignment,
    allow_logical: bool,
) -> Result<HostSet, GatewayError> {
    let mut hosts = Vec::new();
    for lb_endpoint in cla.lb_endpoints() {
        let addr = &lb_endpoint.endpoint.address;
        let weight = lb_endpoint.load_balancing_weight.unwrap_or(DEFAULT_WEIGHT);
        let address = match addr.host().parse::<IpAddr>() {
            Ok(ip) => HostAddress::Socket(SocketAddr::new(ip, addr.port())),
            Err(_) if allow_logical && !addr.host().is_empty() => HostAddress::Logical {
                hostname: addr.host().to_string(),
                port: addr.port(),
            },
            Err(_) => return Err(config_err(format!("malformed address: {}", addr))),
        };
        hosts.push(Host::new(address, weight));
    }
    Ok(hosts)
}

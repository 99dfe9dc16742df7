use crate::config::CidrRange;
use crate::error::{config_err, GatewayError};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Longest-prefix-match table keyed by CIDR.
///
/// Entries are normalized to their network address, so `10.0.0.7/8` and
/// `10.0.0.0/8` are the same key. Lookups walk entries from the most specific
/// prefix down; tables are small (a handful of ranges per listener level).
#[derive(Debug, Clone)]
pub struct CidrTable<V> {
    entries: Vec<(IpNetwork, V)>,
}

impl<V> Default for CidrTable<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V> CidrTable<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `net`, inserting `make()` first if absent.
    pub fn entry_or_insert_with(&mut self, net: IpNetwork, make: impl FnOnce() -> V) -> &mut V {
        let net = normalize(net);
        let idx = match self.entries.iter().position(|(n, _)| *n == net) {
            Some(idx) => idx,
            None => {
                // keep most specific first; stable among equal lengths
                let at = self
                    .entries
                    .iter()
                    .position(|(n, _)| n.prefix() < net.prefix())
                    .unwrap_or(self.entries.len());
                self.entries.insert(at, (net, make()));
                at
            }
        };
        &mut self.entries[idx].1
    }

    pub fn longest_match(&self, ip: IpAddr) -> Option<&V> {
        self.entries
            .iter()
            .find(|(net, _)| same_family(net, ip) && net.contains(ip))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }
}

fn same_family(net: &IpNetwork, ip: IpAddr) -> bool {
    matches!(
        (net, ip),
        (IpNetwork::V4(_), IpAddr::V4(_)) | (IpNetwork::V6(_), IpAddr::V6(_))
    )
}

fn normalize(net: IpNetwork) -> IpNetwork {
    // network() of a valid prefix always re-validates
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}

/// Parse a configured range. An absent prefix length means 0.
pub fn parse_cidr(range: &CidrRange) -> Result<IpNetwork, GatewayError> {
    let ip: IpAddr = range
        .address_prefix
        .parse()
        .map_err(|_| config_err(format!("invalid cidr address: {}", range.address_prefix)))?;
    let len = range.prefix_len.unwrap_or(0);
    IpNetwork::new(ip, len).map(normalize).map_err(|e| {
        config_err(format!(
            "invalid cidr {}/{}: {}",
            range.address_prefix, len, e
        ))
    })
}

/// `0.0.0.0/0` (and `::/0`), the key used when a level has no ranges.
pub fn sentinel_v4() -> IpNetwork {
    zero_prefix(IpAddr::from([0u8; 4]))
}

pub fn sentinel_v6() -> IpNetwork {
    zero_prefix(IpAddr::from([0u16; 8]))
}

fn zero_prefix(ip: IpAddr) -> IpNetwork {
    match IpNetwork::new(ip, 0) {
        Ok(net) => net,
        Err(_) => unreachable!("a zero-length prefix is valid for every family"),
    }
}

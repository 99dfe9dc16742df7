//! Filter-chain selection for accepted connections.
//!
//! Chains are indexed once, at listener build time, into a nested decision
//! table with one level per match criterion, in this order:
//!
//! 1. destination port (exact, `0` = any)
//! 2. destination IP (longest prefix, `0.0.0.0/0` / `::/0` = any)
//! 3. server name (exact, `""` = any; wildcards are rejected)
//! 4. transport protocol (exact, `"raw_buffer"` when unset)
//! 5. application protocol (exact, `""` = any)
//! 6. direct source IP (longest prefix)
//! 7. source type (exact, `ANY` = any)
//! 8. source IP (longest prefix)
//! 9. source port (exact, `0` = any)
//!
//! Lookup walks the same levels. There is no backtracking: a level with no
//! entry for the connection ends the walk and the default chain is used.
//! Only the destination port, application protocol, source type and source
//! port levels retry their "any" key before giving up.
//!
//! The table is never mutated after `build`; listeners swap a whole new
//! manager on update.

use crate::config::{FilterChainConfig, FilterChainMatch};
use crate::error::{config_err, GatewayError};
use crate::listener::cidr::{parse_cidr, sentinel_v4, sentinel_v6, CidrTable};
use crate::listener::connection::{ConnectionContext, SourceType};
use ipnetwork::IpNetwork;
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

pub const ANY_PORT: u16 = 0;
pub const ANY_SERVER_NAME: &str = "";
pub const RAW_BUFFER: &str = "raw_buffer";
pub const ANY_APPLICATION_PROTOCOL: &str = "";
pub const IMPLICIT_DEFAULT_NAME: &str = "only";

const UNSET_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

type SourcePorts<T> = HashMap<u16, Arc<T>>;
type SourceIps<T> = CidrTable<SourcePorts<T>>;
type SourceTypes<T> = HashMap<SourceType, SourceIps<T>>;
type DirectSourceIps<T> = CidrTable<SourceTypes<T>>;
type ApplicationProtocols<T> = HashMap<String, DirectSourceIps<T>>;
type TransportProtocols<T> = HashMap<String, ApplicationProtocols<T>>;
type ServerNames<T> = HashMap<String, TransportProtocols<T>>;
type DestinationIps<T> = CidrTable<ServerNames<T>>;

/// Decision table over filter chains of type `T` (the built chain; tests use
/// plain names).
pub struct FilterChainManager<T> {
    destination_ports: HashMap<u16, DestinationIps<T>>,
    default_chain: Option<Arc<T>>,
    chains: Vec<(String, Arc<T>)>,
}

/// Match keys of one chain, with every unset criterion replaced by its
/// sentinel.
struct MatchKeys {
    destination_port: u16,
    destination_ips: Vec<IpNetwork>,
    server_names: Vec<String>,
    transport_protocol: String,
    application_protocols: Vec<String>,
    direct_source_ips: Vec<IpNetwork>,
    source_type: SourceType,
    source_ips: Vec<IpNetwork>,
    source_ports: Vec<u16>,
}

impl MatchKeys {
    fn from_config(m: &FilterChainMatch) -> Result<Self, GatewayError> {
        let mut server_names = Vec::with_capacity(m.server_names.len().max(1));
        for name in &m.server_names {
            if name.contains('*') {
                return Err(config_err(format!(
                    "wildcard server name is not supported: {}",
                    name
                )));
            }
            server_names.push(name.to_ascii_lowercase());
        }
        if server_names.is_empty() {
            server_names.push(ANY_SERVER_NAME.to_string());
        }

        let transport_protocol = if m.transport_protocol.is_empty() {
            RAW_BUFFER.to_string()
        } else {
            m.transport_protocol.clone()
        };

        let mut application_protocols = m.application_protocols.clone();
        if application_protocols.is_empty() {
            application_protocols.push(ANY_APPLICATION_PROTOCOL.to_string());
        }

        let mut source_ports = m.source_ports.clone();
        if source_ports.is_empty() {
            source_ports.push(ANY_PORT);
        }

        Ok(Self {
            destination_port: m.destination_port.unwrap_or(ANY_PORT),
            destination_ips: cidrs_or_any(&m.prefix_ranges)?,
            server_names,
            transport_protocol,
            application_protocols,
            direct_source_ips: cidrs_or_any(&m.direct_source_prefix_ranges)?,
            source_type: SourceType::from_config(&m.source_type)?,
            source_ips: cidrs_or_any(&m.source_prefix_ranges)?,
            source_ports,
        })
    }
}

fn cidrs_or_any(ranges: &[crate::config::CidrRange]) -> Result<Vec<IpNetwork>, GatewayError> {
    if ranges.is_empty() {
        return Ok(vec![sentinel_v4(), sentinel_v6()]);
    }
    ranges.iter().map(parse_cidr).collect()
}

impl<T> FilterChainManager<T> {
    /// Index `chains`. `make` turns each reachable chain config into `T`;
    /// any error aborts the build.
    ///
    /// Chains without a `filter_chain_match` are not indexed. When nothing is
    /// indexed and no default is given, the first chain becomes the default
    /// (named `only` when unnamed).
    pub fn build<F>(
        chains: &[FilterChainConfig],
        default_chain: Option<&FilterChainConfig>,
        mut make: F,
    ) -> Result<Self, GatewayError>
    where
        F: FnMut(&FilterChainConfig) -> Result<T, GatewayError>,
    {
        let mut manager = FilterChainManager {
            destination_ports: HashMap::new(),
            default_chain: None,
            chains: Vec::new(),
        };

        for config in chains {
            let Some(m) = config.filter_chain_match.as_ref() else {
                continue;
            };
            let keys = MatchKeys::from_config(m)?;
            let chain = Arc::new(make(config)?);
            manager.insert(&config.name, &keys, &chain);
            manager.chains.push((config.name.clone(), chain));
        }

        let default_config = match default_chain {
            Some(c) => Some(c.clone()),
            None if manager.destination_ports.is_empty() => chains.first().map(|c| {
                let mut c = c.clone();
                if c.name.is_empty() {
                    c.name = IMPLICIT_DEFAULT_NAME.to_string();
                }
                c
            }),
            None => None,
        };
        if let Some(c) = default_config {
            let chain = Arc::new(make(&c)?);
            manager.chains.push((c.name.clone(), chain.clone()));
            manager.default_chain = Some(chain);
        }

        Ok(manager)
    }

    fn insert(&mut self, name: &str, keys: &MatchKeys, chain: &Arc<T>) {
        let ips = self
            .destination_ports
            .entry(keys.destination_port)
            .or_default();
        for dst in &keys.destination_ips {
            let names = ips.entry_or_insert_with(*dst, HashMap::new);
            for server_name in &keys.server_names {
                let transports = names.entry(server_name.clone()).or_default();
                let protocols = transports
                    .entry(keys.transport_protocol.clone())
                    .or_default();
                for protocol in &keys.application_protocols {
                    let direct = protocols.entry(protocol.clone()).or_default();
                    for direct_src in &keys.direct_source_ips {
                        let types = direct.entry_or_insert_with(*direct_src, HashMap::new);
                        let sources = types.entry(keys.source_type).or_default();
                        for src in &keys.source_ips {
                            let ports = sources.entry_or_insert_with(*src, HashMap::new);
                            for port in &keys.source_ports {
                                if ports.insert(*port, chain.clone()).is_some() {
                                    tracing::warn!(
                                        "listener: overlapping filter chain match, later chain wins, chain={}",
                                        name
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Chain for `ctx`, or the default chain when the walk misses.
    pub fn find_filter_chain(&self, ctx: &ConnectionContext) -> Option<Arc<T>> {
        self.lookup(ctx).or_else(|| self.default_chain.clone())
    }

    fn lookup(&self, ctx: &ConnectionContext) -> Option<Arc<T>> {
        let ips = self
            .destination_ports
            .get(&ctx.destination_port)
            .or_else(|| self.destination_ports.get(&ANY_PORT))?;

        let names = ips.longest_match(ctx.destination_ip.unwrap_or(UNSET_IP))?;
        // configured names are stored lowercased
        let server_name: Cow<'_, str> = if ctx.server_name.bytes().any(|b| b.is_ascii_uppercase()) {
            Cow::Owned(ctx.server_name.to_ascii_lowercase())
        } else {
            Cow::Borrowed(ctx.server_name.as_str())
        };
        let transports = names.get(server_name.as_ref())?;

        let transport = if ctx.transport_protocol.is_empty() {
            RAW_BUFFER
        } else {
            ctx.transport_protocol.as_str()
        };
        let protocols = transports.get(transport)?;

        let direct = protocols
            .get(ctx.application_protocol.as_str())
            .or_else(|| protocols.get(ANY_APPLICATION_PROTOCOL))?;
        let types = direct.longest_match(ctx.direct_source_ip.unwrap_or(UNSET_IP))?;
        let sources = types
            .get(&ctx.source_type)
            .or_else(|| types.get(&SourceType::Any))?;
        let ports = sources.longest_match(ctx.source_ip.unwrap_or(UNSET_IP))?;

        ports
            .get(&ctx.source_port)
            .or_else(|| ports.get(&ANY_PORT))
            .cloned()
    }

    pub fn default_chain(&self) -> Option<&Arc<T>> {
        self.default_chain.as_ref()
    }

    /// Every built chain with its name, indexed ones first, then the default.
    pub fn chains(&self) -> &[(String, Arc<T>)] {
        &self.chains
    }

    pub fn is_empty(&self) -> bool {
        self.destination_ports.is_empty() && self.default_chain.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CidrRange;

    fn chain(name: &str, m: FilterChainMatch) -> FilterChainConfig {
        FilterChainConfig {
            name: name.to_string(),
            filter_chain_match: Some(m),
            filters: vec![],
        }
    }

    fn any_ip() -> Vec<CidrRange> {
        vec![CidrRange::new("0.0.0.0", 0)]
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn build(
        chains: &[FilterChainConfig],
        default_chain: Option<&FilterChainConfig>,
    ) -> Result<FilterChainManager<String>, GatewayError> {
        FilterChainManager::build(chains, default_chain, |c| Ok(c.name.clone()))
    }

    fn find(m: &FilterChainManager<String>, ctx: &ConnectionContext) -> Option<String> {
        m.find_filter_chain(ctx).map(|c| c.as_ref().clone())
    }

    /// An inbound sidecar listener layout.
    fn inbound_chains() -> Vec<FilterChainConfig> {
        vec![
            chain(
                "001",
                FilterChainMatch {
                    destination_port: Some(15006),
                    ..Default::default()
                },
            ),
            chain(
                "002",
                FilterChainMatch {
                    prefix_ranges: any_ip(),
                    transport_protocol: "tls".into(),
                    application_protocols: strings(&["istio-http/1.0", "istio-http/1.1", "istio-h2"]),
                    ..Default::default()
                },
            ),
            chain(
                "003",
                FilterChainMatch {
                    prefix_ranges: any_ip(),
                    transport_protocol: "raw_buffer".into(),
                    application_protocols: strings(&["http/1.1", "h2c"]),
                    ..Default::default()
                },
            ),
            chain(
                "004",
                FilterChainMatch {
                    prefix_ranges: any_ip(),
                    transport_protocol: "tls".into(),
                    application_protocols: strings(&["istio-peer-exchange", "istio"]),
                    ..Default::default()
                },
            ),
            chain(
                "005",
                FilterChainMatch {
                    prefix_ranges: any_ip(),
                    transport_protocol: "raw_buffer".into(),
                    ..Default::default()
                },
            ),
            chain(
                "006",
                FilterChainMatch {
                    prefix_ranges: any_ip(),
                    transport_protocol: "tls".into(),
                    ..Default::default()
                },
            ),
            chain(
                "007",
                FilterChainMatch {
                    destination_port: Some(9080),
                    transport_protocol: "tls".into(),
                    application_protocols: strings(&[
                        "istio",
                        "istio-peer-exchange",
                        "istio-http/1.0",
                        "istio-http/1.1",
                        "istio-h2",
                    ]),
                    ..Default::default()
                },
            ),
            chain(
                "008",
                FilterChainMatch {
                    destination_port: Some(9080),
                    transport_protocol: "raw_buffer".into(),
                    ..Default::default()
                },
            ),
            chain(
                "009",
                FilterChainMatch {
                    prefix_ranges: vec![CidrRange::new("192.168.0.0", 24)],
                    transport_protocol: "raw_buffer".into(),
                    ..Default::default()
                },
            ),
            chain(
                "010",
                FilterChainMatch {
                    prefix_ranges: vec![CidrRange::new("10.0.20.0", 24)],
                    transport_protocol: "tls".into(),
                    server_names: strings(&["www.qq.com"]),
                    ..Default::default()
                },
            ),
            chain(
                "011",
                FilterChainMatch {
                    source_ports: vec![9080, 10000],
                    transport_protocol: "raw_buffer".into(),
                    ..Default::default()
                },
            ),
        ]
    }

    #[test]
    fn test_inbound_table_matches() {
        let m = build(&inbound_chains(), None).unwrap();
        assert!(m.default_chain().is_none());

        let cases: Vec<(&str, ConnectionContext, Option<&str>)> = vec![
            (
                "destination port",
                ConnectionContext {
                    destination_port: 9080,
                    ..Default::default()
                },
                Some("008"),
            ),
            (
                "destination port with unknown application protocol",
                ConnectionContext {
                    destination_port: 9080,
                    application_protocol: "http/1.1".into(),
                    ..Default::default()
                },
                Some("008"),
            ),
            (
                "destination ip",
                ConnectionContext {
                    destination_ip: Some("192.168.0.2".parse().unwrap()),
                    ..Default::default()
                },
                Some("009"),
            ),
            (
                "server name required",
                ConnectionContext {
                    destination_ip: Some("10.0.20.2".parse().unwrap()),
                    ..Default::default()
                },
                None,
            ),
            (
                "server name without transport",
                ConnectionContext {
                    destination_ip: Some("10.0.20.2".parse().unwrap()),
                    server_name: "www.qq.com".into(),
                    ..Default::default()
                },
                None,
            ),
            (
                "server name",
                ConnectionContext {
                    destination_ip: Some("10.0.20.2".parse().unwrap()),
                    server_name: "www.qq.com".into(),
                    transport_protocol: "tls".into(),
                    ..Default::default()
                },
                Some("010"),
            ),
            (
                "transport and application protocol",
                ConnectionContext {
                    application_protocol: "istio-peer-exchange".into(),
                    transport_protocol: "tls".into(),
                    ..Default::default()
                },
                Some("004"),
            ),
            (
                "unknown application protocol falls back",
                ConnectionContext {
                    application_protocol: "xxxxx".into(),
                    transport_protocol: "tls".into(),
                    ..Default::default()
                },
                Some("006"),
            ),
            (
                "unknown source port falls back",
                ConnectionContext {
                    source_port: 8000,
                    ..Default::default()
                },
                Some("005"),
            ),
            (
                "source port",
                ConnectionContext {
                    source_port: 10000,
                    ..Default::default()
                },
                Some("011"),
            ),
        ];

        for (name, ctx, want) in cases {
            assert_eq!(find(&m, &ctx).as_deref(), want, "case: {}", name);
        }
    }

    #[test]
    fn test_longest_prefix_wins_over_any() {
        let chains = vec![
            chain(
                "any",
                FilterChainMatch {
                    prefix_ranges: any_ip(),
                    ..Default::default()
                },
            ),
            chain(
                "lan",
                FilterChainMatch {
                    prefix_ranges: vec![CidrRange::new("192.168.0.0", 24)],
                    ..Default::default()
                },
            ),
        ];
        let m = build(&chains, None).unwrap();
        let ctx = ConnectionContext {
            destination_ip: Some("192.168.0.2".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(find(&m, &ctx).as_deref(), Some("lan"));
        let ctx = ConnectionContext {
            destination_ip: Some("192.168.1.2".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(find(&m, &ctx).as_deref(), Some("any"));
    }

    #[test]
    fn test_unset_application_protocol_uses_empty_sentinel() {
        let chains = vec![
            chain(
                "h2",
                FilterChainMatch {
                    application_protocols: strings(&["h2"]),
                    ..Default::default()
                },
            ),
            chain("plain", FilterChainMatch::default()),
        ];
        let m = build(&chains, None).unwrap();
        assert_eq!(
            find(&m, &ConnectionContext::default()).as_deref(),
            Some("plain")
        );
        let ctx = ConnectionContext {
            application_protocol: "h2".into(),
            ..Default::default()
        };
        assert_eq!(find(&m, &ctx).as_deref(), Some("h2"));
    }

    #[test]
    fn test_port_chain_and_default() {
        let chains = vec![chain(
            "port-9080",
            FilterChainMatch {
                destination_port: Some(9080),
                transport_protocol: "raw_buffer".into(),
                ..Default::default()
            },
        )];
        let default_chain = FilterChainConfig {
            name: "default".into(),
            ..Default::default()
        };
        let m = build(&chains, Some(&default_chain)).unwrap();

        // no destination ip at all is treated as 0.0.0.0
        let ctx = ConnectionContext {
            destination_port: 9080,
            ..Default::default()
        };
        assert_eq!(find(&m, &ctx).as_deref(), Some("port-9080"));

        let ctx = ConnectionContext {
            destination_ip: Some("10.1.1.1".parse().unwrap()),
            destination_port: 9080,
            ..Default::default()
        };
        assert_eq!(find(&m, &ctx).as_deref(), Some("port-9080"));

        let ctx = ConnectionContext {
            destination_port: 8080,
            ..Default::default()
        };
        assert_eq!(find(&m, &ctx).as_deref(), Some("default"));

        let ctx = ConnectionContext {
            destination_port: 9080,
            transport_protocol: "tls".into(),
            ..Default::default()
        };
        assert_eq!(find(&m, &ctx).as_deref(), Some("default"));
    }

    #[test]
    fn test_server_name_matches_case_insensitively() {
        let chains = vec![chain(
            "sni",
            FilterChainMatch {
                server_names: strings(&["Reviews.Example.COM"]),
                transport_protocol: "tls".into(),
                ..Default::default()
            },
        )];
        let m = build(&chains, None).unwrap();
        for sni in ["reviews.example.com", "REVIEWS.example.com", "Reviews.Example.COM"] {
            let ctx = ConnectionContext {
                server_name: sni.into(),
                transport_protocol: "tls".into(),
                ..Default::default()
            };
            assert_eq!(find(&m, &ctx).as_deref(), Some("sni"), "sni={}", sni);
        }
        let other = ConnectionContext {
            server_name: "ratings.example.com".into(),
            transport_protocol: "tls".into(),
            ..Default::default()
        };
        assert!(find(&m, &other).is_none());
    }

    #[test]
    fn test_wildcard_server_name_rejected() {
        let chains = vec![chain(
            "wild",
            FilterChainMatch {
                server_names: strings(&["*.example.com"]),
                ..Default::default()
            },
        )];
        let err = build(&chains, None).err().unwrap();
        assert!(err.to_string().contains("wildcard server name"));
    }

    #[test]
    fn test_bad_cidr_rejected() {
        let chains = vec![chain(
            "bad",
            FilterChainMatch {
                prefix_ranges: vec![CidrRange::new("10.0.0.0", 40)],
                ..Default::default()
            },
        )];
        assert!(build(&chains, None).is_err());
    }

    #[test]
    fn test_implicit_default_named_only() {
        let chains = vec![
            FilterChainConfig::default(),
            FilterChainConfig {
                name: "second".into(),
                ..Default::default()
            },
        ];
        let m = build(&chains, None).unwrap();
        assert_eq!(m.default_chain().map(|c| c.as_str()), Some("only"));
        assert_eq!(
            find(&m, &ConnectionContext::default()).as_deref(),
            Some("only")
        );
    }

    #[test]
    fn test_no_implicit_default_when_matches_exist() {
        let chains = vec![
            FilterChainConfig {
                name: "unmatched".into(),
                ..Default::default()
            },
            chain(
                "tls",
                FilterChainMatch {
                    transport_protocol: "tls".into(),
                    ..Default::default()
                },
            ),
        ];
        let m = build(&chains, None).unwrap();
        assert!(m.default_chain().is_none());
        assert!(find(&m, &ConnectionContext::default()).is_none());
    }

    #[test]
    fn test_empty_manager_finds_nothing() {
        let m = build(&[], None).unwrap();
        assert!(m.is_empty());
        assert!(find(&m, &ConnectionContext::default()).is_none());
    }

    #[test]
    fn test_duplicate_predicate_last_wins() {
        let chains = vec![
            chain("first", FilterChainMatch::default()),
            chain("second", FilterChainMatch::default()),
        ];
        let m = build(&chains, None).unwrap();
        assert_eq!(
            find(&m, &ConnectionContext::default()).as_deref(),
            Some("second")
        );
    }

    #[test]
    fn test_equal_length_prefixes_are_distinct_keys() {
        let chains = vec![
            chain(
                "a",
                FilterChainMatch {
                    prefix_ranges: vec![CidrRange::new("10.0.1.0", 24)],
                    ..Default::default()
                },
            ),
            chain(
                "b",
                FilterChainMatch {
                    prefix_ranges: vec![CidrRange::new("10.0.2.0", 24)],
                    ..Default::default()
                },
            ),
        ];
        let m = build(&chains, None).unwrap();
        for (ip, want) in [("10.0.1.9", "a"), ("10.0.2.9", "b")] {
            let ctx = ConnectionContext {
                destination_ip: Some(ip.parse().unwrap()),
                ..Default::default()
            };
            assert_eq!(find(&m, &ctx).as_deref(), Some(want));
        }
    }

    #[test]
    fn test_source_type_and_direct_source() {
        let chains = vec![
            chain(
                "local",
                FilterChainMatch {
                    source_type: "SAME_IP_OR_LOOPBACK".into(),
                    ..Default::default()
                },
            ),
            chain("anyone", FilterChainMatch::default()),
        ];
        let m = build(&chains, None).unwrap();

        let local = ConnectionContext::from_addrs(
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
        );
        let remote = ConnectionContext::from_addrs(
            "10.9.9.9:5000".parse().unwrap(),
            "10.0.0.1:8080".parse().unwrap(),
        );
        assert_eq!(find(&m, &local).as_deref(), Some("local"));
        assert_eq!(find(&m, &remote).as_deref(), Some("anyone"));
    }

    #[test]
    fn test_ipv6_connection_matches_unset_ranges() {
        let chains = vec![chain("any", FilterChainMatch::default())];
        let m = build(&chains, None).unwrap();
        let ctx = ConnectionContext::from_addrs(
            "[2001:db8::1]:4000".parse().unwrap(),
            "[2001:db8::2]:80".parse().unwrap(),
        );
        assert_eq!(find(&m, &ctx).as_deref(), Some("any"));
    }

    #[test]
    fn test_build_error_from_factory_aborts() {
        let chains = vec![chain("x", FilterChainMatch::default())];
        let res: Result<FilterChainManager<String>, _> =
            FilterChainManager::build(&chains, None, |_| Err(config_err("boom")));
        assert!(res.is_err());
    }
}

use serde::{Deserialize, Deserializer, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{config_err, GatewayError};

/// Deserialize a `T` that implements `Default`: treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SecsOrString {
    Secs(f64),
    Str(String),
}

/// Parse a duration the way xDS JSON writes them (`"5s"`, `"0.25s"`), falling
/// back to humantime (`"250ms"`, `"1m 30s"`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Ok(v) = secs.parse::<f64>() {
            if v.is_finite() && v >= 0.0 {
                return Ok(Duration::from_secs_f64(v));
            }
        }
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{}': {}", s, e))
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}s", d.as_secs_f64())
    }
}

fn secs_to_duration<E: serde::de::Error>(v: SecsOrString) -> Result<Duration, E> {
    match v {
        SecsOrString::Secs(n) if n.is_finite() && n >= 0.0 => Ok(Duration::from_secs_f64(n)),
        SecsOrString::Secs(n) => Err(E::custom(format!("invalid duration: {}", n))),
        SecsOrString::Str(s) => parse_duration(&s).map_err(E::custom),
    }
}

mod duration_str {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        secs_to_duration(SecsOrString::deserialize(d)?)
    }
}

mod opt_duration_str {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&format_duration(d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<SecsOrString>::deserialize(d)? {
            Some(v) => secs_to_duration(v).map(Some),
            None => Ok(None),
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Top-level proxy configuration, shaped like an Envoy v3 bootstrap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub static_resources: StaticResources,

    #[serde(default)]
    pub dynamic_resources: Option<DynamicResources>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub id: String,

    #[serde(default)]
    pub cluster: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            cluster: String::new(),
        }
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "hermes-proxy".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_address")]
    pub address: AddressConfig,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
        }
    }
}

fn default_admin_address() -> AddressConfig {
    AddressConfig::new("0.0.0.0", 9901)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticResources {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicResources {
    #[serde(default)]
    pub ads_config: Option<AdsConfig>,
}

/// Aggregated discovery source. Only the REST-JSON transport is implemented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdsConfig {
    #[serde(default = "default_api_type")]
    pub api_type: String,

    /// Static clusters hosting the management server; the first one is used.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub cluster_names: Vec<String>,

    /// Interval between polls of subscribed resource types.
    #[serde(default = "default_refresh_delay", with = "duration_str")]
    pub refresh_delay: Duration,
}

fn default_api_type() -> String {
    "REST".to_string()
}

fn default_refresh_delay() -> Duration {
    Duration::from_secs(1)
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressConfig {
    pub socket_address: SocketAddressConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddressConfig {
    pub address: String,

    #[serde(default)]
    pub port_value: u16,

    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

impl AddressConfig {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            socket_address: SocketAddressConfig {
                address: address.to_string(),
                port_value: port,
                protocol: default_protocol(),
            },
        }
    }

    /// The address as an IP socket address. DNS names are rejected.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, GatewayError> {
        let sa = &self.socket_address;
        if sa.protocol != "TCP" {
            return Err(config_err(format!(
                "unsupported socket protocol: {}",
                sa.protocol
            )));
        }
        let ip: IpAddr = sa
            .address
            .parse()
            .map_err(|_| config_err(format!("malformed address: {}", sa.address)))?;
        Ok(SocketAddr::new(ip, sa.port_value))
    }

    pub fn host(&self) -> &str {
        &self.socket_address.address
    }

    pub fn port(&self) -> u16 {
        self.socket_address.port_value
    }
}

impl std::fmt::Display for AddressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            self.socket_address.address, self.socket_address.port_value
        )
    }
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

/// Upstream cluster definition. `type` and `lb_policy` are kept as strings and
/// checked when the cluster is built, so an unsupported value is a build error
/// for that one cluster rather than a decode failure of the whole document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    /// STATIC, STRICT_DNS, LOGICAL_DNS, EDS, ORIGINAL_DST.
    #[serde(rename = "type", default = "default_cluster_type")]
    pub cluster_type: String,

    /// ROUND_ROBIN, RANDOM, CLUSTER_PROVIDED.
    #[serde(default = "default_lb_policy")]
    pub lb_policy: String,

    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,

    /// DNS refresh interval for STRICT_DNS / LOGICAL_DNS. Defaults to 5s.
    #[serde(default, with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub dns_refresh_rate: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_assignment: Option<ClusterLoadAssignment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eds_cluster_config: Option<EdsClusterConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_bind_config: Option<BindConfig>,

    #[serde(default)]
    pub common_http_protocol_options: HttpProtocolOptions,

    /// Presence switches upstream connections to TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_socket: Option<serde_json::Value>,
}

fn default_cluster_type() -> String {
    "STATIC".to_string()
}

fn default_lb_policy() -> String {
    "ROUND_ROBIN".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

impl ClusterConfig {
    /// Name used for EDS lookups: `eds_cluster_config.service_name` if set,
    /// otherwise the cluster name.
    pub fn eds_service_name(&self) -> &str {
        match &self.eds_cluster_config {
            Some(eds) if !eds.service_name.is_empty() => &eds.service_name,
            _ => &self.name,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdsClusterConfig {
    #[serde(default)]
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    pub source_address: AddressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProtocolOptions {
    #[serde(default = "default_idle_timeout", with = "duration_str")]
    pub idle_timeout: Duration,

    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_connections_per_host: usize,
}

impl Default for HttpProtocolOptions {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            max_idle_connections_per_host: default_max_idle_per_host(),
        }
    }
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_idle_per_host() -> usize {
    64
}

/// Endpoint set of a cluster; also the EDS resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterLoadAssignment {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub endpoints: Vec<LocalityLbEndpoints>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalityLbEndpoints {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbEndpoint {
    pub endpoint: Endpoint,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_weight: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: AddressConfig,
}

impl ClusterLoadAssignment {
    /// Flatten localities into (address, weight) pairs in declaration order.
    pub fn lb_endpoints(&self) -> impl Iterator<Item = &LbEndpoint> {
        self.endpoints.iter().flat_map(|l| l.lb_endpoints.iter())
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,

    pub address: AddressConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filter_chains: Vec<FilterChainConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_filter_chain: Option<FilterChainConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub listener_filters: Vec<FilterConfig>,

    /// Hand connections redirected by iptables to the listener owning the
    /// original destination.
    #[serde(default)]
    pub use_original_dst: bool,

    #[serde(default = "default_true")]
    pub bind_to_port: bool,

    #[serde(default = "default_listener_filters_timeout", with = "duration_str")]
    pub listener_filters_timeout: Duration,
}

fn default_listener_filters_timeout() -> Duration {
    Duration::from_secs(15)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterChainConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_chain_match: Option<FilterChainMatch>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: Vec<FilterConfig>,
}

/// A listener, network or HTTP filter reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typed_config: Option<serde_json::Value>,
}

impl FilterConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            typed_config: None,
        }
    }

    /// The `@type` URL of `typed_config`, if any.
    pub fn type_url(&self) -> Option<&str> {
        self.typed_config
            .as_ref()
            .and_then(|v| v.get("@type"))
            .and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterChainMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub prefix_ranges: Vec<CidrRange>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub server_names: Vec<String>,

    #[serde(default)]
    pub transport_protocol: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub application_protocols: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub direct_source_prefix_ranges: Vec<CidrRange>,

    /// ANY, SAME_IP_OR_LOOPBACK (alias LOCAL), EXTERNAL.
    #[serde(default = "default_source_type")]
    pub source_type: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub source_prefix_ranges: Vec<CidrRange>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub source_ports: Vec<u16>,
}

fn default_source_type() -> String {
    "ANY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CidrRange {
    pub address_prefix: String,

    /// Missing means 0.
    #[serde(default)]
    pub prefix_len: Option<u8>,
}

impl CidrRange {
    pub fn new(address_prefix: &str, prefix_len: u8) -> Self {
        Self {
            address_prefix: address_prefix.to_string(),
            prefix_len: Some(prefix_len),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP connection manager / routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpConnectionManagerConfig {
    #[serde(default)]
    pub stat_prefix: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_config: Option<RouteConfiguration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rds: Option<RdsConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub http_filters: Vec<FilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdsConfig {
    pub route_config_name: String,
}

/// Route table; also the RDS resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfiguration {
    #[serde(default)]
    pub name: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub virtual_hosts: Vec<VirtualHostConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualHostConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub domains: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub name: String,

    #[serde(rename = "match", default)]
    pub route_match: RouteMatchConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteActionConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_response: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMatchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_regex: Option<RegexMatcher>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexMatcher {
    pub regex: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteActionConfig {
    /// Only the route-to-cluster action is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    /// Upstream timeout for the whole request. Defaults to 15s.
    #[serde(default, with = "opt_duration_str", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

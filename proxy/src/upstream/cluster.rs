use crate::config::{ClusterConfig, HttpProtocolOptions};
use crate::error::{config_err, GatewayError};
use crate::proxy::context::BoxBody;
use crate::upstream::host::{hosts_from_assignment, Host, HostAddress, HostSet};
use crate::upstream::loadbalance::{LbPolicy, LoadBalancer, SelectContext};
use arc_swap::ArcSwap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Refresh interval for DNS clusters without `dns_refresh_rate`.
const DEFAULT_DNS_REFRESH: Duration = Duration::from_secs(5);

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClusterType {
    Static = 0,
    StrictDns = 1,
    LogicalDns = 2,
    Eds = 3,
    OriginalDst = 4,
}

impl ClusterType {
    pub fn from_config(name: &str) -> Result<Self, GatewayError> {
        match name {
            "" | "STATIC" => Ok(ClusterType::Static),
            "STRICT_DNS" => Ok(ClusterType::StrictDns),
            "LOGICAL_DNS" => Ok(ClusterType::LogicalDns),
            "EDS" => Ok(ClusterType::Eds),
            "ORIGINAL_DST" => Ok(ClusterType::OriginalDst),
            other => Err(config_err(format!("unsupported cluster type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Static => "STATIC",
            ClusterType::StrictDns => "STRICT_DNS",
            ClusterType::LogicalDns => "LOGICAL_DNS",
            ClusterType::Eds => "EDS",
            ClusterType::OriginalDst => "ORIGINAL_DST",
        }
    }

    fn is_dns(&self) -> bool {
        matches!(self, ClusterType::StrictDns | ClusterType::LogicalDns)
    }
}

/// Static identity of a cluster. Built once per cluster instance.
#[derive(Debug)]
pub struct ClusterInfo {
    name: String,
    cluster_type: ClusterType,
    lb_policy: LbPolicy,
    config: Arc<ClusterConfig>,
}

impl ClusterInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.cluster_type
    }

    pub fn lb_policy(&self) -> LbPolicy {
        self.lb_policy
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }
}

/// Immutable {info, hosts, balancer} triple. Replaced wholesale on every host
/// change; a reader holding one never observes a later update.
pub struct ClusterSnapshot {
    info: Arc<ClusterInfo>,
    hosts: HostSet,
    lb: LoadBalancer,
}

impl ClusterSnapshot {
    fn new(info: Arc<ClusterInfo>, hosts: HostSet) -> Self {
        let lb = LoadBalancer::new(info.lb_policy, &hosts);
        Self { info, hosts, lb }
    }

    pub fn info(&self) -> &ClusterInfo {
        &self.info
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn lb(&self) -> &LoadBalancer {
        &self.lb
    }

    pub fn select(&self, ctx: &SelectContext) -> Result<Host, GatewayError> {
        self.lb.select(ctx)
    }
}

/// Runtime representation of a cluster: the published snapshot, the pooled
/// upstream client and, for DNS clusters, the refresh task.
pub struct Cluster {
    info: Arc<ClusterInfo>,
    snapshot: Arc<ArcSwap<ClusterSnapshot>>,

    /// Per-cluster HTTP client so pool settings, connect timeout and source
    /// address can differ between clusters.
    http_client: UpstreamClient,
    scheme: &'static str,

    /// Stops the DNS refresh task. Cancelled on close and on drop.
    cancel: CancellationToken,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Result<Self, GatewayError> {
        let cluster_type = ClusterType::from_config(&config.cluster_type)?;
        let lb_policy = match (cluster_type, config.lb_policy.as_str()) {
            (ClusterType::OriginalDst, _) => LbPolicy::OriginalDst,
            (_, "CLUSTER_PROVIDED") => {
                return Err(config_err(format!(
                    "cluster {}: CLUSTER_PROVIDED lb_policy requires an ORIGINAL_DST cluster",
                    config.name
                )))
            }
            (_, policy) => LbPolicy::from_config(policy)?,
        };

        let configured = match &config.load_assignment {
            Some(cla)
                if matches!(
                    cluster_type,
                    ClusterType::Static | ClusterType::StrictDns | ClusterType::LogicalDns
                ) =>
            {
                hosts_from_assignment(cla, cluster_type.is_dns())?
            }
            _ => Vec::new(),
        };

        let source_ip = match &config.upstream_bind_config {
            Some(bind) => Some(bind.source_address.to_socket_addr()?.ip()),
            None => None,
        };
        let http_client = build_cluster_http_client(
            &config.common_http_protocol_options,
            config.connect_timeout,
            source_ip,
        );
        let scheme = if config.transport_socket.is_some() {
            "https"
        } else {
            "http"
        };
        let refresh = config.dns_refresh_rate.unwrap_or(DEFAULT_DNS_REFRESH);

        let info = Arc::new(ClusterInfo {
            name: config.name.clone(),
            cluster_type,
            lb_policy,
            config: Arc::new(config),
        });

        let initial = if cluster_type == ClusterType::Static {
            configured.clone()
        } else {
            Vec::new()
        };
        let snapshot = Arc::new(ArcSwap::from_pointee(ClusterSnapshot::new(
            info.clone(),
            initial,
        )));
        let cancel = CancellationToken::new();

        if cluster_type.is_dns() {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(GatewayError::Internal(format!(
                    "cluster {}: dns refresh needs a tokio runtime",
                    info.name
                )));
            }
            tokio::spawn(run_dns_refresh(
                info.clone(),
                configured,
                snapshot.clone(),
                refresh,
                cancel.clone(),
            ));
        }

        tracing::info!(
            "upstream: cluster created, name={}, type={}, lb={}",
            info.name,
            cluster_type.as_str(),
            lb_policy.as_str()
        );

        Ok(Self {
            info,
            snapshot,
            http_client,
            scheme,
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn http_client(&self) -> &UpstreamClient {
        &self.http_client
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// Current published snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snapshot.load_full()
    }

    /// Build a new snapshot over `hosts` and publish it.
    pub fn update_hosts(&self, hosts: HostSet) {
        publish(&self.info, &self.snapshot, hosts);
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Release background work. Safe to call more than once.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            tracing::debug!("upstream: cluster closed, name={}", self.info.name);
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn publish(info: &Arc<ClusterInfo>, snapshot: &ArcSwap<ClusterSnapshot>, hosts: HostSet) {
    let count = hosts.len();
    snapshot.store(Arc::new(ClusterSnapshot::new(info.clone(), hosts)));
    metrics::gauge!("proxy_cluster_hosts", "cluster" => info.name.clone()).set(count as f64);
}

/// Resolve `targets` every `refresh` until cancelled. A failed round keeps
/// the previous snapshot and waits for the next tick.
async fn run_dns_refresh(
    info: Arc<ClusterInfo>,
    targets: HostSet,
    snapshot: Arc<ArcSwap<ClusterSnapshot>>,
    refresh: Duration,
    cancel: CancellationToken,
) {
    let first_only = info.cluster_type == ClusterType::LogicalDns;
    loop {
        match resolve_hosts(&targets, first_only).await {
            Ok(hosts) => {
                metrics::counter!(
                    "proxy_dns_resolutions_total",
                    "cluster" => info.name.clone(),
                    "result" => "success",
                )
                .increment(1);
                if snapshot.load().hosts() != hosts.as_slice() {
                    tracing::info!(
                        "upstream: dns hosts changed, cluster={}, hosts={}",
                        info.name,
                        hosts.len()
                    );
                    publish(&info, &snapshot, hosts);
                }
            }
            Err(e) => {
                metrics::counter!(
                    "proxy_dns_resolutions_total",
                    "cluster" => info.name.clone(),
                    "result" => "error",
                )
                .increment(1);
                tracing::error!(
                    "upstream: dns resolve failed, cluster={}, error={}",
                    info.name,
                    e
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("upstream: dns refresh stopped, cluster={}", info.name);
                return;
            }
            _ = tokio::time::sleep(refresh) => {}
        }
    }
}

/// Expand DNS names to one host per resolved address, keeping each entry's
/// weight. Names are looked up concurrently; the result keeps `targets` order.
/// With `first_only`, only the first address of the first entry is used.
async fn resolve_hosts(targets: &[Host], first_only: bool) -> std::io::Result<HostSet> {
    let targets = if first_only {
        &targets[..targets.len().min(1)]
    } else {
        targets
    };

    let resolved = futures_util::future::try_join_all(targets.iter().map(|target| async move {
        match target.address() {
            HostAddress::Socket(_) => Ok(vec![target.clone()]),
            HostAddress::Logical { hostname, port } => {
                let addrs = tokio::net::lookup_host((hostname.as_str(), *port)).await?;
                Ok::<_, std::io::Error>(
                    addrs
                        .map(|addr| Host::socket(addr, target.weight()))
                        .collect::<Vec<_>>(),
                )
            }
        }
    }))
    .await?;

    let mut hosts: HostSet = resolved.into_iter().flatten().collect();
    if first_only {
        hosts.truncate(1);
    }
    Ok(hosts)
}

/// Build a hyper `Client` that supports both HTTP and HTTPS upstreams.
///
/// - Plain `http://` connections go through the inner `HttpConnector` directly.
/// - `https://` connections are terminated with rustls (ring backend) against
///   the webpki roots.
/// - `source_ip` binds outgoing connections (`upstream_bind_config`).
fn build_cluster_http_client(
    opts: &HttpProtocolOptions,
    connect_timeout: Duration,
    source_ip: Option<IpAddr>,
) -> UpstreamClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(opts.idle_timeout));
    http.set_connect_timeout(Some(connect_timeout));
    http.set_local_address(source_ip);
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(opts.idle_timeout)
        .pool_max_idle_per_host(opts.max_idle_connections_per_host)
        .build(https)
}

use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` macros can be used anywhere in the
/// crate; the `PrometheusHandle` is kept only to render `/stats/prometheus`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Call once, before traffic.
    pub fn install() -> Result<Self> {
        let handle = builder()?.install_recorder()?;
        describe();
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally, for rendering in tests.
    #[cfg(test)]
    pub(crate) fn unregistered() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn builder() -> Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_duration_seconds".to_string()), LATENCY_BUCKETS)?)
}

fn describe() {
    // downstream
    describe_counter!(
        "proxy_downstream_connections_total",
        Unit::Count,
        "Downstream connections by listener and accept status"
    );
    describe_gauge!(
        "proxy_downstream_connections_active",
        Unit::Count,
        "Downstream connections currently open"
    );
    describe_counter!(
        "proxy_filter_chain_misses_total",
        Unit::Count,
        "Connections closed because no filter chain matched"
    );
    describe_gauge!(
        "proxy_listeners_total",
        Unit::Count,
        "Listeners currently configured"
    );

    // http
    describe_counter!(
        "proxy_http_requests_total",
        Unit::Count,
        "HTTP requests by stat prefix, cluster and status"
    );
    describe_histogram!(
        "proxy_http_request_duration_seconds",
        Unit::Seconds,
        "Request duration from the downstream perspective"
    );
    describe_histogram!(
        "proxy_upstream_request_duration_seconds",
        Unit::Seconds,
        "Time spent waiting for the upstream"
    );
    describe_counter!(
        "proxy_upstream_errors_total",
        Unit::Count,
        "Upstream requests that failed with a connect error or timeout"
    );

    // upstream
    describe_gauge!(
        "proxy_clusters_total",
        Unit::Count,
        "Clusters currently configured"
    );
    describe_gauge!(
        "proxy_cluster_hosts",
        Unit::Count,
        "Hosts in the published snapshot of a cluster"
    );
    describe_counter!(
        "proxy_dns_resolutions_total",
        Unit::Count,
        "DNS refresh attempts of STRICT_DNS and LOGICAL_DNS clusters"
    );

    // discovery
    describe_counter!(
        "proxy_xds_updates_total",
        Unit::Count,
        "Discovery resources applied by type and result"
    );
    describe_counter!(
        "proxy_xds_sessions_total",
        Unit::Count,
        "Discovery sessions by outcome"
    );
}

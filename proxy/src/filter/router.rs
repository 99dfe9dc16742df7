use crate::config::FilterConfig;
use crate::error::GatewayError;
use crate::filter::{FactoryContext, FilterStatus, HttpFilter};
use crate::proxy::context::{BoxBody, StreamContext};
use crate::upstream::{Cluster, ClusterManager, SelectContext};
use http::header::{CONNECTION, TRANSFER_ENCODING};
use http::{HeaderName, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub fn build(_config: &FilterConfig, ctx: &FactoryContext) -> Result<HttpFilter, GatewayError> {
    Ok(HttpFilter::Router(Router::new(ctx.clusters.clone())))
}

/// Terminal HTTP filter: route match, cluster resolution, host selection and
/// forwarding.
#[derive(Clone)]
pub struct Router {
    clusters: ClusterManager,
}

impl Router {
    pub fn new(clusters: ClusterManager) -> Self {
        Self { clusters }
    }

    pub async fn decode(&self, stream: &mut StreamContext) -> FilterStatus {
        let Some(req) = stream.request.take() else {
            stream.local_reply(StatusCode::INTERNAL_SERVER_ERROR, "request already forwarded");
            return FilterStatus::Stop;
        };

        let Some(route) = stream.route_config.match_request(&req) else {
            debug!(
                "router: no route matched, route_config={}, path={}",
                stream.route_config.name(),
                req.uri().path()
            );
            stream.local_reply(StatusCode::NOT_FOUND, "no route matched");
            return FilterStatus::Stop;
        };
        stream.cluster_name.clear();
        stream.cluster_name.push_str(&route.cluster);
        stream.route = Some(route.clone());

        let Some(cluster) = self.clusters.get(&route.cluster) else {
            warn!(
                "router: cluster not found, route={}, cluster={}",
                route.name, route.cluster
            );
            stream.local_reply(StatusCode::SERVICE_UNAVAILABLE, "cluster not found");
            return FilterStatus::Stop;
        };

        let select_ctx = SelectContext {
            original_destination: stream.connection.original_destination,
        };
        let host = match cluster.snapshot().select(&select_ctx) {
            Ok(host) => host,
            Err(e) => {
                warn!(
                    "router: no host selected, cluster={}, error={}",
                    route.cluster, e
                );
                stream.local_reply(StatusCode::SERVICE_UNAVAILABLE, "no healthy upstream");
                return FilterStatus::Stop;
            }
        };
        stream.upstream_addr = host.authority();

        let upstream_start = Instant::now();
        stream.upstream_start = Some(upstream_start);
        match forward(&cluster, &stream.upstream_addr, req, route.timeout).await {
            Ok(resp) => {
                stream.response = Some(resp);
                FilterStatus::Continue
            }
            Err(e) => {
                let (status, reason, msg) = match e {
                    GatewayError::UpstreamTimeout => {
                        (StatusCode::GATEWAY_TIMEOUT, "timeout", "upstream timeout")
                    }
                    _ => (StatusCode::BAD_GATEWAY, "connect", "bad gateway"),
                };
                warn!(
                    "router: upstream request failed, cluster={}, upstream={}, elapsed_ms={}, error={}",
                    route.cluster,
                    stream.upstream_addr,
                    upstream_start.elapsed().as_millis(),
                    e
                );
                metrics::counter!(
                    "proxy_upstream_errors_total",
                    "cluster" => route.cluster.clone(),
                    "reason" => reason,
                )
                .increment(1);
                stream.local_reply(status, msg);
                FilterStatus::Stop
            }
        }
    }

    pub fn encode(&self, _stream: &mut StreamContext) -> FilterStatus {
        FilterStatus::Continue
    }
}

/// Send `req` to `upstream`. The Host header is kept; only the URI authority
/// is rewritten.
async fn forward(
    cluster: &Cluster,
    upstream: &str,
    req: Request<BoxBody>,
    timeout: Duration,
) -> Result<Response<BoxBody>, GatewayError> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    // "{scheme}://{addr}{path_and_query}"
    let scheme = cluster.scheme();
    let mut uri = String::with_capacity(scheme.len() + 3 + upstream.len() + path_and_query.len());
    uri.push_str(scheme);
    uri.push_str("://");
    uri.push_str(upstream);
    uri.push_str(path_and_query);

    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);
    if !headers.contains_key(http::header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(v) = http::HeaderValue::from_str(authority.as_str()) {
                headers.insert(http::header::HOST, v);
            }
        }
    }

    let mut builder = Request::builder().method(parts.method).uri(&uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = builder
        .body(body)
        .map_err(|e| GatewayError::Internal(format!("build upstream request: {}", e)))?;

    match tokio::time::timeout(timeout, cluster.http_client().request(upstream_req)).await {
        Ok(Ok(resp)) => Ok(build_downstream_response(resp)),
        Ok(Err(e)) => Err(GatewayError::UpstreamConnect(e.to_string())),
        Err(_) => Err(GatewayError::UpstreamTimeout),
    }
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

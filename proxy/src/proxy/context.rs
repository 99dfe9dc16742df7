use crate::listener::ConnectionContext;
use crate::routing::{RouteConfigMatcher, RouteEntry};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request state shared by the HTTP filters of one connection manager.
pub struct StreamContext {
    /// Taken by the filter that forwards it upstream.
    pub request: Option<Request<BoxBody>>,
    pub response: Option<Response<BoxBody>>,
    pub connection: Arc<ConnectionContext>,
    pub route_config: Arc<RouteConfigMatcher>,
    pub stat_prefix: Arc<str>,
    pub route: Option<Arc<RouteEntry>>,
    pub cluster_name: String,
    pub upstream_addr: String,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl StreamContext {
    pub fn new(
        request: Request<BoxBody>,
        connection: Arc<ConnectionContext>,
        route_config: Arc<RouteConfigMatcher>,
        stat_prefix: Arc<str>,
    ) -> Self {
        Self {
            request: Some(request),
            response: None,
            connection,
            route_config,
            stat_prefix,
            route: None,
            cluster_name: String::new(),
            upstream_addr: String::new(),
            start: Instant::now(),
            upstream_start: None,
        }
    }

    pub fn route_name(&self) -> &str {
        self.route.as_ref().map(|r| r.name.as_str()).unwrap_or("")
    }

    /// Answer the request locally instead of from an upstream.
    pub fn local_reply(&mut self, status: StatusCode, msg: &str) {
        self.response = Some(local_response(status, msg));
    }

    pub fn finalize_metrics(&self, status: StatusCode) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());

        metrics::counter!(
            "proxy_http_requests_total",
            "stat_prefix" => self.stat_prefix.to_string(),
            "cluster" => self.cluster_name.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "proxy_http_request_duration_seconds",
            "stat_prefix" => self.stat_prefix.to_string(),
            "cluster" => self.cluster_name.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "proxy_upstream_request_duration_seconds",
                "cluster" => self.cluster_name.clone(),
                "upstream" => self.upstream_addr.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}

pub fn local_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    let body = serde_json::json!({ "error": msg }).to_string();
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    resp
}

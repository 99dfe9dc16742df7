use crate::error::GatewayError;
use crate::filter::{FilterStatus, HttpFilter};
use crate::listener::ConnectionContext;
use crate::proxy::context::{local_response, BoxBody, StreamContext};
use crate::routing::RouteConfigMatcher;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::Arc;

/// The HTTP filter pipeline of one connection manager.
///
/// Decode runs every filter in registration order until one stops; encode
/// then runs every filter, again in registration order, over the response.
pub struct HttpHandler {
    filters: Vec<HttpFilter>,
}

impl HttpHandler {
    pub fn new(filters: Vec<HttpFilter>) -> Self {
        Self { filters }
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    pub async fn decode(&self, stream: &mut StreamContext) -> Result<(), GatewayError> {
        for filter in &self.filters {
            if filter.decode(stream).await == FilterStatus::Stop {
                return Err(GatewayError::Internal(format!(
                    "http filter {} stopped decoding",
                    filter.name()
                )));
            }
        }
        Ok(())
    }

    pub async fn encode(&self, stream: &mut StreamContext) {
        for filter in &self.filters {
            if filter.encode(stream).await == FilterStatus::Stop {
                break;
            }
        }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        connection: Arc<ConnectionContext>,
        route_config: Arc<RouteConfigMatcher>,
        stat_prefix: Arc<str>,
    ) -> Response<BoxBody> {
        let req = req.map(|body| body.boxed());
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let mut stream = StreamContext::new(req, connection, route_config, stat_prefix);

        if let Err(e) = self.decode(&mut stream).await {
            tracing::debug!("proxy: decode stopped, path={}, reason={}", path, e);
        }
        if stream.response.is_none() {
            stream.local_reply(StatusCode::INTERNAL_SERVER_ERROR, "no response");
        }

        self.encode(&mut stream).await;

        let resp = stream
            .response
            .take()
            .unwrap_or_else(|| local_response(StatusCode::INTERNAL_SERVER_ERROR, "no response"));
        stream.finalize_metrics(resp.status());

        tracing::debug!(
            "proxy: access, method={}, path={}, route={}, cluster={}, upstream={}, status={}, duration_ms={}",
            method,
            path,
            stream.route_name(),
            stream.cluster_name,
            stream.upstream_addr,
            resp.status().as_u16(),
            stream.start.elapsed().as_millis()
        );
        resp
    }
}

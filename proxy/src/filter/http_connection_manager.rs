use crate::config::{FilterConfig, HttpConnectionManagerConfig};
use crate::error::{config_err, GatewayError};
use crate::filter::{FactoryContext, FilterStatus, NetworkFilterFactory};
use crate::listener::{Connection, ConnectionContext};
use crate::proxy::HttpHandler;
use crate::routing::{RouteConfigManager, RouteConfigMatcher};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;

enum RouteSource {
    Inline(Arc<RouteConfigMatcher>),
    Rds {
        name: String,
        routes: RouteConfigManager,
    },
}

/// Built once per filter chain from the typed config.
pub struct HttpConnectionManagerFactory {
    stat_prefix: Arc<str>,
    route_source: RouteSource,
    handler: Arc<HttpHandler>,
}

pub fn build(config: &FilterConfig, ctx: &FactoryContext) -> Result<NetworkFilterFactory, GatewayError> {
    let Some(typed) = config.typed_config.clone() else {
        return Err(config_err(format!("{}: missing typed_config", config.name)));
    };
    let hcm: HttpConnectionManagerConfig = serde_json::from_value(typed)
        .map_err(|e| config_err(format!("{}: {}", config.name, e)))?;
    HttpConnectionManagerFactory::new(&hcm, ctx)
        .map(|f| NetworkFilterFactory::HttpConnectionManager(Arc::new(f)))
}

impl HttpConnectionManagerFactory {
    pub fn new(config: &HttpConnectionManagerConfig, ctx: &FactoryContext) -> Result<Self, GatewayError> {
        let route_source = match (&config.route_config, &config.rds) {
            (Some(inline), _) => RouteSource::Inline(Arc::new(RouteConfigMatcher::build(inline)?)),
            (None, Some(rds)) if !rds.route_config_name.is_empty() => RouteSource::Rds {
                name: rds.route_config_name.clone(),
                routes: ctx.routes.clone(),
            },
            _ => {
                return Err(config_err(format!(
                    "http_connection_manager {}: needs route_config or rds",
                    config.stat_prefix
                )))
            }
        };
        let filters = ctx.registry.build_http_filters(&config.http_filters, ctx)?;
        Ok(Self {
            stat_prefix: Arc::from(config.stat_prefix.as_str()),
            route_source,
            handler: Arc::new(HttpHandler::new(filters)),
        })
    }

    /// RDS name this manager reads its routes from, if any.
    pub fn rds_name(&self) -> Option<&str> {
        match &self.route_source {
            RouteSource::Rds { name, .. } => Some(name),
            RouteSource::Inline(_) => None,
        }
    }

    /// Resolve the route configuration for a new connection. An RDS name
    /// that has not arrived yet fails the connection.
    pub fn create(&self) -> Result<HttpConnectionManager, GatewayError> {
        let route_config = match &self.route_source {
            RouteSource::Inline(m) => m.clone(),
            RouteSource::Rds { name, routes } => routes
                .get(name)
                .ok_or_else(|| config_err(format!("route config not found: {}", name)))?,
        };
        Ok(HttpConnectionManager {
            stat_prefix: self.stat_prefix.clone(),
            route_config,
            handler: self.handler.clone(),
            connection: Arc::new(ConnectionContext::default()),
        })
    }
}

/// Terminal network filter serving HTTP/1.1 on the connection.
pub struct HttpConnectionManager {
    stat_prefix: Arc<str>,
    route_config: Arc<RouteConfigMatcher>,
    handler: Arc<HttpHandler>,
    connection: Arc<ConnectionContext>,
}

impl HttpConnectionManager {
    pub fn on_new_connection(&mut self, ctx: &ConnectionContext) -> FilterStatus {
        self.connection = Arc::new(ctx.clone());
        FilterStatus::Continue
    }

    pub async fn serve(self, conn: Connection) -> Result<(), GatewayError> {
        let peer = conn.peer_addr();
        let Self {
            stat_prefix,
            route_config,
            handler,
            connection,
        } = self;

        let svc = service_fn(move |req| {
            let handler = handler.clone();
            let connection = connection.clone();
            let route_config = route_config.clone();
            let stat_prefix = stat_prefix.clone();
            async move {
                Ok::<_, hyper::Error>(
                    handler
                        .handle(req, connection, route_config, stat_prefix)
                        .await,
                )
            }
        });

        hyper::server::conn::http1::Builder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(conn), svc)
            .await
            .map_err(|e| GatewayError::Internal(format!("http connection from {}: {}", peer, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterRegistry;
    use crate::object::ObjectKind;
    use crate::upstream::ClusterManager;

    fn ctx() -> FactoryContext {
        FactoryContext::new(
            ClusterManager::new(),
            RouteConfigManager::new(),
            FilterRegistry::with_builtin().unwrap(),
        )
    }

    fn hcm(json: serde_json::Value) -> HttpConnectionManagerConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_requires_route_source() {
        let err = HttpConnectionManagerFactory::new(&hcm(serde_json::json!({ "stat_prefix": "in" })), &ctx())
            .err()
            .unwrap();
        assert!(err.to_string().contains("needs route_config or rds"));
    }

    #[test]
    fn test_rds_resolved_per_connection() {
        let ctx = ctx();
        let f = HttpConnectionManagerFactory::new(
            &hcm(serde_json::json!({ "stat_prefix": "in", "rds": { "route_config_name": "80" } })),
            &ctx,
        )
        .unwrap();
        assert_eq!(f.rds_name(), Some("80"));
        assert!(f.create().is_err());

        ctx.routes
            .add_or_update(
                ObjectKind::Dynamic,
                serde_json::from_value(serde_json::json!({ "name": "80", "virtual_hosts": [] })).unwrap(),
            )
            .unwrap();
        assert!(f.create().is_ok());
    }

    #[test]
    fn test_inline_route_config() {
        let f = HttpConnectionManagerFactory::new(
            &hcm(serde_json::json!({
                "stat_prefix": "in",
                "route_config": {
                    "name": "local",
                    "virtual_hosts": [{ "name": "vh", "domains": ["*"],
                        "routes": [{ "match": { "prefix": "/" }, "route": { "cluster": "c" } }] }]
                },
                "http_filters": [{ "name": "envoy.filters.http.router" }]
            })),
            &ctx(),
        )
        .unwrap();
        assert!(f.rds_name().is_none());
        let m = f.create().unwrap();
        assert_eq!(m.route_config.name(), "local");
        assert_eq!(m.handler.filter_count(), 1);
    }

    #[test]
    fn test_bad_typed_config() {
        let cfg: FilterConfig = serde_json::from_value(serde_json::json!({
            "name": "envoy.filters.network.http_connection_manager",
            "typed_config": { "http_filters": 5 }
        }))
        .unwrap();
        assert!(build(&cfg, &ctx()).is_err());
        assert!(build(&FilterConfig::new("envoy.filters.network.http_connection_manager"), &ctx()).is_err());
    }
}

//! Listener, network and HTTP filters.
//!
//! Filters are closed enums: static dispatch, exhaustive match. Which variant
//! a configured filter becomes is decided by the builders registered in a
//! [`FilterRegistry`], built once at startup and shared read-only.

pub mod echo;
pub mod http_connection_manager;
pub mod http_inspector;
pub mod original_dst;
pub mod registry;
pub mod router;
pub mod tls_inspector;

use crate::error::GatewayError;
use crate::listener::{Connection, ConnectionContext};
use crate::proxy::context::StreamContext;
use crate::routing::RouteConfigManager;
use crate::upstream::ClusterManager;
use bytes::BytesMut;
use std::sync::Arc;

pub use echo::EchoFilter;
pub use http_connection_manager::{HttpConnectionManager, HttpConnectionManagerFactory};
pub use registry::FilterRegistry;
pub use router::Router;

/// Result of a filter callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    Stop,
}

pub mod well_known {
    pub const TLS_INSPECTOR: &str = "envoy.filters.listener.tls_inspector";
    pub const ORIGINAL_DST: &str = "envoy.filters.listener.original_dst";
    pub const HTTP_INSPECTOR: &str = "envoy.filters.listener.http_inspector";
    pub const ECHO: &str = "envoy.filters.network.echo";
    pub const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
    pub const ROUTER: &str = "envoy.filters.http.router";

    pub const TLS_INSPECTOR_TYPE: &str =
        "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
    pub const ORIGINAL_DST_TYPE: &str =
        "type.googleapis.com/envoy.extensions.filters.listener.original_dst.v3.OriginalDst";
    pub const HTTP_INSPECTOR_TYPE: &str =
        "type.googleapis.com/envoy.extensions.filters.listener.http_inspector.v3.HttpInspector";
    pub const ECHO_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.network.echo.v3.Echo";
    pub const HTTP_CONNECTION_MANAGER_TYPE: &str =
        "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
    pub const ROUTER_TYPE: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

    pub fn is_well_known(name: &str) -> bool {
        matches!(
            name,
            TLS_INSPECTOR | ORIGINAL_DST | HTTP_INSPECTOR | ECHO | HTTP_CONNECTION_MANAGER | ROUTER
        )
    }
}

/// What filter builders may depend on.
#[derive(Clone)]
pub struct FactoryContext {
    pub clusters: ClusterManager,
    pub routes: RouteConfigManager,
    pub registry: Arc<FilterRegistry>,
}

impl FactoryContext {
    pub fn new(clusters: ClusterManager, routes: RouteConfigManager, registry: FilterRegistry) -> Self {
        Self {
            clusters,
            routes,
            registry: Arc::new(registry),
        }
    }
}

/// Runs once per accepted connection, before filter-chain matching.
#[derive(Debug, Clone)]
pub enum ListenerFilter {
    HttpInspector,
    TlsInspector,
    OriginalDst,
}

impl ListenerFilter {
    pub fn name(&self) -> &'static str {
        match self {
            ListenerFilter::HttpInspector => well_known::HTTP_INSPECTOR,
            ListenerFilter::TlsInspector => well_known::TLS_INSPECTOR,
            ListenerFilter::OriginalDst => well_known::ORIGINAL_DST,
        }
    }

    /// Bytes this filter wants read ahead before `on_accept`.
    pub fn peek_len(&self) -> usize {
        match self {
            ListenerFilter::HttpInspector => http_inspector::PEEK_LEN,
            ListenerFilter::TlsInspector => tls_inspector::PEEK_LEN,
            ListenerFilter::OriginalDst => 0,
        }
    }

    pub fn on_accept(&self, conn: &mut Connection) -> FilterStatus {
        match self {
            ListenerFilter::HttpInspector => http_inspector::on_accept(conn),
            ListenerFilter::TlsInspector => tls_inspector::on_accept(conn),
            ListenerFilter::OriginalDst => original_dst::on_accept(conn),
        }
    }
}

/// Built once per filter chain; creates a fresh [`NetworkFilter`] for every
/// connection the chain admits.
#[derive(Clone)]
pub enum NetworkFilterFactory {
    Echo,
    HttpConnectionManager(Arc<HttpConnectionManagerFactory>),
}

impl NetworkFilterFactory {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkFilterFactory::Echo => well_known::ECHO,
            NetworkFilterFactory::HttpConnectionManager(_) => well_known::HTTP_CONNECTION_MANAGER,
        }
    }

    /// Terminal filters take the connection over and must come last.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NetworkFilterFactory::HttpConnectionManager(_))
    }

    pub fn create(&self) -> Result<NetworkFilter, GatewayError> {
        match self {
            NetworkFilterFactory::Echo => Ok(NetworkFilter::Echo(EchoFilter)),
            NetworkFilterFactory::HttpConnectionManager(f) => {
                Ok(NetworkFilter::HttpConnectionManager(f.create()?))
            }
        }
    }
}

impl std::fmt::Debug for NetworkFilterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-connection network filter instance.
pub enum NetworkFilter {
    Echo(EchoFilter),
    HttpConnectionManager(HttpConnectionManager),
}

impl NetworkFilter {
    pub fn on_new_connection(&mut self, ctx: &ConnectionContext) -> FilterStatus {
        match self {
            NetworkFilter::Echo(_) => FilterStatus::Continue,
            NetworkFilter::HttpConnectionManager(hcm) => hcm.on_new_connection(ctx),
        }
    }

    /// Handle bytes read from the downstream. Bytes appended to `reply` are
    /// written back once every filter has seen `data`.
    pub fn on_data(&mut self, data: &mut BytesMut, reply: &mut BytesMut) -> FilterStatus {
        match self {
            NetworkFilter::Echo(echo) => echo.on_data(data, reply),
            NetworkFilter::HttpConnectionManager(_) => FilterStatus::Continue,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NetworkFilter::HttpConnectionManager(_))
    }

    pub fn into_terminal(self) -> Option<HttpConnectionManager> {
        match self {
            NetworkFilter::HttpConnectionManager(hcm) => Some(hcm),
            NetworkFilter::Echo(_) => None,
        }
    }
}

/// Per-request HTTP filter, shared by every stream of a connection manager.
#[derive(Clone)]
pub enum HttpFilter {
    Router(Router),
}

impl HttpFilter {
    pub fn name(&self) -> &'static str {
        match self {
            HttpFilter::Router(_) => well_known::ROUTER,
        }
    }

    pub async fn decode(&self, stream: &mut StreamContext) -> FilterStatus {
        match self {
            HttpFilter::Router(router) => router.decode(stream).await,
        }
    }

    pub async fn encode(&self, stream: &mut StreamContext) -> FilterStatus {
        match self {
            HttpFilter::Router(router) => router.encode(stream),
        }
    }
}

impl std::fmt::Debug for HttpFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

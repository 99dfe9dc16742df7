use crate::config::BootstrapConfig;
use crate::filter::{FactoryContext, FilterRegistry};
use crate::listener::ListenerManager;
use crate::metrics::Metrics;
use crate::object::ObjectKind;
use crate::routing::RouteConfigManager;
use crate::upstream::ClusterManager;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared proxy state, cheaply cloneable.
///
/// The three registries are written by static loading and the discovery
/// task; the accept loops, HTTP filters and admin server only read them.
#[derive(Clone)]
pub struct ProxyState {
    pub bootstrap: Arc<BootstrapConfig>,
    pub metrics: Metrics,
    pub clusters: ClusterManager,
    pub routes: RouteConfigManager,
    pub listeners: ListenerManager,
    pub factory: FactoryContext,
}

impl ProxyState {
    pub fn new(bootstrap: BootstrapConfig, metrics: Metrics) -> Result<Self> {
        let clusters = ClusterManager::new();
        let routes = RouteConfigManager::new();
        let registry = FilterRegistry::with_builtin()?;
        let factory = FactoryContext::new(clusters.clone(), routes.clone(), registry);
        let listeners = ListenerManager::new(factory.clone());

        Ok(Self {
            bootstrap: Arc::new(bootstrap),
            metrics,
            clusters,
            routes,
            listeners,
            factory,
        })
    }

    /// Build the bootstrap's static clusters, then its static listeners, so
    /// listeners can resolve the clusters they name. Any failure is fatal.
    pub fn load_static_resources(&self) -> Result<()> {
        let resources = &self.bootstrap.static_resources;
        for cluster in &resources.clusters {
            if let Err(e) = self.clusters.add_or_update(cluster.clone()) {
                anyhow::bail!("static cluster '{}': {}", cluster.name, e);
            }
        }
        for listener in &resources.listeners {
            if let Err(e) = self
                .listeners
                .add_or_update(ObjectKind::Static, listener.clone())
            {
                anyhow::bail!("static listener '{}': {}", listener.name, e);
            }
        }
        info!(
            "server: static resources loaded, clusters={}, listeners={}",
            resources.clusters.len(),
            resources.listeners.len()
        );
        Ok(())
    }

    /// Stop accepting on every listener, wait up to `drain_timeout` for
    /// admitted connections, then release cluster background work.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.listeners.stop_all();
        self.listeners.drain(drain_timeout).await;
        self.clusters.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, ListenerConfig};

    fn state(bootstrap: BootstrapConfig) -> ProxyState {
        ProxyState::new(bootstrap, Metrics::unregistered()).unwrap()
    }

    #[tokio::test]
    async fn test_load_static_resources() {
        let mut bootstrap = BootstrapConfig::default();
        bootstrap.static_resources.clusters = vec![serde_json::from_value::<ClusterConfig>(
            serde_json::json!({ "name": "backend" }),
        )
        .unwrap()];
        bootstrap.static_resources.listeners = vec![serde_json::from_value::<ListenerConfig>(
            serde_json::json!({
                "name": "ingress",
                "address": { "socket_address": { "address": "127.0.0.1", "port_value": 0 } },
                "filter_chains": [{ "filters": [{ "name": "envoy.filters.network.echo" }] }]
            }),
        )
        .unwrap()];

        let s = state(bootstrap);
        s.load_static_resources().unwrap();
        assert!(s.clusters.get("backend").is_some());
        assert_eq!(s.listeners.get("ingress").unwrap().kind(), ObjectKind::Static);
        assert!(s.listeners.local_addr("ingress").is_some());

        s.shutdown(Duration::from_millis(100)).await;
        assert!(s.listeners.get("ingress").unwrap().is_stopped());
    }

    #[tokio::test]
    async fn test_bad_static_cluster_is_fatal() {
        let mut bootstrap = BootstrapConfig::default();
        bootstrap.static_resources.clusters = vec![serde_json::from_value::<ClusterConfig>(
            serde_json::json!({ "name": "backend", "type": "MAGIC" }),
        )
        .unwrap()];
        let err = state(bootstrap).load_static_resources().unwrap_err();
        assert!(err.to_string().contains("static cluster 'backend'"));
    }
}

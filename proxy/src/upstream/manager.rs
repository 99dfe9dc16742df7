use crate::config::ClusterConfig;
use crate::error::GatewayError;
use crate::object::ObjectConfig;
use crate::upstream::cluster::{Cluster, ClusterType};
use crate::upstream::host::HostSet;
use dashmap::DashMap;
use std::sync::Arc;

pub type ClusterEntry = ObjectConfig<Arc<Cluster>, ClusterConfig>;

/// Central registry of all live clusters, keyed by name. Thread-safe, cheaply
/// cloneable. Readers never wait on writers of other keys.
#[derive(Clone, Default)]
pub struct ClusterManager {
    clusters: Arc<DashMap<String, ClusterEntry>>,
}

impl ClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cluster from `config` and store it under its name. An existing
    /// cluster of that name is closed after the replacement is in place.
    ///
    /// Replacing an EDS cluster that reads the same service carries its
    /// current hosts over, so the new instance never publishes an empty set
    /// while it waits for the next endpoint push.
    pub fn add_or_update(&self, config: ClusterConfig) -> Result<(), GatewayError> {
        let name = config.name.clone();
        let cluster = Arc::new(Cluster::new(config.clone())?);
        if let Some(hosts) = self.carried_over_hosts(&cluster, &config) {
            tracing::debug!(
                "upstream: carrying endpoints over, name={}, hosts={}",
                name,
                hosts.len()
            );
            cluster.update_hosts(hosts);
        }
        let previous = self
            .clusters
            .insert(name.clone(), ObjectConfig::new(cluster, config));

        match previous {
            Some(old) => {
                old.object.close();
                tracing::info!("upstream: cluster updated, name={}", name);
            }
            None => tracing::info!("upstream: cluster added, name={}", name),
        }
        metrics::gauge!("proxy_clusters_total").set(self.clusters.len() as f64);
        Ok(())
    }

    fn carried_over_hosts(&self, cluster: &Cluster, config: &ClusterConfig) -> Option<HostSet> {
        if cluster.info().cluster_type() != ClusterType::Eds {
            return None;
        }
        let old = self.clusters.get(&config.name)?;
        let previous = old.object.snapshot();
        if previous.info().cluster_type() != ClusterType::Eds
            || old.config.eds_service_name() != config.eds_service_name()
        {
            return None;
        }
        Some(previous.hosts().to_vec())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|e| e.value().object.clone())
    }

    pub fn get_entry(&self, name: &str) -> Option<ClusterEntry> {
        self.clusters.get(name).map(|e| e.value().clone())
    }

    /// Remove a cluster and stop its background work. In-flight requests
    /// holding a snapshot finish against it. Returns whether it existed.
    pub fn delete(&self, name: &str) -> bool {
        let Some((_, entry)) = self.clusters.remove(name) else {
            tracing::info!("upstream: cluster delete ignored (not found), name={}", name);
            return false;
        };
        entry.object.close();
        metrics::gauge!("proxy_clusters_total").set(self.clusters.len() as f64);
        tracing::info!("upstream: cluster deleted, name={}", name);
        true
    }

    /// Replace the host set of an existing cluster.
    pub fn update_cluster_hosts(&self, name: &str, hosts: HostSet) -> Result<(), GatewayError> {
        let cluster = self
            .get(name)
            .ok_or_else(|| GatewayError::ClusterNotFound(name.to_string()))?;
        tracing::debug!(
            "upstream: cluster hosts updated, name={}, hosts={}",
            name,
            hosts.len()
        );
        cluster.update_hosts(hosts);
        Ok(())
    }

    /// Visit a point-in-time copy of the registry. The visitor may call back
    /// into the manager.
    pub fn for_each(&self, mut f: impl FnMut(&str, &ClusterEntry)) {
        let entries: Vec<(String, ClusterEntry)> = self
            .clusters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (name, entry) in &entries {
            f(name, entry);
        }
    }

    /// Names of every cluster whose EDS service name is `service`.
    pub fn clusters_for_eds_service(&self, service: &str) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each(|name, entry| {
            if entry.config.eds_service_name() == service {
                names.push(name.to_string());
            }
        });
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Stop background work of every cluster (shutdown).
    pub fn close_all(&self) {
        self.for_each(|_, entry| entry.object.close());
    }
}

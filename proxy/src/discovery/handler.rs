//! Reconciles complete resource sets pushed by the control plane against the
//! cluster, listener and route managers.

use crate::config::{ClusterConfig, ClusterLoadAssignment, ListenerConfig, RouteConfiguration};
use crate::discovery::client::{DiscoveryResponse, ResourceType, XdsClient};
use crate::error::GatewayError;
use crate::listener::ListenerManager;
use crate::object::ObjectKind;
use crate::routing::RouteConfigManager;
use crate::upstream::host::hosts_from_assignment;
use crate::upstream::ClusterManager;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

/// Names present in sorted `olds` but missing from sorted `news`, in one
/// forward pass over both.
pub fn diff_deleted(olds: &[String], news: &[String]) -> Vec<String> {
    let mut deleted = Vec::new();
    let (mut oi, mut ni) = (0, 0);
    while oi < olds.len() && ni < news.len() {
        match olds[oi].cmp(&news[ni]) {
            std::cmp::Ordering::Equal => {
                oi += 1;
                ni += 1;
            }
            std::cmp::Ordering::Less => {
                deleted.push(olds[oi].clone());
                oi += 1;
            }
            std::cmp::Ordering::Greater => ni += 1,
        }
    }
    deleted.extend(olds[oi..].iter().cloned());
    deleted
}

fn record_update(resource_type: ResourceType, result: &'static str) {
    metrics::counter!(
        "proxy_xds_updates_total",
        "type" => resource_type.as_str(),
        "result" => result,
    )
    .increment(1);
}

/// Decode every resource of a response; undecodable ones are logged and
/// skipped.
fn decode_resources<T: DeserializeOwned>(
    resource_type: ResourceType,
    resources: Vec<serde_json::Value>,
) -> Vec<T> {
    resources
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(
                    "discovery: skipping undecodable resource, type={}, error={}",
                    resource_type.as_str(),
                    e
                );
                record_update(resource_type, "rejected");
                None
            }
        })
        .collect()
}

fn sorted_unique(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names.dedup();
    names
}

/// Discovery state kept across sessions: the last name list seen per
/// resource class.
pub struct XdsHandler {
    clusters: ClusterManager,
    listeners: ListenerManager,
    routes: RouteConfigManager,
    cluster_names: Vec<String>,
    listener_names: Vec<String>,
    route_names: Vec<String>,
}

impl XdsHandler {
    pub fn new(clusters: ClusterManager, listeners: ListenerManager, routes: RouteConfigManager) -> Self {
        Self {
            clusters,
            listeners,
            routes,
            cluster_names: Vec::new(),
            listener_names: Vec::new(),
            route_names: Vec::new(),
        }
    }

    /// First requests of a session: every cluster, then every listener.
    pub fn on_connect(&self, client: &dyn XdsClient) -> Result<(), GatewayError> {
        client.send_cds(Vec::new())?;
        client.send_lds(Vec::new())?;
        debug!("discovery: requested cds and lds on connect");
        Ok(())
    }

    pub fn handle_response(
        &mut self,
        response: DiscoveryResponse,
        client: &dyn XdsClient,
    ) -> Result<(), GatewayError> {
        let Some(resource_type) = ResourceType::from_type_url(&response.type_url) else {
            warn!("discovery: ignoring unknown type, type_url={}", response.type_url);
            return Ok(());
        };
        debug!(
            "discovery: response received, type={}, version={}, resources={}",
            resource_type.as_str(),
            response.version_info,
            response.resources.len()
        );
        match resource_type {
            ResourceType::Cluster => {
                self.handle_cds(decode_resources(resource_type, response.resources), client)
            }
            ResourceType::Listener => {
                self.handle_lds(decode_resources(resource_type, response.resources), client)
            }
            ResourceType::Route => {
                self.handle_rds(decode_resources(resource_type, response.resources));
                Ok(())
            }
            ResourceType::Endpoint => {
                self.handle_eds(decode_resources(resource_type, response.resources));
                Ok(())
            }
        }
    }

    /// Apply a complete cluster set, then ask for the endpoints of its EDS
    /// clusters.
    pub fn handle_cds(
        &mut self,
        mut clusters: Vec<ClusterConfig>,
        client: &dyn XdsClient,
    ) -> Result<(), GatewayError> {
        clusters.sort_by(|a, b| a.name.cmp(&b.name));

        let mut names = Vec::with_capacity(clusters.len());
        let mut eds_names = Vec::new();
        for cluster in clusters {
            let name = cluster.name.clone();
            if cluster.cluster_type == "EDS" {
                eds_names.push(cluster.eds_service_name().to_string());
            }
            match self.clusters.add_or_update(cluster) {
                Ok(()) => {
                    debug!("discovery: cluster added or updated, name={}", name);
                    record_update(ResourceType::Cluster, "ok");
                }
                Err(e) => {
                    error!("discovery: add or update cluster failed, name={}, error={}", name, e);
                    record_update(ResourceType::Cluster, "error");
                }
            }
            names.push(name);
        }

        let names = sorted_unique(names);
        for name in diff_deleted(&self.cluster_names, &names) {
            self.clusters.delete(&name);
        }
        info!("discovery: cds applied, clusters={}", names.len());
        self.cluster_names = names;

        client.send_eds(sorted_unique(eds_names))
    }

    /// Apply a complete listener set, then ask for the route configurations
    /// its connection managers read through RDS.
    pub fn handle_lds(
        &mut self,
        mut listeners: Vec<ListenerConfig>,
        client: &dyn XdsClient,
    ) -> Result<(), GatewayError> {
        listeners.sort_by(|a, b| a.name.cmp(&b.name));

        let mut names = Vec::with_capacity(listeners.len());
        let mut route_names = Vec::new();
        for listener in listeners {
            let name = listener.name.clone();
            match self.listeners.add_or_update(ObjectKind::Dynamic, listener) {
                Ok(()) => {
                    debug!("discovery: listener added or updated, name={}", name);
                    record_update(ResourceType::Listener, "ok");
                }
                Err(e) => {
                    error!("discovery: add or update listener failed, name={}, error={}", name, e);
                    record_update(ResourceType::Listener, "error");
                }
            }
            if let Some(active) = self.listeners.get(&name) {
                route_names.extend(active.runtime().rds_names());
            }
            names.push(name);
        }

        let names = sorted_unique(names);
        for name in diff_deleted(&self.listener_names, &names) {
            self.listeners.delete(&name);
        }
        info!("discovery: lds applied, listeners={}", names.len());
        self.listener_names = names;

        client.send_rds(sorted_unique(route_names))
    }

    pub fn handle_rds(&mut self, mut routes: Vec<RouteConfiguration>) {
        routes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut names = Vec::with_capacity(routes.len());
        for route in routes {
            let name = route.name.clone();
            match self.routes.add_or_update(ObjectKind::Dynamic, route) {
                Ok(()) => {
                    debug!("discovery: route config added or updated, name={}", name);
                    record_update(ResourceType::Route, "ok");
                }
                Err(e) => {
                    error!("discovery: add or update route config failed, name={}, error={}", name, e);
                    record_update(ResourceType::Route, "error");
                }
            }
            names.push(name);
        }

        let names = sorted_unique(names);
        for name in diff_deleted(&self.route_names, &names) {
            self.routes.delete(&name);
        }
        info!("discovery: rds applied, route_configs={}", names.len());
        self.route_names = names;
    }

    /// Replace host sets of existing clusters. Never creates a cluster.
    pub fn handle_eds(&mut self, mut assignments: Vec<ClusterLoadAssignment>) {
        assignments.sort_by(|a, b| a.cluster_name.cmp(&b.cluster_name));

        for cla in assignments {
            let hosts = match hosts_from_assignment(&cla, false) {
                Ok(h) => h,
                Err(e) => {
                    error!("discovery: bad endpoints, cluster={}, error={}", cla.cluster_name, e);
                    record_update(ResourceType::Endpoint, "error");
                    continue;
                }
            };

            let mut targets = self.clusters.clusters_for_eds_service(&cla.cluster_name);
            if targets.is_empty() && self.clusters.get(&cla.cluster_name).is_some() {
                targets.push(cla.cluster_name.clone());
            }
            if targets.is_empty() {
                error!("discovery: endpoints for unknown cluster, cluster={}", cla.cluster_name);
                record_update(ResourceType::Endpoint, "error");
                continue;
            }

            for target in targets {
                match self.clusters.update_cluster_hosts(&target, hosts.clone()) {
                    Ok(()) => record_update(ResourceType::Endpoint, "ok"),
                    Err(e) => {
                        error!("discovery: update hosts failed, cluster={}, error={}", target, e);
                        record_update(ResourceType::Endpoint, "error");
                    }
                }
            }
        }
    }

    pub fn cluster_names(&self) -> &[String] {
        &self.cluster_names
    }

    pub fn listener_names(&self) -> &[String] {
        &self.listener_names
    }

    pub fn route_names(&self) -> &[String] {
        &self.route_names
    }
}

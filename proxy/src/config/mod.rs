pub mod types;


pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl BootstrapConfig {
    /// Load the bootstrap from a `.toml` or `.json` file, apply environment
    /// overrides and validate. When the file does not exist, built-in
    /// defaults are used (admin only, no listeners, no clusters).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: BootstrapConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            BootstrapConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            node = %config.node.id,
            listeners = config.static_resources.listeners.len(),
            clusters = config.static_resources.clusters.len(),
            ads = config.ads().is_some(),
            "loaded bootstrap configuration"
        );
        Ok(config)
    }

    /// Environment overrides for node identity and process-level settings.
    /// Listeners, clusters and routes come from the file or the control plane.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HERMES_NODE_ID") {
            self.node.id = v;
        }
        if let Ok(v) = std::env::var("HERMES_NODE_CLUSTER") {
            self.node.cluster = v;
        }
        if let Ok(v) = std::env::var("HERMES_ADMIN_ADDRESS") {
            match v.parse::<std::net::SocketAddr>() {
                Ok(addr) => {
                    self.admin.address = AddressConfig::new(&addr.ip().to_string(), addr.port());
                }
                Err(e) => {
                    tracing::warn!("config: ignoring HERMES_ADMIN_ADDRESS={}, error={}", v, e);
                }
            }
        }
        if let Ok(v) = std::env::var("HERMES_XDS_REFRESH_DELAY") {
            match (types::parse_duration(&v), self.ads_mut()) {
                (Ok(d), Some(ads)) => ads.refresh_delay = d,
                (Err(e), _) => tracing::warn!("config: ignoring HERMES_XDS_REFRESH_DELAY, {}", e),
                (Ok(_), None) => {}
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.admin.address.to_socket_addr() {
            anyhow::bail!("admin address: {}", e);
        }

        let mut cluster_names = HashSet::new();
        for cluster in &self.static_resources.clusters {
            if cluster.name.is_empty() {
                anyhow::bail!("static cluster with empty name");
            }
            if !cluster_names.insert(cluster.name.as_str()) {
                anyhow::bail!("duplicate static cluster '{}'", cluster.name);
            }
        }

        let mut listener_names = HashSet::new();
        for listener in &self.static_resources.listeners {
            if listener.name.is_empty() {
                anyhow::bail!("static listener with empty name");
            }
            if !listener_names.insert(listener.name.as_str()) {
                anyhow::bail!("duplicate static listener '{}'", listener.name);
            }
            if let Err(e) = listener.address.to_socket_addr() {
                anyhow::bail!("listener '{}': {}", listener.name, e);
            }
        }

        if let Some(ads) = self.ads() {
            if ads.api_type != "REST" {
                anyhow::bail!(
                    "ads_config: api_type '{}' is not supported, use REST",
                    ads.api_type
                );
            }
            let Some(name) = ads.cluster_names.first() else {
                anyhow::bail!("ads_config: cluster_names must name the management server cluster");
            };
            let Some(cluster) = self
                .static_resources
                .clusters
                .iter()
                .find(|c| &c.name == name)
            else {
                anyhow::bail!("ads_config: cluster '{}' is not a static cluster", name);
            };
            if self.ads_server_address_of(cluster).is_none() {
                anyhow::bail!("ads_config: cluster '{}' has no endpoints", name);
            }
        }

        Ok(())
    }

    pub fn ads(&self) -> Option<&AdsConfig> {
        self.dynamic_resources
            .as_ref()
            .and_then(|d| d.ads_config.as_ref())
    }

    fn ads_mut(&mut self) -> Option<&mut AdsConfig> {
        self.dynamic_resources
            .as_mut()
            .and_then(|d| d.ads_config.as_mut())
    }

    /// Base URL of the management server: the first endpoint of the static
    /// cluster named by `ads_config.cluster_names`.
    pub fn ads_server_url(&self) -> Option<String> {
        let ads = self.ads()?;
        let name = ads.cluster_names.first()?;
        let cluster = self
            .static_resources
            .clusters
            .iter()
            .find(|c| &c.name == name)?;
        self.ads_server_address_of(cluster)
    }

    fn ads_server_address_of(&self, cluster: &ClusterConfig) -> Option<String> {
        let endpoint = cluster.load_assignment.as_ref()?.lb_endpoints().next()?;
        let scheme = if cluster.transport_socket.is_some() {
            "https"
        } else {
            "http"
        };
        Some(format!("{}://{}", scheme, endpoint.endpoint.address))
    }
}

use crate::config::RouteConfiguration;
use crate::error::{config_err, GatewayError};
use crate::object::{ObjectConfig, ObjectKind};
use crate::routing::matcher::RouteConfigMatcher;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct RouteEntryObject {
    pub kind: ObjectKind,
    pub matcher: Arc<RouteConfigMatcher>,
}

pub type RouteConfigEntry = ObjectConfig<RouteEntryObject, RouteConfiguration>;

/// Named route configurations (inline ones are not registered here; only
/// those reachable by RDS name).
#[derive(Clone, Default)]
pub struct RouteConfigManager {
    configs: Arc<DashMap<String, RouteConfigEntry>>,
}

impl RouteConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `config` and publish it under its name, replacing any previous
    /// version. A failed compile leaves the previous version in place.
    pub fn add_or_update(
        &self,
        kind: ObjectKind,
        config: RouteConfiguration,
    ) -> Result<(), GatewayError> {
        if config.name.is_empty() {
            return Err(config_err("route configuration without a name"));
        }
        let matcher = Arc::new(RouteConfigMatcher::build(&config)?);
        let name = config.name.clone();
        let routes = matcher.route_count();
        let previous = self.configs.insert(
            name.clone(),
            ObjectConfig::new(RouteEntryObject { kind, matcher }, config),
        );
        tracing::info!(
            "routing: route config {}, name={}, kind={}, routes={}",
            if previous.is_some() { "updated" } else { "added" },
            name,
            kind.as_str(),
            routes
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<RouteConfigMatcher>> {
        self.configs.get(name).map(|e| e.object.matcher.clone())
    }

    pub fn delete(&self, name: &str) -> bool {
        let removed = self.configs.remove(name).is_some();
        if removed {
            tracing::info!("routing: route config deleted, name={}", name);
        }
        removed
    }

    /// Visit a point-in-time copy of the registry.
    pub fn for_each(&self, mut f: impl FnMut(&str, &RouteConfigEntry)) {
        let entries: Vec<(String, RouteConfigEntry)> = self
            .configs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (name, entry) in &entries {
            f(name, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

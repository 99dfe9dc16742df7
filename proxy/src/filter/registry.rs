use crate::config::FilterConfig;
use crate::error::{config_err, GatewayError};
use crate::filter::{
    http_connection_manager, router, well_known, FactoryContext, HttpFilter, ListenerFilter,
    NetworkFilterFactory,
};
use std::collections::HashMap;

pub type ListenerFilterBuilder =
    fn(&FilterConfig, &FactoryContext) -> Result<ListenerFilter, GatewayError>;
pub type NetworkFilterBuilder =
    fn(&FilterConfig, &FactoryContext) -> Result<NetworkFilterFactory, GatewayError>;
pub type HttpFilterBuilder = fn(&FilterConfig, &FactoryContext) -> Result<HttpFilter, GatewayError>;

/// Builders keyed by filter name and by typed-config `@type` URL.
struct BuilderTable<B> {
    kind: &'static str,
    by_name: HashMap<String, B>,
    by_type: HashMap<String, B>,
}

impl<B: Copy> BuilderTable<B> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            by_name: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    fn register(&mut self, name: &str, type_url: &str, builder: B) -> Result<(), GatewayError> {
        if self.by_name.contains_key(name) {
            return Err(config_err(format!(
                "duplicate {} filter name: {}",
                self.kind, name
            )));
        }
        if !type_url.is_empty() && self.by_type.contains_key(type_url) {
            return Err(config_err(format!(
                "duplicate {} filter type: {}",
                self.kind, type_url
            )));
        }
        self.by_name.insert(name.to_string(), builder);
        if !type_url.is_empty() {
            self.by_type.insert(type_url.to_string(), builder);
        }
        Ok(())
    }

    /// `@type` first, then the name. `Ok(None)` means skip.
    fn lookup(&self, config: &FilterConfig) -> Result<Option<B>, GatewayError> {
        if let Some(b) = config.type_url().and_then(|t| self.by_type.get(t)) {
            return Ok(Some(*b));
        }
        if let Some(b) = self.by_name.get(&config.name) {
            return Ok(Some(*b));
        }
        if well_known::is_well_known(&config.name) {
            return Err(config_err(format!(
                "no builder registered for {} filter {}",
                self.kind, config.name
            )));
        }
        tracing::warn!(
            "filter: unknown {} filter skipped, name={}",
            self.kind,
            config.name
        );
        Ok(None)
    }
}

/// Explicit filter factory registry. Populated at startup, then shared
/// read-only through [`FactoryContext`].
pub struct FilterRegistry {
    listener: BuilderTable<ListenerFilterBuilder>,
    network: BuilderTable<NetworkFilterBuilder>,
    http: BuilderTable<HttpFilterBuilder>,
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            listener: BuilderTable::new("listener"),
            network: BuilderTable::new("network"),
            http: BuilderTable::new("http"),
        }
    }

    /// A registry with every built-in filter.
    pub fn with_builtin() -> Result<Self, GatewayError> {
        let mut r = Self::new();
        r.register_listener_filter(well_known::HTTP_INSPECTOR, well_known::HTTP_INSPECTOR_TYPE, |_, _| {
            Ok(ListenerFilter::HttpInspector)
        })?;
        r.register_listener_filter(well_known::TLS_INSPECTOR, well_known::TLS_INSPECTOR_TYPE, |_, _| {
            Ok(ListenerFilter::TlsInspector)
        })?;
        r.register_listener_filter(well_known::ORIGINAL_DST, well_known::ORIGINAL_DST_TYPE, |_, _| {
            Ok(ListenerFilter::OriginalDst)
        })?;
        r.register_network_filter(well_known::ECHO, well_known::ECHO_TYPE, |_, _| {
            Ok(NetworkFilterFactory::Echo)
        })?;
        r.register_network_filter(
            well_known::HTTP_CONNECTION_MANAGER,
            well_known::HTTP_CONNECTION_MANAGER_TYPE,
            http_connection_manager::build,
        )?;
        r.register_http_filter(well_known::ROUTER, well_known::ROUTER_TYPE, router::build)?;
        Ok(r)
    }

    pub fn register_listener_filter(
        &mut self,
        name: &str,
        type_url: &str,
        builder: ListenerFilterBuilder,
    ) -> Result<(), GatewayError> {
        self.listener.register(name, type_url, builder)
    }

    pub fn register_network_filter(
        &mut self,
        name: &str,
        type_url: &str,
        builder: NetworkFilterBuilder,
    ) -> Result<(), GatewayError> {
        self.network.register(name, type_url, builder)
    }

    pub fn register_http_filter(
        &mut self,
        name: &str,
        type_url: &str,
        builder: HttpFilterBuilder,
    ) -> Result<(), GatewayError> {
        self.http.register(name, type_url, builder)
    }

    pub fn build_listener_filters(
        &self,
        configs: &[FilterConfig],
        ctx: &FactoryContext,
    ) -> Result<Vec<ListenerFilter>, GatewayError> {
        let mut filters = Vec::with_capacity(configs.len());
        for config in configs {
            if let Some(builder) = self.listener.lookup(config)? {
                filters.push(builder(config, ctx)?);
            }
        }
        Ok(filters)
    }

    /// Build a chain's network filters. A terminal filter must be last.
    pub fn build_network_filters(
        &self,
        configs: &[FilterConfig],
        ctx: &FactoryContext,
    ) -> Result<Vec<NetworkFilterFactory>, GatewayError> {
        let mut filters: Vec<NetworkFilterFactory> = Vec::with_capacity(configs.len());
        for config in configs {
            if let Some(last) = filters.last() {
                if last.is_terminal() {
                    return Err(config_err(format!(
                        "terminal filter {} must be the last filter in the chain",
                        last.name()
                    )));
                }
            }
            if let Some(builder) = self.network.lookup(config)? {
                filters.push(builder(config, ctx)?);
            }
        }
        Ok(filters)
    }

    pub fn build_http_filters(
        &self,
        configs: &[FilterConfig],
        ctx: &FactoryContext,
    ) -> Result<Vec<HttpFilter>, GatewayError> {
        let mut filters = Vec::with_capacity(configs.len());
        for config in configs {
            if let Some(builder) = self.http.lookup(config)? {
                filters.push(builder(config, ctx)?);
            }
        }
        Ok(filters)
    }
}

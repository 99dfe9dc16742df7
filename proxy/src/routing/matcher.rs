use crate::config::{RouteConfig, RouteConfiguration, VirtualHostConfig};
use crate::error::{config_err, GatewayError};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ROUTE_TIMEOUT: Duration = Duration::from_secs(15);

/// Domain-keyed lookup over virtual hosts.
///
/// Supported patterns, in lookup priority:
/// - `api.example.com`: exact (case-insensitive)
/// - `*.example.com`: suffix wildcard, longest suffix first; needs at least
///   one character before the suffix
/// - `api.*`: prefix wildcard, longest prefix first
/// - `*`: catch-all
///
/// A `*` anywhere else (e.g. `www.*.com`) is rejected at build time.
#[derive(Debug)]
pub struct DomainMatcher<V> {
    exact: HashMap<String, V>,
    suffixes: Vec<(String, V)>,
    prefixes: Vec<(String, V)>,
    any: Option<V>,
}

impl<V> Default for DomainMatcher<V> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            suffixes: Vec::new(),
            prefixes: Vec::new(),
            any: None,
        }
    }
}

impl<V: Clone> DomainMatcher<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pattern: &str, value: V) -> Result<(), GatewayError> {
        let pattern = pattern.to_ascii_lowercase();
        let duplicate = || config_err(format!("duplicate domain: {}", pattern));

        if pattern == "*" {
            if self.any.is_some() {
                return Err(duplicate());
            }
            self.any = Some(value);
            return Ok(());
        }

        let stars = pattern.matches('*').count();
        if stars == 0 {
            if self.exact.contains_key(&pattern) {
                return Err(duplicate());
            }
            self.exact.insert(pattern, value);
            return Ok(());
        }

        if stars == 1 {
            if let Some(suffix) = pattern.strip_prefix('*') {
                if self.suffixes.iter().any(|(s, _)| s == suffix) {
                    return Err(duplicate());
                }
                self.suffixes.push((suffix.to_string(), value));
                self.suffixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
                return Ok(());
            }
            if let Some(prefix) = pattern.strip_suffix('*') {
                if self.prefixes.iter().any(|(p, _)| p == prefix) {
                    return Err(duplicate());
                }
                self.prefixes.push((prefix.to_string(), value));
                self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
                return Ok(());
            }
        }

        Err(config_err(format!(
            "unsupported domain pattern: {}",
            pattern
        )))
    }

    /// Look up a host. Exact entries are tried with and without a port;
    /// wildcards see the host without its port.
    pub fn find(&self, host: &str) -> Option<&V> {
        let host = host.to_ascii_lowercase();
        if let Some(v) = self.exact.get(&host) {
            return Some(v);
        }
        let bare = strip_port(&host).unwrap_or(&host);
        if let Some(v) = self.exact.get(bare) {
            return Some(v);
        }
        for (suffix, v) in &self.suffixes {
            if bare.len() > suffix.len() && bare.ends_with(suffix.as_str()) {
                return Some(v);
            }
        }
        for (prefix, v) in &self.prefixes {
            if bare.len() > prefix.len() && bare.starts_with(prefix.as_str()) {
                return Some(v);
            }
        }
        self.any.as_ref()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.suffixes.len() + self.prefixes.len() + usize::from(self.any.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn strip_port(host: &str) -> Option<&str> {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        let end = rest.find(']')?;
        return rest[end + 1..].starts_with(':').then(|| &host[..end + 2]);
    }
    let (bare, port) = host.rsplit_once(':')?;
    (!bare.contains(':') && port.bytes().all(|b| b.is_ascii_digit())).then_some(bare)
}

#[derive(Debug)]
enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl PathMatch {
    fn from_config(route: &RouteConfig) -> Result<Self, GatewayError> {
        let m = &route.route_match;
        if let Some(path) = &m.path {
            return Ok(PathMatch::Exact(path.clone()));
        }
        if let Some(prefix) = &m.prefix {
            return Ok(PathMatch::Prefix(prefix.clone()));
        }
        if let Some(re) = &m.safe_regex {
            let anchored = format!("^(?:{})$", re.regex);
            return Regex::new(&anchored)
                .map(PathMatch::Regex)
                .map_err(|e| config_err(format!("route {}: bad regex: {}", route.name, e)));
        }
        Err(config_err(format!(
            "route {}: match needs path, prefix or safe_regex",
            route.name
        )))
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(p) => path == p,
            PathMatch::Prefix(p) => path.starts_with(p.as_str()),
            PathMatch::Regex(re) => re.is_match(path),
        }
    }
}

/// The routing decision for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub name: String,
    pub virtual_host: String,
    pub cluster: String,
    pub timeout: Duration,
}

#[derive(Debug)]
struct RouteRule {
    path: PathMatch,
    entry: Arc<RouteEntry>,
}

#[derive(Debug)]
pub struct VirtualHost {
    name: String,
    rules: Vec<RouteRule>,
}

impl VirtualHost {
    fn build(config: &VirtualHostConfig) -> Result<Self, GatewayError> {
        let mut rules = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            if route.redirect.is_some() || route.direct_response.is_some() {
                return Err(config_err(format!(
                    "route {} in {}: only route-to-cluster actions are supported",
                    route.name, config.name
                )));
            }
            let Some(action) = route.route.as_ref() else {
                return Err(config_err(format!(
                    "route {} in {}: missing route action",
                    route.name, config.name
                )));
            };
            let Some(cluster) = action.cluster.as_ref().filter(|c| !c.is_empty()) else {
                return Err(config_err(format!(
                    "route {} in {}: only route-to-cluster actions are supported",
                    route.name, config.name
                )));
            };
            rules.push(RouteRule {
                path: PathMatch::from_config(route)?,
                entry: Arc::new(RouteEntry {
                    name: route.name.clone(),
                    virtual_host: config.name.clone(),
                    cluster: cluster.clone(),
                    timeout: action.timeout.unwrap_or(DEFAULT_ROUTE_TIMEOUT),
                }),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            rules,
        })
    }

    /// First declared rule matching `path` wins.
    pub fn match_path(&self, path: &str) -> Option<&Arc<RouteEntry>> {
        self.rules
            .iter()
            .find(|r| r.path.matches(path))
            .map(|r| &r.entry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Compiled form of one route configuration.
#[derive(Debug)]
pub struct RouteConfigMatcher {
    name: String,
    domains: DomainMatcher<Arc<VirtualHost>>,
    route_count: usize,
}

impl RouteConfigMatcher {
    pub fn build(config: &RouteConfiguration) -> Result<Self, GatewayError> {
        let mut domains = DomainMatcher::new();
        let mut route_count = 0;
        for vh in &config.virtual_hosts {
            let compiled = Arc::new(VirtualHost::build(vh)?);
            route_count += compiled.rules.len();
            for domain in &vh.domains {
                domains.insert(domain, compiled.clone())?;
            }
        }
        tracing::debug!(
            "routing: compiled route config, name={}, domains={}, routes={}",
            config.name,
            domains.len(),
            route_count
        );
        Ok(Self {
            name: config.name.clone(),
            domains,
            route_count,
        })
    }

    pub fn match_route(&self, host: &str, path: &str) -> Option<Arc<RouteEntry>> {
        self.domains.find(host)?.match_path(path).cloned()
    }

    /// Match on the Host header (or the URI authority for absolute-form
    /// requests) and the request path.
    pub fn match_request<B>(&self, req: &http::Request<B>) -> Option<Arc<RouteEntry>> {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or("");
        self.match_route(host, req.uri().path())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route_count(&self) -> usize {
        self.route_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_config(json: serde_json::Value) -> RouteConfiguration {
        serde_json::from_value(json).unwrap()
    }

    fn bookinfo() -> RouteConfiguration {
        route_config(serde_json::json!({
            "name": "9080",
            "virtual_hosts": [
                {
                    "name": "reviews",
                    "domains": ["reviews", "reviews.default.svc.cluster.local"],
                    "routes": [
                        { "name": "exact", "match": { "path": "/foo" }, "route": { "cluster": "reviews-v1" } },
                        { "name": "api", "match": { "prefix": "/api/" }, "route": { "cluster": "reviews-v2", "timeout": "2s" } },
                        { "name": "all", "match": { "prefix": "/" }, "route": { "cluster": "reviews-v3" } }
                    ]
                },
                {
                    "name": "ratings",
                    "domains": ["*.ratings.com", "ratings.*"],
                    "routes": [
                        { "name": "re", "match": { "safe_regex": { "regex": "/r/[0-9]+" } }, "route": { "cluster": "ratings" } }
                    ]
                },
                {
                    "name": "fallback",
                    "domains": ["*"],
                    "routes": [ { "match": { "prefix": "/" }, "route": { "cluster": "passthrough" } } ]
                }
            ]
        }))
    }

    fn domains(patterns: &[&str]) -> DomainMatcher<String> {
        let mut m = DomainMatcher::new();
        for p in patterns {
            m.insert(p, p.to_string()).unwrap();
        }
        m
    }

    #[test]
    fn test_suffix_wildcard() {
        let m = domains(&["*.foo.com"]);
        assert_eq!(m.find("www.foo.com").map(String::as_str), Some("*.foo.com"));
        assert_eq!(m.find("go.foo.com").map(String::as_str), Some("*.foo.com"));
        assert!(m.find("foo.com").is_none());
    }

    #[test]
    fn test_prefix_wildcard() {
        let m = domains(&["foo.*"]);
        assert_eq!(m.find("foo.org").map(String::as_str), Some("foo.*"));
        assert!(m.find("bar.foo.org").is_none());
    }

    #[test]
    fn test_mid_wildcard_rejected() {
        let mut m = DomainMatcher::new();
        assert!(m.insert("www.*.com", ()).is_err());
        assert!(m.insert("*foo*", ()).is_err());
    }

    #[test]
    fn test_domain_priority() {
        let m = domains(&["*", "api.*", "*.example.com", "*.api.example.com", "api.example.com"]);
        assert_eq!(m.find("api.example.com").map(String::as_str), Some("api.example.com"));
        assert_eq!(m.find("v1.api.example.com").map(String::as_str), Some("*.api.example.com"));
        assert_eq!(m.find("www.example.com").map(String::as_str), Some("*.example.com"));
        assert_eq!(m.find("api.other.org").map(String::as_str), Some("api.*"));
        assert_eq!(m.find("anything").map(String::as_str), Some("*"));
    }

    #[test]
    fn test_domain_case_and_port() {
        let m = domains(&["Reviews", "ratings:9080"]);
        assert!(m.find("REVIEWS").is_some());
        assert!(m.find("reviews:9080").is_some());
        assert!(m.find("ratings:9080").is_some());
        assert!(m.find("ratings").is_none());
        assert_eq!(strip_port("[::1]:80"), Some("[::1]"));
        assert_eq!(strip_port("::1"), None);
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let mut m = DomainMatcher::new();
        m.insert("a.com", 1).unwrap();
        assert!(m.insert("A.com", 2).is_err());
        m.insert("*", 1).unwrap();
        assert!(m.insert("*", 2).is_err());
    }

    #[test]
    fn test_path_rules_first_match_wins() {
        let rc = RouteConfigMatcher::build(&bookinfo()).unwrap();
        assert_eq!(rc.route_count(), 5);

        let hit = |host: &str, path: &str| rc.match_route(host, path).map(|e| e.cluster.clone());
        assert_eq!(hit("reviews", "/foo").as_deref(), Some("reviews-v1"));
        assert_eq!(hit("reviews", "/foo/bar").as_deref(), Some("reviews-v3"));
        assert_eq!(hit("reviews", "/api/x").as_deref(), Some("reviews-v2"));
        assert_eq!(hit("reviews:9080", "/anything").as_deref(), Some("reviews-v3"));
        assert_eq!(hit("v1.ratings.com", "/r/42").as_deref(), Some("ratings"));
        assert_eq!(hit("ratings.org", "/r/42").as_deref(), Some("ratings"));
        assert_eq!(hit("ratings.org", "/r/42/x"), None);
        assert_eq!(hit("details", "/").as_deref(), Some("passthrough"));
    }

    #[test]
    fn test_route_entry_fields() {
        let rc = RouteConfigMatcher::build(&bookinfo()).unwrap();
        let e = rc.match_route("reviews", "/api/v1").unwrap();
        assert_eq!(e.name, "api");
        assert_eq!(e.virtual_host, "reviews");
        assert_eq!(e.timeout, Duration::from_secs(2));
        let e = rc.match_route("reviews", "/foo").unwrap();
        assert_eq!(e.timeout, DEFAULT_ROUTE_TIMEOUT);
    }

    #[test]
    fn test_no_match() {
        let rc = RouteConfigMatcher::build(&route_config(serde_json::json!({
            "name": "r",
            "virtual_hosts": [{
                "name": "vh", "domains": ["a.com"],
                "routes": [{ "match": { "path": "/only" }, "route": { "cluster": "c" } }]
            }]
        })))
        .unwrap();
        assert!(rc.match_route("b.com", "/only").is_none());
        assert!(rc.match_route("a.com", "/other").is_none());
    }

    #[test]
    fn test_match_request_uses_host_header() {
        let rc = RouteConfigMatcher::build(&bookinfo()).unwrap();
        let req = http::Request::builder()
            .uri("/foo")
            .header("host", "reviews.default.svc.cluster.local")
            .body(())
            .unwrap();
        assert_eq!(rc.match_request(&req).unwrap().cluster, "reviews-v1");

        let req = http::Request::builder()
            .uri("http://reviews/api/z")
            .body(())
            .unwrap();
        assert_eq!(rc.match_request(&req).unwrap().cluster, "reviews-v2");
    }

    #[test]
    fn test_unsupported_actions_rejected() {
        for route in [
            serde_json::json!({ "match": { "prefix": "/" }, "redirect": { "host_redirect": "x" } }),
            serde_json::json!({ "match": { "prefix": "/" }, "direct_response": { "status": 200 } }),
            serde_json::json!({ "match": { "prefix": "/" } }),
            serde_json::json!({ "match": { "prefix": "/" }, "route": { "timeout": "1s" } }),
            serde_json::json!({ "match": {}, "route": { "cluster": "c" } }),
            serde_json::json!({ "match": { "safe_regex": { "regex": "(" } }, "route": { "cluster": "c" } }),
        ] {
            let rc = route_config(serde_json::json!({
                "name": "r",
                "virtual_hosts": [{ "name": "vh", "domains": ["*"], "routes": [route] }]
            }));
            assert!(RouteConfigMatcher::build(&rc).is_err());
        }
    }

    #[test]
    fn test_duplicate_domain_across_virtual_hosts_rejected() {
        let rc = route_config(serde_json::json!({
            "name": "r",
            "virtual_hosts": [
                { "name": "a", "domains": ["x.com"], "routes": [] },
                { "name": "b", "domains": ["x.com"], "routes": [] }
            ]
        }));
        let err = RouteConfigMatcher::build(&rc).unwrap_err();
        assert!(err.to_string().contains("duplicate domain"));
    }
}

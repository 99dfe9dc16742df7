pub mod manager;
pub mod matcher;

pub use manager::{RouteConfigEntry, RouteConfigManager};
pub use matcher::{DomainMatcher, RouteConfigMatcher, RouteEntry, VirtualHost, DEFAULT_ROUTE_TIMEOUT};

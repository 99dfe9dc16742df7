pub mod cluster;
pub mod host;
pub mod loadbalance;
pub mod manager;

pub use cluster::{Cluster, ClusterInfo, ClusterSnapshot, ClusterType, UpstreamClient};
pub use host::{Host, HostAddress, HostSet, DEFAULT_WEIGHT};
pub use loadbalance::{LbPolicy, LoadBalancer, SelectContext};
pub use manager::{ClusterEntry, ClusterManager};

pub mod original_dst;
pub mod random;
pub mod round_robin;

use crate::error::{config_err, GatewayError};
use crate::upstream::host::Host;
use original_dst::OriginalDstBalancer;
use random::WeightedRandom;
use round_robin::SmoothRoundRobin;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbPolicy {
    RoundRobin,
    Random,
    OriginalDst,
}

impl LbPolicy {
    /// Map a configured `lb_policy`. `CLUSTER_PROVIDED` is only meaningful for
    /// clusters that bring their own balancer and is resolved by the caller.
    pub fn from_config(name: &str) -> Result<Self, GatewayError> {
        match name {
            "" | "ROUND_ROBIN" => Ok(LbPolicy::RoundRobin),
            "RANDOM" => Ok(LbPolicy::Random),
            other => Err(config_err(format!("unsupported lb_policy: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LbPolicy::RoundRobin => "ROUND_ROBIN",
            LbPolicy::Random => "RANDOM",
            LbPolicy::OriginalDst => "CLUSTER_PROVIDED",
        }
    }
}

/// Per-request facts a balancer may consult.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectContext {
    pub original_destination: Option<SocketAddr>,
}

/// Selection policy over a fixed host set. A new balancer is built for every
/// host set; it never sees membership changes.
pub enum LoadBalancer {
    RoundRobin(SmoothRoundRobin),
    Random(WeightedRandom),
    OriginalDst(OriginalDstBalancer),
}

impl LoadBalancer {
    pub fn new(policy: LbPolicy, hosts: &[Host]) -> Self {
        match policy {
            LbPolicy::RoundRobin => Self::RoundRobin(SmoothRoundRobin::new(hosts)),
            LbPolicy::Random => Self::Random(WeightedRandom::new(hosts)),
            LbPolicy::OriginalDst => Self::OriginalDst(OriginalDstBalancer),
        }
    }

    /// Pick a host. An empty host set yields `GatewayError::NoUpstream`.
    pub fn select(&self, ctx: &SelectContext) -> Result<Host, GatewayError> {
        match self {
            Self::RoundRobin(lb) => lb.select(),
            Self::Random(lb) => lb.select(),
            Self::OriginalDst(lb) => lb.select(ctx),
        }
    }

    pub fn policy(&self) -> LbPolicy {
        match self {
            Self::RoundRobin(_) => LbPolicy::RoundRobin,
            Self::Random(_) => LbPolicy::Random,
            Self::OriginalDst(_) => LbPolicy::OriginalDst,
        }
    }
}

use crate::error::GatewayError;
use crate::upstream::host::{Host, DEFAULT_WEIGHT};
use crate::upstream::loadbalance::SelectContext;

/// Forwards to the downstream connection's pre-redirect destination.
/// The cluster's own host set is not consulted.
pub struct OriginalDstBalancer;

impl OriginalDstBalancer {
    pub fn select(&self, ctx: &SelectContext) -> Result<Host, GatewayError> {
        ctx.original_destination
            .map(|addr| Host::socket(addr, DEFAULT_WEIGHT))
            .ok_or(GatewayError::NoUpstream)
    }
}

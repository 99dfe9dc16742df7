use crate::error::GatewayError;
use crate::upstream::host::Host;
use std::sync::Mutex;

/// Smooth weighted round robin (the nginx algorithm).
///
/// Every pick adds each host's weight to its running step, takes the host with
/// the largest step (first one on ties) and subtracts the total weight from it.
/// Steps are shared between callers, so selection holds a lock.
pub struct SmoothRoundRobin {
    hosts: Vec<Host>,
    steps: Mutex<Vec<i64>>,
    total_weight: i64,
}

impl SmoothRoundRobin {
    pub fn new(hosts: &[Host]) -> Self {
        let total_weight = hosts.iter().map(|h| h.weight() as i64).sum();
        Self {
            hosts: hosts.to_vec(),
            steps: Mutex::new(vec![0; hosts.len()]),
            total_weight,
        }
    }

    pub fn select(&self) -> Result<Host, GatewayError> {
        if self.hosts.is_empty() {
            return Err(GatewayError::NoUpstream);
        }

        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        let mut best = 0;
        for (i, host) in self.hosts.iter().enumerate() {
            steps[i] += host.weight() as i64;
            if steps[i] > steps[best] {
                best = i;
            }
        }
        steps[best] -= self.total_weight;

        Ok(self.hosts[best].clone())
    }
}

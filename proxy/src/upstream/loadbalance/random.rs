use crate::error::GatewayError;
use crate::upstream::host::Host;
use rand::Rng;

/// Weighted Random using prefix sum + binary search.
pub struct WeightedRandom {
    hosts: Vec<Host>,
    prefix_sum: Vec<u64>,
    total_weight: u64,
}

impl WeightedRandom {
    pub fn new(hosts: &[Host]) -> Self {
        let mut prefix_sum = Vec::with_capacity(hosts.len());
        let mut sum: u64 = 0;
        for host in hosts {
            sum += host.weight().max(1) as u64;
            prefix_sum.push(sum);
        }
        Self {
            hosts: hosts.to_vec(),
            prefix_sum,
            total_weight: sum,
        }
    }

    pub fn select(&self) -> Result<Host, GatewayError> {
        if self.total_weight == 0 {
            return Err(GatewayError::NoUpstream);
        }
        let target = rand::thread_rng().gen_range(0..self.total_weight);
        let idx = self.prefix_sum.partition_point(|&s| s <= target);
        Ok(self.hosts[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn host(port: u16, weight: u32) -> Host {
        Host::socket(SocketAddr::from(([10, 0, 0, 1], port)), weight)
    }

    #[test]
    fn test_weighted_distribution() {
        let lb = WeightedRandom::new(&[host(1, 2), host(2, 3)]);
        let mut counts = HashMap::new();
        for _ in 0..10_000 {
            let h = lb.select().unwrap();
            *counts.entry(h.socket_addr().unwrap().port()).or_insert(0) += 1;
        }
        let a = *counts.get(&1).unwrap_or(&0);
        let b = *counts.get(&2).unwrap_or(&0);
        assert!((3600..4400).contains(&a), "A count: {}", a);
        assert!((5600..6400).contains(&b), "B count: {}", b);
    }

    #[test]
    fn test_empty() {
        let lb = WeightedRandom::new(&[]);
        assert!(matches!(lb.select(), Err(GatewayError::NoUpstream)));
    }

    #[test]
    fn test_single() {
        let lb = WeightedRandom::new(&[host(1, 100)]);
        for _ in 0..100 {
            assert_eq!(lb.select().unwrap().socket_addr().unwrap().port(), 1);
        }
    }
}

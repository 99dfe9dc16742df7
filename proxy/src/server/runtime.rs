//! Worker-thread sizing that respects container CPU limits.
//!
//! Without it tokio sizes its pool by the host CPU count, which
//! over-provisions threads when a pod is limited to a few cores of a large
//! node.

use std::path::Path;

const CGROUP_V2_CPU_MAX: &str = "/sys/fs/cgroup/cpu.max";
const CGROUP_V1_QUOTA: &str = "/sys/fs/cgroup/cpu/cpu.cfs_quota_us";
const CGROUP_V1_PERIOD: &str = "/sys/fs/cgroup/cpu/cpu.cfs_period_us";

/// Where the worker count came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuLimitSource {
    Env,
    CgroupV2,
    CgroupV1,
    Host,
}

impl CpuLimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuLimitSource::Env => "HERMES_CPU_LIMIT",
            CpuLimitSource::CgroupV2 => "cgroup v2",
            CpuLimitSource::CgroupV1 => "cgroup v1",
            CpuLimitSource::Host => "host",
        }
    }
}

/// Number of worker threads for the runtime, at least 1. Partial cores
/// round up, so a 500m limit still gets one thread.
///
/// Order: `HERMES_CPU_LIMIT` ("4" or "2500m"), cgroup v2 `cpu.max`, cgroup v1
/// CFS quota, host parallelism.
pub fn worker_threads() -> (usize, CpuLimitSource) {
    if let Some(threads) = std::env::var("HERMES_CPU_LIMIT")
        .ok()
        .and_then(|v| parse_cpu_limit(&v))
    {
        return (threads, CpuLimitSource::Env);
    }

    if let Some(threads) = read(CGROUP_V2_CPU_MAX).and_then(|s| parse_cpu_max(&s)) {
        return (threads, CpuLimitSource::CgroupV2);
    }

    if let (Some(quota), Some(period)) = (read(CGROUP_V1_QUOTA), read(CGROUP_V1_PERIOD)) {
        let quota = quota.trim().parse::<i64>().ok();
        let period = period.trim().parse::<i64>().ok();
        if let Some(threads) = quota.zip(period).and_then(|(q, p)| threads_for_quota(q, p)) {
            return (threads, CpuLimitSource::CgroupV1);
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (threads, CpuLimitSource::Host)
}

fn read(path: &str) -> Option<String> {
    std::fs::read_to_string(Path::new(path)).ok()
}

/// "4" cores or "2500m" millicores.
fn parse_cpu_limit(value: &str) -> Option<usize> {
    let value = value.trim();
    let millis = match value.strip_suffix('m') {
        Some(m) => m.parse::<i64>().ok()?,
        None => value.parse::<i64>().ok()?.checked_mul(1000)?,
    };
    threads_for_quota(millis, 1000)
}

/// cgroup v2 `cpu.max`: "<quota> <period>", or "max <period>" for unlimited.
fn parse_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?.parse::<i64>().ok()?;
    if quota == "max" {
        return None;
    }
    threads_for_quota(quota.parse().ok()?, period)
}

fn threads_for_quota(quota: i64, period: i64) -> Option<usize> {
    if quota <= 0 || period <= 0 {
        return None;
    }
    let threads = (quota + period - 1) / period;
    Some(threads.max(1) as usize)
}

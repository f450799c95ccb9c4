use std::collections::HashMap;

/// Per-host load sample fed in by the stats collector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostStats {
    /// CPU utilization, 0.0..=1.0.
    pub cpu: f64,
    /// Memory utilization, 0.0..=1.0.
    pub mem: f64,
    /// Average stored item size in bytes.
    pub avg_item_size: u64,
    /// Virtual nodes currently served by the host.
    pub vnode_count: u64,
}

impl HostStats {
    /// Estimated bytes the host currently carries.
    pub fn projected_size(&self) -> u64 {
        self.avg_item_size.saturating_mul(self.vnode_count)
    }
}

const SMOOTHING: f64 = 0.16;

/// Exponential moving average of cluster-wide cpu/mem utilization.
///
/// Only consulted by the load-based swap passes, which are disabled by
/// default; the average is maintained regardless so enabling them starts
/// from warm state.
#[derive(Debug, Clone, Default)]
pub struct LoadAverages {
    cpu: f64,
    mem: f64,
    primed: bool,
}

impl LoadAverages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, stats: &HashMap<u32, HostStats>) {
        if stats.is_empty() {
            return;
        }
        let n = stats.len() as f64;
        let cpu = stats.values().map(|s| s.cpu).sum::<f64>() / n;
        let mem = stats.values().map(|s| s.mem).sum::<f64>() / n;
        if !self.primed {
            self.cpu = cpu;
            self.mem = mem;
            self.primed = true;
            return;
        }
        self.cpu = SMOOTHING * cpu + (1.0 - SMOOTHING) * self.cpu;
        self.mem = SMOOTHING * mem + (1.0 - SMOOTHING) * self.mem;
    }

    pub fn cpu(&self) -> f64 {
        self.cpu
    }

    pub fn mem(&self) -> f64 {
        self.mem
    }
}

//! # Resource Monitor
//!
//! Samples live CPU/RAM/disk statistics on a fixed cadence and publishes
//! the last-known snapshot for admission checks, offers, and `/status`.
//!
//! Effective promised capacity is derived from hardware, not from the
//! CLI flag: `physical_cores * max_ghz * 1000 + ram_gb * 100`.

use chrono::Utc;
use parking_lot::RwLock;
use sysinfo::{Disks, System};

use edgemesh_common::SystemStats;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Sampling cadence.
pub const SAMPLE_INTERVAL_SECS: u64 = 60;

/// Holds the latest host snapshot.
pub struct ResourceMonitor {
    system: parking_lot::Mutex<System>,
    latest: RwLock<SystemStats>,
}

impl ResourceMonitor {
    /// Creates the monitor and takes the first sample synchronously so
    /// a snapshot exists before any admission check can run.
    pub fn new() -> Self {
        let mut system = System::new_all();
        let latest = sample(&mut system);
        Self {
            system: parking_lot::Mutex::new(system),
            latest: RwLock::new(latest),
        }
    }

    /// Takes a fresh sample and publishes it.
    pub fn refresh(&self) {
        let stats = {
            let mut system = self.system.lock();
            sample(&mut system)
        };
        *self.latest.write() = stats;
    }

    /// Last-known snapshot.
    pub fn latest(&self) -> SystemStats {
        self.latest.read().clone()
    }

    /// Hardware-derived promised capacity:
    /// `physical_cores * max_ghz * 1000 + ram_gb * 100`, truncated.
    pub fn derived_capacity(&self) -> u64 {
        let (cores, max_mhz, total_mem) = {
            let system = self.system.lock();
            let cores = system.physical_core_count().unwrap_or(1) as f64;
            let max_mhz = system
                .cpus()
                .iter()
                .map(|c| c.frequency())
                .max()
                .unwrap_or(0) as f64;
            (cores, max_mhz, system.total_memory() as f64)
        };
        let max_ghz = max_mhz / 1000.0;
        let ram_gb = total_mem / BYTES_PER_GB;
        (cores * max_ghz * 1000.0 + ram_gb * 100.0) as u64
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn sample(system: &mut System) -> SystemStats {
    system.refresh_cpu();
    system.refresh_memory();

    let total_memory = system.total_memory() as f64;
    let available_memory = system.available_memory() as f64;
    let memory_used_percent = if total_memory > 0.0 {
        (1.0 - available_memory / total_memory) * 100.0
    } else {
        0.0
    };

    // Root mount (largest disk as a fallback on exotic layouts).
    let disks = Disks::new_with_refreshed_list();
    let (disk_total, disk_free) = disks
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.iter().max_by_key(|d| d.total_space()))
        .map(|d| (d.total_space() as f64, d.available_space() as f64))
        .unwrap_or((0.0, 0.0));
    let disk_used_percent = if disk_total > 0.0 {
        (1.0 - disk_free / disk_total) * 100.0
    } else {
        0.0
    };

    SystemStats {
        cpu_percent: system.global_cpu_info().cpu_usage() as f64,
        cpu_cores_physical: system.physical_core_count().unwrap_or(0) as u32,
        cpu_cores_logical: system.cpus().len() as u32,
        memory_total_gb: round2(total_memory / BYTES_PER_GB),
        memory_available_gb: round2(available_memory / BYTES_PER_GB),
        memory_used_percent: round2(memory_used_percent),
        disk_total_gb: round2(disk_total / BYTES_PER_GB),
        disk_free_gb: round2(disk_free / BYTES_PER_GB),
        disk_used_percent: round2(disk_used_percent),
        timestamp_utc: Utc::now(),
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_available_immediately() {
        let monitor = ResourceMonitor::new();
        let stats = monitor.latest();
        assert!(stats.cpu_cores_logical >= 1);
        assert!(stats.memory_total_gb > 0.0);
    }

    #[test]
    fn test_refresh_updates_timestamp() {
        let monitor = ResourceMonitor::new();
        let before = monitor.latest().timestamp_utc;
        monitor.refresh();
        let after = monitor.latest().timestamp_utc;
        assert!(after >= before);
    }

    #[test]
    fn test_derived_capacity_positive() {
        let monitor = ResourceMonitor::new();
        // RAM alone contributes on any real host.
        assert!(monitor.derived_capacity() > 0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.005), 1.0); // floating representation of 1.005
        assert_eq!(round2(2.345_001), 2.35);
        assert_eq!(round2(0.0), 0.0);
    }
}

//! Versioned snapshot data model streamed to subscribers.
//!
//! Every sequence field is a plain `Vec` so it serializes as `[]` when
//! nothing was collected; consumers rely on never seeing `null` there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of entries kept in [`Snapshot::top_processes`].
pub const TOP_PROCESS_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: Metadata,
    pub cpu: Cpu,
    pub memory: Memory,
    pub disks: Vec<Disk>,
    pub networks: Vec<Network>,
    pub top_processes: Vec<Process>,
    pub containers: Vec<Container>,
    pub gpus: Vec<Gpu>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub hostname: String,
    pub os_type: String,
    pub agent_version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cpu {
    pub global_usage_percent: f64,
    /// Indexed by core id.
    pub core_usage: Vec<f64>,
    pub temperature_c: f64,
    pub power_draw_w: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub swap_used_mb: u64,
}

impl Memory {
    pub fn used_percent(&self) -> f64 {
        if self.total_mb == 0 {
            return 0.0;
        }
        self.used_mb as f64 / self.total_mb as f64 * 100.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub mount_point: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub read_bytes_sec: u64,
    pub write_bytes_sec: u64,
}

impl Disk {
    pub fn used_percent(&self) -> f64 {
        if self.total_gb <= 0.0 {
            return 0.0;
        }
        self.used_gb / self.total_gb * 100.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub interface: String,
    pub rx_bytes_sec: u64,
    pub tx_bytes_sec: u64,
    pub active_connections: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u32,
    pub name: String,
    pub user: String,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gpu {
    pub vendor: String,
    pub model: String,
    pub memory_total_mb: u64,
    pub utilization: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_serializes_sequences_as_arrays() {
        let value = serde_json::to_value(Snapshot::default()).unwrap();
        for key in [
            "disks",
            "networks",
            "top_processes",
            "containers",
            "gpus",
        ] {
            assert_eq!(value[key], serde_json::json!([]), "field {key}");
        }
        assert_eq!(value["cpu"]["core_usage"], serde_json::json!([]));
    }

    #[test]
    fn snapshot_uses_snake_case_keys() {
        let text = serde_json::to_string(&Snapshot::default()).unwrap();
        for key in [
            "\"metadata\"",
            "\"os_type\"",
            "\"agent_version\"",
            "\"uptime_seconds\"",
            "\"global_usage_percent\"",
            "\"temperature_c\"",
            "\"power_draw_w\"",
            "\"swap_used_mb\"",
            "\"top_processes\"",
        ] {
            assert!(text.contains(key), "missing {key} in {text}");
        }
    }

    #[test]
    fn memory_percent_handles_zero_total() {
        assert_eq!(Memory::default().used_percent(), 0.0);
        let mem = Memory {
            total_mb: 200,
            used_mb: 50,
            available_mb: 150,
            swap_used_mb: 0,
        };
        assert_eq!(mem.used_percent(), 25.0);
    }
}

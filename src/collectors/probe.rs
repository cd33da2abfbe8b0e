//! Host-metrics provider boundary.
//!
//! Plugins never touch the OS directly; they go through [`HostProbe`] so the
//! collection logic can be driven by fixed readings in tests. The production
//! implementation is backed by `sysinfo` plus a few Linux-only files.

use crate::collectors::CollectError;
use crate::registry::IoCounters;
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::{Mutex, PoisonError};
use sysinfo::{
    ComponentExt, CpuExt, DiskExt, NetworkExt, NetworksExt, PidExt, ProcessExt, System,
    SystemExt, UserExt,
};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostReading {
    pub hostname: String,
    pub os_type: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuReading {
    pub global_usage_percent: f64,
    pub core_usage: Vec<f64>,
    pub temperature_c: Option<f64>,
    /// Cumulative package energy counter, if the platform exposes one.
    pub energy_microjoules: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReading {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub swap_used_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiskReading {
    pub mount_point: String,
    pub device: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    /// Cumulative device counters, when the OS reports them.
    pub io: Option<IoCounters>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceReading {
    pub name: String,
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
    pub active_connections: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessReading {
    pub pid: u32,
    pub name: String,
    pub user: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Blocking reads of host state. Implementations must be callable from
/// several threads at once.
pub trait HostProbe: Send + Sync {
    fn host(&self) -> Result<HostReading, CollectError>;
    /// CPU usage since the previous call.
    fn cpu(&self) -> Result<CpuReading, CollectError>;
    fn memory(&self) -> Result<MemoryReading, CollectError>;
    fn disks(&self) -> Result<Vec<DiskReading>, CollectError>;
    fn interfaces(&self) -> Result<Vec<InterfaceReading>, CollectError>;
    /// Processes in enumeration order (ascending pid).
    fn processes(&self) -> Result<Vec<ProcessReading>, CollectError>;
}

/// `sysinfo`-backed probe. Each facet keeps its own `System` so plugins
/// running in parallel do not serialize on one lock.
pub struct SysinfoProbe {
    host: Mutex<System>,
    cpu: Mutex<System>,
    memory: Mutex<System>,
    disks: Mutex<System>,
    networks: Mutex<System>,
    processes: Mutex<System>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut cpu = System::new();
        // First refresh primes the "since last call" usage baseline.
        cpu.refresh_cpu();
        cpu.refresh_components_list();
        let mut networks = System::new();
        networks.refresh_networks_list();
        let mut processes = System::new();
        processes.refresh_users_list();
        processes.refresh_processes();
        Self {
            host: Mutex::new(System::new()),
            cpu: Mutex::new(cpu),
            memory: Mutex::new(System::new()),
            disks: Mutex::new(System::new()),
            networks: Mutex::new(networks),
            processes: Mutex::new(processes),
        }
    }
}

impl HostProbe for SysinfoProbe {
    fn host(&self) -> Result<HostReading, CollectError> {
        let system = self.host.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(HostReading {
            hostname: system.host_name().unwrap_or_default(),
            os_type: std::env::consts::OS.to_string(),
            uptime_seconds: system.uptime(),
        })
    }

    fn cpu(&self) -> Result<CpuReading, CollectError> {
        let mut system = self.cpu.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu();
        system.refresh_components();
        let core_usage: Vec<f64> = system
            .cpus()
            .iter()
            .map(|c| c.cpu_usage() as f64)
            .collect();
        if core_usage.is_empty() {
            return Err(CollectError::Unavailable("cpu usage"));
        }
        let sensors: Vec<(String, f64)> = system
            .components()
            .iter()
            .map(|c| (c.label().to_string(), c.temperature() as f64))
            .collect();
        Ok(CpuReading {
            global_usage_percent: system.global_cpu_info().cpu_usage() as f64,
            core_usage,
            temperature_c: cpu_temperature(&sensors),
            energy_microjoules: read_package_energy(),
        })
    }

    fn memory(&self) -> Result<MemoryReading, CollectError> {
        let mut system = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        Ok(MemoryReading {
            total_bytes: system.total_memory(),
            used_bytes: system.used_memory(),
            available_bytes: system.available_memory(),
            swap_used_bytes: system.used_swap(),
        })
    }

    fn disks(&self) -> Result<Vec<DiskReading>, CollectError> {
        let mut system = self.disks.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_disks_list();
        system.refresh_disks();
        let io = read_block_device_counters();
        Ok(system
            .disks()
            .iter()
            .map(|d| {
                let device = d.name().to_string_lossy().to_string();
                let io = device_basename(&device).and_then(|name| io.get(name).copied());
                DiskReading {
                    mount_point: d.mount_point().to_string_lossy().to_string(),
                    device,
                    total_bytes: d.total_space(),
                    available_bytes: d.available_space(),
                    io,
                }
            })
            .collect())
    }

    fn interfaces(&self) -> Result<Vec<InterfaceReading>, CollectError> {
        let mut system = self.networks.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_networks_list();
        system.refresh_networks();
        let mut out: Vec<InterfaceReading> = system
            .networks()
            .iter()
            .map(|(name, data)| InterfaceReading {
                name: name.to_string(),
                rx_bytes_total: data.total_received(),
                tx_bytes_total: data.total_transmitted(),
                active_connections: 0,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn processes(&self) -> Result<Vec<ProcessReading>, CollectError> {
        let mut system = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes();
        let mut out: Vec<ProcessReading> = system
            .processes()
            .iter()
            .map(|(pid, process)| {
                let user = process
                    .user_id()
                    .and_then(|uid| system.get_user_by_id(uid))
                    .map(|u| u.name().to_string())
                    .unwrap_or_default();
                ProcessReading {
                    pid: pid.as_u32(),
                    name: process.name().to_string(),
                    user,
                    cpu_percent: process.cpu_usage() as f64,
                    memory_bytes: process.memory(),
                }
            })
            .collect();
        out.sort_by_key(|p| p.pid);
        debug!(count = out.len(), "processes enumerated");
        Ok(out)
    }
}

/// Picks the hottest CPU package/core sensor, falling back to any non-GPU
/// sensor. Readings outside 0..=130 °C are treated as bogus.
pub fn cpu_temperature(sensors: &[(String, f64)]) -> Option<f64> {
    const PRIMARY: [&str; 6] = ["cpu", "package", "tctl", "tdie", "coretemp", "k10temp"];
    const GPU: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];

    let plausible = || {
        sensors
            .iter()
            .filter(|(_, t)| *t > 0.0 && *t <= 130.0)
            .map(|(label, t)| (label.to_lowercase(), *t))
    };

    let primary = plausible()
        .filter(|(label, _)| {
            PRIMARY.iter().any(|m| label.contains(m)) && !GPU.iter().any(|m| label.contains(m))
        })
        .map(|(_, t)| t)
        .max_by(|a, b| a.total_cmp(b));
    if primary.is_some() {
        return primary;
    }

    plausible()
        .filter(|(label, _)| !GPU.iter().any(|m| label.contains(m)))
        .map(|(_, t)| t)
        .max_by(|a, b| a.total_cmp(b))
}

fn device_basename(device: &str) -> Option<&str> {
    device.rsplit('/').next().filter(|s| !s.is_empty())
}

/// Parses `/proc/diskstats` into cumulative byte counters per device.
/// Sector counts are in 512-byte units regardless of the device block size.
pub fn parse_diskstats(text: &str) -> HashMap<String, IoCounters> {
    const SECTOR_BYTES: u64 = 512;
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let sectors_read: u64 = fields[5].parse().ok()?;
            let sectors_written: u64 = fields[9].parse().ok()?;
            Some((
                fields[2].to_string(),
                IoCounters {
                    read_bytes: sectors_read.saturating_mul(SECTOR_BYTES),
                    write_bytes: sectors_written.saturating_mul(SECTOR_BYTES),
                },
            ))
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn read_block_device_counters() -> HashMap<String, IoCounters> {
    match fs::read_to_string("/proc/diskstats") {
        Ok(text) => parse_diskstats(&text),
        Err(err) => {
            debug!(error = %err, "diskstats unavailable");
            HashMap::new()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_block_device_counters() -> HashMap<String, IoCounters> {
    HashMap::new()
}

#[cfg(target_os = "linux")]
fn read_package_energy() -> Option<u64> {
    fs::read_to_string("/sys/class/powercap/intel-rapl:0/energy_uj")
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(not(target_os = "linux"))]
fn read_package_energy() -> Option<u64> {
    None
}

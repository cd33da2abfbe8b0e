use crate::collectors::{run_blocking, CollectError, CycleContext, Facet, Plugin, PluginKind};
use crate::registry::Registry;
use crate::schema::Gpu;
use async_trait::async_trait;
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

const UNKNOWN_VENDOR: &str = "Unknown";
const UNKNOWN_MODEL: &str = "Unknown Graphics Card";

/// Hardware-discovery boundary. Utilization and VRAM may legitimately stay
/// zero when the platform cannot report them.
pub trait GpuDiscovery: Send + Sync {
    fn discover(&self) -> Result<Vec<Gpu>, CollectError>;
}

/// Tries `nvidia-smi` first, then the DRM device tree.
#[derive(Debug, Default)]
pub struct SystemGpuDiscovery;

impl GpuDiscovery for SystemGpuDiscovery {
    fn discover(&self) -> Result<Vec<Gpu>, CollectError> {
        let gpus = collect_nvidia_smi();
        if !gpus.is_empty() {
            return Ok(gpus);
        }
        Ok(collect_drm_cards())
    }
}

/// Discovery can shell out and outlive the cycle deadline. At most one run
/// is in flight; cycles that find one running report the last result.
pub struct GpuPlugin {
    discovery: Arc<dyn GpuDiscovery>,
    in_flight: Arc<AtomicBool>,
    last_seen: Arc<Mutex<Vec<Gpu>>>,
}

impl GpuPlugin {
    pub fn new(discovery: Arc<dyn GpuDiscovery>) -> Self {
        Self {
            discovery,
            in_flight: Arc::new(AtomicBool::new(false)),
            last_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn last_seen(&self) -> Vec<Gpu> {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Clears the in-flight flag when the blocking run ends, even if the cycle
/// that started it has already given up.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Plugin for GpuPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::Gpu
    }

    async fn collect(&self, ctx: &CycleContext, _registry: &Registry) -> Result<Facet, CollectError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("gpu discovery still running, reusing last result");
            return Ok(Facet::Gpus(self.last_seen()));
        }
        let guard = InFlight(Arc::clone(&self.in_flight));
        let discovery = Arc::clone(&self.discovery);
        let last_seen = Arc::clone(&self.last_seen);
        let gpus = run_blocking(ctx, move || {
            let _guard = guard;
            let gpus = discovery.discover()?;
            *last_seen.lock().unwrap_or_else(PoisonError::into_inner) = gpus.clone();
            Ok(gpus)
        })
        .await?;
        Ok(Facet::Gpus(gpus))
    }
}

fn collect_nvidia_smi() -> Vec<Gpu> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output();
    let output = match output {
        Ok(output) if output.status.success() => output,
        Ok(_) => return Vec::new(),
        Err(err) => {
            debug!(error = %err, "nvidia-smi not available");
            return Vec::new();
        }
    };
    match String::from_utf8(output.stdout) {
        Ok(text) => parse_nvidia_smi(&text),
        Err(_) => Vec::new(),
    }
}

/// Parses `name, memory.total [MiB], utilization.gpu [%]` rows.
pub fn parse_nvidia_smi(text: &str) -> Vec<Gpu> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 3 || parts[0].is_empty() {
                return None;
            }
            Some(Gpu {
                vendor: "NVIDIA".to_string(),
                model: parts[0].to_string(),
                memory_total_mb: parts[1].parse::<f64>().map(|v| v as u64).unwrap_or(0),
                utilization: parts[2].parse().unwrap_or(0.0),
            })
        })
        .collect()
}

pub fn vendor_name(pci_vendor_id: &str) -> &'static str {
    match pci_vendor_id
        .trim()
        .trim_start_matches("0x")
        .to_ascii_lowercase()
        .as_str()
    {
        "10de" => "NVIDIA",
        "1002" => "AMD",
        "8086" => "Intel",
        "1af4" => "Red Hat (virtio)",
        "15ad" => "VMware",
        "1234" => "QEMU",
        _ => UNKNOWN_VENDOR,
    }
}

#[cfg(target_os = "linux")]
fn collect_drm_cards() -> Vec<Gpu> {
    let Ok(entries) = fs::read_dir("/sys/class/drm") else {
        return Vec::new();
    };
    let mut cards: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().to_string())
        // Connector entries look like "card0-HDMI-A-1".
        .filter(|name| name.starts_with("card") && !name.contains('-'))
        .collect();
    cards.sort();

    cards
        .iter()
        .filter_map(|card| {
            let device = Path::new("/sys/class/drm").join(card).join("device");
            let vendor_id = fs::read_to_string(device.join("vendor")).ok()?;
            let read_u64 = |file: &str| {
                fs::read_to_string(device.join(file))
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
            };
            let model = fs::read_to_string(device.join("product_name"))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNKNOWN_MODEL.to_string());
            Some(Gpu {
                vendor: vendor_name(&vendor_id).to_string(),
                model,
                memory_total_mb: read_u64("mem_info_vram_total")
                    .map(|b| b / 1024 / 1024)
                    .unwrap_or(0),
                utilization: read_u64("gpu_busy_percent").unwrap_or(0) as f64,
            })
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn collect_drm_cards() -> Vec<Gpu> {
    Vec::new()
}

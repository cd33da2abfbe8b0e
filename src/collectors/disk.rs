use crate::collectors::probe::{DiskReading, HostProbe};
use crate::collectors::{
    bytes_to_gb_f64, per_second, run_blocking, CollectError, CycleContext, Facet, Plugin,
    PluginKind, DEFAULT_SAMPLE_INTERVAL,
};
use crate::registry::{IoCounters, Registry, Store};
use crate::schema::Disk;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Mount prefixes never reported: snap loopback images and boot partitions.
const EXCLUDED_MOUNT_PREFIXES: [&str; 2] = ["/snap", "/boot"];

pub struct DiskPlugin {
    probe: Arc<dyn HostProbe>,
    interval: Duration,
}

impl DiskPlugin {
    pub fn new(probe: Arc<dyn HostProbe>) -> Self {
        Self {
            probe,
            interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl Plugin for DiskPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::Disk
    }

    async fn collect(&self, ctx: &CycleContext, registry: &Registry) -> Result<Facet, CollectError> {
        let probe = Arc::clone(&self.probe);
        let readings = run_blocking(ctx, move || probe.disks()).await?;
        Ok(Facet::Disks(to_disks(
            readings,
            &registry.block_devices,
            self.interval,
        )))
    }
}

pub fn is_excluded_mount(mount_point: &str) -> bool {
    EXCLUDED_MOUNT_PREFIXES
        .iter()
        .any(|prefix| mount_point.starts_with(prefix))
}

fn to_disks(
    readings: Vec<DiskReading>,
    previous: &Store<IoCounters>,
    interval: Duration,
) -> Vec<Disk> {
    readings
        .into_iter()
        .filter(|d| !is_excluded_mount(&d.mount_point))
        .map(|d| {
            let (read, write) = match d.io {
                Some(current) => {
                    let rates = previous
                        .get(&d.mount_point)
                        .map(|prev| {
                            (
                                current.read_bytes.saturating_sub(prev.read_bytes),
                                current.write_bytes.saturating_sub(prev.write_bytes),
                            )
                        })
                        .unwrap_or((0, 0));
                    previous.set(d.mount_point.clone(), current);
                    rates
                }
                None => (0, 0),
            };
            let used = d.total_bytes.saturating_sub(d.available_bytes);
            Disk {
                mount_point: d.mount_point,
                total_gb: bytes_to_gb_f64(d.total_bytes),
                used_gb: bytes_to_gb_f64(used),
                read_bytes_sec: per_second(read, interval),
                write_bytes_sec: per_second(write, interval),
            }
        })
        .collect()
}

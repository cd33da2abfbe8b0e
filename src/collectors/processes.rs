use crate::collectors::probe::{HostProbe, ProcessReading};
use crate::collectors::{
    bytes_to_mb_f64, run_blocking, CollectError, CycleContext, Facet, Plugin, PluginKind,
};
use crate::registry::Registry;
use crate::schema::{Process, TOP_PROCESS_LIMIT};
use async_trait::async_trait;
use std::sync::Arc;

pub struct ProcessPlugin {
    probe: Arc<dyn HostProbe>,
}

impl ProcessPlugin {
    pub fn new(probe: Arc<dyn HostProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl Plugin for ProcessPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::Processes
    }

    async fn collect(&self, ctx: &CycleContext, _registry: &Registry) -> Result<Facet, CollectError> {
        let probe = Arc::clone(&self.probe);
        let readings = run_blocking(ctx, move || probe.processes()).await?;
        Ok(Facet::Processes(top_processes(readings, TOP_PROCESS_LIMIT)))
    }
}

/// Highest cpu first; equal cpu keeps enumeration order.
pub fn top_processes(readings: Vec<ProcessReading>, limit: usize) -> Vec<Process> {
    let mut list: Vec<Process> = readings
        .into_iter()
        .map(|p| Process {
            pid: p.pid,
            name: p.name,
            user: p.user,
            cpu_percent: if p.cpu_percent.is_finite() {
                p.cpu_percent.max(0.0)
            } else {
                0.0
            },
            memory_mb: bytes_to_mb_f64(p.memory_bytes),
        })
        .collect();
    // sort_by is stable.
    list.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
    list.truncate(limit);
    list
}

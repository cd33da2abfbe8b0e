pub mod containers;
pub mod cpu;
pub mod disk;
pub mod gpu;
pub mod host;
pub mod memory;
pub mod network;
pub mod probe;
pub mod processes;
#[cfg(test)]
pub(crate) mod testing;

use crate::registry::Registry;
use crate::schema::{self, Snapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// The fixed set of snapshot facets; one plugin per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Host,
    Cpu,
    Memory,
    Disk,
    Network,
    Processes,
    Docker,
    Gpu,
}

impl PluginKind {
    pub const ALL: [PluginKind; 8] = [
        PluginKind::Host,
        PluginKind::Cpu,
        PluginKind::Memory,
        PluginKind::Disk,
        PluginKind::Network,
        PluginKind::Processes,
        PluginKind::Docker,
        PluginKind::Gpu,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PluginKind::Host => "host",
            PluginKind::Cpu => "cpu",
            PluginKind::Memory => "memory",
            PluginKind::Disk => "disk",
            PluginKind::Network => "network",
            PluginKind::Processes => "processes",
            PluginKind::Docker => "docker",
            PluginKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one plugin invocation, tagged by the facet it fills.
#[derive(Debug, Clone, PartialEq)]
pub enum Facet {
    Host(schema::Metadata),
    Cpu(schema::Cpu),
    Memory(schema::Memory),
    Disks(Vec<schema::Disk>),
    Networks(Vec<schema::Network>),
    Processes(Vec<schema::Process>),
    Containers(Vec<schema::Container>),
    Gpus(Vec<schema::Gpu>),
}

impl Facet {
    pub fn kind(&self) -> PluginKind {
        match self {
            Facet::Host(_) => PluginKind::Host,
            Facet::Cpu(_) => PluginKind::Cpu,
            Facet::Memory(_) => PluginKind::Memory,
            Facet::Disks(_) => PluginKind::Disk,
            Facet::Networks(_) => PluginKind::Network,
            Facet::Processes(_) => PluginKind::Processes,
            Facet::Containers(_) => PluginKind::Docker,
            Facet::Gpus(_) => PluginKind::Gpu,
        }
    }

    /// Writes this facet into its field of `snapshot`.
    pub fn merge_into(self, snapshot: &mut Snapshot) {
        match self {
            Facet::Host(metadata) => snapshot.metadata = metadata,
            Facet::Cpu(cpu) => snapshot.cpu = cpu,
            Facet::Memory(memory) => snapshot.memory = memory,
            Facet::Disks(disks) => snapshot.disks = disks,
            Facet::Networks(networks) => snapshot.networks = networks,
            Facet::Processes(processes) => snapshot.top_processes = processes,
            Facet::Containers(containers) => snapshot.containers = containers,
            Facet::Gpus(gpus) => snapshot.gpus = gpus,
        }
    }
}

/// Per-cycle context handed to every plugin. The deadline is shared by all
/// plugins of the cycle and is the only cancellation signal they get.
#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    deadline: Instant,
}

impl CycleContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("{0} is not available on this host")]
    Unavailable(&'static str),
    #[error("cycle deadline exceeded")]
    DeadlineExceeded,
    #[error("blocking collection task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Other(String),
}

/// A unit of collection responsible for exactly one snapshot facet.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn kind(&self) -> PluginKind;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    async fn collect(&self, ctx: &CycleContext, registry: &Registry)
        -> Result<Facet, CollectError>;
}

/// Runs a blocking host read on the blocking pool, bounded by the cycle
/// deadline. On timeout the read keeps running to completion in the
/// background; its result is discarded.
pub(crate) async fn run_blocking<T, F>(ctx: &CycleContext, f: F) -> Result<T, CollectError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CollectError> + Send + 'static,
{
    match tokio::time::timeout_at(ctx.deadline(), tokio::task::spawn_blocking(f)).await {
        Ok(joined) => joined?,
        Err(_elapsed) => Err(CollectError::DeadlineExceeded),
    }
}

/// Tick length the rate plugins assume unless told otherwise.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Turns a counter delta observed over one tick into a per-second rate.
pub(crate) fn per_second(delta: u64, interval: Duration) -> u64 {
    let millis = interval.as_millis();
    if millis == 0 {
        return delta;
    }
    u64::try_from(u128::from(delta) * 1000 / millis).unwrap_or(u64::MAX)
}

pub(crate) fn bytes_to_mb(bytes: u64) -> u64 {
    bytes / 1024 / 1024
}

pub(crate) fn bytes_to_mb_f64(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

pub(crate) fn bytes_to_gb_f64(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facet_kind_matches_merge_target() {
        let mut snapshot = Snapshot::default();
        let facet = Facet::Containers(vec![schema::Container {
            id: "abcdef12".to_string(),
            ..Default::default()
        }]);
        assert_eq!(facet.kind(), PluginKind::Docker);
        facet.merge_into(&mut snapshot);
        assert_eq!(snapshot.containers.len(), 1);
        assert!(snapshot.gpus.is_empty());
    }

    #[test]
    fn plugin_kind_names_are_stable() {
        let names: Vec<_> = PluginKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            ["host", "cpu", "memory", "disk", "network", "processes", "docker", "gpu"]
        );
        let parsed: PluginKind = serde_yaml::from_str("docker").unwrap();
        assert_eq!(parsed, PluginKind::Docker);
    }

    #[test]
    fn per_second_scales_by_tick_length() {
        assert_eq!(per_second(80, Duration::from_secs(1)), 80);
        assert_eq!(per_second(50, Duration::from_millis(500)), 100);
        assert_eq!(per_second(300, Duration::from_secs(2)), 150);
        assert_eq!(per_second(7, Duration::ZERO), 7);
    }

    #[tokio::test]
    async fn run_blocking_respects_deadline() {
        let ctx = CycleContext::new(Duration::from_millis(20));
        let result: Result<(), _> = run_blocking(&ctx, || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(CollectError::DeadlineExceeded)));
    }
}

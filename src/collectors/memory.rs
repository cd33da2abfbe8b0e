use crate::collectors::probe::{HostProbe, MemoryReading};
use crate::collectors::{
    bytes_to_mb, run_blocking, CollectError, CycleContext, Facet, Plugin, PluginKind,
};
use crate::registry::Registry;
use crate::schema::Memory;
use async_trait::async_trait;
use std::sync::Arc;

pub struct MemoryPlugin {
    probe: Arc<dyn HostProbe>,
}

impl MemoryPlugin {
    pub fn new(probe: Arc<dyn HostProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl Plugin for MemoryPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::Memory
    }

    async fn collect(&self, ctx: &CycleContext, _registry: &Registry) -> Result<Facet, CollectError> {
        let probe = Arc::clone(&self.probe);
        let reading = run_blocking(ctx, move || probe.memory()).await?;
        Ok(Facet::Memory(to_memory(reading)))
    }
}

/// Converts to whole megabytes, clamping so that used and available never
/// exceed total even if the provider reports them from separate reads.
fn to_memory(reading: MemoryReading) -> Memory {
    let total_mb = bytes_to_mb(reading.total_bytes);
    Memory {
        total_mb,
        used_mb: bytes_to_mb(reading.used_bytes).min(total_mb),
        available_mb: bytes_to_mb(reading.available_bytes).min(total_mb),
        swap_used_mb: bytes_to_mb(reading.swap_used_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn converts_bytes_to_megabytes() {
        let memory = to_memory(MemoryReading {
            total_bytes: 32768 * MB,
            used_bytes: 16384 * MB,
            available_bytes: 16384 * MB + 12,
            swap_used_bytes: 0,
        });
        assert_eq!(
            memory,
            Memory {
                total_mb: 32768,
                used_mb: 16384,
                available_mb: 16384,
                swap_used_mb: 0,
            }
        );
    }

    #[test]
    fn used_and_available_never_exceed_total() {
        let memory = to_memory(MemoryReading {
            total_bytes: 1024 * MB,
            used_bytes: 2048 * MB,
            available_bytes: 4096 * MB,
            swap_used_bytes: 5 * MB,
        });
        assert!(memory.used_mb <= memory.total_mb);
        assert!(memory.available_mb <= memory.total_mb);
        assert_eq!(memory.swap_used_mb, 5);
    }
}

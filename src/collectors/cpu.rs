use crate::collectors::probe::HostProbe;
use crate::collectors::{run_blocking, CollectError, CycleContext, Facet, Plugin, PluginKind};
use crate::registry::{EnergySample, Registry, Store};
use crate::schema::Cpu;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

const PACKAGE_KEY: &str = "package-0";

pub struct CpuPlugin {
    probe: Arc<dyn HostProbe>,
}

impl CpuPlugin {
    pub fn new(probe: Arc<dyn HostProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl Plugin for CpuPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::Cpu
    }

    async fn collect(&self, ctx: &CycleContext, registry: &Registry) -> Result<Facet, CollectError> {
        let probe = Arc::clone(&self.probe);
        let reading = run_blocking(ctx, move || probe.cpu()).await?;
        let power_draw_w = reading
            .energy_microjoules
            .and_then(|uj| power_draw(&registry.cpu_energy, uj, Instant::now()))
            .unwrap_or(0.0);
        Ok(Facet::Cpu(Cpu {
            global_usage_percent: reading.global_usage_percent.clamp(0.0, 100.0),
            core_usage: reading.core_usage,
            temperature_c: reading.temperature_c.unwrap_or(0.0),
            power_draw_w,
        }))
    }
}

/// Average package power since the previous reading. `None` on the first
/// reading and when the counter wrapped.
fn power_draw(store: &Store<EnergySample>, microjoules: u64, now: Instant) -> Option<f64> {
    let previous = store.get(PACKAGE_KEY);
    store.set(
        PACKAGE_KEY,
        EnergySample {
            microjoules,
            taken_at: now,
        },
    );
    let previous = previous?;
    let elapsed = now.checked_duration_since(previous.taken_at)?.as_secs_f64();
    if elapsed <= 0.0 || microjoules < previous.microjoules {
        return None;
    }
    Some((microjoules - previous.microjoules) as f64 / 1_000_000.0 / elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::probe::CpuReading;
    use crate::collectors::testing::FakeProbe;
    use std::time::Duration;

    #[test]
    fn power_is_energy_delta_over_elapsed_time() {
        let store = Store::default();
        let t0 = Instant::now();
        assert_eq!(power_draw(&store, 1_000_000, t0), None);
        let watts = power_draw(&store, 31_000_000, t0 + Duration::from_secs(2)).unwrap();
        assert!((watts - 15.0).abs() < 1e-9, "got {watts}");
    }

    #[test]
    fn counter_wrap_yields_no_power() {
        let store = Store::default();
        let t0 = Instant::now();
        power_draw(&store, 9_000_000, t0);
        assert_eq!(power_draw(&store, 10, t0 + Duration::from_secs(1)), None);
    }

    #[tokio::test]
    async fn unavailable_sensors_are_zero() {
        let probe = FakeProbe {
            cpu: Some(CpuReading {
                global_usage_percent: 18.5,
                core_usage: vec![15.2, 22.1, 10.0, 26.7],
                temperature_c: None,
                energy_microjoules: None,
            }),
            ..FakeProbe::default()
        };
        let plugin = CpuPlugin::new(Arc::new(probe));
        let ctx = CycleContext::new(Duration::from_secs(1));
        let Facet::Cpu(cpu) = plugin.collect(&ctx, &Registry::new()).await.unwrap() else {
            panic!("wrong facet");
        };
        assert_eq!(cpu.global_usage_percent, 18.5);
        assert_eq!(cpu.core_usage, vec![15.2, 22.1, 10.0, 26.7]);
        assert_eq!(cpu.temperature_c, 0.0);
        assert_eq!(cpu.power_draw_w, 0.0);
    }
}

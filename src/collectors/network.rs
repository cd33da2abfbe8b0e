use crate::collectors::probe::{HostProbe, InterfaceReading};
use crate::collectors::{
    per_second, run_blocking, CollectError, CycleContext, Facet, Plugin, PluginKind,
    DEFAULT_SAMPLE_INTERVAL,
};
use crate::registry::{NetCounters, Registry, Store};
use crate::schema::Network;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Per-interface throughput. The delta between two cumulative readings is
/// spread over the sampling interval to give bytes/sec; at the default one
/// second tick the delta is reported as is.
pub struct NetworkPlugin {
    probe: Arc<dyn HostProbe>,
    interval: Duration,
}

impl NetworkPlugin {
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
impl Plugin for NetworkPlugin {
    fn kind(&self) -> PluginKind {
        PluginKind::Network
    }

    async fn collect(&self, ctx: &CycleContext, registry: &Registry) -> Result<Facet, CollectError> {
        let probe = Arc::clone(&self.probe);
        let readings = run_blocking(ctx, move || probe.interfaces()).await?;
        Ok(Facet::Networks(rates(
            readings,
            &registry.interfaces,
            self.interval,
        )))
    }
}

fn rates(
    readings: Vec<InterfaceReading>,
    previous: &Store<NetCounters>,
    interval: Duration,
) -> Vec<Network> {
    readings
        .into_iter()
        .map(|reading| {
            let (rx, tx) = match previous.get(&reading.name) {
                // A counter that went backwards (driver reset) reads as idle.
                Some(prev) => (
                    reading.rx_bytes_total.saturating_sub(prev.rx_bytes),
                    reading.tx_bytes_total.saturating_sub(prev.tx_bytes),
                ),
                None => (0, 0),
            };
            previous.set(
                reading.name.clone(),
                NetCounters {
                    rx_bytes: reading.rx_bytes_total,
                    tx_bytes: reading.tx_bytes_total,
                },
            );
            Network {
                interface: reading.name,
                rx_bytes_sec: per_second(rx, interval),
                tx_bytes_sec: per_second(tx, interval),
                active_connections: reading.active_connections,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testing::FakeProbe;

    const TICK: Duration = Duration::from_secs(1);

    fn eth0(total: u64) -> InterfaceReading {
        InterfaceReading {
            name: "eth0".to_string(),
            rx_bytes_total: total,
            tx_bytes_total: total,
            active_connections: 0,
        }
    }

    #[tokio::test]
    async fn deltas_follow_cumulative_counters() {
        let probe = FakeProbe::default();
        for total in [100, 180, 180, 260] {
            probe.push_interfaces(vec![eth0(total)]);
        }
        let plugin = NetworkPlugin::new(Arc::new(probe));
        let registry = Registry::new();

        let mut rx = Vec::new();
        let mut tx = Vec::new();
        for _ in 0..4 {
            let ctx = CycleContext::new(Duration::from_secs(1));
            let Facet::Networks(nets) = plugin.collect(&ctx, &registry).await.unwrap() else {
                panic!("wrong facet");
            };
            rx.push(nets[0].rx_bytes_sec);
            tx.push(nets[0].tx_bytes_sec);
        }
        assert_eq!(rx, vec![0, 80, 0, 80]);
        assert_eq!(tx, vec![0, 80, 0, 80]);
        assert_eq!(
            registry.interfaces.get("eth0"),
            Some(NetCounters {
                rx_bytes: 260,
                tx_bytes: 260,
            })
        );
    }

    #[test]
    fn interfaces_may_come_and_go() {
        let store = Store::default();
        let wlan = |total| InterfaceReading {
            name: "wlan0".to_string(),
            rx_bytes_total: total,
            tx_bytes_total: 0,
            active_connections: 0,
        };

        rates(vec![eth0(10), wlan(50)], &store, TICK);
        let second = rates(vec![eth0(30)], &store, TICK);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].rx_bytes_sec, 20);

        let third = rates(vec![eth0(30), wlan(70)], &store, TICK);
        assert_eq!(third[1].interface, "wlan0");
        assert_eq!(third[1].rx_bytes_sec, 20);
    }

    #[test]
    fn counter_reset_reads_as_zero() {
        let store = Store::default();
        rates(vec![eth0(1_000)], &store, TICK);
        let after_reset = rates(vec![eth0(10)], &store, TICK);
        assert_eq!(after_reset[0].rx_bytes_sec, 0);
        let next = rates(vec![eth0(50)], &store, TICK);
        assert_eq!(next[0].rx_bytes_sec, 40);
    }

    #[tokio::test]
    async fn half_second_tick_reports_bytes_per_second() {
        let probe = FakeProbe::default();
        // A steady 100 B/s link sampled every 500ms.
        for total in [0, 50, 100] {
            probe.push_interfaces(vec![eth0(total)]);
        }
        let plugin = NetworkPlugin::new(Arc::new(probe)).with_interval(Duration::from_millis(500));
        let registry = Registry::new();

        let mut rx = Vec::new();
        for _ in 0..3 {
            let ctx = CycleContext::new(Duration::from_millis(400));
            let Facet::Networks(nets) = plugin.collect(&ctx, &registry).await.unwrap() else {
                panic!("wrong facet");
            };
            rx.push(nets[0].rx_bytes_sec);
        }
        assert_eq!(rx, vec![0, 100, 100]);
    }
}

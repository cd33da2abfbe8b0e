use crate::schema::Snapshot;
use prometheus::core::Collector;
use prometheus::{
    histogram_opts, opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at: Instant,
    pub agent_cpu_usage_percent: Gauge,
    pub agent_memory_used_mb: Gauge,
    pub agent_memory_total_mb: Gauge,
    pub agent_memory_usage_percent: Gauge,
    pub agent_disk_usage_percent: GaugeVec,
    pub agent_net_rx_bytes_per_sec: GaugeVec,
    pub agent_net_tx_bytes_per_sec: GaugeVec,
    pub agent_container_count: Gauge,
    pub agent_gpu_count: Gauge,
    pub agent_cycles_total: Counter,
    pub agent_cycle_duration_seconds: Histogram,
    pub agent_plugin_errors_total: CounterVec,
    pub agent_plugin_timeouts_total: CounterVec,
    pub agent_stream_connections: Gauge,
    pub agent_commands_total: CounterVec,
    pub agent_alerts_fired_total: CounterVec,
    pub agent_scrape_count_total: Counter,
    pub agent_uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let agent_cpu_usage_percent = Gauge::with_opts(opts!(
            "agent_cpu_usage_percent",
            "Global CPU usage in percent (0..100) from the latest snapshot"
        ))?;
        let agent_memory_used_mb =
            Gauge::with_opts(opts!("agent_memory_used_mb", "Used memory in MB"))?;
        let agent_memory_total_mb =
            Gauge::with_opts(opts!("agent_memory_total_mb", "Total memory in MB"))?;
        let agent_memory_usage_percent = Gauge::with_opts(opts!(
            "agent_memory_usage_percent",
            "Used memory as a percentage of total"
        ))?;
        let agent_disk_usage_percent = GaugeVec::new(
            opts!("agent_disk_usage_percent", "Disk usage per mount in percent"),
            &["mount"],
        )?;
        let agent_net_rx_bytes_per_sec = GaugeVec::new(
            opts!("agent_net_rx_bytes_per_sec", "Received bytes per second per interface"),
            &["iface"],
        )?;
        let agent_net_tx_bytes_per_sec = GaugeVec::new(
            opts!("agent_net_tx_bytes_per_sec", "Transmitted bytes per second per interface"),
            &["iface"],
        )?;
        let agent_container_count =
            Gauge::with_opts(opts!("agent_container_count", "Containers in the latest snapshot"))?;
        let agent_gpu_count = Gauge::with_opts(opts!("agent_gpu_count", "Detected GPUs"))?;
        let agent_cycles_total =
            Counter::with_opts(opts!("agent_cycles_total", "Completed collection cycles"))?;
        let agent_cycle_duration_seconds = Histogram::with_opts(histogram_opts!(
            "agent_cycle_duration_seconds",
            "Wall time of one collection cycle",
            vec![0.01, 0.05, 0.1, 0.2, 0.4, 0.6, 0.8, 1.0]
        ))?;
        let agent_plugin_errors_total = CounterVec::new(
            opts!("agent_plugin_errors_total", "Plugin collection failures"),
            &["plugin"],
        )?;
        let agent_plugin_timeouts_total = CounterVec::new(
            opts!("agent_plugin_timeouts_total", "Plugins abandoned at the cycle deadline"),
            &["plugin"],
        )?;
        let agent_stream_connections = Gauge::with_opts(opts!(
            "agent_stream_connections",
            "Currently connected streaming clients"
        ))?;
        let agent_commands_total = CounterVec::new(
            opts!("agent_commands_total", "Inbound control commands dispatched"),
            &["action"],
        )?;
        let agent_alerts_fired_total = CounterVec::new(
            opts!("agent_alerts_fired_total", "Alert rules fired"),
            &["rule"],
        )?;
        let agent_scrape_count_total = Counter::with_opts(opts!(
            "agent_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let agent_uptime_seconds =
            Gauge::with_opts(opts!("agent_uptime_seconds", "Agent process uptime in seconds"))?;

        register(&registry, &agent_cpu_usage_percent)?;
        register(&registry, &agent_memory_used_mb)?;
        register(&registry, &agent_memory_total_mb)?;
        register(&registry, &agent_memory_usage_percent)?;
        register(&registry, &agent_disk_usage_percent)?;
        register(&registry, &agent_net_rx_bytes_per_sec)?;
        register(&registry, &agent_net_tx_bytes_per_sec)?;
        register(&registry, &agent_container_count)?;
        register(&registry, &agent_gpu_count)?;
        register(&registry, &agent_cycles_total)?;
        register(&registry, &agent_cycle_duration_seconds)?;
        register(&registry, &agent_plugin_errors_total)?;
        register(&registry, &agent_plugin_timeouts_total)?;
        register(&registry, &agent_stream_connections)?;
        register(&registry, &agent_commands_total)?;
        register(&registry, &agent_alerts_fired_total)?;
        register(&registry, &agent_scrape_count_total)?;
        register(&registry, &agent_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at: Instant::now(),
            agent_cpu_usage_percent,
            agent_memory_used_mb,
            agent_memory_total_mb,
            agent_memory_usage_percent,
            agent_disk_usage_percent,
            agent_net_rx_bytes_per_sec,
            agent_net_tx_bytes_per_sec,
            agent_container_count,
            agent_gpu_count,
            agent_cycles_total,
            agent_cycle_duration_seconds,
            agent_plugin_errors_total,
            agent_plugin_timeouts_total,
            agent_stream_connections,
            agent_commands_total,
            agent_alerts_fired_total,
            agent_scrape_count_total,
            agent_uptime_seconds,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        self.agent_cpu_usage_percent
            .set(snapshot.cpu.global_usage_percent);
        self.agent_memory_used_mb.set(snapshot.memory.used_mb as f64);
        self.agent_memory_total_mb
            .set(snapshot.memory.total_mb as f64);
        self.agent_memory_usage_percent
            .set(snapshot.memory.used_percent());

        // Mounts and interfaces come and go; drop stale label sets.
        self.agent_disk_usage_percent.reset();
        self.agent_net_rx_bytes_per_sec.reset();
        self.agent_net_tx_bytes_per_sec.reset();

        for disk in &snapshot.disks {
            self.agent_disk_usage_percent
                .with_label_values(&[&disk.mount_point])
                .set(disk.used_percent());
        }
        for net in &snapshot.networks {
            self.agent_net_rx_bytes_per_sec
                .with_label_values(&[&net.interface])
                .set(net.rx_bytes_sec as f64);
            self.agent_net_tx_bytes_per_sec
                .with_label_values(&[&net.interface])
                .set(net.tx_bytes_sec as f64);
        }

        self.agent_container_count
            .set(snapshot.containers.len() as f64);
        self.agent_gpu_count.set(snapshot.gpus.len() as f64);
        self.agent_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());
    }

    pub fn observe_cycle(&self, elapsed: Duration) {
        self.agent_cycles_total.inc();
        self.agent_cycle_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    pub fn inc_plugin_error(&self, plugin: &str) {
        self.agent_plugin_errors_total
            .with_label_values(&[plugin])
            .inc();
    }

    pub fn inc_plugin_timeout(&self, plugin: &str) {
        self.agent_plugin_timeouts_total
            .with_label_values(&[plugin])
            .inc();
    }

    pub fn inc_command(&self, action: &str) {
        self.agent_commands_total
            .with_label_values(&[action])
            .inc();
    }

    pub fn inc_alert_fired(&self, rule: &str) {
        self.agent_alerts_fired_total
            .with_label_values(&[rule])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.agent_scrape_count_total.inc();
    }

    pub fn stream_connected(&self) {
        self.agent_stream_connections.inc();
    }

    pub fn stream_disconnected(&self) {
        self.agent_stream_connections.dec();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.agent_uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

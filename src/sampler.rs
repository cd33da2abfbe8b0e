//! The tick loop. One engine cycle per tick; the resulting snapshot is
//! published to every connected stream, checked against the alert rules and
//! appended to history.

use crate::alerts::AlertEvaluator;
use crate::engine::Engine;
use crate::history::HistoryWriter;
use crate::metrics::Metrics;
use crate::schema::Snapshot;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub type SnapshotFeed = watch::Receiver<Option<Arc<Snapshot>>>;

pub struct Sampler {
    engine: Engine,
    interval: Duration,
    cycle_timeout: Duration,
    publish: watch::Sender<Option<Arc<Snapshot>>>,
    alerts: Option<AlertEvaluator>,
    history: Option<HistoryWriter>,
    metrics: Option<Arc<Metrics>>,
}

impl Sampler {
    pub fn new(engine: Engine, interval: Duration, cycle_timeout: Duration) -> (Self, SnapshotFeed) {
        let (publish, feed) = watch::channel(None);
        let sampler = Self {
            engine,
            interval,
            cycle_timeout,
            publish,
            alerts: None,
            history: None,
            metrics: None,
        };
        (sampler, feed)
    }

    pub fn with_alerts(mut self, alerts: AlertEvaluator) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_history(mut self, history: HistoryWriter) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            cycle_timeout_ms = self.cycle_timeout.as_millis() as u64,
            plugins = self.engine.plugin_kinds().len(),
            "sampler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown signal received, stopping sampler");
                    break;
                }
                _ = ticker.tick() => {
                    self.sample_once().await;
                }
            }
        }
    }

    /// Runs one cycle and hands the snapshot to every consumer.
    pub async fn sample_once(&mut self) -> Arc<Snapshot> {
        let snapshot = Arc::new(self.engine.run_cycle(self.cycle_timeout).await);

        if let Some(metrics) = &self.metrics {
            metrics.update_from_snapshot(&snapshot);
        }
        if let Some(alerts) = &mut self.alerts {
            for alert in alerts.evaluate(&snapshot, Utc::now()) {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_alert_fired(&alert.rule_id);
                }
            }
        }
        if let Some(history) = &self.history {
            history.record(&snapshot);
        }

        self.publish.send_replace(Some(Arc::clone(&snapshot)));
        debug!(
            subscribers = self.publish.receiver_count(),
            "snapshot published"
        );
        snapshot
    }
}

//! Bounded, concurrent collection cycles over the registered plugin set.

use crate::collectors::{CollectError, CycleContext, Facet, Plugin, PluginKind};
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::schema::Snapshot;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

pub struct Engine {
    registry: Arc<Registry>,
    plugins: Vec<Arc<dyn Plugin>>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            plugins: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Adds a plugin. A second plugin of the same kind replaces the first,
    /// so every facet has at most one writer.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        if let Some(existing) = self.plugins.iter_mut().find(|p| p.kind() == plugin.kind()) {
            warn!(plugin = plugin.name(), "plugin registered twice, replacing");
            *existing = plugin;
            return;
        }
        self.plugins.push(plugin);
    }

    pub fn plugin_kinds(&self) -> Vec<PluginKind> {
        self.plugins.iter().map(|p| p.kind()).collect()
    }

    /// Runs every plugin concurrently under one shared deadline and merges
    /// whatever finished in time. Never fails: a plugin that errors or misses
    /// the deadline leaves its field at the default value.
    pub async fn run_cycle(&self, timeout: Duration) -> Snapshot {
        let started = Instant::now();
        let ctx = CycleContext::new(timeout);
        let mut snapshot = Snapshot::default();
        let mut pending: HashSet<PluginKind> = HashSet::new();
        let mut tasks = JoinSet::new();

        for plugin in &self.plugins {
            let plugin = Arc::clone(plugin);
            let registry = Arc::clone(&self.registry);
            pending.insert(plugin.kind());
            tasks.spawn(async move {
                let kind = plugin.kind();
                (kind, plugin.collect(&ctx, &registry).await)
            });
        }

        loop {
            let joined = match tokio::time::timeout_at(ctx.deadline(), tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_elapsed) => {
                    for kind in &pending {
                        warn!(plugin = kind.as_str(), "plugin missed the cycle deadline");
                        self.record_failure(*kind, &CollectError::DeadlineExceeded);
                    }
                    tasks.abort_all();
                    break;
                }
            };

            match joined {
                Ok((kind, Ok(facet))) => {
                    pending.remove(&kind);
                    self.merge(&mut snapshot, kind, facet);
                }
                Ok((kind, Err(err))) => {
                    pending.remove(&kind);
                    warn!(plugin = kind.as_str(), error = %err, "plugin failed, field left empty");
                    self.record_failure(kind, &err);
                }
                Err(err) => {
                    error!(error = %err, "plugin task did not complete");
                }
            }
        }

        snapshot.metadata.timestamp = Utc::now();
        let elapsed = started.elapsed();
        debug!(
            elapsed_ms = elapsed.as_millis() as u64,
            interfaces = self.registry.interfaces.len(),
            block_devices = self.registry.block_devices.len(),
            "collection cycle finished"
        );
        if let Some(metrics) = &self.metrics {
            metrics.observe_cycle(elapsed);
        }
        snapshot
    }

    fn merge(&self, snapshot: &mut Snapshot, kind: PluginKind, facet: Facet) {
        // A plugin returning another plugin's facet is a wiring bug.
        assert_eq!(
            facet.kind(),
            kind,
            "plugin `{kind}` produced a `{}` facet",
            facet.kind()
        );
        facet.merge_into(snapshot);
    }

    fn record_failure(&self, kind: PluginKind, err: &CollectError) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match err {
            CollectError::DeadlineExceeded => metrics.inc_plugin_timeout(kind.as_str()),
            _ => metrics.inc_plugin_error(kind.as_str()),
        }
    }
}

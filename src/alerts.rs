//! Threshold rules evaluated against each published snapshot.
//!
//! Every rule walks `idle -> triggered -> cooling-down -> idle`: a rule that
//! fired is skipped until the cooldown window has passed since `last_fired`.
//! Delivery is handed to a [`NotificationSink`] and never awaited.

use crate::schema::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertMetric {
    Cpu,
    #[serde(alias = "memory")]
    Mem,
    /// Highest used percentage of any mounted disk.
    Disk,
}

impl AlertMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertMetric::Cpu => "cpu",
            AlertMetric::Mem => "mem",
            AlertMetric::Disk => "disk",
        }
    }

    pub fn value(self, snapshot: &Snapshot) -> f64 {
        match self {
            AlertMetric::Cpu => snapshot.cpu.global_usage_percent,
            AlertMetric::Mem => snapshot.memory.used_percent(),
            AlertMetric::Disk => snapshot
                .disks
                .iter()
                .map(|d| d.used_percent())
                .fold(0.0, f64::max),
        }
    }
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub metric: AlertMetric,
    pub threshold: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip)]
    pub last_fired: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Rule {
    pub fn new(id: impl Into<String>, metric: AlertMetric, threshold: f64) -> Self {
        Self {
            id: id.into(),
            metric,
            threshold,
            enabled: true,
            last_fired: None,
        }
    }

    fn cooling_down(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        let Some(last) = self.last_fired else {
            return false;
        };
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < cooldown,
            // Clock went backwards; stay quiet until it catches up.
            Err(_) => true,
        }
    }
}

pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new("cpu_high", AlertMetric::Cpu, 90.0),
        Rule::new("mem_critical", AlertMetric::Mem, 95.0),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub rule_id: String,
    pub metric: AlertMetric,
    pub value: f64,
    pub threshold: f64,
    pub hostname: String,
    pub fired_at: DateTime<Utc>,
}

impl Alert {
    /// Markdown text understood by chat webhooks.
    pub fn markdown(&self) -> String {
        format!(
            "\u{1F6A8} **AEGIS ALERT** [{}]: {} threshold breached! Current: {:.1}% (Limit: {:.1}%)",
            host_label(&self.hostname),
            self.metric,
            self.value,
            self.threshold
        )
    }
}

pub(crate) fn host_label(hostname: &str) -> &str {
    if hostname.is_empty() {
        "unknown host"
    } else {
        hostname
    }
}

/// Outbound alert delivery. `dispatch` must return without waiting on the
/// network; failures are the sink's to log.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    fn dispatch(&self, alert: &Alert);
}

pub struct AlertEvaluator {
    rules: Vec<Rule>,
    cooldown: Duration,
    sink: Arc<dyn NotificationSink>,
}

impl AlertEvaluator {
    pub fn new(rules: Vec<Rule>, cooldown: Duration, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            rules,
            cooldown,
            sink,
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Checks every enabled rule in order and returns the alerts that fired.
    pub fn evaluate(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<Alert> {
        let mut fired = Vec::new();
        for rule in &mut self.rules {
            if !rule.enabled || rule.cooling_down(now, self.cooldown) {
                continue;
            }
            let value = rule.metric.value(snapshot);
            if value <= rule.threshold {
                continue;
            }

            let alert = Alert {
                rule_id: rule.id.clone(),
                metric: rule.metric,
                value,
                threshold: rule.threshold,
                hostname: snapshot.metadata.hostname.clone(),
                fired_at: now,
            };
            info!(
                rule = %rule.id,
                metric = %rule.metric,
                value,
                threshold = rule.threshold,
                sink = self.sink.name(),
                "alert fired"
            );
            self.sink.dispatch(&alert);
            rule.last_fired = Some(now);
            fired.push(alert);
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Cpu, Disk, Memory};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl NotificationSink for CollectingSink {
        fn name(&self) -> &'static str {
            "collecting"
        }

        fn dispatch(&self, alert: &Alert) {
            self.alerts.lock().unwrap().push(alert.clone());
        }
    }

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn cpu_at(percent: f64) -> Snapshot {
        Snapshot {
            cpu: Cpu {
                global_usage_percent: percent,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn evaluator(rules: Vec<Rule>) -> (AlertEvaluator, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        (AlertEvaluator::new(rules, FIVE_MINUTES, sink.clone()), sink)
    }

    #[test]
    fn cooldown_suppresses_repeat_until_window_passes() {
        let (mut evaluator, sink) = evaluator(vec![Rule::new("cpu_high", AlertMetric::Cpu, 90.0)]);
        let t0 = Utc::now();
        let hot = cpu_at(97.0);

        assert_eq!(evaluator.evaluate(&hot, t0).len(), 1);
        assert!(evaluator
            .evaluate(&hot, t0 + chrono::Duration::seconds(1))
            .is_empty());
        assert_eq!(
            evaluator
                .evaluate(&hot, t0 + chrono::Duration::minutes(6))
                .len(),
            1
        );
        assert_eq!(sink.alerts.lock().unwrap().len(), 2);
        assert_eq!(
            evaluator.rules()[0].last_fired,
            Some(t0 + chrono::Duration::minutes(6))
        );
    }

    #[test]
    fn value_at_threshold_does_not_fire() {
        let (mut evaluator, sink) = evaluator(vec![Rule::new("cpu_high", AlertMetric::Cpu, 90.0)]);
        assert!(evaluator.evaluate(&cpu_at(90.0), Utc::now()).is_empty());
        assert!(sink.alerts.lock().unwrap().is_empty());
    }

    #[test]
    fn rules_on_same_metric_fire_independently() {
        let (mut evaluator, _) = evaluator(vec![
            Rule::new("cpu_warn", AlertMetric::Cpu, 70.0),
            Rule::new("cpu_high", AlertMetric::Cpu, 90.0),
        ]);
        let fired = evaluator.evaluate(&cpu_at(95.0), Utc::now());
        let ids: Vec<_> = fired.iter().map(|a| a.rule_id.as_str()).collect();
        assert_eq!(ids, ["cpu_warn", "cpu_high"]);
    }

    #[test]
    fn disabled_rule_never_fires() {
        let mut rule = Rule::new("cpu_high", AlertMetric::Cpu, 10.0);
        rule.enabled = false;
        let (mut evaluator, _) = evaluator(vec![rule]);
        assert!(evaluator.evaluate(&cpu_at(99.0), Utc::now()).is_empty());
    }

    #[test]
    fn memory_and_disk_metrics() {
        let snapshot = Snapshot {
            memory: Memory {
                total_mb: 1000,
                used_mb: 960,
                available_mb: 40,
                swap_used_mb: 0,
            },
            disks: vec![
                Disk {
                    total_gb: 100.0,
                    used_gb: 20.0,
                    ..Default::default()
                },
                Disk {
                    total_gb: 50.0,
                    used_gb: 45.0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!((AlertMetric::Mem.value(&snapshot) - 96.0).abs() < 1e-9);
        assert!((AlertMetric::Disk.value(&snapshot) - 90.0).abs() < 1e-9);
        assert_eq!(AlertMetric::Mem.value(&Snapshot::default()), 0.0);

        let (mut evaluator, _) = evaluator(default_rules());
        let fired = evaluator.evaluate(&snapshot, Utc::now());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule_id, "mem_critical");
    }

    #[test]
    fn memory_alias_and_markdown() {
        let rule: Rule =
            serde_yaml::from_str("id: ram\nmetric: memory\nthreshold: 80\n").unwrap();
        assert_eq!(rule.metric, AlertMetric::Mem);
        assert!(rule.enabled);

        let alert = Alert {
            rule_id: "cpu_high".to_string(),
            metric: AlertMetric::Cpu,
            value: 93.26,
            threshold: 90.0,
            hostname: "db-1".to_string(),
            fired_at: Utc::now(),
        };
        assert!(alert
            .markdown()
            .ends_with("[db-1]: cpu threshold breached! Current: 93.3% (Limit: 90.0%)"));
    }
}

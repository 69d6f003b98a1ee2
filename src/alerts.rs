use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub metric: String,
    pub warning_level: f64,
    pub critical_level: f64,
    #[serde(default)]
    pub hysteresis_margin: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Inclusive at both boundaries: a value sitting exactly on a level breaches
/// it.
pub fn classify(value: f64, threshold: &AlertThreshold) -> Option<Severity> {
    if value >= threshold.critical_level {
        Some(Severity::Critical)
    } else if value >= threshold.warning_level {
        Some(Severity::Warning)
    } else {
        None
    }
}

/// Immutable threshold snapshot, keyed by metric name. Swapped wholesale on
/// reload so evaluator reads never see a half-updated configuration.
#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    by_metric: HashMap<String, AlertThreshold>,
}

impl ThresholdSet {
    pub fn from_thresholds(thresholds: Vec<AlertThreshold>) -> Self {
        let by_metric = thresholds
            .into_iter()
            .map(|t| (t.metric.clone(), t))
            .collect();
        Self { by_metric }
    }

    pub fn get(&self, metric: &str) -> Option<&AlertThreshold> {
        self.by_metric.get(metric)
    }

    pub fn len(&self) -> usize {
        self.by_metric.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_metric.is_empty()
    }
}

/// Hot-reloadable handle: readers clone the current `Arc` under a short read
/// lock, a reload replaces it in one store. Changes take effect on the next
/// evaluation; open alerts are never reclassified retroactively.
#[derive(Clone, Default)]
pub struct ThresholdHandle {
    current: Arc<RwLock<Arc<ThresholdSet>>>,
}

impl ThresholdHandle {
    pub fn new(set: ThresholdSet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(set))),
        }
    }

    pub fn current(&self) -> Arc<ThresholdSet> {
        self.current.read().clone()
    }

    pub fn replace(&self, set: ThresholdSet) {
        *self.current.write() = Arc::new(set);
    }
}

pub fn load_threshold_file(path: &Path) -> anyhow::Result<ThresholdSet> {
    let contents = std::fs::read_to_string(path)?;
    let mut bytes = contents.into_bytes();
    let thresholds: Vec<AlertThreshold> = simd_json::serde::from_slice(&mut bytes)?;
    Ok(ThresholdSet::from_thresholds(thresholds))
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub device_id: String,
    pub metric: String,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
}

/// What a single evaluation did, for logging and storage projection.
#[derive(Debug, Clone)]
pub enum AlertTransition {
    Opened(Alert),
    Escalated(Alert),
    Closed(Alert),
}

impl AlertTransition {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertTransition::Opened(alert)
            | AlertTransition::Escalated(alert)
            | AlertTransition::Closed(alert) => alert,
        }
    }
}

/// Open-alert table keyed by `(device, metric)`. Same-device evaluations are
/// serialized by the device lane, so each key has a single writer.
#[derive(Clone, Default)]
pub struct AlertEvaluator {
    thresholds: ThresholdHandle,
    open: Arc<RwLock<HashMap<(String, String), Alert>>>,
}

impl AlertEvaluator {
    pub fn new(thresholds: ThresholdHandle) -> Self {
        Self {
            thresholds,
            open: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn thresholds(&self) -> &ThresholdHandle {
        &self.thresholds
    }

    /// Runs one metric reading through the open/close lifecycle. Disabled or
    /// unconfigured metrics are not evaluated at all, which also leaves any
    /// open alert untouched.
    pub fn evaluate(
        &self,
        device_id: &str,
        metric: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<AlertTransition> {
        let snapshot = self.thresholds.current();
        let threshold = snapshot.get(metric).filter(|t| t.enabled)?;
        let severity = classify(value, threshold);
        let key = (device_id.to_string(), metric.to_string());

        let mut open = self.open.write();
        match (severity, open.get_mut(&key)) {
            (Some(severity), Some(existing)) => {
                if severity > existing.severity {
                    // Escalate in place: same alert, higher severity.
                    existing.severity = severity;
                    existing.value = value;
                    existing.threshold = level_for(threshold, severity);
                    Some(AlertTransition::Escalated(existing.clone()))
                } else {
                    // Same or higher severity already open: de-duplicate.
                    None
                }
            }
            (Some(severity), None) => {
                let alert = Alert {
                    id: Uuid::new_v4(),
                    device_id: device_id.to_string(),
                    metric: metric.to_string(),
                    severity,
                    value,
                    threshold: level_for(threshold, severity),
                    opened_at: now,
                    closed_at: None,
                    acknowledged: false,
                };
                open.insert(key, alert.clone());
                Some(AlertTransition::Opened(alert))
            }
            (None, Some(existing)) => {
                // Hysteresis: recovery must clear the band below the level
                // for the open severity, not just the level itself.
                let close_below =
                    level_for(threshold, existing.severity) - threshold.hysteresis_margin;
                if value < close_below {
                    // The key is present under the held write lock.
                    let mut closed = open.remove(&key)?;
                    closed.closed_at = Some(now);
                    closed.value = value;
                    Some(AlertTransition::Closed(closed))
                } else {
                    None
                }
            }
            (None, None) => None,
        }
    }

    pub fn acknowledge(&self, alert_id: Uuid) -> Option<Alert> {
        let mut open = self.open.write();
        for alert in open.values_mut() {
            if alert.id == alert_id {
                alert.acknowledged = true;
                return Some(alert.clone());
            }
        }
        None
    }

    /// Read-only projection for the reporting layer.
    pub fn open_alerts(
        &self,
        device_id: Option<&str>,
        severity: Option<Severity>,
    ) -> Vec<Alert> {
        let open = self.open.read();
        let mut out: Vec<Alert> = open
            .values()
            .filter(|alert| device_id.map(|d| alert.device_id == d).unwrap_or(true))
            .filter(|alert| severity.map(|s| alert.severity == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.id.cmp(&b.id)));
        out
    }
}

fn level_for(threshold: &AlertThreshold, severity: Severity) -> f64 {
    match severity {
        Severity::Warning => threshold.warning_level,
        Severity::Critical => threshold.critical_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_threshold() -> AlertThreshold {
        AlertThreshold {
            metric: "cpu".to_string(),
            warning_level: 80.0,
            critical_level: 90.0,
            hysteresis_margin: 5.0,
            enabled: true,
        }
    }

    fn evaluator() -> AlertEvaluator {
        let handle = ThresholdHandle::new(ThresholdSet::from_thresholds(vec![cpu_threshold()]));
        AlertEvaluator::new(handle)
    }

    #[test]
    fn classify_is_inclusive_at_both_levels() {
        let t = cpu_threshold();
        assert_eq!(classify(79.9, &t), None);
        assert_eq!(classify(80.0, &t), Some(Severity::Warning));
        assert_eq!(classify(89.9, &t), Some(Severity::Warning));
        assert_eq!(classify(90.0, &t), Some(Severity::Critical));
        assert_eq!(classify(100.0, &t), Some(Severity::Critical));
    }

    #[test]
    fn classify_is_monotonic_in_value() {
        let t = cpu_threshold();
        let mut prev = classify(0.0, &t);
        for step in 1..=1200 {
            let current = classify(step as f64 / 10.0, &t);
            assert!(current >= prev, "classification regressed at {step}");
            prev = current;
        }
    }

    #[test]
    fn repeated_breaches_open_exactly_one_alert() {
        let eval = evaluator();
        let now = Utc::now();
        let first = eval.evaluate("r1", "cpu", 95.0, now);
        assert!(matches!(first, Some(AlertTransition::Opened(_))));
        assert!(eval.evaluate("r1", "cpu", 95.0, now).is_none());
        assert!(eval.evaluate("r1", "cpu", 96.0, now).is_none());
        assert_eq!(eval.open_alerts(Some("r1"), None).len(), 1);
        assert_eq!(
            eval.open_alerts(Some("r1"), None)[0].severity,
            Severity::Critical
        );
    }

    #[test]
    fn warning_escalates_in_place_keeping_opened_at() {
        let eval = evaluator();
        let opened_at = Utc::now();
        let opened = eval.evaluate("r1", "cpu", 85.0, opened_at);
        assert!(matches!(opened, Some(AlertTransition::Opened(_))));

        let later = opened_at + chrono::Duration::seconds(10);
        match eval.evaluate("r1", "cpu", 93.0, later) {
            Some(AlertTransition::Escalated(alert)) => {
                assert_eq!(alert.severity, Severity::Critical);
                assert_eq!(alert.opened_at, opened_at);
                assert!((alert.threshold - 90.0).abs() < f64::EPSILON);
            }
            other => panic!("expected escalation, got {other:?}"),
        }
        assert_eq!(eval.open_alerts(None, None).len(), 1);
    }

    #[test]
    fn critical_alert_holds_through_hysteresis_band() {
        // Warning close to critical so the hysteresis band reaches below it.
        let eval = AlertEvaluator::new(ThresholdHandle::new(ThresholdSet::from_thresholds(vec![
            AlertThreshold {
                metric: "cpu".to_string(),
                warning_level: 88.0,
                critical_level: 90.0,
                hysteresis_margin: 5.0,
                enabled: true,
            },
        ])));
        let now = Utc::now();
        eval.evaluate("r1", "cpu", 95.0, now);

        // Exactly at the critical level: still open.
        assert!(eval.evaluate("r1", "cpu", 90.0, now).is_none());
        // Recovered below warning but not past critical - margin: still open.
        assert!(eval.evaluate("r1", "cpu", 87.0, now).is_none());
        assert!(eval.evaluate("r1", "cpu", 85.0, now).is_none());
        assert_eq!(eval.open_alerts(None, None).len(), 1);

        let closed = eval.evaluate("r1", "cpu", 84.9, now);
        assert!(matches!(closed, Some(AlertTransition::Closed(_))));
        assert!(eval.open_alerts(None, None).is_empty());
        if let Some(AlertTransition::Closed(alert)) = closed {
            assert!(alert.closed_at.is_some());
        }
    }

    #[test]
    fn close_removes_entry_and_reports_recovery_value() {
        let eval = evaluator();
        let opened_at = Utc::now();
        eval.evaluate("r1", "cpu", 85.0, opened_at);

        let closed_at = opened_at + chrono::Duration::seconds(30);
        match eval.evaluate("r1", "cpu", 70.0, closed_at) {
            Some(AlertTransition::Closed(alert)) => {
                assert_eq!(alert.severity, Severity::Warning);
                assert_eq!(alert.opened_at, opened_at);
                assert_eq!(alert.closed_at, Some(closed_at));
                assert!((alert.value - 70.0).abs() < f64::EPSILON);
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(eval.open_alerts(None, None).is_empty());
        // A fresh breach opens a new alert rather than resurrecting the old.
        assert!(matches!(
            eval.evaluate("r1", "cpu", 85.0, closed_at),
            Some(AlertTransition::Opened(_))
        ));
    }

    #[test]
    fn warning_alert_closes_below_warning_minus_margin() {
        let eval = evaluator();
        let now = Utc::now();
        eval.evaluate("r1", "cpu", 82.0, now);
        assert!(eval.evaluate("r1", "cpu", 76.0, now).is_none());
        let closed = eval.evaluate("r1", "cpu", 74.9, now);
        assert!(matches!(closed, Some(AlertTransition::Closed(_))));
    }

    #[test]
    fn threshold_reload_applies_on_next_evaluation() {
        let eval = evaluator();
        let now = Utc::now();
        assert!(eval.evaluate("r1", "cpu", 85.0, now).is_some());

        let mut relaxed = cpu_threshold();
        relaxed.warning_level = 95.0;
        relaxed.critical_level = 99.0;
        eval.thresholds()
            .replace(ThresholdSet::from_thresholds(vec![relaxed]));

        // 85 is now clean and clears the warning band (95 - 5 = 90 > 85).
        let closed = eval.evaluate("r1", "cpu", 85.0, now);
        assert!(matches!(closed, Some(AlertTransition::Closed(_))));
    }

    #[test]
    fn disabled_metric_is_not_evaluated() {
        let mut threshold = cpu_threshold();
        threshold.enabled = false;
        let eval = AlertEvaluator::new(ThresholdHandle::new(ThresholdSet::from_thresholds(vec![
            threshold,
        ])));
        assert!(eval.evaluate("r1", "cpu", 99.0, Utc::now()).is_none());
        assert!(eval.open_alerts(None, None).is_empty());
    }

    #[test]
    fn alerts_are_independent_per_device_and_metric() {
        let handle = ThresholdHandle::new(ThresholdSet::from_thresholds(vec![
            cpu_threshold(),
            AlertThreshold {
                metric: "temperature".to_string(),
                warning_level: 60.0,
                critical_level: 75.0,
                hysteresis_margin: 2.0,
                enabled: true,
            },
        ]));
        let eval = AlertEvaluator::new(handle);
        let now = Utc::now();
        eval.evaluate("r1", "cpu", 95.0, now);
        eval.evaluate("r2", "cpu", 95.0, now);
        eval.evaluate("r1", "temperature", 62.0, now);

        assert_eq!(eval.open_alerts(None, None).len(), 3);
        assert_eq!(eval.open_alerts(Some("r1"), None).len(), 2);
        assert_eq!(
            eval.open_alerts(None, Some(Severity::Critical)).len(),
            2
        );
    }

    #[test]
    fn acknowledge_marks_open_alert() {
        let eval = evaluator();
        let now = Utc::now();
        let opened = match eval.evaluate("r1", "cpu", 95.0, now) {
            Some(AlertTransition::Opened(alert)) => alert,
            other => panic!("expected open, got {other:?}"),
        };
        assert!(eval.acknowledge(opened.id).is_some());
        assert!(eval.open_alerts(None, None)[0].acknowledged);
        assert!(eval.acknowledge(Uuid::new_v4()).is_none());
    }
}

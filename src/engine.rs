use crate::alerts::{AlertEvaluator, AlertTransition};
use crate::devices::{ActivityOutcome, DeviceRegistry};
use crate::jobs::JobEngine;
use crate::router::{JobEvent, Payload, RoutedMessage};
use crate::storage::{PointRow, StorageHandle};
use serde_json::json;

/// Applies one routed message to the in-memory state and projects the results
/// to storage. Called from a single lane worker per device, so per-device
/// processing is strictly sequential; the storage writes it emits never block.
#[derive(Clone)]
pub struct Engine {
    devices: DeviceRegistry,
    alerts: AlertEvaluator,
    jobs: JobEngine,
    storage: StorageHandle,
}

impl Engine {
    pub fn new(
        devices: DeviceRegistry,
        alerts: AlertEvaluator,
        jobs: JobEngine,
        storage: StorageHandle,
    ) -> Self {
        Self {
            devices,
            alerts,
            jobs,
            storage,
        }
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn alerts(&self) -> &AlertEvaluator {
        &self.alerts
    }

    pub fn jobs(&self) -> &JobEngine {
        &self.jobs
    }

    pub fn handle(&self, msg: RoutedMessage) {
        let outcome = self.devices.record_activity(&msg.device_id, msg.received_at);
        if outcome == ActivityOutcome::Created {
            tracing::info!(device = %msg.device_id, "device registered on first contact");
        } else if outcome == ActivityOutcome::CameOnline {
            tracing::info!(device = %msg.device_id, "device back online");
        }

        let touched_snapshot = match &msg.payload {
            Payload::Status {
                cpu,
                memory,
                disk,
                temperature,
                uptime_seconds,
            } => {
                self.devices.update_status_metrics(
                    &msg.device_id,
                    *cpu,
                    *memory,
                    *disk,
                    *temperature,
                    *uptime_seconds,
                );
                for (metric, value) in [
                    ("cpu", *cpu),
                    ("memory", *memory),
                    ("disk", *disk),
                    ("temperature", *temperature),
                ] {
                    self.apply_alert(&msg.device_id, metric, value, &msg);
                }
                self.storage.write_point(PointRow {
                    measurement: "status",
                    device_id: msg.device_id.clone(),
                    fields: json!({
                        "cpu": cpu,
                        "memory": memory,
                        "disk": disk,
                        "temperature": temperature,
                        "uptime_seconds": uptime_seconds,
                    }),
                    published_at: msg.published_at,
                    received_at: msg.received_at,
                });
                true
            }
            Payload::Sensor {
                accel,
                gyro,
                ultrasonic_distance,
                servo_angle,
                light_level,
            } => {
                self.storage.write_point(PointRow {
                    measurement: "sensor",
                    device_id: msg.device_id.clone(),
                    fields: json!({
                        "accel": accel,
                        "gyro": gyro,
                        "ultrasonic_distance": ultrasonic_distance,
                        "servo_angle": servo_angle,
                        "light_level": light_level,
                    }),
                    published_at: msg.published_at,
                    received_at: msg.received_at,
                });
                false
            }
            Payload::Battery { percent, voltage } => {
                self.devices.update_battery(&msg.device_id, *percent);
                self.apply_alert(&msg.device_id, "battery", *percent, &msg);
                self.storage.write_point(PointRow {
                    measurement: "battery",
                    device_id: msg.device_id.clone(),
                    fields: json!({ "percent": percent, "voltage": voltage }),
                    published_at: msg.published_at,
                    received_at: msg.received_at,
                });
                true
            }
            Payload::Location { lat, lon, heading } => {
                self.devices.update_position(&msg.device_id, *lat, *lon);
                self.storage.write_point(PointRow {
                    measurement: "location",
                    device_id: msg.device_id.clone(),
                    fields: json!({ "lat": lat, "lon": lon, "heading": heading }),
                    published_at: msg.published_at,
                    received_at: msg.received_at,
                });
                true
            }
            Payload::Job { .. } => {
                self.handle_job(&msg);
                false
            }
        };

        if touched_snapshot || outcome != ActivityOutcome::Unchanged {
            if let Some(snap) = self.devices.snapshot(&msg.device_id) {
                self.storage.upsert_device((&snap).into());
            }
        }
    }

    fn handle_job(&self, msg: &RoutedMessage) {
        let Payload::Job {
            event,
            code,
            target,
            count,
            reason,
        } = &msg.payload
        else {
            return;
        };

        let updated = match event {
            JobEvent::Trigger => {
                match self
                    .jobs
                    .trigger(&msg.device_id, code.clone(), *target, msg.received_at)
                {
                    Ok(job) => {
                        tracing::info!(
                            device = %msg.device_id,
                            job = %job.id,
                            code = job.trigger_code.as_deref().unwrap_or("-"),
                            "job started"
                        );
                        Some(job)
                    }
                    Err(err) => {
                        tracing::warn!(device = %msg.device_id, error = %err, "job trigger rejected");
                        None
                    }
                }
            }
            JobEvent::Item => {
                self.jobs
                    .item_processed(&msg.device_id, count.unwrap_or(1), msg.received_at)
            }
            JobEvent::Complete => {
                let job = self.jobs.complete(&msg.device_id, msg.received_at);
                if let Some(job) = &job {
                    tracing::info!(device = %msg.device_id, job = %job.id, "job completed");
                }
                job
            }
            JobEvent::Fail => {
                let job = self
                    .jobs
                    .fail(&msg.device_id, reason.clone(), msg.received_at);
                if let Some(job) = &job {
                    tracing::warn!(
                        device = %msg.device_id,
                        job = %job.id,
                        reason = job.fail_reason.as_deref().unwrap_or("-"),
                        "job failed"
                    );
                }
                job
            }
        };

        if let Some(job) = updated {
            self.storage.upsert_job((&job).into());
        }
    }

    fn apply_alert(&self, device_id: &str, metric: &str, value: f64, msg: &RoutedMessage) {
        let Some(transition) = self
            .alerts
            .evaluate(device_id, metric, value, msg.received_at)
        else {
            return;
        };
        match &transition {
            AlertTransition::Opened(alert) => {
                tracing::warn!(
                    device = %device_id,
                    metric,
                    severity = alert.severity.as_str(),
                    value,
                    "alert opened"
                );
            }
            AlertTransition::Escalated(alert) => {
                tracing::warn!(
                    device = %device_id,
                    metric,
                    severity = alert.severity.as_str(),
                    value,
                    "alert escalated"
                );
            }
            AlertTransition::Closed(_) => {
                tracing::info!(device = %device_id, metric, value, "alert closed");
            }
        }
        self.storage.upsert_alert(transition.alert().into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertThreshold, Severity, ThresholdHandle, ThresholdSet};
    use crate::jobs::JobStatus;
    use crate::pipeline::IngestStats;
    use crate::router::Category;
    use crate::storage::WriteCommand;
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn engine_with_rx() -> (Engine, mpsc::Receiver<WriteCommand>) {
        let stats = Arc::new(IngestStats::new());
        let (tx, rx) = mpsc::channel(256);
        let storage = StorageHandle::new(tx, stats);
        let thresholds = ThresholdHandle::new(ThresholdSet::from_thresholds(vec![
            AlertThreshold {
                metric: "temperature".to_string(),
                warning_level: 60.0,
                critical_level: 75.0,
                hysteresis_margin: 2.0,
                enabled: true,
            },
        ]));
        let engine = Engine::new(
            DeviceRegistry::new(),
            AlertEvaluator::new(thresholds),
            JobEngine::new(),
            storage,
        );
        (engine, rx)
    }

    fn msg(device_id: &str, category: Category, payload: Payload) -> RoutedMessage {
        let now = Utc::now();
        RoutedMessage {
            device_id: device_id.to_string(),
            category,
            payload,
            published_at: now,
            received_at: now,
        }
    }

    fn status(device_id: &str, temperature: f64) -> RoutedMessage {
        msg(
            device_id,
            Category::Status,
            Payload::Status {
                cpu: 30.0,
                memory: 40.0,
                disk: 20.0,
                temperature,
                uptime_seconds: Some(60),
            },
        )
    }

    fn drain(rx: &mut mpsc::Receiver<WriteCommand>) -> Vec<WriteCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[test]
    fn status_message_registers_device_and_writes_point() {
        let (engine, mut rx) = engine_with_rx();
        engine.handle(status("r1", 45.0));

        let snap = engine.devices().snapshot("r1").unwrap();
        assert_eq!(snap.metrics.temperature, Some(45.0));

        let cmds = drain(&mut rx);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, WriteCommand::Point(p) if p.measurement == "status")));
        assert!(cmds
            .iter()
            .any(|c| matches!(c, WriteCommand::UpsertDevice(_))));
    }

    #[test]
    fn hot_temperature_opens_alert_and_projects_it() {
        let (engine, mut rx) = engine_with_rx();
        engine.handle(status("r1", 80.0));

        let open = engine.alerts().open_alerts(Some("r1"), None);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].severity, Severity::Critical);

        let cmds = drain(&mut rx);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, WriteCommand::UpsertAlert(a) if a.severity == "critical")));
    }

    #[test]
    fn alert_closes_once_temperature_clears_the_band() {
        let (engine, mut rx) = engine_with_rx();
        engine.handle(status("r1", 65.0));
        // 60 - 2 = 58 is the close boundary for the open warning.
        engine.handle(status("r1", 59.0));
        assert_eq!(engine.alerts().open_alerts(None, None).len(), 1);

        engine.handle(status("r1", 57.0));
        assert!(engine.alerts().open_alerts(None, None).is_empty());

        let closes = drain(&mut rx)
            .into_iter()
            .filter(|c| matches!(c, WriteCommand::UpsertAlert(a) if a.closed_at.is_some()))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn job_lifecycle_runs_through_storage_projection() {
        let (engine, mut rx) = engine_with_rx();
        engine.handle(msg(
            "r1",
            Category::Job,
            Payload::Job {
                event: JobEvent::Trigger,
                code: Some("PKG-778".into()),
                target: Some(2),
                count: None,
                reason: None,
            },
        ));
        for _ in 0..2 {
            engine.handle(msg(
                "r1",
                Category::Job,
                Payload::Job {
                    event: JobEvent::Item,
                    code: None,
                    target: None,
                    count: Some(1),
                    reason: None,
                },
            ));
        }

        let job = engine.jobs().current("r1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.items_processed, 2);

        let upserts = drain(&mut rx)
            .into_iter()
            .filter(|c| matches!(c, WriteCommand::UpsertJob(_)))
            .count();
        assert_eq!(upserts, 3);
    }

    #[test]
    fn second_trigger_is_rejected_and_not_projected() {
        let (engine, mut rx) = engine_with_rx();
        let trigger = |code: &str| {
            msg(
                "r1",
                Category::Job,
                Payload::Job {
                    event: JobEvent::Trigger,
                    code: Some(code.into()),
                    target: None,
                    count: None,
                    reason: None,
                },
            )
        };
        engine.handle(trigger("A"));
        engine.handle(trigger("B"));

        let job = engine.jobs().current("r1").unwrap();
        assert_eq!(job.trigger_code.as_deref(), Some("A"));

        let upserts = drain(&mut rx)
            .into_iter()
            .filter(|c| matches!(c, WriteCommand::UpsertJob(_)))
            .count();
        assert_eq!(upserts, 1);
    }

    #[test]
    fn sensor_sample_writes_point_without_touching_alerts() {
        let (engine, mut rx) = engine_with_rx();
        engine.handle(msg(
            "r1",
            Category::Sensor,
            Payload::Sensor {
                accel: Some([0.1, 0.0, 9.8]),
                gyro: None,
                ultrasonic_distance: Some(0.4),
                servo_angle: None,
                light_level: Some(310.0),
            },
        ));

        assert!(engine.alerts().open_alerts(None, None).is_empty());
        let cmds = drain(&mut rx);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, WriteCommand::Point(p) if p.measurement == "sensor")));
    }
}

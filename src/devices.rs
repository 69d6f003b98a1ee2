use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Missed-heartbeat budget before a device flips offline. A single dropped
/// packet must not flap the status.
const OFFLINE_MULTIPLIER: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

/// Latest reported operating metrics for a device. Fields stay `None` until
/// the first payload carrying them arrives.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricSnapshot {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub disk: Option<f64>,
    pub temperature: Option<f64>,
    pub battery: Option<f64>,
    pub position: Option<(f64, f64)>,
    pub uptime_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    pub metrics: MetricSnapshot,
}

#[derive(Debug)]
struct DeviceEntry {
    status: DeviceStatus,
    last_seen: DateTime<Utc>,
    metrics: MetricSnapshot,
}

/// Outcome of `record_activity`, used to decide whether a relational upsert
/// is worth emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    Created,
    CameOnline,
    Refreshed,
    /// Stale duplicate; nothing moved.
    Unchanged,
}

/// Keyed device table. Writes for a given device only happen from its lane
/// worker or from the sweep task; the lock is never held across an await.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<HashMap<String, DeviceEntry>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert: first contact creates the row, repeats refresh it.
    /// `last_seen` takes the max of the stored and incoming timestamps so an
    /// out-of-order duplicate can never regress it.
    pub fn record_activity(&self, device_id: &str, received_at: DateTime<Utc>) -> ActivityOutcome {
        let mut table = self.inner.write();
        match table.get_mut(device_id) {
            Some(entry) => {
                let was_offline = entry.status != DeviceStatus::Online;
                entry.status = DeviceStatus::Online;
                if received_at > entry.last_seen {
                    entry.last_seen = received_at;
                    if was_offline {
                        ActivityOutcome::CameOnline
                    } else {
                        ActivityOutcome::Refreshed
                    }
                } else if was_offline {
                    ActivityOutcome::CameOnline
                } else {
                    ActivityOutcome::Unchanged
                }
            }
            None => {
                table.insert(
                    device_id.to_string(),
                    DeviceEntry {
                        status: DeviceStatus::Online,
                        last_seen: received_at,
                        metrics: MetricSnapshot::default(),
                    },
                );
                ActivityOutcome::Created
            }
        }
    }

    /// Flips devices quiet for more than `3 × timeout` to offline and returns
    /// their ids so the caller can project the change to storage.
    pub fn sweep(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> Vec<String> {
        let budget = ChronoDuration::from_std(timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(30))
            * OFFLINE_MULTIPLIER;
        let mut flipped = Vec::new();
        let mut table = self.inner.write();
        for (device_id, entry) in table.iter_mut() {
            if entry.status == DeviceStatus::Online && now - entry.last_seen > budget {
                entry.status = DeviceStatus::Offline;
                flipped.push(device_id.clone());
            }
        }
        flipped
    }

    pub fn update_status_metrics(
        &self,
        device_id: &str,
        cpu: f64,
        memory: f64,
        disk: f64,
        temperature: f64,
        uptime_seconds: Option<i64>,
    ) {
        let mut table = self.inner.write();
        if let Some(entry) = table.get_mut(device_id) {
            entry.metrics.cpu = Some(cpu);
            entry.metrics.memory = Some(memory);
            entry.metrics.disk = Some(disk);
            entry.metrics.temperature = Some(temperature);
            if uptime_seconds.is_some() {
                entry.metrics.uptime_seconds = uptime_seconds;
            }
        }
    }

    pub fn update_battery(&self, device_id: &str, percent: f64) {
        let mut table = self.inner.write();
        if let Some(entry) = table.get_mut(device_id) {
            entry.metrics.battery = Some(percent);
        }
    }

    pub fn update_position(&self, device_id: &str, lat: f64, lon: f64) {
        let mut table = self.inner.write();
        if let Some(entry) = table.get_mut(device_id) {
            entry.metrics.position = Some((lat, lon));
        }
    }

    pub fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let table = self.inner.read();
        table.get(device_id).map(|entry| DeviceSnapshot {
            device_id: device_id.to_string(),
            status: entry.status,
            last_seen: entry.last_seen,
            metrics: entry.metrics.clone(),
        })
    }

    pub fn all_snapshots(&self) -> Vec<DeviceSnapshot> {
        let table = self.inner.read();
        let mut out: Vec<DeviceSnapshot> = table
            .iter()
            .map(|(device_id, entry)| DeviceSnapshot {
                device_id: device_id.clone(),
                status: entry.status,
                last_seen: entry.last_seen,
                metrics: entry.metrics.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_contact_creates_once() {
        let registry = DeviceRegistry::new();
        let now = Utc::now();
        assert_eq!(registry.record_activity("r1", now), ActivityOutcome::Created);
        assert_eq!(
            registry.record_activity("r1", now),
            ActivityOutcome::Unchanged
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn last_seen_never_regresses_on_stale_duplicates() {
        let registry = DeviceRegistry::new();
        let now = Utc::now();
        registry.record_activity("r1", now);
        registry.record_activity("r1", now - ChronoDuration::seconds(40));
        assert_eq!(registry.snapshot("r1").unwrap().last_seen, now);

        let later = now + ChronoDuration::seconds(5);
        assert_eq!(
            registry.record_activity("r1", later),
            ActivityOutcome::Refreshed
        );
        assert_eq!(registry.snapshot("r1").unwrap().last_seen, later);
    }

    #[test]
    fn sweep_flips_offline_after_three_missed_heartbeats() {
        let registry = DeviceRegistry::new();
        let timeout = Duration::from_secs(10);
        let start = Utc::now();
        registry.record_activity("r1", start);
        registry.record_activity("r2", start);

        // Inside the 3x budget: nothing flips.
        let flipped = registry.sweep(start + ChronoDuration::seconds(29), timeout);
        assert!(flipped.is_empty());

        let flipped = registry.sweep(start + ChronoDuration::seconds(31), timeout);
        assert_eq!(flipped.len(), 2);
        assert_eq!(
            registry.snapshot("r1").unwrap().status,
            DeviceStatus::Offline
        );

        // A message after the sweep restores online.
        let outcome = registry.record_activity("r1", start + ChronoDuration::seconds(35));
        assert_eq!(outcome, ActivityOutcome::CameOnline);
        assert_eq!(
            registry.snapshot("r1").unwrap().status,
            DeviceStatus::Online
        );
    }

    #[test]
    fn snapshot_tracks_latest_metrics() {
        let registry = DeviceRegistry::new();
        registry.record_activity("r1", Utc::now());
        registry.update_status_metrics("r1", 40.0, 60.0, 20.0, 45.0, Some(600));
        registry.update_battery("r1", 83.0);
        registry.update_position("r1", 47.1, 8.5);

        let snap = registry.snapshot("r1").unwrap();
        assert_eq!(snap.metrics.cpu, Some(40.0));
        assert_eq!(snap.metrics.battery, Some(83.0));
        assert_eq!(snap.metrics.position, Some((47.1, 8.5)));
        assert_eq!(snap.metrics.uptime_seconds, Some(600));
    }
}

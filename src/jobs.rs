use crate::error::TransitionError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub device_id: String,
    pub trigger_code: Option<String>,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub items_processed: u64,
    pub items_target: Option<u64>,
    pub fail_reason: Option<String>,
}

/// Per-device job state machine. Idle is the absence of an entry; at most one
/// running job exists per device. Terminal jobs are immutable; signals
/// arriving for them are ignored and logged, never errors.
#[derive(Clone, Default)]
pub struct JobEngine {
    active: Arc<RwLock<HashMap<String, Job>>>,
}

impl JobEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a job for an idle device. A second trigger while one is running
    /// is rejected and leaves the running job untouched; no queueing, no
    /// preemption.
    pub fn trigger(
        &self,
        device_id: &str,
        code: Option<String>,
        target: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<Job, TransitionError> {
        let mut active = self.active.write();
        if let Some(existing) = active.get(device_id) {
            if existing.status == JobStatus::Running {
                return Err(TransitionError::JobAlreadyActive {
                    device_id: device_id.to_string(),
                    job_id: existing.id,
                });
            }
        }
        let job = Job {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            trigger_code: code,
            status: JobStatus::Running,
            start_time: now,
            end_time: None,
            items_processed: 0,
            items_target: target,
            fail_reason: None,
        };
        active.insert(device_id.to_string(), job.clone());
        Ok(job)
    }

    /// Progress accounting; auto-completes when the target is reached.
    /// Returns the updated job, or None when no job is running or the count
    /// is zero.
    pub fn item_processed(
        &self,
        device_id: &str,
        delta: u64,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        if delta == 0 {
            tracing::debug!(device = %device_id, "item event with zero count; ignored");
            return None;
        }
        let mut active = self.active.write();
        let job = match active.get_mut(device_id) {
            Some(job) if job.status == JobStatus::Running => job,
            _ => {
                tracing::debug!(device = %device_id, "item event with no running job; ignored");
                return None;
            }
        };
        job.items_processed = job.items_processed.saturating_add(delta);
        if let Some(target) = job.items_target {
            if job.items_processed >= target {
                job.status = JobStatus::Completed;
                job.end_time = Some(now);
            }
        }
        Some(job.clone())
    }

    /// Explicit completion signal. Idempotent once terminal.
    pub fn complete(&self, device_id: &str, now: DateTime<Utc>) -> Option<Job> {
        let mut active = self.active.write();
        let job = match active.get_mut(device_id) {
            Some(job) if job.status == JobStatus::Running => job,
            _ => {
                tracing::debug!(device = %device_id, "complete event with no running job; ignored");
                return None;
            }
        };
        job.status = JobStatus::Completed;
        job.end_time = Some(now);
        Some(job.clone())
    }

    /// Failure signal; the reason is diagnostic text, not a typed value.
    pub fn fail(&self, device_id: &str, reason: Option<String>, now: DateTime<Utc>) -> Option<Job> {
        let mut active = self.active.write();
        let job = match active.get_mut(device_id) {
            Some(job) if job.status == JobStatus::Running => job,
            _ => {
                tracing::debug!(device = %device_id, "fail event with no running job; ignored");
                return None;
            }
        };
        job.status = JobStatus::Failed;
        job.end_time = Some(now);
        job.fail_reason = reason;
        Some(job.clone())
    }

    /// Latest job for a device, running or terminal. History beyond the last
    /// job lives in the relational store.
    pub fn current(&self, device_id: &str) -> Option<Job> {
        self.active.read().get(device_id).cloned()
    }

    pub fn running_count(&self) -> usize {
        self.active
            .read()
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_from_idle_starts_running_job() {
        let engine = JobEngine::new();
        let now = Utc::now();
        let job = engine
            .trigger("r1", Some("PKG-778".into()), None, now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.items_processed, 0);
        assert_eq!(job.start_time, now);
        assert!(job.end_time.is_none());
    }

    #[test]
    fn trigger_while_running_is_rejected_without_side_effects() {
        let engine = JobEngine::new();
        let now = Utc::now();
        let first = engine.trigger("r1", Some("A".into()), None, now).unwrap();
        engine.item_processed("r1", 1, now);

        let err = engine.trigger("r1", Some("B".into()), None, now).unwrap_err();
        assert_eq!(
            err,
            TransitionError::JobAlreadyActive {
                device_id: "r1".to_string(),
                job_id: first.id,
            }
        );

        let current = engine.current("r1").unwrap();
        assert_eq!(current.id, first.id);
        assert_eq!(current.trigger_code.as_deref(), Some("A"));
        assert_eq!(current.items_processed, 1);
    }

    #[test]
    fn items_accumulate_without_target() {
        let engine = JobEngine::new();
        let now = Utc::now();
        engine.trigger("r1", None, None, now).unwrap();
        for _ in 0..10 {
            engine.item_processed("r1", 1, now);
        }
        let job = engine.current("r1").unwrap();
        assert_eq!(job.items_processed, 10);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn zero_count_item_does_not_invent_progress() {
        let engine = JobEngine::new();
        let now = Utc::now();
        engine.trigger("r1", None, Some(1), now).unwrap();

        assert!(engine.item_processed("r1", 0, now).is_none());
        let job = engine.current("r1").unwrap();
        assert_eq!(job.items_processed, 0);
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn reaching_target_auto_completes() {
        let engine = JobEngine::new();
        let now = Utc::now();
        engine.trigger("r1", None, Some(10), now).unwrap();
        for i in 1..=9 {
            let job = engine.item_processed("r1", 1, now).unwrap();
            assert_eq!(job.status, JobStatus::Running, "completed early at {i}");
        }
        let job = engine.item_processed("r1", 1, now).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.items_processed, 10);
        assert!(job.end_time.is_some());
    }

    #[test]
    fn terminal_jobs_ignore_further_signals() {
        let engine = JobEngine::new();
        let now = Utc::now();
        engine.trigger("r1", None, None, now).unwrap();
        let completed = engine.complete("r1", now).unwrap();

        assert!(engine.item_processed("r1", 1, now).is_none());
        assert!(engine.complete("r1", now).is_none());
        assert!(engine.fail("r1", Some("late".into()), now).is_none());

        let job = engine.current("r1").unwrap();
        assert_eq!(job.id, completed.id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.items_processed, 0);
    }

    #[test]
    fn fail_records_reason() {
        let engine = JobEngine::new();
        let now = Utc::now();
        engine.trigger("r1", None, None, now).unwrap();
        let failed = engine.fail("r1", Some("gripper jam".into()), now).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.fail_reason.as_deref(), Some("gripper jam"));
    }

    #[test]
    fn new_trigger_allowed_after_terminal_job() {
        let engine = JobEngine::new();
        let now = Utc::now();
        let first = engine.trigger("r1", None, None, now).unwrap();
        engine.fail("r1", None, now);

        let second = engine.trigger("r1", Some("next".into()), None, now).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(engine.running_count(), 1);
    }

    #[test]
    fn signals_on_idle_device_are_ignored() {
        let engine = JobEngine::new();
        let now = Utc::now();
        assert!(engine.item_processed("ghost", 1, now).is_none());
        assert!(engine.complete("ghost", now).is_none());
        assert!(engine.fail("ghost", None, now).is_none());
        assert!(engine.current("ghost").is_none());
    }
}

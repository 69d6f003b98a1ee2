use crate::alerts::Alert;
use crate::devices::DeviceSnapshot;
use crate::jobs::Job;
use crate::pipeline::IngestStats;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_CAP: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: u32 = 5;

/// One time-series point: a measurement for a device with free-form fields.
/// Both sender and ingest timestamps travel with the row.
#[derive(Debug, Clone)]
pub struct PointRow {
    pub measurement: &'static str,
    pub device_id: String,
    pub fields: JsonValue,
    pub published_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub device_id: String,
    pub status: &'static str,
    pub last_seen: DateTime<Utc>,
    pub snapshot: JsonValue,
}

impl From<&DeviceSnapshot> for DeviceRow {
    fn from(snap: &DeviceSnapshot) -> Self {
        Self {
            device_id: snap.device_id.clone(),
            status: snap.status.as_str(),
            last_seen: snap.last_seen,
            snapshot: serde_json::to_value(&snap.metrics).unwrap_or(JsonValue::Null),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertRow {
    pub id: Uuid,
    pub device_id: String,
    pub metric: String,
    pub severity: &'static str,
    pub value: f64,
    pub threshold: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
}

impl From<&Alert> for AlertRow {
    fn from(alert: &Alert) -> Self {
        Self {
            id: alert.id,
            device_id: alert.device_id.clone(),
            metric: alert.metric.clone(),
            severity: alert.severity.as_str(),
            value: alert.value,
            threshold: alert.threshold,
            opened_at: alert.opened_at,
            closed_at: alert.closed_at,
            acknowledged: alert.acknowledged,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub device_id: String,
    pub trigger_code: Option<String>,
    pub status: &'static str,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub items_processed: i64,
    pub items_target: Option<i64>,
    pub fail_reason: Option<String>,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            device_id: job.device_id.clone(),
            trigger_code: job.trigger_code.clone(),
            status: job.status.as_str(),
            start_time: job.start_time,
            end_time: job.end_time,
            items_processed: job.items_processed as i64,
            items_target: job.items_target.map(|v| v as i64),
            fail_reason: job.fail_reason.clone(),
        }
    }
}

#[derive(Debug)]
pub enum WriteCommand {
    Point(PointRow),
    UpsertDevice(DeviceRow),
    UpsertAlert(AlertRow),
    UpsertJob(JobRow),
    Flush(oneshot::Sender<()>),
}

/// Cloneable producer side of the storage channel. Writes are best-effort
/// projections of in-memory state: a full queue drops the write (counted)
/// rather than blocking the lane that produced it.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<WriteCommand>,
    stats: Arc<IngestStats>,
}

impl StorageHandle {
    pub fn new(tx: mpsc::Sender<WriteCommand>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn write_point(&self, point: PointRow) {
        self.send(WriteCommand::Point(point));
    }

    pub fn upsert_device(&self, row: DeviceRow) {
        self.send(WriteCommand::UpsertDevice(row));
    }

    pub fn upsert_alert(&self, row: AlertRow) {
        self.send(WriteCommand::UpsertAlert(row));
    }

    pub fn upsert_job(&self, row: JobRow) {
        self.send(WriteCommand::UpsertJob(row));
    }

    fn send(&self, cmd: WriteCommand) {
        if self.tx.try_send(cmd).is_err() {
            self.stats.record_storage_drop();
            tracing::warn!("storage queue full; dropping write");
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(WriteCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Single consumer of the storage channel. Points are batched and flushed on
/// size or interval; state upserts run immediately with bounded retry. A
/// write that exhausts its retries is dropped with a logged error; in-memory
/// state is already committed and is never rolled back.
pub fn spawn_worker(
    pool: PgPool,
    mut rx: mpsc::Receiver<WriteCommand>,
    stats: Arc<IngestStats>,
    batch_size: usize,
    flush_interval: Duration,
    write_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<PointRow> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    flush_points(&pool, &mut buffer, &stats, write_timeout).await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(WriteCommand::Point(point)) => {
                            buffer.push(point);
                            if buffer.len() >= batch_size {
                                flush_points(&pool, &mut buffer, &stats, write_timeout).await;
                            }
                        }
                        Some(WriteCommand::UpsertDevice(row)) => {
                            run_with_retry(&stats, write_timeout, "device upsert", || {
                                upsert_device(&pool, &row)
                            })
                            .await;
                        }
                        Some(WriteCommand::UpsertAlert(row)) => {
                            run_with_retry(&stats, write_timeout, "alert upsert", || {
                                upsert_alert(&pool, &row)
                            })
                            .await;
                        }
                        Some(WriteCommand::UpsertJob(row)) => {
                            run_with_retry(&stats, write_timeout, "job upsert", || {
                                upsert_job(&pool, &row)
                            })
                            .await;
                        }
                        Some(WriteCommand::Flush(done)) => {
                            flush_points(&pool, &mut buffer, &stats, write_timeout).await;
                            let _ = done.send(());
                        }
                        None => {
                            flush_points(&pool, &mut buffer, &stats, write_timeout).await;
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn run_with_retry<F, Fut>(
    stats: &Arc<IngestStats>,
    write_timeout: Duration,
    what: &str,
    mut op: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), sqlx::Error>>,
{
    let mut delay = RETRY_BASE;
    for attempt in 1..=RETRY_ATTEMPTS {
        match tokio::time::timeout(write_timeout, op()).await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, attempt, "{what} failed");
            }
            Err(_) => {
                tracing::warn!(attempt, "{what} timed out");
            }
        }
        if attempt == RETRY_ATTEMPTS {
            break;
        }
        stats.record_storage_retry();
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RETRY_CAP);
    }
    stats.record_storage_drop();
    tracing::error!("{what} dropped after {RETRY_ATTEMPTS} attempts");
}

async fn flush_points(
    pool: &PgPool,
    buffer: &mut Vec<PointRow>,
    stats: &Arc<IngestStats>,
    write_timeout: Duration,
) {
    if buffer.is_empty() {
        return;
    }
    let items = std::mem::take(buffer);
    let len = items.len();
    run_with_retry(stats, write_timeout, "telemetry batch insert", || {
        insert_points(pool, &items)
    })
    .await;
    tracing::debug!(len, "flushed telemetry batch");
}

async fn insert_points(pool: &PgPool, items: &[PointRow]) -> Result<(), sqlx::Error> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO telemetry (device_id, measurement, fields, published_at, received_at) ",
    );
    builder.push_values(items.iter(), |mut b, point| {
        b.push_bind(&point.device_id)
            .push_bind(point.measurement)
            .push_bind(SqlJson(point.fields.clone()))
            .push_bind(point.published_at)
            .push_bind(point.received_at);
    });
    builder.push(" ON CONFLICT DO NOTHING");
    builder.build().execute(pool).await?;
    Ok(())
}

async fn upsert_device(pool: &PgPool, row: &DeviceRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO devices (device_id, status, last_seen, snapshot, updated_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (device_id) DO UPDATE
        SET status = EXCLUDED.status,
            last_seen = GREATEST(devices.last_seen, EXCLUDED.last_seen),
            snapshot = EXCLUDED.snapshot,
            updated_at = NOW()
        "#,
    )
    .bind(&row.device_id)
    .bind(row.status)
    .bind(row.last_seen)
    .bind(SqlJson(row.snapshot.clone()))
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_alert(pool: &PgPool, row: &AlertRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO alerts (
            id, device_id, metric, severity, value, threshold,
            opened_at, closed_at, acknowledged
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE
        SET severity = EXCLUDED.severity,
            value = EXCLUDED.value,
            threshold = EXCLUDED.threshold,
            closed_at = EXCLUDED.closed_at,
            acknowledged = EXCLUDED.acknowledged
        "#,
    )
    .bind(row.id)
    .bind(&row.device_id)
    .bind(&row.metric)
    .bind(row.severity)
    .bind(row.value)
    .bind(row.threshold)
    .bind(row.opened_at)
    .bind(row.closed_at)
    .bind(row.acknowledged)
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_job(pool: &PgPool, row: &JobRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, device_id, trigger_code, status, start_time, end_time,
            items_processed, items_target, fail_reason
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            end_time = EXCLUDED.end_time,
            items_processed = EXCLUDED.items_processed,
            items_target = EXCLUDED.items_target,
            fail_reason = EXCLUDED.fail_reason
        "#,
    )
    .bind(row.id)
    .bind(&row.device_id)
    .bind(&row.trigger_code)
    .bind(row.status)
    .bind(row.start_time)
    .bind(row.end_time)
    .bind(row.items_processed)
    .bind(row.items_target)
    .bind(&row.fail_reason)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, FromRow)]
pub struct JobHistoryRow {
    pub id: Uuid,
    pub device_id: String,
    pub trigger_code: Option<String>,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub items_processed: i64,
    pub items_target: Option<i64>,
    pub fail_reason: Option<String>,
}

/// Job history for one device, newest first. Read-only projection consumed by
/// the reporting layer.
pub async fn job_history(
    pool: &PgPool,
    device_id: &str,
    limit: i64,
) -> Result<Vec<JobHistoryRow>> {
    let rows: Vec<JobHistoryRow> = sqlx::query_as(
        r#"
        SELECT id, device_id, trigger_code, status, start_time, end_time,
               items_processed, items_target, fail_reason
        FROM jobs
        WHERE device_id = $1
        ORDER BY start_time DESC
        LIMIT $2
        "#,
    )
    .bind(device_id)
    .bind(limit.clamp(1, 1000))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, FromRow)]
pub struct StoredAlertRow {
    pub id: Uuid,
    pub device_id: String,
    pub metric: String,
    pub severity: String,
    pub value: f64,
    pub threshold: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub acknowledged: bool,
}

pub async fn open_alert_rows(
    pool: &PgPool,
    device_id: Option<&str>,
    severity: Option<&str>,
) -> Result<Vec<StoredAlertRow>> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT id, device_id, metric, severity, value, threshold, opened_at, closed_at, acknowledged \
         FROM alerts WHERE closed_at IS NULL",
    );
    if let Some(device_id) = device_id {
        builder.push(" AND device_id = ").push_bind(device_id);
    }
    if let Some(severity) = severity {
        builder.push(" AND severity = ").push_bind(severity);
    }
    builder.push(" ORDER BY opened_at ASC");
    let rows: Vec<StoredAlertRow> = builder.build_query_as().fetch_all(pool).await?;
    Ok(rows)
}

#[derive(Debug, Clone, FromRow)]
pub struct DeviceQueryRow {
    pub device_id: String,
    pub status: String,
    pub last_seen: DateTime<Utc>,
    pub snapshot: SqlJson<JsonValue>,
}

pub async fn device_rows(pool: &PgPool) -> Result<Vec<DeviceQueryRow>> {
    let rows: Vec<DeviceQueryRow> = sqlx::query_as(
        "SELECT device_id, status, last_seen, snapshot FROM devices ORDER BY device_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

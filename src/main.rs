mod alerts;
mod config;
mod devices;
mod engine;
mod error;
mod jobs;
mod mqtt;
mod pipeline;
mod router;
mod storage;

use crate::alerts::{AlertEvaluator, ThresholdHandle, ThresholdSet};
use crate::config::Config;
use crate::devices::DeviceRegistry;
use crate::engine::Engine;
use crate::jobs::JobEngine;
use crate::pipeline::{IngestStats, LaneRouter};
use crate::storage::{build_pool, spawn_worker, StorageHandle, WriteCommand};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fleet_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn load_initial_thresholds(path: Option<&PathBuf>) -> ThresholdHandle {
    let Some(path) = path else {
        tracing::info!("no threshold file configured; alert evaluation is idle");
        return ThresholdHandle::new(ThresholdSet::default());
    };
    match alerts::load_threshold_file(path) {
        Ok(set) => {
            tracing::info!(path = %path.display(), thresholds = set.len(), "loaded alert thresholds");
            ThresholdHandle::new(set)
        }
        Err(err) => {
            tracing::error!(error = %err, path = %path.display(), "failed to load thresholds; starting empty");
            ThresholdHandle::new(ThresholdSet::default())
        }
    }
}

/// Re-reads the threshold file when its mtime moves. A bad reload keeps the
/// previous snapshot in place.
async fn run_threshold_reloader(
    path: PathBuf,
    handle: ThresholdHandle,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut last_mtime: Option<SystemTime> = std::fs::metadata(&path)
        .and_then(|meta| meta.modified())
        .ok();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let mtime = match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(mtime) => mtime,
            Err(err) => {
                tracing::debug!(error = %err, path = %path.display(), "threshold file not readable");
                continue;
            }
        };
        if last_mtime == Some(mtime) {
            continue;
        }
        match alerts::load_threshold_file(&path) {
            Ok(set) => {
                tracing::info!(thresholds = set.len(), "reloaded alert thresholds");
                handle.replace(set);
                last_mtime = Some(mtime);
            }
            Err(err) => {
                tracing::warn!(error = %err, "threshold reload failed; keeping previous set");
            }
        }
    }
}

/// Periodic liveness sweep. Devices that flip offline are projected to
/// storage so the dashboard reflects the change without another message.
async fn run_offline_sweep(
    devices: DeviceRegistry,
    storage: StorageHandle,
    timeout: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(timeout);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let flipped = devices.sweep(chrono::Utc::now(), timeout);
        for device_id in flipped {
            tracing::warn!(device = %device_id, "device went offline");
            if let Some(snap) = devices.snapshot(&device_id) {
                storage.upsert_device((&snap).into());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let stats = Arc::new(IngestStats::new());
    let (tx, rx) = mpsc::channel::<WriteCommand>(config.storage_queue);
    let storage = StorageHandle::new(tx, stats.clone());
    let worker_handle = spawn_worker(
        pool,
        rx,
        stats.clone(),
        config.batch_size,
        config.flush_interval(),
        config.storage_write_timeout(),
    );

    let thresholds = load_initial_thresholds(config.thresholds_path.as_ref());
    let devices = DeviceRegistry::new();
    let engine = Engine::new(
        devices.clone(),
        AlertEvaluator::new(thresholds.clone()),
        JobEngine::new(),
        storage.clone(),
    );
    let lanes = LaneRouter::new(engine, config.lane_capacity, stats);

    let shutdown = CancellationToken::new();

    let reload_handle = config.thresholds_path.clone().map(|path| {
        tokio::spawn(run_threshold_reloader(
            path,
            thresholds.clone(),
            config.thresholds_reload_interval(),
            shutdown.clone(),
        ))
    });
    let sweep_handle = tokio::spawn(run_offline_sweep(
        devices,
        storage.clone(),
        config.heartbeat_timeout(),
        shutdown.clone(),
    ));

    let mqtt_handle = {
        let config = config.clone();
        let lanes = lanes.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { mqtt::run_listener(config, lanes, shutdown).await })
    };

    tokio::select! {
        res = mqtt_handle => {
            match res {
                Ok(Ok(())) => tracing::info!("MQTT listener exited"),
                Ok(Err(err)) => tracing::error!(error = %err, "MQTT listener failed"),
                Err(err) => tracing::error!(error = %err, "MQTT task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    shutdown.cancel();
    lanes.shutdown(config.shutdown_grace()).await;
    if let Err(err) = storage.flush().await {
        tracing::warn!(error = %err, "final storage flush failed");
    }
    if let Some(handle) = reload_handle {
        let _ = handle.await;
    }
    let _ = sweep_handle.await;
    // The worker exits once the last sender is gone; the lane router's engine
    // holds one, so both must drop first.
    drop(lanes);
    drop(storage);
    let _ = worker_handle.await;

    Ok(())
}

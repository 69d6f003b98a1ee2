use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub lane_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub storage_queue: usize,
    pub storage_write_timeout_ms: u64,
    pub heartbeat_timeout_secs: u64,
    pub thresholds_path: Option<PathBuf>,
    pub thresholds_reload_secs: u64,
    pub shutdown_grace_ms: u64,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("FLEET_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("FLEET_DATABASE_URL or DATABASE_URL is required")?;

        let mqtt_host = env::var("FLEET_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = env_parsed("FLEET_MQTT_PORT", 1883u16);
        let mqtt_username = env::var("FLEET_MQTT_USERNAME").ok();
        let mqtt_password = env::var("FLEET_MQTT_PASSWORD").ok();
        let mqtt_topic_prefix =
            env::var("FLEET_MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "fleet".to_string());
        let mqtt_keepalive_secs = env_parsed("FLEET_MQTT_KEEPALIVE_SECS", 30u64);
        let mqtt_client_id = env::var("FLEET_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("fleet-ingest-{}", std::process::id()));

        let lane_capacity = env_parsed("FLEET_LANE_CAPACITY", 256usize);
        let batch_size = env_parsed("FLEET_BATCH_SIZE", 500usize);
        let flush_interval_ms = env_parsed("FLEET_FLUSH_INTERVAL_MS", 750u64);
        let storage_queue = env_parsed("FLEET_STORAGE_QUEUE", batch_size.saturating_mul(10));
        let storage_write_timeout_ms = env_parsed("FLEET_STORAGE_WRITE_TIMEOUT_MS", 5_000u64);
        let db_pool_size = env_parsed("FLEET_DB_POOL_SIZE", 10u32);

        let heartbeat_timeout_secs = env_parsed("FLEET_HEARTBEAT_TIMEOUT_SECS", 30u64);
        let thresholds_path = env::var("FLEET_THRESHOLDS_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let thresholds_reload_secs = env_parsed("FLEET_THRESHOLDS_RELOAD_SECS", 5u64);
        let shutdown_grace_ms = env_parsed("FLEET_SHUTDOWN_GRACE_MS", 5_000u64);

        Ok(Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            lane_capacity,
            batch_size,
            flush_interval_ms,
            storage_queue,
            storage_write_timeout_ms,
            heartbeat_timeout_secs,
            thresholds_path,
            thresholds_reload_secs,
            shutdown_grace_ms,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn storage_write_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_write_timeout_ms)
    }

    pub fn thresholds_reload_interval(&self) -> Duration {
        Duration::from_secs(self.thresholds_reload_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

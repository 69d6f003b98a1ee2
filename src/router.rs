use crate::error::RouteError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// Topic category for an inbound message. One topic per category per device:
/// `<prefix>/<category>/<device_id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Status,
    Sensor,
    Battery,
    Location,
    Job,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Status => "status",
            Category::Sensor => "sensor",
            Category::Battery => "battery",
            Category::Location => "location",
            Category::Job => "job",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Trigger,
    Item,
    Complete,
    Fail,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Status {
        cpu: f64,
        memory: f64,
        disk: f64,
        temperature: f64,
        uptime_seconds: Option<i64>,
    },
    Sensor {
        accel: Option<[f64; 3]>,
        gyro: Option<[f64; 3]>,
        ultrasonic_distance: Option<f64>,
        servo_angle: Option<f64>,
        light_level: Option<f64>,
    },
    Battery {
        percent: f64,
        voltage: Option<f64>,
    },
    Location {
        lat: f64,
        lon: f64,
        heading: Option<f64>,
    },
    Job {
        event: JobEvent,
        code: Option<String>,
        target: Option<u64>,
        count: Option<u64>,
        reason: Option<String>,
    },
}

/// A classified, decoded message ready for the pipeline. `published_at` is the
/// sender-assigned timestamp; `received_at` is stamped at ingestion. Both are
/// kept because the transport gives no ordering guarantee across reconnects.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub device_id: String,
    pub category: Category,
    pub payload: Payload,
    pub published_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl RoutedMessage {
    /// Routine samples may be evicted from a full lane before status and job
    /// messages are.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self.category,
            Category::Sensor | Category::Battery | Category::Location
        )
    }
}

/// Splits `<prefix>/<category>/<device_id>` into a category and device id.
/// No side effects; malformed or unknown topics come back as errors for the
/// caller to count and drop.
pub fn classify(prefix: &str, topic: &str) -> Result<(Category, String), RouteError> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0] != prefix {
        return Err(RouteError::MalformedTopic(topic.to_string()));
    }
    let category = match parts[1] {
        "status" => Category::Status,
        "sensor" => Category::Sensor,
        "battery" => Category::Battery,
        "location" => Category::Location,
        "job" => Category::Job,
        other => return Err(RouteError::UnknownCategory(other.to_string())),
    };
    let device_id = parts[2].trim();
    if device_id.is_empty() {
        return Err(RouteError::EmptyDeviceId(topic.to_string()));
    }
    Ok((category, device_id.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> WireTimestamp<'a> {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            WireTimestamp::Int(ms) => millis_to_dt(*ms),
            WireTimestamp::Float(ts) => millis_to_dt((*ts * 1000.0) as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    let secs = ms / 1000;
    let nanos = ((ms % 1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

#[derive(Debug, Deserialize)]
struct WireStatus<'a> {
    cpu: f64,
    memory: f64,
    disk: f64,
    temperature: f64,
    #[serde(default)]
    uptime: Option<i64>,
    #[serde(default, borrow)]
    ts: Option<WireTimestamp<'a>>,
}

#[derive(Debug, Deserialize)]
struct WireSensor<'a> {
    #[serde(default)]
    accel: Option<[f64; 3]>,
    #[serde(default)]
    gyro: Option<[f64; 3]>,
    #[serde(default)]
    ultrasonic_distance: Option<f64>,
    #[serde(default)]
    servo_angle: Option<f64>,
    #[serde(default)]
    light_level: Option<f64>,
    #[serde(default, borrow)]
    ts: Option<WireTimestamp<'a>>,
}

#[derive(Debug, Deserialize)]
struct WireBattery<'a> {
    percent: f64,
    #[serde(default)]
    voltage: Option<f64>,
    #[serde(default, borrow)]
    ts: Option<WireTimestamp<'a>>,
}

#[derive(Debug, Deserialize)]
struct WireLocation<'a> {
    lat: f64,
    lon: f64,
    #[serde(default)]
    heading: Option<f64>,
    #[serde(default, borrow)]
    ts: Option<WireTimestamp<'a>>,
}

#[derive(Debug, Deserialize)]
struct WireJob<'a> {
    #[serde(borrow)]
    event: &'a str,
    #[serde(default, borrow)]
    code: Option<&'a str>,
    #[serde(default)]
    target: Option<u64>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default, borrow)]
    reason: Option<&'a str>,
    #[serde(default, borrow)]
    ts: Option<WireTimestamp<'a>>,
}

/// Decodes the payload for an already-classified topic. Returns the routed
/// message or a decode error; the payload buffer is scratch space for the
/// borrowed parse.
pub fn decode(
    category: Category,
    device_id: String,
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<RoutedMessage, RouteError> {
    let malformed = |err: simd_json::Error| RouteError::MalformedPayload(err.to_string());

    let (payload, published_at) = match category {
        Category::Status => {
            let wire: WireStatus = simd_json::from_slice(payload).map_err(malformed)?;
            let published_at = wire.ts.as_ref().and_then(WireTimestamp::to_datetime);
            (
                Payload::Status {
                    cpu: wire.cpu,
                    memory: wire.memory,
                    disk: wire.disk,
                    temperature: wire.temperature,
                    uptime_seconds: wire.uptime,
                },
                published_at,
            )
        }
        Category::Sensor => {
            let wire: WireSensor = simd_json::from_slice(payload).map_err(malformed)?;
            let published_at = wire.ts.as_ref().and_then(WireTimestamp::to_datetime);
            (
                Payload::Sensor {
                    accel: wire.accel,
                    gyro: wire.gyro,
                    ultrasonic_distance: wire.ultrasonic_distance,
                    servo_angle: wire.servo_angle,
                    light_level: wire.light_level,
                },
                published_at,
            )
        }
        Category::Battery => {
            let wire: WireBattery = simd_json::from_slice(payload).map_err(malformed)?;
            let published_at = wire.ts.as_ref().and_then(WireTimestamp::to_datetime);
            (
                Payload::Battery {
                    percent: wire.percent,
                    voltage: wire.voltage,
                },
                published_at,
            )
        }
        Category::Location => {
            let wire: WireLocation = simd_json::from_slice(payload).map_err(malformed)?;
            let published_at = wire.ts.as_ref().and_then(WireTimestamp::to_datetime);
            (
                Payload::Location {
                    lat: wire.lat,
                    lon: wire.lon,
                    heading: wire.heading,
                },
                published_at,
            )
        }
        Category::Job => {
            let wire: WireJob = simd_json::from_slice(payload).map_err(malformed)?;
            let event = match wire.event.trim() {
                "trigger" => JobEvent::Trigger,
                "item" => JobEvent::Item,
                "complete" => JobEvent::Complete,
                "fail" => JobEvent::Fail,
                other => {
                    return Err(RouteError::MalformedPayload(format!(
                        "unknown job event: {other}"
                    )))
                }
            };
            let published_at = wire.ts.as_ref().and_then(WireTimestamp::to_datetime);
            (
                Payload::Job {
                    event,
                    code: wire
                        .code
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string),
                    target: wire.target,
                    count: wire.count,
                    reason: wire
                        .reason
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string),
                },
                published_at,
            )
        }
    };

    Ok(RoutedMessage {
        device_id,
        category,
        payload,
        published_at: published_at.unwrap_or(received_at),
        received_at,
    })
}

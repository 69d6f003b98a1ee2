use thiserror::Error;

/// Classification or decode failure for an inbound message. Routing errors
/// are counted and dropped; they never stop the listener.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("topic does not match <prefix>/<category>/<device_id>: {0}")]
    MalformedTopic(String),
    #[error("unknown topic category: {0}")]
    UnknownCategory(String),
    #[error("empty device id in topic: {0}")]
    EmptyDeviceId(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Typed rejection for a state-machine operation attempted from the wrong
/// state. Returned to the caller; the existing state is left untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job already active for device {device_id} (job {job_id})")]
    JobAlreadyActive { device_id: String, job_id: uuid::Uuid },
}

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::supervisor::WorkerId;

/// Controller-side infrastructure errors.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid capability name: {0:?}")]
    InvalidCapability(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn worker `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {worker} did not expose its {pipe}")]
    MissingPipe { worker: WorkerId, pipe: &'static str },

    #[error("Channel to worker {0} is closed")]
    TransportClosed(WorkerId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Supervisor has shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Outcome of a request that did not produce a value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Handler rejected request: {0}")]
    Rejected(HandlerError),

    #[error("Invalid capability name: {0:?}")]
    InvalidCapability(String),

    #[error("Request abandoned: supervisor shut down")]
    Abandoned,
}

/// Errors raised by the worker-side runtime.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("No heartbeat received within {0:?}")]
    LivenessTimeout(Duration),

    #[error("Invalid capability name: {0:?}")]
    InvalidCapability(String),

    #[error("I/O error on controller channel: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a capability handler.
///
/// This is the payload of a `success: false` result message. Any
/// `std::error::Error` converts into it, so handlers can use `?` freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub(crate) fn not_provided(capability: &str) -> Self {
        Self::new(format!("capability `{capability}` is not provided by this worker"))
    }

    pub(crate) fn panicked() -> Self {
        Self::new("handler panicked")
    }

    /// Rebuilds a handler error from a result payload.
    ///
    /// Payloads that are not shaped like a `HandlerError` (for instance a
    /// bare string sent by a foreign worker) are kept verbatim in `data`.
    pub fn from_payload(payload: Value) -> Self {
        match serde_json::from_value::<HandlerError>(payload.clone()) {
            Ok(err) => err,
            Err(_) => {
                let message = match &payload {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Self {
                    message,
                    data: Some(payload),
                }
            }
        }
    }

    pub(crate) fn into_payload(self) -> Value {
        serde_json::to_value(&self).unwrap_or(Value::String(self.message))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handler_error_payload_round_trips() {
        let err = HandlerError::new("boom").with_data(json!({"code": 7}));
        let payload = err.clone().into_payload();
        assert_eq!(payload, json!({"message": "boom", "data": {"code": 7}}));
        assert_eq!(HandlerError::from_payload(payload), err);
    }

    #[test]
    fn foreign_payload_is_kept_verbatim() {
        let err = HandlerError::from_payload(json!("plain failure"));
        assert_eq!(err.message, "plain failure");
        assert_eq!(err.data, Some(json!("plain failure")));

        let err = HandlerError::from_payload(json!(42));
        assert_eq!(err.message, "42");
    }

    #[test]
    fn std_errors_convert() {
        let parse = "x".parse::<i64>().unwrap_err();
        let err: HandlerError = parse.into();
        assert!(err.message.contains("invalid digit"));
        assert!(err.data.is_none());
    }
}

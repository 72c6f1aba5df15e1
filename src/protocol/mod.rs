//! Wire protocol between the controller and its workers.
//!
//! Every message is a single JSON object on its own line. Messages carry no
//! type tag; they are told apart by their field sets:
//!
//! | Message   | Direction         | Fields                        |
//! |-----------|-------------------|-------------------------------|
//! | dispatch  | controller→worker | `id`, `request`, `args`       |
//! | heartbeat | controller→worker | `heartbeat: true`             |
//! | result    | worker→controller | `id`, `result`, `success`     |
//! | provide   | worker→controller | `provide` (name or names)     |
//! | log       | worker→controller | `log: true`, `level`, `args`  |

pub mod codec;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{HandlerError, SupervisorError};

/// Case-insensitive capability name, stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityName(String);

impl CapabilityName {
    pub fn new(name: &str) -> Result<Self, SupervisorError> {
        let normalized = name.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(SupervisorError::InvalidCapability(name.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CapabilityName {
    type Error = SupervisorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CapabilityName> for String {
    fn from(name: CapabilityName) -> Self {
        name.0
    }
}

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id of a request, unique for the controller's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A field that is always `true` on the wire (`heartbeat: true`, `log: true`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Marker;

impl Serialize for Marker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for Marker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if bool::deserialize(deserializer)? {
            Ok(Marker)
        } else {
            Err(serde::de::Error::custom("marker field must be `true`"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub id: RequestId,
    pub request: CapabilityName,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    pub heartbeat: Marker,
}

/// Messages written by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControllerMessage {
    Dispatch(Dispatch),
    Heartbeat(Heartbeat),
}

impl ControllerMessage {
    pub fn heartbeat() -> Self {
        Self::Heartbeat(Heartbeat::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub id: RequestId,
    #[serde(default)]
    pub result: Value,
    pub success: bool,
}

impl Outcome {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result,
            success: true,
        }
    }

    pub fn failure(id: RequestId, err: HandlerError) -> Self {
        Self {
            id,
            result: err.into_payload(),
            success: false,
        }
    }

    /// Split into the value or the handler error it carries.
    pub fn into_result(self) -> Result<Value, HandlerError> {
        if self.success {
            Ok(self.result)
        } else {
            Err(HandlerError::from_payload(self.result))
        }
    }
}

/// One capability name or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Names {
    One(CapabilityName),
    Many(Vec<CapabilityName>),
}

impl Names {
    pub fn into_vec(self) -> Vec<CapabilityName> {
        match self {
            Names::One(name) => vec![name],
            Names::Many(names) => names,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provide {
    pub provide: Names,
}

/// Severity of a forwarded worker log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[serde(alias = "warning")]
    Warn,
    Info,
    Verbose,
    Debug,
    Silly,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Verbose => write!(f, "verbose"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Silly => write!(f, "silly"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log: Marker,
    pub level: LogLevel,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl LogRecord {
    pub fn new(level: LogLevel, args: Vec<Value>) -> Self {
        Self {
            log: Marker,
            level,
            args,
        }
    }

    /// Render the arguments space-separated; strings are written unquoted.
    pub fn text(&self) -> String {
        self.args
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Messages written by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Log(LogRecord),
    Provide(Provide),
    Result(Outcome),
}

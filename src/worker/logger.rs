use std::fmt;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{LogLevel, LogRecord, WorkerMessage};

/// Forwards log lines from a worker to its controller.
///
/// The controller re-emits them through its own `tracing` subscriber, tagged
/// with the worker's id. Lines logged after the controller went away are
/// dropped.
#[derive(Debug, Clone)]
pub struct WorkerLogger {
    outbound: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerLogger {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { outbound }
    }

    pub fn log(&self, level: LogLevel, args: Vec<Value>) {
        let _ = self
            .outbound
            .send(WorkerMessage::Log(LogRecord::new(level, args)));
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(LogLevel::Error, vec![Value::String(message.to_string())]);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(LogLevel::Warn, vec![Value::String(message.to_string())]);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(LogLevel::Info, vec![Value::String(message.to_string())]);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(LogLevel::Debug, vec![Value::String(message.to_string())]);
    }
}

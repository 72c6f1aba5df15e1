//! Worker-side runtime.
//!
//! A worker executable builds a [`Worker`] over its standard streams,
//! registers the capabilities it offers and hands control to
//! [`Worker::run`]:
//!
//! ```no_run
//! use pool_supervisor::worker::Worker;
//! use serde_json::{json, Value};
//!
//! # async fn entry() -> Result<(), pool_supervisor::WorkerError> {
//! let mut worker = Worker::stdio();
//! worker.provide_fn("square", |args: Vec<Value>| {
//!     let n = args.first().and_then(Value::as_i64).unwrap_or(0);
//!     Ok(json!(n * n))
//! })?;
//! worker.run().await
//! # }
//! ```
//!
//! # Components
//!
//! - [`Worker`]: reads dispatches, runs handlers, writes results
//! - [`WorkerLogger`]: forwards log lines to the controller
//! - [`heartbeat`]: the controller's heartbeat probe and the worker's
//!   [`Liveness`](heartbeat::Liveness) countdown
//!
//! Handlers run concurrently; results are written in completion order. A
//! worker that hears no heartbeat for its liveness timeout stops with
//! [`WorkerError::LivenessTimeout`].

pub mod handler;
pub mod heartbeat;
pub mod logger;

use std::collections::HashMap;
use std::future::Future;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::WorkerOptions;
use crate::error::WorkerError;
use crate::protocol::codec;
use crate::protocol::{CapabilityName, ControllerMessage, Names, Provide, WorkerMessage};

pub use handler::{BoxFuture, Handler, HandlerResult};
pub use heartbeat::{HeartbeatSender, Liveness};
pub use logger::WorkerLogger;

type InputLines = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// One worker's end of the controller link.
///
/// Dropping the worker stops its writer and aborts running handlers.
pub struct Worker {
    options: WorkerOptions,
    handlers: HashMap<CapabilityName, Handler>,
    input: InputLines,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    writer: JoinHandle<()>,
    tasks: JoinSet<()>,
}

impl Worker {
    /// Build a worker over arbitrary streams. Must be called inside a tokio
    /// runtime.
    pub fn new<R, W>(reader: R, writer: W, options: WorkerOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let mut writer = writer;
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = codec::write_message(&mut writer, &message).await {
                    tracing::debug!(error = %e, "Controller channel closed for writing");
                    break;
                }
            }
        });

        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            options,
            handlers: HashMap::new(),
            input: BufReader::new(reader).lines(),
            outbound,
            writer,
            tasks: JoinSet::new(),
        }
    }

    /// Worker talking to its controller over stdin/stdout, configured from
    /// the environment.
    pub fn stdio() -> Self {
        Self::new(
            tokio::io::stdin(),
            tokio::io::stdout(),
            WorkerOptions::from_env(),
        )
    }

    /// Controller-assigned id, when running under a supervisor.
    pub fn id(&self) -> Option<u64> {
        self.options.worker_id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Register an async handler for `name` and announce it.
    pub fn provide<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), WorkerError>
    where
        F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, handler::from_async(handler))
    }

    /// Register a blocking handler for `name` and announce it.
    pub fn provide_fn<F>(&mut self, name: &str, handler: F) -> Result<(), WorkerError>
    where
        F: Fn(Vec<serde_json::Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(name, handler::from_sync(handler))
    }

    fn register(&mut self, name: &str, handler: Handler) -> Result<(), WorkerError> {
        let name = CapabilityName::new(name)
            .map_err(|_| WorkerError::InvalidCapability(name.to_string()))?;
        tracing::debug!(worker = ?self.options.worker_id, capability = %name, "Providing capability");

        self.handlers.insert(name.clone(), handler);
        let _ = self.outbound.send(WorkerMessage::Provide(Provide {
            provide: Names::One(name),
        }));
        Ok(())
    }

    pub fn logger(&self) -> WorkerLogger {
        WorkerLogger::new(self.outbound.clone())
    }

    /// Serve dispatches until the controller closes the channel, the
    /// liveness countdown runs out, or results can no longer be written.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let mut liveness = Liveness::new(self.options.liveness_timeout());
        tracing::info!(worker = ?self.options.worker_id, capabilities = self.handlers.len(), "Worker running");

        loop {
            tokio::select! {
                line = self.input.next_line() => match line? {
                    Some(line) => self.handle_line(&line, &mut liveness),
                    None => {
                        tracing::info!(worker = ?self.options.worker_id, "Controller closed the channel");
                        return Ok(());
                    }
                },
                Some(_) = self.tasks.join_next() => {}
                _ = &mut self.writer => {
                    tracing::warn!(worker = ?self.options.worker_id, "Controller channel closed for writing, exiting");
                    return Err(WorkerError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "controller channel closed for writing",
                    )));
                }
                _ = &mut liveness => {
                    tracing::warn!(
                        worker = ?self.options.worker_id,
                        timeout_ms = liveness.timeout().as_millis() as u64,
                        "No heartbeat from controller, exiting"
                    );
                    return Err(WorkerError::LivenessTimeout(liveness.timeout()));
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str, liveness: &mut Liveness) {
        if line.trim().is_empty() {
            return;
        }
        match codec::decode::<ControllerMessage>(line) {
            Ok(ControllerMessage::Heartbeat(_)) => liveness.reset(),
            Ok(ControllerMessage::Dispatch(dispatch)) => {
                tracing::trace!(request_id = %dispatch.id, capability = %dispatch.request, "Dispatch received");
                let handler = self.handlers.get(&dispatch.request).cloned();
                handler::invoke(handler, dispatch, self.outbound.clone(), &mut self.tasks);
            }
            Err(e) => {
                tracing::warn!(worker = ?self.options.worker_id, error = %e, "Ignoring malformed controller message");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

//! IPC transport between the controller and worker processes.
//!
//! A [`Transport`] knows how to start a worker for an [`EntryTarget`] and
//! hands back a [`WorkerChannel`] for sending. Everything the worker says,
//! and its eventual exit, arrives as [`TransportEvent`]s on the channel the
//! caller supplied. The controller logic never touches processes directly.
//!
//! - [`ProcessTransport`]: real child processes, JSON Lines over stdin/stdout.
//! - [`MemoryTransport`]: workers run as tokio tasks over in-memory pipes,
//!   for tests and embedding.
//!
//! Other transports can reuse [`attach`] and [`report_exit`] to speak the
//! same framing over any byte stream pair. A link that breaks in either
//! direction is reported as the worker's exit.

pub mod memory;
pub mod process;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SupervisorError};
use crate::protocol::codec;
use crate::protocol::{ControllerMessage, WorkerMessage};
use crate::supervisor::WorkerId;

pub use memory::MemoryTransport;
pub use process::ProcessTransport;

/// How long to keep reading a dead worker's output before reporting its exit.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// What to run for each worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryTarget {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl EntryTarget {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Re-run the current executable, typically with a worker subcommand.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for EntryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a worker went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, when the worker ended on its own with one.
    pub code: Option<i32>,
    pub detail: String,
}

impl WorkerExit {
    pub fn new(code: Option<i32>, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn killed() -> Self {
        Self::new(None, "killed by supervisor")
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// Something that happened on a worker's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message { worker: WorkerId, message: WorkerMessage },
    /// Free-form text the worker wrote to its protocol channel.
    Output { worker: WorkerId, line: String },
    /// Always the last event for a worker.
    Exited { worker: WorkerId, exit: WorkerExit },
}

/// Sending half of a worker link.
///
/// Cloning is cheap; every clone talks to the same worker. Sends never block:
/// messages are queued for a writer task.
#[derive(Debug, Clone)]
pub struct WorkerChannel {
    worker: WorkerId,
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<ControllerMessage>,
    kill: CancellationToken,
}

impl WorkerChannel {
    pub fn new(
        worker: WorkerId,
        pid: Option<u32>,
        outbound: mpsc::UnboundedSender<ControllerMessage>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            worker,
            pid,
            outbound,
            kill,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn send(&self, message: ControllerMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| SupervisorError::TransportClosed(self.worker))
    }

    /// Terminate the worker. Its `Exited` event still follows.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Token cancelled when the worker is killed.
    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}

/// Starts workers.
pub trait Transport: Send + Sync + 'static {
    /// Start a worker running `target` with `env` added to its environment.
    ///
    /// Messages and the final exit of the worker are reported on `events`.
    fn spawn(
        &self,
        worker: WorkerId,
        target: &EntryTarget,
        env: &[(String, String)],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<WorkerChannel>;
}

/// Wire a worker's byte streams to the controller.
///
/// Returns the outbound queue feeding `writer` and the task reading
/// `reader`. Lines that are not protocol messages, including bytes that are
/// not valid UTF-8, are reported as [`TransportEvent::Output`]. When either
/// direction breaks (write failure, read error, or end of output) `kill` is
/// cancelled, so a worker that can no longer talk to the controller goes
/// through the regular exit path.
///
/// The reader task ends once the output is closed; callers await it before
/// reporting the exit so that no message overtakes the `Exited` event.
pub fn attach<R, W>(
    worker: WorkerId,
    reader: R,
    mut writer: W,
    events: mpsc::UnboundedSender<TransportEvent>,
    kill: CancellationToken,
) -> (mpsc::UnboundedSender<ControllerMessage>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ControllerMessage>();

    let writer_kill = kill.clone();
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = codec::write_message(&mut writer, &message).await {
                tracing::warn!(worker, error = %e, "Worker channel closed for writing");
                writer_kill.cancel();
                break;
            }
        }
    });

    let reader_task = tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    tracing::debug!(worker, "Worker closed its output");
                    break;
                }
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\n', '\r']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event = match codec::decode::<WorkerMessage>(line) {
                        Ok(message) => TransportEvent::Message { worker, message },
                        Err(_) => TransportEvent::Output {
                            worker,
                            line: line.to_string(),
                        },
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(worker, error = %e, "Worker channel closed for reading");
                    break;
                }
            }
        }
        kill.cancel();
    });

    (outbound, reader_task)
}

/// Wait (bounded) for the reader task to drain, then report the exit.
pub async fn report_exit(
    worker: WorkerId,
    reader_task: JoinHandle<()>,
    exit: WorkerExit,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    if tokio::time::timeout(DRAIN_TIMEOUT, reader_task).await.is_err() {
        tracing::warn!(worker, "Worker output still open after exit, not waiting further");
    }
    let _ = events.send(TransportEvent::Exited { worker, exit });
}

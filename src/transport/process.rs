use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{attach, report_exit, EntryTarget, Transport, TransportEvent, WorkerChannel, WorkerExit};
use crate::error::{Result, SupervisorError};
use crate::supervisor::WorkerId;

/// Runs each worker as a child process.
///
/// The child's stdin carries controller messages, its stdout carries worker
/// messages, and its stderr is inherited so worker diagnostics reach the
/// controller's terminal. Children are killed when their handle is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTransport;

impl ProcessTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for ProcessTransport {
    fn spawn(
        &self,
        worker: WorkerId,
        target: &EntryTarget,
        env: &[(String, String)],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<WorkerChannel> {
        let mut cmd = Command::new(&target.program);
        cmd.args(&target.args)
            .envs(target.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: target.to_string(),
            source,
        })?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(SupervisorError::MissingPipe {
            worker,
            pipe: "stdin",
        })?;
        let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipe {
            worker,
            pipe: "stdout",
        })?;

        let kill = CancellationToken::new();
        let (outbound, reader_task) = attach(worker, stdout, stdin, events.clone(), kill.clone());

        let watch_kill = kill.clone();
        tokio::spawn(async move {
            let exit = watch(worker, &mut child, watch_kill).await;
            report_exit(worker, reader_task, exit, &events).await;
        });

        Ok(WorkerChannel::new(worker, pid, outbound, kill))
    }
}

/// Wait for the child to exit on its own or to be killed.
///
/// A child that had already exited when the kill arrived keeps its own exit
/// code.
async fn watch(worker: WorkerId, child: &mut Child, kill: CancellationToken) -> WorkerExit {
    tokio::select! {
        biased;
        status = child.wait() => exit_of(worker, status),
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(worker, error = %e, "Worker process already gone");
            }
            match child.wait().await {
                Ok(status) if status.code().is_some() => exit_of(worker, Ok(status)),
                _ => WorkerExit::killed(),
            }
        }
    }
}

fn exit_of(worker: WorkerId, status: std::io::Result<ExitStatus>) -> WorkerExit {
    match status {
        Ok(status) => WorkerExit::new(status.code(), status.to_string()),
        Err(e) => {
            tracing::warn!(worker, error = %e, "Failed to wait on worker process");
            WorkerExit::new(None, format!("wait failed: {e}"))
        }
    }
}

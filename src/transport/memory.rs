use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{attach, report_exit, EntryTarget, Transport, TransportEvent, WorkerChannel, WorkerExit};
use crate::config::WorkerOptions;
use crate::error::{Result, WorkerError};
use crate::supervisor::WorkerId;
use crate::worker::{BoxFuture, Worker};

const PIPE_CAPACITY: usize = 64 * 1024;

type EntryFn = dyn Fn(Worker) -> BoxFuture<'static, std::result::Result<(), WorkerError>> + Send + Sync;

/// Runs each worker as a tokio task connected by in-memory pipes.
///
/// The entry function plays the part of the worker executable: it receives a
/// [`Worker`] speaking the regular wire protocol, registers capabilities and
/// runs it. The entry target's program is ignored; its environment (plus the
/// controller-injected variables) becomes the worker's [`WorkerOptions`].
/// Killing the worker aborts the task.
#[derive(Clone)]
pub struct MemoryTransport {
    entry: Arc<EntryFn>,
}

impl MemoryTransport {
    pub fn new<F, Fut>(entry: F) -> Self
    where
        F: Fn(Worker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), WorkerError>> + Send + 'static,
    {
        Self {
            entry: Arc::new(move |worker| Box::pin(entry(worker))),
        }
    }
}

impl Transport for MemoryTransport {
    fn spawn(
        &self,
        worker: WorkerId,
        target: &EntryTarget,
        env: &[(String, String)],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<WorkerChannel> {
        let (controller_io, worker_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (controller_read, controller_write) = tokio::io::split(controller_io);
        let (worker_read, worker_write) = tokio::io::split(worker_io);

        let options = WorkerOptions::from_vars(target.env.iter().chain(env.iter()).cloned());
        let runtime = Worker::new(worker_read, worker_write, options);
        let mut task = tokio::spawn((self.entry)(runtime));

        let kill = CancellationToken::new();
        let (outbound, reader_task) = attach(
            worker,
            controller_read,
            controller_write,
            events.clone(),
            kill.clone(),
        );

        let watch_kill = kill.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                biased;
                joined = &mut task => match joined {
                    Ok(Ok(())) => WorkerExit::new(Some(0), "worker finished"),
                    Ok(Err(e)) => WorkerExit::new(Some(1), e.to_string()),
                    Err(e) if e.is_panic() => WorkerExit::new(None, "worker panicked"),
                    Err(_) => WorkerExit::new(None, "worker cancelled"),
                },
                _ = watch_kill.cancelled() => {
                    task.abort();
                    let _ = task.await;
                    WorkerExit::killed()
                }
            };
            report_exit(worker, reader_task, exit, &events).await;
        });

        Ok(WorkerChannel::new(worker, None, outbound, kill))
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").finish_non_exhaustive()
    }
}

//! Controller side of the pool.
//!
//! [`Supervisor`] is a cheap, cloneable handle; every operation is a message
//! to the [`Controller`] task that owns the pool and all routing state.
//!
//! # Request flow
//!
//! 1. [`Supervisor::request`] registers the request with the correlator and
//!    returns a [`Completion`] immediately
//! 2. The least loaded provider of the capability gets the dispatch; with no
//!    provider the request waits in the backlog
//! 3. The worker's result resolves the completion and re-ranks providers
//!
//! # Recovery
//!
//! A worker that exits is dropped from every capability at once. After the
//! respawn grace delay a replacement is spawned at the same entry target and
//! the requests that were in flight on the dead worker move to it; they are
//! sent once the replacement announces their capability.

pub mod controller;
pub mod pool;
pub mod stats;

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::SupervisorConfig;
use crate::error::{RequestError, Result, SupervisorError};
use crate::protocol::{CapabilityName, RequestId};
use crate::scheduler::correlator::{self, Completion};
use crate::transport::{EntryTarget, ProcessTransport, Transport};

use controller::Command;

pub use controller::{Controller, WORKER_LOG_TARGET};
pub use pool::{WorkerPool, WorkerSlot, WorkerState};
pub use stats::{PoolStats, WorkerStats};

/// Controller-assigned worker identity, stable for the worker's lifetime.
pub type WorkerId = u64;

/// Handle to a running controller.
///
/// When the last handle is dropped the controller kills its workers and
/// stops.
#[derive(Debug, Clone)]
pub struct Supervisor {
    commands: mpsc::UnboundedSender<Command>,
}

impl Supervisor {
    /// Start a controller that runs workers as child processes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SupervisorConfig) -> Result<Self> {
        Self::with_transport(config, ProcessTransport::new())
    }

    /// Start a controller over a custom transport.
    pub fn with_transport<T: Transport>(config: SupervisorConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let (controller, commands) = Controller::new(config, Arc::new(transport));
        tokio::spawn(controller.run());
        Ok(Self { commands })
    }

    /// Ask the pool to run capability `name` with `args`.
    ///
    /// Never blocks and never fails synchronously; every outcome, including
    /// an invalid name, arrives through the returned [`Completion`].
    pub fn request(&self, name: &str, args: Vec<Value>) -> Completion {
        let id = RequestId::new();
        let name = match CapabilityName::new(name) {
            Ok(name) => name,
            Err(_) => {
                return Completion::ready(id, Err(RequestError::InvalidCapability(name.to_string())))
            }
        };

        let (reply, completion) = correlator::completion(id);
        // A closed controller drops the reply, which resolves as abandoned.
        let _ = self.commands.send(Command::Request {
            id,
            name,
            args,
            reply,
        });
        completion
    }

    /// Spawn `count` workers running `target`, by default one per available
    /// CPU. Returns the new worker ids.
    pub async fn cluster(&self, target: EntryTarget, count: Option<usize>) -> Result<Vec<WorkerId>> {
        let count = count.unwrap_or_else(default_pool_size);
        self.call(|reply| Command::Cluster {
            target,
            count,
            reply,
        })
        .await?
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Kill every worker and abandon pending requests. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        match self.call(|reply| Command::Shutdown { reply }).await {
            Err(SupervisorError::ShutDown) => Ok(()),
            other => other,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn call<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SupervisorError::ShutDown)?;
        response.await.map_err(|_| SupervisorError::ShutDown)
    }
}

/// Number of workers [`Supervisor::cluster`] starts when no count is given.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

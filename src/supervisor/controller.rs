use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tokio_stream::StreamExt;
use tokio_util::time::DelayQueue;

use super::pool::{WorkerPool, WorkerState};
use super::stats::PoolStats;
use super::WorkerId;
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::protocol::{CapabilityName, LogLevel, LogRecord, Outcome, RequestId, WorkerMessage};
use crate::scheduler::correlator::CompletionSender;
use crate::scheduler::{Backlog, CapabilityRegistry, Correlator, Registration, Resolution};
use crate::transport::{EntryTarget, Transport, TransportEvent, WorkerExit};

/// Tracing target for lines forwarded from workers.
pub const WORKER_LOG_TARGET: &str = "worker";

/// Requests from [`Supervisor`](super::Supervisor) handles.
pub(crate) enum Command {
    Request {
        id: RequestId,
        name: CapabilityName,
        args: Vec<Value>,
        reply: CompletionSender,
    },
    Cluster {
        target: EntryTarget,
        count: usize,
        reply: oneshot::Sender<Result<Vec<WorkerId>>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A replacement worker due after the grace delay.
#[derive(Debug)]
struct Respawn {
    /// The exited worker whose requests move to the replacement.
    predecessor: Option<WorkerId>,
    target: Arc<EntryTarget>,
}

/// Owns all routing state and the worker pool.
///
/// Runs as a single task: facade commands, transport events, respawn timers
/// and the optional stats tick are handled one at a time, so no state is
/// shared or locked.
pub struct Controller {
    config: SupervisorConfig,
    pool: WorkerPool,
    registry: CapabilityRegistry,
    backlog: Backlog,
    correlator: Correlator,
    respawns: DelayQueue<Respawn>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Controller {
    pub(crate) fn new(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedSender<Command>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        let controller = Self {
            pool: WorkerPool::new(transport, events_tx, config.clone()),
            config,
            registry: CapabilityRegistry::new(),
            backlog: Backlog::new(),
            correlator: Correlator::new(),
            respawns: DelayQueue::new(),
            commands,
            events,
        };
        (controller, commands_tx)
    }

    /// Run until shutdown is requested or every supervisor handle is dropped.
    pub async fn run(mut self) {
        let mut stats_tick = self
            .config
            .stats_interval()
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        tracing::debug!(
            heartbeat_ms = self.config.heartbeat_interval_ms,
            liveness_ms = self.config.liveness_timeout_ms,
            grace_ms = self.config.respawn_grace_ms,
            "Controller started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            return;
                        }
                    }
                    None => {
                        tracing::debug!("All supervisor handles dropped");
                        self.teardown();
                        return;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(expired) = self.respawns.next() => self.respawn(expired.into_inner()),
                _ = tick(&mut stats_tick) => self.stats().log(),
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Request {
                id,
                name,
                args,
                reply,
            } => {
                tracing::trace!(request_id = %id, capability = %name, "Request accepted");
                self.correlator.insert(id, name, args, reply);
                self.route(id);
            }
            Command::Cluster {
                target,
                count,
                reply,
            } => {
                let _ = reply.send(self.cluster(target, count));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { worker, message } => match message {
                WorkerMessage::Provide(provide) => {
                    self.handle_provide(worker, provide.provide.into_vec())
                }
                WorkerMessage::Result(outcome) => self.handle_result(worker, outcome),
                WorkerMessage::Log(record) => forward_log(worker, &record),
            },
            TransportEvent::Output { worker, line } => {
                tracing::info!(target: WORKER_LOG_TARGET, worker, "{line}");
            }
            TransportEvent::Exited { worker, exit } => self.handle_exit(worker, exit),
        }
    }

    fn cluster(&mut self, target: EntryTarget, count: usize) -> Result<Vec<WorkerId>> {
        let target = Arc::new(target);
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.pool.spawn(Arc::clone(&target))?);
        }
        tracing::info!(workers = ids.len(), entry = %target, "Cluster started");
        Ok(ids)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.pool.iter().map(|slot| slot.stats()).collect(),
            pending: self.correlator.len(),
            backlog: self.backlog.len(),
        }
    }

    /// Send a queued request to the least loaded provider, or park it in the
    /// backlog when there is none.
    fn route(&mut self, id: RequestId) {
        let Some(request) = self.correlator.get(&id) else {
            return;
        };
        let name = request.capability.clone();
        match self.registry.select(&name) {
            Some(worker) => self.dispatch(id, worker),
            None => {
                self.backlog.push(name.clone(), id);
                tracing::debug!(
                    request_id = %id,
                    capability = %name,
                    queued = self.backlog.len_for(&name),
                    "No provider, request backlogged"
                );
            }
        }
    }

    fn dispatch(&mut self, id: RequestId, worker: WorkerId) {
        let Some(slot) = self.pool.get_mut(worker) else {
            tracing::warn!(worker, request_id = %id, "Provider missing from pool, request backlogged");
            if let Some(request) = self.correlator.release(&id) {
                self.backlog.push(request.capability.clone(), id);
            }
            return;
        };
        let Some(request) = self.correlator.assign(&id, worker) else {
            return;
        };

        slot.in_flight += 1;
        if let Err(e) = slot.send(request.dispatch_message()) {
            tracing::warn!(worker, request_id = %id, error = %e, "Dispatch failed, worker will be replaced");
        } else {
            tracing::trace!(worker, request_id = %id, capability = %request.capability, "Request dispatched");
        }
        self.rerank(worker);
    }

    fn rerank(&mut self, worker: WorkerId) {
        let pool = &self.pool;
        self.registry.rerank(worker, |id| pool.load(id));
    }

    fn handle_provide(&mut self, worker: WorkerId, names: Vec<CapabilityName>) {
        let Some(slot) = self.pool.get_mut(worker) else {
            tracing::debug!(worker, "Provide from unknown worker ignored");
            return;
        };
        if !slot.is_live() {
            tracing::debug!(worker, state = %slot.state, "Provide from exited worker ignored");
            return;
        }
        if slot.state == WorkerState::Spawning {
            slot.state = WorkerState::Active;
            tracing::info!(worker, "Worker active");
        }

        for name in names {
            if let Some(slot) = self.pool.get_mut(worker) {
                if !slot.provides(&name) {
                    slot.capabilities.push(name.clone());
                }
            }

            let pool = &self.pool;
            let registration = self.registry.register(name.clone(), worker, |id| pool.load(id));
            if registration != Registration::Unchanged {
                tracing::info!(worker, capability = %name, "Capability provided");
            }

            self.flush_deferred(worker, &name);

            if registration == (Registration::Added { first_provider: true }) {
                let queued = self.backlog.drain(&name);
                if !queued.is_empty() {
                    tracing::info!(capability = %name, requests = queued.len(), "Draining backlog");
                }
                for id in queued {
                    self.route(id);
                }
            }
        }
    }

    /// Send relocated requests for `name` that were waiting on `worker`.
    fn flush_deferred(&mut self, worker: WorkerId, name: &CapabilityName) {
        let correlator = &self.correlator;
        let Some(slot) = self.pool.get_mut(worker) else {
            return;
        };
        if slot.deferred.is_empty() {
            return;
        }

        let (ready, waiting): (Vec<RequestId>, Vec<RequestId>) = slot
            .deferred
            .drain(..)
            .filter(|id| correlator.get(id).is_some())
            .partition(|id| {
                correlator
                    .get(id)
                    .is_some_and(|request| &request.capability == name)
            });
        slot.deferred = waiting;

        for id in ready {
            if let Some(request) = correlator.get(&id) {
                if let Err(e) = slot.send(request.dispatch_message()) {
                    tracing::warn!(worker, request_id = %id, error = %e, "Relocated dispatch failed");
                    break;
                }
            }
        }
    }

    fn handle_result(&mut self, worker: WorkerId, outcome: Outcome) {
        let id = outcome.id;
        match self.correlator.resolve(worker, outcome) {
            Resolution::Resolved => {
                if let Some(slot) = self.pool.get_mut(worker) {
                    slot.in_flight = slot.in_flight.saturating_sub(1);
                    slot.completed += 1;
                }
                self.rerank(worker);
                tracing::trace!(worker, request_id = %id, "Request completed");
            }
            Resolution::Unknown => {
                tracing::debug!(worker, request_id = %id, "Discarding result for unknown request");
            }
            Resolution::NotAssigned { assigned } => {
                tracing::debug!(
                    worker,
                    request_id = %id,
                    assigned = ?assigned,
                    "Discarding result from a worker the request is not assigned to"
                );
            }
        }
    }

    fn handle_exit(&mut self, worker: WorkerId, exit: WorkerExit) {
        let Some(slot) = self.pool.get_mut(worker) else {
            tracing::debug!(worker, "Exit of a worker no longer in the pool");
            return;
        };
        if !slot.is_live() {
            return;
        }

        slot.state = WorkerState::Draining;
        slot.kill();
        let target = Arc::clone(&slot.target);
        tracing::error!(
            worker,
            code = ?exit.code,
            in_flight = slot.in_flight,
            "Worker exited: {exit}"
        );

        for name in self.registry.remove_worker(worker) {
            if !self.registry.has_provider(&name) {
                tracing::warn!(capability = %name, "No providers left, new requests will be backlogged");
            }
        }
        self.respawns.insert(
            Respawn {
                predecessor: Some(worker),
                target,
            },
            self.config.respawn_grace(),
        );
    }

    /// Replace an exited worker and move its requests onto the replacement.
    fn respawn(&mut self, respawn: Respawn) {
        let Respawn {
            predecessor,
            target,
        } = respawn;

        let mut orphans = Vec::new();
        let mut assigned = 0;
        if let Some(dead) = predecessor {
            orphans = self.correlator.assigned_to(dead);
            if let Some(slot) = self.pool.remove(dead) {
                assigned = slot.in_flight;
            }
        }

        match self.pool.spawn(Arc::clone(&target)) {
            Ok(replacement) => {
                for id in &orphans {
                    self.correlator.assign(id, replacement);
                }
                if let Some(slot) = self.pool.get_mut(replacement) {
                    slot.in_flight += orphans.len();
                    slot.deferred.extend(orphans.iter().copied());
                }
                if let Some(dead) = predecessor {
                    tracing::warn!(
                        worker = dead,
                        replacement,
                        relocated = orphans.len(),
                        assigned,
                        "Worker {dead} -> relocated {}/{assigned} tasks",
                        orphans.len()
                    );
                }
            }
            Err(e) => {
                tracing::error!(entry = %target, error = %e, "Failed to spawn replacement worker");
                for id in orphans {
                    self.correlator.release(&id);
                    self.route(id);
                }
                self.respawns.insert(
                    Respawn {
                        predecessor: None,
                        target,
                    },
                    self.config.respawn_grace(),
                );
            }
        }
    }

    fn teardown(&mut self) {
        let workers = self.pool.kill_all();
        if !self.backlog.is_empty() {
            tracing::debug!(requests = self.backlog.len(), "Dropping backlog");
        }
        self.backlog.clear();
        let abandoned = self.correlator.abandon_all();
        self.respawns.clear();
        tracing::info!(workers, abandoned, "Supervisor shut down");
    }
}

fn forward_log(worker: WorkerId, record: &LogRecord) {
    let text = record.text();
    match record.level {
        LogLevel::Error => tracing::error!(target: WORKER_LOG_TARGET, worker, "{text}"),
        LogLevel::Warn => tracing::warn!(target: WORKER_LOG_TARGET, worker, "{text}"),
        LogLevel::Info => tracing::info!(target: WORKER_LOG_TARGET, worker, "{text}"),
        LogLevel::Verbose | LogLevel::Debug => {
            tracing::debug!(target: WORKER_LOG_TARGET, worker, "{text}")
        }
        LogLevel::Silly => tracing::trace!(target: WORKER_LOG_TARGET, worker, "{text}"),
    }
}

/// Next stats tick, or never when stats logging is off.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

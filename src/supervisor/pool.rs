use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::stats::WorkerStats;
use super::WorkerId;
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::protocol::{CapabilityName, ControllerMessage, RequestId};
use crate::scheduler::Load;
use crate::transport::{EntryTarget, Transport, TransportEvent, WorkerChannel};
use crate::worker::HeartbeatSender;

/// Lifecycle of a worker as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Started, nothing announced yet.
    Spawning,
    /// Has announced at least one capability.
    Active,
    /// Exited; waiting out the grace delay before replacement.
    Draining,
    /// Removed from the pool.
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Spawning => write!(f, "spawning"),
            WorkerState::Active => write!(f, "active"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Controller-side record of one worker.
#[derive(Debug)]
pub struct WorkerSlot {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
    /// Announced capabilities, in announcement order.
    pub capabilities: Vec<CapabilityName>,
    pub in_flight: usize,
    pub completed: u64,
    pub spawned_at: DateTime<Utc>,
    pub target: Arc<EntryTarget>,
    /// Relocated requests waiting for this worker to announce their
    /// capability before they are sent.
    pub(crate) deferred: Vec<RequestId>,
    channel: WorkerChannel,
    heartbeat: JoinHandle<()>,
}

impl WorkerSlot {
    pub fn load(&self) -> Load {
        Load::new(self.in_flight, self.completed)
    }

    pub fn provides(&self, name: &CapabilityName) -> bool {
        self.capabilities.contains(name)
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, WorkerState::Spawning | WorkerState::Active)
    }

    /// Queue a message for the worker. A failed send kills the worker so it
    /// goes through the regular exit path.
    pub fn send(&self, message: ControllerMessage) -> Result<()> {
        let sent = self.channel.send(message);
        if sent.is_err() {
            self.channel.kill();
        }
        sent
    }

    pub fn kill(&self) {
        self.channel.kill();
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            pid: self.pid,
            state: self.state,
            in_flight: self.in_flight,
            completed: self.completed,
            capabilities: self.capabilities.iter().map(ToString::to_string).collect(),
            spawned_at: self.spawned_at,
        }
    }
}

/// The set of workers the controller manages.
pub struct WorkerPool {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<TransportEvent>,
    config: SupervisorConfig,
    slots: BTreeMap<WorkerId, WorkerSlot>,
    next_id: WorkerId,
}

impl WorkerPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<TransportEvent>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            transport,
            events,
            config,
            slots: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Start one worker running `target`.
    pub fn spawn(&mut self, target: Arc<EntryTarget>) -> Result<WorkerId> {
        let id = self.next_id;
        self.next_id += 1;

        let env = self.config.worker_env(id);
        let channel = self
            .transport
            .spawn(id, &target, &env, self.events.clone())?;
        let heartbeat =
            HeartbeatSender::new(self.config.heartbeat_interval_ms).spawn(channel.clone());

        tracing::info!(worker = id, pid = ?channel.pid(), entry = %target, "Worker spawned");
        self.slots.insert(
            id,
            WorkerSlot {
                id,
                pid: channel.pid(),
                state: WorkerState::Spawning,
                capabilities: Vec::new(),
                in_flight: 0,
                completed: 0,
                spawned_at: Utc::now(),
                target,
                deferred: Vec::new(),
                channel,
                heartbeat,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(&id)
    }

    pub fn load(&self, id: WorkerId) -> Load {
        self.slots.get(&id).map(WorkerSlot::load).unwrap_or_default()
    }

    /// Take a worker out of the pool, stopping its heartbeat and process.
    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerSlot> {
        let mut slot = self.slots.remove(&id)?;
        slot.heartbeat.abort();
        slot.channel.kill();
        slot.state = WorkerState::Terminated;
        tracing::debug!(worker = id, "Worker removed from pool");
        Some(slot)
    }

    /// Kill every worker and forget them.
    pub fn kill_all(&mut self) -> usize {
        let ids: Vec<WorkerId> = self.slots.keys().copied().collect();
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("slots", &self.slots)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

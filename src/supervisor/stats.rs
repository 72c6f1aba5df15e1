use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pool::WorkerState;
use super::WorkerId;

/// Snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub in_flight: usize,
    pub completed: u64,
    pub capabilities: Vec<String>,
    pub spawned_at: DateTime<Utc>,
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}", self.id)?;
        if let Some(pid) = self.pid {
            write!(f, " (pid {pid})")?;
        }
        write!(
            f,
            " [{}] in flight: {} done: {}",
            self.state, self.in_flight, self.completed
        )
    }
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub workers: Vec<WorkerStats>,
    /// Requests accepted and not yet resolved, queued or in flight.
    pub pending: usize,
    /// Requests waiting for a provider.
    pub backlog: usize,
}

impl PoolStats {
    pub fn in_flight(&self) -> usize {
        self.workers.iter().map(|w| w.in_flight).sum()
    }

    pub fn completed(&self) -> u64 {
        self.workers.iter().map(|w| w.completed).sum()
    }

    /// Log the snapshot, one line per worker.
    pub fn log(&self) {
        tracing::info!(
            workers = self.workers.len(),
            pending = self.pending,
            backlog = self.backlog,
            "Pool stats"
        );
        for worker in &self.workers {
            tracing::info!("{worker}");
        }
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} workers, {} pending, {} backlogged",
            self.workers.len(),
            self.pending,
            self.backlog
        )
    }
}

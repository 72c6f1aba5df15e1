use std::collections::{HashMap, VecDeque};

use crate::protocol::{CapabilityName, RequestId};

/// Requests waiting for a capability that has no live provider, one FIFO per
/// capability.
#[derive(Debug, Default)]
pub struct Backlog {
    queues: HashMap<CapabilityName, VecDeque<RequestId>>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: CapabilityName, id: RequestId) {
        self.queues.entry(name).or_default().push_back(id);
    }

    /// Take every request queued for `name`, oldest first.
    pub fn drain(&mut self, name: &CapabilityName) -> Vec<RequestId> {
        self.queues
            .remove(name)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn len_for(&self, name: &CapabilityName) -> usize {
        self.queues.get(name).map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }

    /// Remove everything, e.g. at shutdown.
    pub fn clear(&mut self) -> Vec<RequestId> {
        self.queues.drain().flat_map(|(_, queue)| queue).collect()
    }
}

use std::collections::BTreeMap;

use crate::protocol::CapabilityName;
use crate::scheduler::balancer::{self, Load};
use crate::supervisor::WorkerId;

/// Result of a capability announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The worker already provided this capability.
    Unchanged,
    /// The worker was added to the provider list.
    Added { first_provider: bool },
}

/// Capability name → live providers, each list kept in load order.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<CapabilityName, Vec<WorkerId>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `worker` provides `name`.
    ///
    /// Announcing the same capability twice from one worker is a no-op.
    pub fn register<F>(&mut self, name: CapabilityName, worker: WorkerId, load: F) -> Registration
    where
        F: Fn(WorkerId) -> Load,
    {
        let providers = self.entries.entry(name).or_default();
        if providers.contains(&worker) {
            return Registration::Unchanged;
        }
        providers.push(worker);
        balancer::rank(providers, load);
        Registration::Added {
            first_provider: providers.len() == 1,
        }
    }

    pub fn providers(&self, name: &CapabilityName) -> &[WorkerId] {
        self.entries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_provider(&self, name: &CapabilityName) -> bool {
        !self.providers(name).is_empty()
    }

    /// Least loaded provider of `name`.
    pub fn select(&self, name: &CapabilityName) -> Option<WorkerId> {
        balancer::select(self.providers(name))
    }

    /// Re-sort every list `worker` appears in after its load changed.
    pub fn rerank<F>(&mut self, worker: WorkerId, load: F)
    where
        F: Fn(WorkerId) -> Load,
    {
        for providers in self.entries.values_mut() {
            if providers.contains(&worker) {
                balancer::rank(providers, &load);
            }
        }
    }

    /// Drop `worker` from every capability. Returns the names it provided.
    pub fn remove_worker(&mut self, worker: WorkerId) -> Vec<CapabilityName> {
        let mut removed = Vec::new();
        for (name, providers) in self.entries.iter_mut() {
            if let Some(pos) = providers.iter().position(|&id| id == worker) {
                providers.remove(pos);
                removed.push(name.clone());
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> CapabilityName {
        CapabilityName::new(s).unwrap()
    }

    fn idle(_: WorkerId) -> Load {
        Load::default()
    }

    #[test]
    fn first_registration_is_reported() {
        let mut registry = CapabilityRegistry::new();
        assert_eq!(
            registry.register(name("square"), 1, idle),
            Registration::Added { first_provider: true }
        );
        assert_eq!(
            registry.register(name("square"), 2, idle),
            Registration::Added { first_provider: false }
        );
        assert_eq!(registry.providers(&name("square")), &[1, 2]);
    }

    #[test]
    fn registration_is_idempotent_and_case_insensitive() {
        let mut registry = CapabilityRegistry::new();
        registry.register(name("Echo"), 1, idle);
        assert_eq!(
            registry.register(name("ECHO"), 1, idle),
            Registration::Unchanged
        );
        assert_eq!(registry.providers(&name("echo")), &[1]);
    }

    #[test]
    fn new_provider_is_ranked_on_insert() {
        let mut registry = CapabilityRegistry::new();
        let load = |id: WorkerId| if id == 1 { Load::new(3, 0) } else { Load::default() };
        registry.register(name("ping"), 1, load);
        registry.register(name("ping"), 2, load);
        assert_eq!(registry.select(&name("ping")), Some(2));
    }

    #[test]
    fn rerank_touches_every_list_of_the_worker() {
        let mut registry = CapabilityRegistry::new();
        for cap in ["a", "b"] {
            registry.register(name(cap), 1, idle);
            registry.register(name(cap), 2, idle);
        }
        registry.register(name("c"), 2, idle);

        let busy_one = |id: WorkerId| if id == 1 { Load::new(1, 0) } else { Load::default() };
        registry.rerank(1, busy_one);

        assert_eq!(registry.providers(&name("a")), &[2, 1]);
        assert_eq!(registry.providers(&name("b")), &[2, 1]);
        assert_eq!(registry.providers(&name("c")), &[2]);
    }

    #[test]
    fn remove_worker_clears_every_entry() {
        let mut registry = CapabilityRegistry::new();
        registry.register(name("a"), 1, idle);
        registry.register(name("b"), 1, idle);
        registry.register(name("b"), 2, idle);

        let removed = registry.remove_worker(1);
        assert_eq!(removed, vec![name("a"), name("b")]);
        assert!(!registry.has_provider(&name("a")));
        assert_eq!(registry.providers(&name("b")), &[2]);
        assert!(registry.has_provider(&name("b")));
    }

    #[test]
    fn unknown_capability_has_no_providers() {
        let registry = CapabilityRegistry::new();
        assert!(registry.providers(&name("nothing")).is_empty());
        assert_eq!(registry.select(&name("nothing")), None);
    }
}

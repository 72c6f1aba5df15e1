use crate::supervisor::WorkerId;

/// Work counters used to order providers.
///
/// Ordering compares `in_flight` first and `completed` second, so the
/// least busy worker sorts first and, among equally busy ones, the one that
/// has done the least so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Load {
    pub in_flight: usize,
    pub completed: u64,
}

impl Load {
    pub fn new(in_flight: usize, completed: u64) -> Self {
        Self {
            in_flight,
            completed,
        }
    }
}

/// Re-order `providers` by ascending load.
///
/// The sort is stable: workers with identical load keep their relative
/// (registration) order.
pub fn rank<F>(providers: &mut [WorkerId], load: F)
where
    F: Fn(WorkerId) -> Load,
{
    providers.sort_by_key(|&id| load(id));
}

/// Pick the provider for the next dispatch: the head of a ranked list.
pub fn select(providers: &[WorkerId]) -> Option<WorkerId> {
    providers.first().copied()
}

//! Strict-mode allocation bookkeeping.
//!
//! Release actions for buffers are driven by wrapper drops, so a bookkeeping bug shows up as a
//! double free or a free of memory the host never owned. The ledger turns both into an immediate
//! panic at the release site instead of silent heap corruption in the module.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tether_mem::RefHandle;

/// Released allocations remembered for double-release diagnostics.
const RELEASE_HISTORY: usize = 256;

/// Lifecycle of one exclusive allocation as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveState {
    Live,
    /// Handed back to the module; no destructor ran.
    Transferred,
    /// The last host wrapper dropped and the destructor freed the allocation.
    Destroyed,
}

#[derive(Debug, Default)]
struct Tracked {
    /// Host-held references per refcounted allocation. Entries go away at zero.
    refs: HashMap<RefHandle, u32>,
    live_exclusive: HashSet<u32>,
    released_refs: VecDeque<RefHandle>,
    released_exclusive: VecDeque<(u32, ExclusiveState)>,
}

impl Tracked {
    fn remember_ref(&mut self, handle: RefHandle) {
        if self.released_refs.len() == RELEASE_HISTORY {
            self.released_refs.pop_front();
        }
        self.released_refs.push_back(handle);
    }

    fn remember_exclusive(&mut self, ptr: u32, how: ExclusiveState) {
        self.released_exclusive.retain(|&(p, _)| p != ptr);
        if self.released_exclusive.len() == RELEASE_HISTORY {
            self.released_exclusive.pop_front();
        }
        self.released_exclusive.push_back((ptr, how));
    }

    fn released_exclusive(&self, ptr: u32) -> Option<ExclusiveState> {
        self.released_exclusive
            .iter()
            .rev()
            .find(|&&(p, _)| p == ptr)
            .map(|&(_, how)| how)
    }
}

/// Tracks live allocations only; released ones are kept in a short history so that a late
/// second release still names what happened first.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    tracked: Mutex<Tracked>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ref_acquired(&self, handle: RefHandle) {
        let mut tracked = self.tracked();
        tracked.released_refs.retain(|&h| h != handle);
        *tracked.refs.entry(handle).or_insert(0) += 1;
    }

    pub fn ref_released(&self, handle: RefHandle) {
        let mut guard = self.tracked();
        let tracked = &mut *guard;
        match tracked.refs.get_mut(&handle) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                tracked.refs.remove(&handle);
                tracked.remember_ref(handle);
            }
            None if tracked.released_refs.contains(&handle) => {
                panic!("releasing already released refcounted allocation {handle}")
            }
            None => panic!("releasing untracked refcounted allocation {handle}"),
        }
    }

    pub fn exclusive_allocated(&self, ptr: u32) {
        let mut tracked = self.tracked();
        if !tracked.live_exclusive.insert(ptr) {
            panic!("exclusive allocation {ptr:#x} registered twice while live");
        }
        tracked.released_exclusive.retain(|&(p, _)| p != ptr);
    }

    /// Record the single release of an exclusive allocation (`Transferred` or `Destroyed`).
    pub fn exclusive_released(&self, ptr: u32, how: ExclusiveState) {
        debug_assert_ne!(how, ExclusiveState::Live);
        let mut tracked = self.tracked();
        if tracked.live_exclusive.remove(&ptr) {
            tracked.remember_exclusive(ptr, how);
            return;
        }
        match tracked.released_exclusive(ptr) {
            Some(prev) => panic!(
                "releasing exclusive allocation {ptr:#x} as {how:?} after it was already {prev:?}"
            ),
            None => panic!("releasing untracked exclusive allocation {ptr:#x}"),
        }
    }

    /// Number of host references currently held on `handle`.
    pub fn live_refs(&self, handle: RefHandle) -> u32 {
        self.tracked().refs.get(&handle).copied().unwrap_or(0)
    }

    /// `Live`, or how the allocation was recently released. `None` once it has aged out of the
    /// release history.
    pub fn exclusive_state(&self, ptr: u32) -> Option<ExclusiveState> {
        let tracked = self.tracked();
        if tracked.live_exclusive.contains(&ptr) {
            return Some(ExclusiveState::Live);
        }
        tracked.released_exclusive(ptr)
    }

    /// Allocations the host currently holds: refcounted handles plus live exclusive vectors.
    pub fn live_allocations(&self) -> usize {
        let tracked = self.tracked();
        tracked.refs.len() + tracked.live_exclusive.len()
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_release_is_recorded_once() {
        let ledger = AllocationLedger::new();
        ledger.exclusive_allocated(64);
        ledger.exclusive_released(64, ExclusiveState::Transferred);
        assert_eq!(ledger.exclusive_state(64), Some(ExclusiveState::Transferred));

        // The module may reuse the address for a later allocation.
        ledger.exclusive_allocated(64);
        assert_eq!(ledger.exclusive_state(64), Some(ExclusiveState::Live));
    }

    #[test]
    #[should_panic(expected = "after it was already Transferred")]
    fn destroy_after_transfer_panics() {
        let ledger = AllocationLedger::new();
        ledger.exclusive_allocated(64);
        ledger.exclusive_released(64, ExclusiveState::Transferred);
        ledger.exclusive_released(64, ExclusiveState::Destroyed);
    }

    #[test]
    #[should_panic(expected = "untracked exclusive allocation")]
    fn releasing_untracked_exclusive_panics() {
        AllocationLedger::new().exclusive_released(8, ExclusiveState::Destroyed);
    }

    #[test]
    #[should_panic(expected = "already released refcounted allocation")]
    fn ref_double_release_panics() {
        let ledger = AllocationLedger::new();
        ledger.ref_acquired(RefHandle(16));
        ledger.ref_released(RefHandle(16));
        ledger.ref_released(RefHandle(16));
    }

    #[test]
    fn released_allocations_stop_being_tracked() {
        let ledger = AllocationLedger::new();
        for round in 0..(RELEASE_HISTORY as u32 * 4) {
            let handle = RefHandle(round * 8);
            ledger.ref_acquired(handle);
            ledger.ref_acquired(handle);
            ledger.exclusive_allocated(round * 8);
            assert_eq!(ledger.live_allocations(), 2);

            ledger.ref_released(handle);
            assert_eq!(ledger.live_refs(handle), 1);
            ledger.ref_released(handle);
            ledger.exclusive_released(round * 8, ExclusiveState::Destroyed);
            assert_eq!(ledger.live_allocations(), 0);
        }
        let tracked = ledger.tracked();
        assert_eq!(tracked.released_refs.len(), RELEASE_HISTORY);
        assert_eq!(tracked.released_exclusive.len(), RELEASE_HISTORY);
    }

    #[test]
    #[should_panic(expected = "untracked refcounted allocation")]
    fn ref_release_of_unknown_handle_panics() {
        AllocationLedger::new().ref_released(RefHandle(16));
    }
}

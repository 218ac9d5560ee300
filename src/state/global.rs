use std::fmt;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;

use super::ResourceState;
use crate::hal::{ResourceHandle, ResourceStates};

/// Table of committed resource states, owned by a
/// [`GpuContext`](crate::GpuContext) and shared by all of its queues.
///
/// Resolving a submission's pending barriers and committing its final states
/// must happen under one [`lock`](Self::lock); interleaving two queues'
/// resolve/commit phases would let one observe a half-committed table.
#[derive(Default)]
pub struct GlobalResourceStates {
    table: Mutex<FxHashMap<ResourceHandle, ResourceState>>,
}

impl GlobalResourceStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `resource`. Call when the resource is created.
    pub fn register(&self, resource: ResourceHandle, initial: ResourceStates) {
        self.table.lock().insert(resource, ResourceState::new(initial));
    }

    /// Stop tracking `resource`. Call before it is destroyed.
    pub fn unregister(&self, resource: ResourceHandle) {
        self.table.lock().remove(&resource);
    }

    #[must_use]
    pub fn lock(&self) -> GlobalStatesGuard<'_> {
        GlobalStatesGuard {
            table: self.table.lock(),
            journal: Vec::new(),
        }
    }

    /// Snapshot of the committed state of `resource`.
    #[must_use]
    pub fn state_of(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.table.lock().get(&resource).cloned()
    }

    #[must_use]
    pub fn is_registered(&self, resource: ResourceHandle) -> bool {
        self.table.lock().contains_key(&resource)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for GlobalResourceStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalResourceStates")
            .field("resources", &self.len())
            .finish()
    }
}

/// Exclusive access to the global table for one submission.
///
/// Every commit made through the guard can be undone with
/// [`rollback`](Self::rollback) until the guard is dropped.
pub struct GlobalStatesGuard<'a> {
    table: MutexGuard<'a, FxHashMap<ResourceHandle, ResourceState>>,
    /// Previous states, oldest first.
    journal: Vec<(ResourceHandle, ResourceState)>,
}

impl GlobalStatesGuard<'_> {
    #[must_use]
    pub fn get(&self, resource: ResourceHandle) -> Option<&ResourceState> {
        self.table.get(&resource)
    }

    /// Replace the state of a registered resource. Returns `false` (and
    /// changes nothing) for unregistered resources.
    pub fn commit(&mut self, resource: ResourceHandle, state: ResourceState) -> bool {
        match self.table.get_mut(&resource) {
            Some(entry) => {
                let previous = std::mem::replace(entry, state);
                self.journal.push((resource, previous));
                true
            }
            None => false,
        }
    }

    /// Restore every entry committed through this guard. Used when a
    /// submission fails before its lists reach the GPU.
    pub fn rollback(&mut self) {
        if !self.journal.is_empty() {
            log::debug!("Rolling back {} committed resource states", self.journal.len());
        }
        while let Some((resource, previous)) = self.journal.pop() {
            if let Some(entry) = self.table.get_mut(&resource) {
                *entry = previous;
            }
        }
    }
}

//! Resource state tracking.
//!
//! Two levels:
//!
//! - [`GlobalResourceStates`]: the last state every registered resource was
//!   left in by a submitted command list. One mutex, shared by all queues.
//! - [`ResourceStateTracker`]: per command list. Records the final state of
//!   every resource the list touched, plus "pending" barriers for resources
//!   whose state before the list is not yet known.
//!
//! At submission the pending barriers are resolved against the global table
//! and recorded into an auxiliary command list that runs first; the list's
//! final states are then merged back into the table, all under the same lock.

mod global;
mod tracker;

use std::collections::BTreeMap;

pub use global::{GlobalResourceStates, GlobalStatesGuard};
pub use tracker::{PendingFlush, ResourceStateTracker};

use crate::hal::{ResourceStates, Subresource};

/// State of a resource, with per-subresource overrides once they diverge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceState {
    /// State of every subresource without an override.
    pub state: ResourceStates,
    pub subresource_states: BTreeMap<u32, ResourceStates>,
}

impl ResourceState {
    #[must_use]
    pub fn new(state: ResourceStates) -> Self {
        Self {
            state,
            subresource_states: BTreeMap::new(),
        }
    }

    /// A whole-resource set drops every override.
    pub fn set(&mut self, subresource: Subresource, state: ResourceStates) {
        match subresource {
            Subresource::All => {
                self.state = state;
                self.subresource_states.clear();
            }
            Subresource::Index(index) => {
                self.subresource_states.insert(index, state);
            }
        }
    }

    #[must_use]
    pub fn get(&self, subresource: Subresource) -> ResourceStates {
        match subresource {
            Subresource::All => self.state,
            Subresource::Index(index) => self
                .subresource_states
                .get(&index)
                .copied()
                .unwrap_or(self.state),
        }
    }

    /// Whether any subresource has its own state.
    #[inline]
    #[must_use]
    pub fn is_divergent(&self) -> bool {
        !self.subresource_states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subresource_falls_back_to_whole_state() {
        let mut state = ResourceState::new(ResourceStates::COPY_DEST);
        state.set(Subresource::Index(2), ResourceStates::PIXEL_SHADER_RESOURCE);

        assert!(state.is_divergent());
        assert_eq!(state.get(Subresource::Index(0)), ResourceStates::COPY_DEST);
        assert_eq!(
            state.get(Subresource::Index(2)),
            ResourceStates::PIXEL_SHADER_RESOURCE
        );

        state.set(Subresource::All, ResourceStates::COMMON);
        assert!(!state.is_divergent());
        assert_eq!(state.get(Subresource::Index(2)), ResourceStates::COMMON);
    }
}

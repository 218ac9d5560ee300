use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::{GlobalStatesGuard, ResourceState};
use crate::hal::{
    CommandEncoder, ResourceBarrier, ResourceHandle, ResourceStates, Subresource,
    TransitionBarrier,
};

/// Outcome of resolving a command list's pending barriers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingFlush {
    /// Barriers recorded into the pending command list.
    pub emitted: u32,
    /// Of those, barriers whose before and after states differ.
    pub effective: u32,
}

/// Per-command-list resource state tracking.
///
/// The first transition of a resource in a list cannot know the resource's
/// state before the list runs, so it becomes a *pending* barrier with a
/// placeholder before-state. Every later transition of the same resource in
/// the list knows the true before-state and is recorded immediately (and
/// skipped when it changes nothing).
#[derive(Debug, Default)]
pub struct ResourceStateTracker {
    barriers: Vec<ResourceBarrier>,
    pending: Vec<TransitionBarrier>,
    final_states: FxHashMap<ResourceHandle, ResourceState>,
    // First seen through a single subresource; the rest are unknown until
    // resolved against the global table.
    partial: FxHashSet<ResourceHandle>,
}

impl ResourceStateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `barrier`. Only transitions are tracked; UAV and aliasing
    /// barriers are queued as-is.
    pub fn resource_barrier(&mut self, barrier: ResourceBarrier) {
        let ResourceBarrier::Transition(transition) = barrier else {
            self.barriers.push(barrier);
            return;
        };
        let TransitionBarrier {
            resource,
            subresource,
            after,
            ..
        } = transition;

        let divergent = subresource == Subresource::All
            && self
                .final_states
                .get(&resource)
                .is_some_and(ResourceState::is_divergent);

        if divergent {
            if let Some(known) = self.final_states.get(&resource) {
                for (&index, &before) in &known.subresource_states {
                    if before != after {
                        self.barriers.push(ResourceBarrier::transition(
                            resource,
                            before,
                            after,
                            Subresource::Index(index),
                        ));
                    }
                }
            }
        } else if let Some(before) = self.tracked_state(resource, subresource) {
            if before != after {
                self.barriers.push(ResourceBarrier::transition(
                    resource,
                    before,
                    after,
                    subresource,
                ));
            }
        } else {
            if matches!(subresource, Subresource::Index(_))
                && !self.final_states.contains_key(&resource)
            {
                self.partial.insert(resource);
            }
            self.pending.push(TransitionBarrier {
                before: ResourceStates::COMMON,
                ..transition
            });
        }

        self.final_states
            .entry(resource)
            .or_default()
            .set(subresource, after);
        if subresource == Subresource::All {
            self.partial.remove(&resource);
        }
    }

    /// Transition `resource` (or one subresource) to `after`.
    pub fn transition_resource(
        &mut self,
        resource: ResourceHandle,
        after: ResourceStates,
        subresource: Subresource,
    ) {
        self.resource_barrier(ResourceBarrier::transition(
            resource,
            ResourceStates::COMMON,
            after,
            subresource,
        ));
    }

    /// `None` orders all UAV accesses.
    pub fn uav_barrier(&mut self, resource: Option<ResourceHandle>) {
        self.resource_barrier(ResourceBarrier::Uav { resource });
    }

    pub fn aliasing_barrier(&mut self, before: Option<ResourceHandle>, after: Option<ResourceHandle>) {
        self.resource_barrier(ResourceBarrier::Aliasing { before, after });
    }

    /// Record every queued barrier into `encoder`. Returns how many.
    pub fn flush_resource_barriers(&mut self, encoder: &mut dyn CommandEncoder) -> u32 {
        if self.barriers.is_empty() {
            return 0;
        }
        encoder.resource_barrier(&self.barriers);
        let count = self.barriers.len() as u32;
        self.barriers.clear();
        count
    }

    /// Resolve the pending barriers against the global table and record them
    /// into `encoder` (the list that runs just before this one).
    ///
    /// Barriers that turn out redundant are still recorded unless `elide` is
    /// set. Transitions of unregistered resources are dropped.
    pub fn flush_pending_resource_barriers(
        &mut self,
        encoder: &mut dyn CommandEncoder,
        global: &GlobalStatesGuard<'_>,
        elide: bool,
    ) -> PendingFlush {
        let mut resolved: SmallVec<[ResourceBarrier; 8]> = SmallVec::new();
        let mut effective = 0;

        for pending in self.pending.drain(..) {
            let Some(current) = global.get(pending.resource) else {
                log::warn!(
                    "Dropping transition of unregistered resource {:?}",
                    pending.resource
                );
                continue;
            };

            let mut push = |before: ResourceStates, subresource: Subresource| {
                let changes = before != pending.after;
                if changes || !elide {
                    resolved.push(ResourceBarrier::transition(
                        pending.resource,
                        before,
                        pending.after,
                        subresource,
                    ));
                }
                if changes {
                    effective += 1;
                }
            };

            if pending.subresource == Subresource::All && current.is_divergent() {
                for (&index, &before) in &current.subresource_states {
                    push(before, Subresource::Index(index));
                }
            } else {
                push(current.get(pending.subresource), pending.subresource);
            }
        }

        // Fill in what the list never touched for resources it only saw
        // through single subresources.
        for resource in self.partial.drain() {
            if let (Some(current), Some(entry)) =
                (global.get(resource), self.final_states.get_mut(&resource))
            {
                entry.state = current.state;
                for (&index, &state) in &current.subresource_states {
                    entry.subresource_states.entry(index).or_insert(state);
                }
            }
        }

        if !resolved.is_empty() {
            encoder.resource_barrier(&resolved);
            log::debug!(
                "Resolved {} pending barriers ({} effective)",
                resolved.len(),
                effective
            );
        }

        PendingFlush {
            emitted: resolved.len() as u32,
            effective,
        }
    }

    /// Merge this list's final states into the global table.
    pub fn commit_final_resource_states(&self, global: &mut GlobalStatesGuard<'_>) {
        for (&resource, state) in &self.final_states {
            if !global.commit(resource, state.clone()) {
                log::trace!("Not committing state of unregistered resource {resource:?}");
            }
        }
    }

    /// Forget everything. Must run before the owning list is reused.
    pub fn reset(&mut self) {
        self.barriers.clear();
        self.pending.clear();
        self.final_states.clear();
        self.partial.clear();
    }

    /// Pending barriers waiting for submission-time resolution.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Barriers queued for the next flush.
    #[inline]
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.barriers.len()
    }

    #[must_use]
    pub fn final_state(&self, resource: ResourceHandle) -> Option<&ResourceState> {
        self.final_states.get(&resource)
    }

    fn tracked_state(&self, resource: ResourceHandle, subresource: Subresource) -> Option<ResourceStates> {
        let entry = self.final_states.get(&resource)?;
        match subresource {
            Subresource::All => Some(entry.state),
            Subresource::Index(index) => entry
                .subresource_states
                .get(&index)
                .copied()
                .or_else(|| (!self.partial.contains(&resource)).then_some(entry.state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::headless::{Command, HeadlessDevice, HeadlessEncoder};
    use crate::hal::{Device, QueueKind};
    use crate::state::GlobalResourceStates;
    use slotmap::KeyData;

    fn handle(n: u64) -> ResourceHandle {
        ResourceHandle::from(KeyData::from_ffi(n))
    }

    fn encoder() -> Box<dyn CommandEncoder> {
        HeadlessDevice::new()
            .create_command_encoder(QueueKind::Direct)
            .unwrap()
    }

    fn recorded(encoder: &dyn CommandEncoder) -> Vec<ResourceBarrier> {
        encoder
            .as_any()
            .downcast_ref::<HeadlessEncoder>()
            .unwrap()
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::Barriers(b) => Some(b.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_first_transition_is_pending() {
        let mut tracker = ResourceStateTracker::new();
        let a = handle(1);
        tracker.transition_resource(a, ResourceStates::COPY_DEST, Subresource::All);

        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.queued_count(), 0);
        assert_eq!(
            tracker.final_state(a).map(|s| s.state),
            Some(ResourceStates::COPY_DEST)
        );
    }

    #[test]
    fn test_known_resource_gets_corrective_barrier() {
        let mut tracker = ResourceStateTracker::new();
        let a = handle(1);
        tracker.transition_resource(a, ResourceStates::COPY_DEST, Subresource::All);
        tracker.transition_resource(a, ResourceStates::PIXEL_SHADER_RESOURCE, Subresource::All);

        let mut enc = encoder();
        assert_eq!(tracker.flush_resource_barriers(enc.as_mut()), 1);
        assert_eq!(
            recorded(enc.as_ref()),
            vec![ResourceBarrier::transition(
                a,
                ResourceStates::COPY_DEST,
                ResourceStates::PIXEL_SHADER_RESOURCE,
                Subresource::All
            )]
        );
    }

    #[test]
    fn test_repeated_transition_is_skipped() {
        let mut tracker = ResourceStateTracker::new();
        let a = handle(1);
        tracker.transition_resource(a, ResourceStates::COPY_DEST, Subresource::All);
        tracker.transition_resource(a, ResourceStates::COPY_DEST, Subresource::All);

        assert_eq!(tracker.pending_count(), 1);
        assert_eq!(tracker.queued_count(), 0);
    }

    #[test]
    fn test_pending_resolves_against_global_state() {
        let global = GlobalResourceStates::new();
        let a = handle(1);
        global.register(a, ResourceStates::RENDER_TARGET);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(a, ResourceStates::PIXEL_SHADER_RESOURCE, Subresource::All);

        let mut pending = encoder();
        let mut guard = global.lock();
        let flush = tracker.flush_pending_resource_barriers(pending.as_mut(), &guard, false);
        tracker.commit_final_resource_states(&mut guard);
        drop(guard);

        assert_eq!(
            flush,
            PendingFlush {
                emitted: 1,
                effective: 1
            }
        );
        assert_eq!(
            recorded(pending.as_ref()),
            vec![ResourceBarrier::transition(
                a,
                ResourceStates::RENDER_TARGET,
                ResourceStates::PIXEL_SHADER_RESOURCE,
                Subresource::All
            )]
        );
        assert_eq!(
            global.state_of(a).map(|s| s.state),
            Some(ResourceStates::PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn test_redundant_pending_barrier_kept_unless_elided() {
        let global = GlobalResourceStates::new();
        let a = handle(1);
        global.register(a, ResourceStates::COPY_DEST);

        for (elide, emitted) in [(false, 1), (true, 0)] {
            let mut tracker = ResourceStateTracker::new();
            tracker.transition_resource(a, ResourceStates::COPY_DEST, Subresource::All);
            let mut pending = encoder();
            let flush =
                tracker.flush_pending_resource_barriers(pending.as_mut(), &global.lock(), elide);
            assert_eq!(flush.emitted, emitted);
            assert_eq!(flush.effective, 0);
            assert_eq!(recorded(pending.as_ref()).len(), emitted as usize);
        }
    }

    #[test]
    fn test_whole_transition_expands_over_divergent_subresources() {
        let global = GlobalResourceStates::new();
        let tex = handle(1);
        global.register(tex, ResourceStates::COMMON);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(tex, ResourceStates::COPY_DEST, Subresource::All);
        tracker.transition_resource(tex, ResourceStates::RENDER_TARGET, Subresource::Index(1));
        tracker.transition_resource(tex, ResourceStates::UNORDERED_ACCESS, Subresource::Index(3));
        tracker.transition_resource(tex, ResourceStates::RENDER_TARGET, Subresource::All);

        let mut enc = encoder();
        tracker.flush_resource_barriers(enc.as_mut());
        let barriers = recorded(enc.as_ref());

        // COPY_DEST→RT on 1, COPY_DEST→UAV on 3, then UAV→RT on 3 only.
        assert_eq!(barriers.len(), 3);
        assert_eq!(
            barriers[2],
            ResourceBarrier::transition(
                tex,
                ResourceStates::UNORDERED_ACCESS,
                ResourceStates::RENDER_TARGET,
                Subresource::Index(3)
            )
        );
        let final_state = tracker.final_state(tex).unwrap();
        assert!(!final_state.is_divergent());
        assert_eq!(final_state.state, ResourceStates::RENDER_TARGET);
    }

    #[test]
    fn test_pending_whole_transition_expands_over_divergent_global_state() {
        let global = GlobalResourceStates::new();
        let tex = handle(1);
        global.register(tex, ResourceStates::COMMON);
        {
            let mut guard = global.lock();
            let mut state = ResourceState::new(ResourceStates::COPY_DEST);
            state.set(Subresource::Index(0), ResourceStates::RENDER_TARGET);
            state.set(Subresource::Index(2), ResourceStates::COPY_SOURCE);
            guard.commit(tex, state);
        }

        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(tex, ResourceStates::PIXEL_SHADER_RESOURCE, Subresource::All);
        let mut pending = encoder();
        let flush = tracker.flush_pending_resource_barriers(pending.as_mut(), &global.lock(), false);

        assert_eq!(flush.emitted, 2);
        let barriers = recorded(pending.as_ref());
        assert_eq!(
            barriers[0],
            ResourceBarrier::transition(
                tex,
                ResourceStates::RENDER_TARGET,
                ResourceStates::PIXEL_SHADER_RESOURCE,
                Subresource::Index(0)
            )
        );
    }

    #[test]
    fn test_subresource_only_list_keeps_untouched_global_state() {
        let global = GlobalResourceStates::new();
        let tex = handle(1);
        global.register(tex, ResourceStates::COPY_DEST);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(tex, ResourceStates::RENDER_TARGET, Subresource::Index(1));
        // Subresource 2 was never seen, so its transition is pending too.
        tracker.transition_resource(tex, ResourceStates::RENDER_TARGET, Subresource::Index(2));
        assert_eq!(tracker.pending_count(), 2);

        let mut pending = encoder();
        let mut guard = global.lock();
        tracker.flush_pending_resource_barriers(pending.as_mut(), &guard, false);
        tracker.commit_final_resource_states(&mut guard);
        drop(guard);

        let state = global.state_of(tex).unwrap();
        assert_eq!(state.state, ResourceStates::COPY_DEST);
        assert_eq!(
            state.get(Subresource::Index(1)),
            ResourceStates::RENDER_TARGET
        );
        assert_eq!(state.get(Subresource::Index(0)), ResourceStates::COPY_DEST);
    }

    #[test]
    fn test_unregistered_pending_transition_is_dropped() {
        let global = GlobalResourceStates::new();
        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(handle(9), ResourceStates::COPY_DEST, Subresource::All);

        let mut pending = encoder();
        let flush = tracker.flush_pending_resource_barriers(pending.as_mut(), &global.lock(), false);
        assert_eq!(flush, PendingFlush::default());
        assert!(recorded(pending.as_ref()).is_empty());
    }

    #[test]
    fn test_uav_and_aliasing_barriers_pass_through() {
        let mut tracker = ResourceStateTracker::new();
        tracker.uav_barrier(None);
        tracker.aliasing_barrier(Some(handle(1)), Some(handle(2)));
        assert_eq!(tracker.pending_count(), 0);

        let mut enc = encoder();
        assert_eq!(tracker.flush_resource_barriers(enc.as_mut()), 2);
        assert_eq!(tracker.flush_resource_barriers(enc.as_mut()), 0);
    }

    #[test]
    fn test_reset_forgets_everything() {
        let mut tracker = ResourceStateTracker::new();
        tracker.transition_resource(handle(1), ResourceStates::COPY_DEST, Subresource::All);
        tracker.uav_barrier(None);
        tracker.reset();
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.queued_count(), 0);
        assert!(tracker.final_state(handle(1)).is_none());
    }
}

use crate::AggregateActionInput;
use crate::AggregateGroup;
use crate::IdentificationKeysMap;
use clock::Clock;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Registry of the aggregation groups, indexed by identification keys
pub struct AggregateGroupManager {
    all_groups: DashMap<IdentificationKeysMap, Arc<AggregateGroup>>,
    group_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl AggregateGroupManager {
    pub fn new(group_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        AggregateGroupManager {
            all_groups: DashMap::new(),
            group_duration,
            clock,
        }
    }

    pub fn group_duration(&self) -> Duration {
        self.group_duration
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Return the group for these keys, creating it if there is none yet
    ///
    /// Concurrent calls with equal keys get the very same group.
    pub fn get_or_create_group(&self, key: &IdentificationKeysMap) -> Arc<AggregateGroup> {
        if let Some(group) = self.all_groups.get(key) {
            return group.value().clone();
        }
        self.all_groups
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AggregateGroup::new(key.clone(), self.clock.now())))
            .value()
            .clone()
    }

    pub fn put_group_with_hash(&self, key: &IdentificationKeysMap, group: &Arc<AggregateGroup>) {
        self.all_groups.insert(key.clone(), group.clone());
    }

    /// Reset a concluded group in place, so it can collect the next window
    ///
    /// Takes the group state, hence requires the caller to hold the handle lock.
    pub fn close_group(&self, input: &mut AggregateActionInput) {
        input.reset_group(self.clock.now());
    }

    /// Remove a group from the registry, unless it has already been replaced by another one
    pub fn retire_group(&self, key: &IdentificationKeysMap, group: &Arc<AggregateGroup>) {
        self.all_groups
            .remove_if(key, |_, registered| Arc::ptr_eq(registered, group));
    }

    pub fn should_conclude_group(&self, input: &AggregateActionInput) -> bool {
        input.should_conclude_group(self.group_duration, self.clock.now())
    }

    /// The groups to be concluded: the groups whose window is over, or all the groups if `force`
    pub fn get_groups_to_conclude(
        &self,
        force: bool,
    ) -> Vec<(IdentificationKeysMap, Arc<AggregateGroup>)> {
        // No registry guard is held while inspecting the groups,
        // and no group lock is taken: a busy group must not hold back the others
        let all_groups: Vec<_> = self
            .all_groups
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if force {
            return all_groups;
        }

        let now = self.clock.now();
        all_groups
            .into_iter()
            .filter(|(_, group)| group.should_conclude_group(self.group_duration, now))
            .collect()
    }

    pub fn get_all_groups_size(&self) -> usize {
        self.all_groups.len()
    }
}

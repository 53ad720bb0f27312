//! Fixed replica table indexed by backend and state
//!
//! Each backend owns one ordered sequence per [`ReplicaState`]. A replica is
//! always filed under the bucket matching its own state, so moving it is a
//! pop from one bucket followed by a push that lands in exactly one other.

use std::collections::{BTreeMap, VecDeque};

use crate::models::BackendTag;
use crate::replica::{ReplicaInstance, ReplicaState};

/// Replicas of one backend, bucketed by state
#[derive(Debug, Default)]
pub struct ReplicaBuckets {
    buckets: [VecDeque<ReplicaInstance>; 6],
}

impl ReplicaBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// File a replica under its current state
    pub fn push(&mut self, replica: ReplicaInstance) {
        self.buckets[replica.state().index()].push_back(replica);
    }

    /// Newest replica in a state
    pub fn pop_newest(&mut self, state: ReplicaState) -> Option<ReplicaInstance> {
        self.buckets[state.index()].pop_back()
    }

    /// Remove every replica in a state, oldest first
    pub fn take(&mut self, state: ReplicaState) -> VecDeque<ReplicaInstance> {
        std::mem::take(&mut self.buckets[state.index()])
    }

    /// Put back replicas taken with [`take`] that were not moved
    ///
    /// [`take`]: ReplicaBuckets::take
    pub fn restore(&mut self, state: ReplicaState, mut replicas: VecDeque<ReplicaInstance>) {
        debug_assert!(replicas.iter().all(|r| r.state() == state));
        let bucket = &mut self.buckets[state.index()];
        replicas.append(bucket);
        *bucket = replicas;
    }

    pub fn len(&self, state: ReplicaState) -> usize {
        self.buckets[state.index()].len()
    }

    pub fn iter(&self, state: ReplicaState) -> impl Iterator<Item = &ReplicaInstance> {
        self.buckets[state.index()].iter()
    }

    /// Every replica in lifecycle order
    pub fn iter_all(&self) -> impl Iterator<Item = &ReplicaInstance> {
        self.buckets.iter().flatten()
    }

    /// Whether every bucket is empty
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Replicas not yet marked for stopping
    pub fn live_count(&self) -> usize {
        ReplicaState::ALL
            .into_iter()
            .filter(|state| state.is_live())
            .map(|state| self.len(state))
            .sum()
    }

    /// Live replicas minus those on their way out
    pub fn weighted_count(&self) -> i64 {
        ReplicaState::ALL
            .into_iter()
            .map(|state| {
                let n = self.len(state) as i64;
                if state.is_live() {
                    n
                } else {
                    -n
                }
            })
            .sum()
    }

    /// Bucket sizes in lifecycle order
    pub fn counts(&self) -> [(ReplicaState, usize); 6] {
        ReplicaState::ALL.map(|state| (state, self.len(state)))
    }
}

/// All replicas the controller manages
#[derive(Debug, Default)]
pub struct ReplicaTable {
    backends: BTreeMap<BackendTag, ReplicaBuckets>,
}

impl ReplicaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tag: &BackendTag) -> Option<&ReplicaBuckets> {
        self.backends.get(tag)
    }

    /// Buckets for a backend, created on first use
    pub fn entry(&mut self, tag: &BackendTag) -> &mut ReplicaBuckets {
        self.backends.entry(tag.clone()).or_default()
    }

    pub fn contains(&self, tag: &BackendTag) -> bool {
        self.backends.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &BackendTag> {
        self.backends.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BackendTag, &ReplicaBuckets)> {
        self.backends.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&BackendTag, &mut ReplicaBuckets)> {
        self.backends.iter_mut()
    }

    /// Number of replicas in a state for a backend
    pub fn count(&self, tag: &BackendTag, state: ReplicaState) -> usize {
        self.backends.get(tag).map_or(0, |b| b.len(state))
    }

    /// Total replicas across all backends and states
    pub fn total(&self) -> usize {
        self.backends
            .values()
            .map(|b| b.iter_all().count())
            .sum()
    }

    /// Drop a backend's buckets
    pub fn remove(&mut self, tag: &BackendTag) -> Option<ReplicaBuckets> {
        self.backends.remove(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tag() -> BackendTag {
        BackendTag::new("svc").unwrap()
    }

    #[test]
    fn test_push_files_by_state() {
        let mut buckets = ReplicaBuckets::new();
        buckets.push(ReplicaInstance::new("ctl", &tag()));
        buckets.push(ReplicaInstance::new("ctl", &tag()));

        assert_eq!(buckets.len(ReplicaState::ShouldStart), 2);
        assert_eq!(buckets.live_count(), 2);
        assert_eq!(buckets.weighted_count(), 2);
    }

    #[test]
    fn test_weighted_count_subtracts_stopping() {
        let mut buckets = ReplicaBuckets::new();
        buckets.push(ReplicaInstance::new("ctl", &tag()));
        let mut leaving = ReplicaInstance::new("ctl", &tag());
        leaving.set_should_stop(Duration::ZERO);
        buckets.push(leaving);

        assert_eq!(buckets.live_count(), 1);
        assert_eq!(buckets.weighted_count(), 0);
    }

    #[test]
    fn test_pop_newest() {
        let mut buckets = ReplicaBuckets::new();
        let first = ReplicaInstance::new("ctl", &tag());
        let second = ReplicaInstance::new("ctl", &tag());
        let newest = second.replica_tag().clone();
        buckets.push(first);
        buckets.push(second);

        let popped = buckets.pop_newest(ReplicaState::ShouldStart).unwrap();
        assert_eq!(popped.replica_tag(), &newest);
    }

    #[test]
    fn test_take_and_restore_keeps_order() {
        let mut buckets = ReplicaBuckets::new();
        for _ in 0..3 {
            buckets.push(ReplicaInstance::new("ctl", &tag()));
        }
        let order: Vec<_> = buckets
            .iter(ReplicaState::ShouldStart)
            .map(|r| r.replica_tag().clone())
            .collect();

        let mut taken = buckets.take(ReplicaState::ShouldStart);
        assert!(buckets.is_empty());
        let first = taken.pop_front().unwrap();
        buckets.push(first);
        buckets.restore(ReplicaState::ShouldStart, taken);

        let after: Vec<_> = buckets
            .iter(ReplicaState::ShouldStart)
            .map(|r| r.replica_tag().clone())
            .collect();
        assert_eq!(after, vec![order[1].clone(), order[2].clone(), order[0].clone()]);
    }

    #[test]
    fn test_table_counts() {
        let mut table = ReplicaTable::new();
        let other = BackendTag::new("other").unwrap();
        table.entry(&tag()).push(ReplicaInstance::new("ctl", &tag()));
        table.entry(&other);

        assert_eq!(table.count(&tag(), ReplicaState::ShouldStart), 1);
        assert_eq!(table.count(&other, ReplicaState::ShouldStart), 0);
        assert_eq!(table.total(), 1);

        assert!(table.remove(&other).unwrap().is_empty());
        assert!(!table.contains(&other));
    }
}

//! Awaitable goal tracking
//!
//! Every externally observable mutation on the controller hands out a
//! [`GoalId`]. Callers turn the id into a [`GoalWaiter`] and await it while the
//! controller keeps ticking; the controller fires the goal once the desired
//! state is observed (or once a newer goal for the same backend supersedes it).

use std::collections::{HashMap, HashSet};
use tokio::sync::watch;

use crate::metrics;
use crate::models::GoalId;

// ============================================================================
// Goal Tracker
// ============================================================================

/// Registry of pending goals and their completion signals
#[derive(Debug, Default)]
pub struct GoalTracker {
    pending: HashMap<GoalId, watch::Sender<bool>>,
}

impl GoalTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new pending goal
    pub fn create_goal(&mut self) -> GoalId {
        let id = GoalId::new();
        self.register_pending(id);
        metrics::record_goal_created();
        tracing::debug!(goal = %id, "Goal created");
        id
    }

    /// Register an existing id as pending
    ///
    /// Used when restoring from a checkpoint. Waiters attached before the
    /// restart are not carried over; callers re-subscribe through [`watch`].
    ///
    /// [`watch`]: GoalTracker::watch
    pub fn register_pending(&mut self, id: GoalId) {
        self.pending
            .entry(id)
            .or_insert_with(|| watch::channel(false).0);
    }

    /// Fire a goal. Unknown or already-completed ids are ignored.
    pub fn complete_goal(&mut self, id: GoalId) {
        if let Some(sender) = self.pending.remove(&id) {
            sender.send_replace(true);
            metrics::record_goal_completed();
            tracing::debug!(goal = %id, waiters = sender.receiver_count(), "Goal completed");
        }
    }

    /// Whether a goal is still pending
    pub fn is_pending(&self, id: &GoalId) -> bool {
        self.pending.contains_key(id)
    }

    /// Ids of all pending goals
    pub fn get_pending_goal_ids(&self) -> HashSet<GoalId> {
        self.pending.keys().copied().collect()
    }

    /// Number of pending goals
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no goal is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Obtain a waiter for a goal
    ///
    /// The waiter resolves immediately if the id is unknown or already done.
    pub fn watch(&self, id: GoalId) -> GoalWaiter {
        GoalWaiter {
            id,
            receiver: self.pending.get(&id).map(watch::Sender::subscribe),
        }
    }
}

// ============================================================================
// Goal Waiter
// ============================================================================

/// Suspends the caller until a goal fires
#[derive(Debug)]
pub struct GoalWaiter {
    id: GoalId,
    receiver: Option<watch::Receiver<bool>>,
}

impl GoalWaiter {
    /// Goal being waited on
    pub fn id(&self) -> GoalId {
        self.id
    }

    /// Non-blocking check
    pub fn is_complete(&self) -> bool {
        match &self.receiver {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => true,
        }
    }

    /// Wait until the goal fires
    ///
    /// A tracker dropped without firing the goal also releases the waiter.
    pub async fn wait(self) {
        if let Some(mut rx) = self.receiver {
            let _ = rx.wait_for(|done| *done).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_create_and_complete() {
        let mut tracker = GoalTracker::new();
        let id = tracker.create_goal();

        assert!(tracker.is_pending(&id));
        assert_eq!(tracker.get_pending_goal_ids(), HashSet::from([id]));

        tracker.complete_goal(id);
        assert!(!tracker.is_pending(&id));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_complete_unknown_is_noop() {
        let mut tracker = GoalTracker::new();
        let id = tracker.create_goal();

        tracker.complete_goal(GoalId::new());
        tracker.complete_goal(id);
        tracker.complete_goal(id);

        assert!(tracker.is_empty());
    }

    #[test]
    fn test_waiter_pending_until_fired() {
        let mut tracker = GoalTracker::new();
        let id = tracker.create_goal();
        let waiter = tracker.watch(id);
        assert!(!waiter.is_complete());

        let mut fut = task::spawn(waiter.wait());
        assert_pending!(fut.poll());

        tracker.complete_goal(id);
        assert!(fut.is_woken());
        assert_ready!(fut.poll());
    }

    #[test]
    fn test_waiter_for_unknown_goal_resolves() {
        let tracker = GoalTracker::new();
        let waiter = tracker.watch(GoalId::new());
        assert!(waiter.is_complete());

        let mut fut = task::spawn(waiter.wait());
        assert_ready!(fut.poll());
    }

    #[test]
    fn test_waiter_released_when_tracker_dropped() {
        let mut tracker = GoalTracker::new();
        let id = tracker.create_goal();
        let waiter = tracker.watch(id);

        let mut fut = task::spawn(waiter.wait());
        assert_pending!(fut.poll());

        drop(tracker);
        assert_ready!(fut.poll());
    }

    #[test]
    fn test_register_pending_restores_goal() {
        let mut tracker = GoalTracker::new();
        let id = GoalId::new();
        tracker.register_pending(id);

        assert!(tracker.is_pending(&id));
        assert!(!tracker.watch(id).is_complete());
    }

    #[tokio::test]
    async fn test_multiple_waiters() {
        let mut tracker = GoalTracker::new();
        let id = tracker.create_goal();
        let first = tracker.watch(id);
        let second = tracker.watch(id);

        let handle = tokio::spawn(async move {
            first.wait().await;
            second.wait().await;
        });

        tracker.complete_goal(id);
        handle.await.unwrap();
    }
}

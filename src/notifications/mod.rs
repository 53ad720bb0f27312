//! Change notifications for downstream consumers
//!
//! The controller publishes two snapshots: the config of every backend and
//! the handles of every RUNNING replica. [`LongPollHost`] keeps the latest
//! snapshot of each topic together with a monotonically increasing snapshot
//! id. Listeners send the ids they already know and get back every topic that
//! moved past them, waiting for the next change if none has.

use futures::future::select_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::models::{BackendConfig, BackendTag};
use crate::runtime::WorkerHandle;

// ============================================================================
// Topics and Payloads
// ============================================================================

/// Notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    BackendConfigs,
    ReplicaHandles,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::BackendConfigs, Topic::ReplicaHandles];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackendConfigs => "backend-configs",
            Self::ReplicaHandles => "replica-handles",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload", rename_all = "kebab-case")]
pub enum Update {
    /// Config of every installed backend
    BackendConfigs(BTreeMap<BackendTag, BackendConfig>),

    /// Handles of every RUNNING replica, per backend
    ReplicaHandles(BTreeMap<BackendTag, Vec<WorkerHandle>>),
}

impl Update {
    pub fn topic(&self) -> Topic {
        match self {
            Self::BackendConfigs(_) => Topic::BackendConfigs,
            Self::ReplicaHandles(_) => Topic::ReplicaHandles,
        }
    }
}

/// Sink for change notifications
pub trait NotificationHost: Send + Sync {
    /// Publish the latest snapshot for the update's topic
    fn notify_changed(&self, update: Update);
}

// ============================================================================
// Long Poll Host
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Nothing has been published on topic '{0}'")]
    UnknownTopic(Topic),

    #[error("No topics requested")]
    EmptyRequest,

    #[error("Notification host closed")]
    Closed,
}

/// A published snapshot and its id
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub snapshot_id: u64,
    pub update: Arc<Update>,
}

/// Keeps the latest snapshot per topic and wakes listeners on change
#[derive(Debug)]
pub struct LongPollHost {
    channels: HashMap<Topic, watch::Sender<Option<Snapshot>>>,
}

impl Default for LongPollHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LongPollHost {
    pub fn new() -> Self {
        Self {
            channels: Topic::ALL
                .into_iter()
                .map(|topic| (topic, watch::channel(None).0))
                .collect(),
        }
    }

    fn channel(&self, topic: Topic) -> &watch::Sender<Option<Snapshot>> {
        &self.channels[&topic]
    }

    /// Latest snapshot on a topic
    pub fn get_snapshot(&self, topic: Topic) -> Option<Snapshot> {
        self.channel(topic).borrow().clone()
    }

    /// Current snapshot id of a topic, if anything was published
    pub fn snapshot_id(&self, topic: Topic) -> Option<u64> {
        self.channel(topic).borrow().as_ref().map(|s| s.snapshot_id)
    }

    fn outdated(
        &self,
        known: &HashMap<Topic, u64>,
    ) -> Result<HashMap<Topic, Snapshot>, NotificationError> {
        let mut updates = HashMap::new();
        for (topic, known_id) in known {
            let snapshot = self
                .get_snapshot(*topic)
                .ok_or(NotificationError::UnknownTopic(*topic))?;
            if snapshot.snapshot_id != *known_id {
                updates.insert(*topic, snapshot);
            }
        }
        Ok(updates)
    }

    /// Wait until at least one topic moves past the id the caller knows
    ///
    /// Returns immediately with every outdated topic if any already moved.
    /// Topics nothing has been published on yet are an error.
    pub async fn listen_for_change(
        &self,
        known: &HashMap<Topic, u64>,
    ) -> Result<HashMap<Topic, Snapshot>, NotificationError> {
        if known.is_empty() {
            return Err(NotificationError::EmptyRequest);
        }

        let mut receivers: Vec<_> = known
            .keys()
            .map(|topic| self.channel(*topic).subscribe())
            .collect();

        loop {
            let updates = self.outdated(known)?;
            if !updates.is_empty() {
                return Ok(updates);
            }

            let changes = receivers.iter_mut().map(|rx| Box::pin(rx.changed()));
            let (result, _, _) = select_all(changes).await;
            result.map_err(|_| NotificationError::Closed)?;
        }
    }
}

impl NotificationHost for LongPollHost {
    fn notify_changed(&self, update: Update) {
        let topic = update.topic();
        let update = Arc::new(update);
        self.channel(topic).send_modify(|current| {
            let snapshot_id = current.as_ref().map_or(1, |s| s.snapshot_id + 1);
            *current = Some(Snapshot {
                snapshot_id,
                update: Arc::clone(&update),
            });
        });
        tracing::debug!(topic = %topic, snapshot_id = ?self.snapshot_id(topic), "Published snapshot");
    }
}

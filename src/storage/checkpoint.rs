//! Versioned checkpoint envelope
//!
//! A checkpoint is the controller's full state wrapped in a small envelope:
//!
//! ```json
//! {
//!   "version": 1,
//!   "controller": "backend-controller",
//!   "written_at": "2026-01-01T00:00:00Z",
//!   "digest": "<sha256 of the serialized state>",
//!   "state": { ... }
//! }
//! ```
//!
//! The digest guards against truncated or hand-edited files; a mismatch is
//! reported as [`CheckpointError::Corrupt`] rather than silently restoring
//! partial state.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{KvStore, StorageError};

/// Current envelope version
pub const CHECKPOINT_VERSION: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Corrupt checkpoint: {reason}")]
    Corrupt { reason: String },

    #[error("Unsupported checkpoint version {found} (expected {CHECKPOINT_VERSION})")]
    UnsupportedVersion { found: u32 },
}

impl CheckpointError {
    fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    /// Whether the same operation may succeed if retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Io { .. }))
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    controller: String,
    written_at: DateTime<Utc>,
    digest: String,
    state: serde_json::Value,
}

/// Decoded checkpoint
#[derive(Debug, Clone)]
pub struct Checkpoint<T> {
    /// Name of the controller that wrote it
    pub controller: String,

    /// When it was written
    pub written_at: DateTime<Utc>,

    /// Hex SHA-256 of the state
    pub digest: String,

    pub state: T,
}

fn digest_of(state: &serde_json::Value) -> Result<String, CheckpointError> {
    let bytes = serde_json::to_vec(state).map_err(CheckpointError::Serialize)?;
    let hash = Sha256::digest(&bytes);
    Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
}

/// Serialize a state into envelope bytes. Returns the bytes and digest.
pub fn encode<T: Serialize>(controller: &str, state: &T) -> Result<(Vec<u8>, String), CheckpointError> {
    let state = serde_json::to_value(state).map_err(CheckpointError::Serialize)?;
    let digest = digest_of(&state)?;
    let envelope = Envelope {
        version: CHECKPOINT_VERSION,
        controller: controller.to_string(),
        written_at: Utc::now(),
        digest: digest.clone(),
        state,
    };
    let bytes = serde_json::to_vec(&envelope).map_err(CheckpointError::Serialize)?;
    Ok((bytes, digest))
}

/// Parse and verify envelope bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<Checkpoint<T>, CheckpointError> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| CheckpointError::corrupt(format!("unreadable envelope: {e}")))?;

    if envelope.version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            found: envelope.version,
        });
    }

    let digest = digest_of(&envelope.state)?;
    if digest != envelope.digest {
        return Err(CheckpointError::corrupt(format!(
            "digest mismatch (stored {}, computed {digest})",
            envelope.digest
        )));
    }

    let state = serde_json::from_value(envelope.state)
        .map_err(|e| CheckpointError::corrupt(format!("invalid state: {e}")))?;

    Ok(Checkpoint {
        controller: envelope.controller,
        written_at: envelope.written_at,
        digest,
        state,
    })
}

/// Write a checkpoint under `key`. Returns the number of bytes written.
pub fn save<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    controller: &str,
    state: &T,
) -> Result<usize, CheckpointError> {
    let (bytes, digest) = encode(controller, state)?;
    store.put(key, &bytes)?;
    tracing::debug!(key = %key, bytes = bytes.len(), digest = %digest, "Checkpoint written");
    Ok(bytes.len())
}

/// Read the checkpoint under `key`, if any
pub fn load<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<Checkpoint<T>>, CheckpointError> {
    match store.get(key)? {
        Some(bytes) => {
            let checkpoint = decode(&bytes)?;
            tracing::debug!(key = %key, written_at = %checkpoint.written_at, "Checkpoint loaded");
            Ok(Some(checkpoint))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        targets: BTreeMap<String, u32>,
        note: String,
    }

    fn sample() -> Sample {
        Sample {
            targets: BTreeMap::from([("svc-a".to_string(), 2), ("svc-b".to_string(), 0)]),
            note: "mid scale-up".to_string(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let store = MemoryKvStore::new();
        let written = save(&store, "ckpt", "ctl", &sample()).unwrap();
        assert!(written > 0);

        let loaded: Checkpoint<Sample> = load(&store, "ckpt").unwrap().unwrap();
        assert_eq!(loaded.state, sample());
        assert_eq!(loaded.controller, "ctl");
        assert_eq!(loaded.digest.len(), 64);
    }

    #[test]
    fn test_missing_key() {
        let store = MemoryKvStore::new();
        assert!(load::<Sample>(&store, "ckpt").unwrap().is_none());
    }

    #[test]
    fn test_tampered_state_is_rejected() {
        let (bytes, _) = encode("ctl", &sample()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        envelope["state"]["targets"]["svc-a"] = serde_json::json!(99);
        let tampered = serde_json::to_vec(&envelope).unwrap();

        let err = decode::<Sample>(&tampered).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let (bytes, _) = encode("ctl", &sample()).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        envelope["version"] = serde_json::json!(7);
        let bumped = serde_json::to_vec(&envelope).unwrap();

        let err = decode::<Sample>(&bumped).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedVersion { found: 7 }));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = decode::<Sample>(b"not json").unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_digest_is_stable() {
        let (_, first) = encode("ctl", &sample()).unwrap();
        let (_, second) = encode("other", &sample()).unwrap();
        assert_eq!(first, second);
    }
}

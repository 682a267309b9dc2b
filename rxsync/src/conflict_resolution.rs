//! Conflict detection and resolution
//!
//! A conflict exists when a record was edited locally while the remote copy
//! moved past the version the local edit started from. Resolution either picks
//! the newer copy automatically or asks a [`ManualResolver`] (normally a UI
//! prompt) to choose between the two copies or supply a merge.
//!
//! Whatever the choice, the resolved record is written as the version after
//! the remote one, so the subsequent push is a plain compare-and-set on top of
//! what the remote holds.

use crate::error::{SyncError, SyncResult};
use crate::models::Syncable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Sync metadata fields left out of field-level diffs
const METADATA_FIELDS: &[&str] = &["version", "isSynced", "updatedAt"];

/// Strategy for resolving conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Most recently updated copy wins
    NewerWins,
    /// Defer to a [`ManualResolver`]
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewerWins => "newer_wins",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "newer_wins" => Ok(Self::NewerWins),
            "manual" => Ok(Self::Manual),
            _ => Err(SyncError::InvalidOperation(format!("Unknown conflict strategy: {}", s))),
        }
    }
}

/// What a sync pass should do with one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Both sides agree
    InSync,
    /// Local edit sits directly on top of the remote copy
    PushLocal,
    /// Remote copy is authoritative and local has no unsynced edits
    PullRemote,
    /// Both sides changed since the common version
    Conflict,
    /// Remote copy is gone
    RemoteDeleted,
}

pub struct ConflictDetector;

impl ConflictDetector {
    pub fn classify<T: Syncable>(local: Option<&T>, remote: Option<&T>) -> SyncDecision {
        match (local, remote) {
            (None, None) => SyncDecision::InSync,
            (None, Some(_)) => SyncDecision::PullRemote,
            (Some(local), None) => {
                if !local.is_synced() && local.base_version() == 0 {
                    SyncDecision::PushLocal
                } else {
                    SyncDecision::RemoteDeleted
                }
            }
            (Some(local), Some(remote)) => {
                if local.is_synced() {
                    if remote.version() == local.version() {
                        SyncDecision::InSync
                    } else {
                        SyncDecision::PullRemote
                    }
                } else if remote.version() == local.base_version() {
                    SyncDecision::PushLocal
                } else {
                    SyncDecision::Conflict
                }
            }
        }
    }
}

/// A field whose value differs between the two copies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDiff {
    pub field_path: String,
    pub local_value: Value,
    pub remote_value: Value,
}

/// Top-level field differences between two JSON documents, sync metadata excluded
pub fn compute_diffs(local: &Value, remote: &Value) -> Vec<ConflictDiff> {
    let mut diffs = Vec::new();

    let (Some(local_obj), Some(remote_obj)) = (local.as_object(), remote.as_object()) else {
        if local != remote {
            diffs.push(ConflictDiff {
                field_path: String::new(),
                local_value: local.clone(),
                remote_value: remote.clone(),
            });
        }
        return diffs;
    };

    for (key, local_val) in local_obj {
        if METADATA_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let remote_val = remote_obj.get(key).unwrap_or(&Value::Null);
        if local_val != remote_val {
            diffs.push(ConflictDiff {
                field_path: key.clone(),
                local_value: local_val.clone(),
                remote_value: remote_val.clone(),
            });
        }
    }

    for (key, remote_val) in remote_obj {
        if !local_obj.contains_key(key) && !METADATA_FIELDS.contains(&key.as_str()) {
            diffs.push(ConflictDiff {
                field_path: key.clone(),
                local_value: Value::Null,
                remote_value: remote_val.clone(),
            });
        }
    }

    diffs
}

/// Both copies of a conflicting record, as presented for resolution
#[derive(Debug, Clone)]
pub struct Conflict<T: Syncable> {
    pub id: Uuid,
    pub collection: &'static str,
    pub record_id: Uuid,
    pub local: T,
    pub remote: T,
    pub diffs: Vec<ConflictDiff>,
    pub detected_at: DateTime<Utc>,
}

/// Choice returned by a [`ManualResolver`]
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    KeepLocal,
    KeepRemote,
    Merge(T),
}

/// Presents a conflict to the user and waits for a decision
#[async_trait]
pub trait ManualResolver<T: Syncable>: Send + Sync {
    async fn resolve(&self, conflict: &Conflict<T>) -> SyncResult<Resolution<T>>;
}

/// Which copy ended up as the resolved record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    KeptLocal,
    KeptRemote,
    Merged,
}

impl ResolutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeptLocal => "kept_local",
            Self::KeptRemote => "kept_remote",
            Self::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConflict<T> {
    pub record: T,
    pub strategy: ConflictStrategy,
    pub outcome: ResolutionOutcome,
}

impl<T> ResolvedConflict<T> {
    /// Label stored in the conflict log, e.g. `newer_wins:kept_remote`
    pub fn label(&self) -> String {
        format!("{}:{}", self.strategy.as_str(), self.outcome.as_str())
    }
}

/// Newer-wins choice: later `updated_at`, then higher version, then remote
pub fn newer_wins<T: Syncable>(local: &T, remote: &T) -> ResolutionOutcome {
    let by_time = local.updated_at().cmp(&remote.updated_at());
    let by_version = local.version().cmp(&remote.version());
    if by_time.then(by_version).is_gt() {
        ResolutionOutcome::KeptLocal
    } else {
        ResolutionOutcome::KeptRemote
    }
}

enum Policy<T: Syncable> {
    NewerWins,
    Manual(Arc<dyn ManualResolver<T>>),
}

impl<T: Syncable> Clone for Policy<T> {
    fn clone(&self) -> Self {
        match self {
            Policy::NewerWins => Policy::NewerWins,
            Policy::Manual(resolver) => Policy::Manual(Arc::clone(resolver)),
        }
    }
}

/// Conflict resolution manager for one record type
#[derive(Clone)]
pub struct ConflictResolver<T: Syncable> {
    policy: Policy<T>,
}

impl<T: Syncable> ConflictResolver<T> {
    pub fn newer_wins() -> Self {
        Self {
            policy: Policy::NewerWins,
        }
    }

    pub fn manual(resolver: Arc<dyn ManualResolver<T>>) -> Self {
        Self {
            policy: Policy::Manual(resolver),
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        match self.policy {
            Policy::NewerWins => ConflictStrategy::NewerWins,
            Policy::Manual(_) => ConflictStrategy::Manual,
        }
    }

    pub fn create_conflict(
        &self,
        local: T,
        remote: T,
        now: DateTime<Utc>,
    ) -> SyncResult<Conflict<T>> {
        let diffs = compute_diffs(&local.to_json()?, &remote.to_json()?);
        Ok(Conflict {
            id: Uuid::new_v4(),
            collection: T::COLLECTION,
            record_id: local.id(),
            local,
            remote,
            diffs,
            detected_at: now,
        })
    }

    /// Pick the surviving record and stamp it as the version after the remote copy
    pub async fn resolve(
        &self,
        conflict: &Conflict<T>,
        now: DateTime<Utc>,
    ) -> SyncResult<ResolvedConflict<T>> {
        let (chosen, outcome) = match &self.policy {
            Policy::NewerWins => match newer_wins(&conflict.local, &conflict.remote) {
                ResolutionOutcome::KeptLocal => {
                    (conflict.local.clone(), ResolutionOutcome::KeptLocal)
                }
                _ => (conflict.remote.clone(), ResolutionOutcome::KeptRemote),
            },
            Policy::Manual(resolver) => match resolver.resolve(conflict).await? {
                Resolution::KeepLocal => (conflict.local.clone(), ResolutionOutcome::KeptLocal),
                Resolution::KeepRemote => (conflict.remote.clone(), ResolutionOutcome::KeptRemote),
                Resolution::Merge(merged) => {
                    if merged.id() != conflict.record_id {
                        return Err(SyncError::Conflict(format!(
                            "merged record {} does not match conflicting record {}",
                            merged.id(),
                            conflict.record_id
                        )));
                    }
                    (merged, ResolutionOutcome::Merged)
                }
            },
        };

        let version = conflict.remote.version().saturating_add(1);
        tracing::info!(
            collection = conflict.collection,
            record_id = %conflict.record_id,
            local_version = conflict.local.version(),
            remote_version = conflict.remote.version(),
            resolved_version = version,
            outcome = outcome.as_str(),
            "Resolved sync conflict"
        );

        Ok(ResolvedConflict {
            record: chosen.with_sync_state(version, false).touched(now),
            strategy: self.strategy(),
            outcome,
        })
    }
}

impl<T: Syncable> Default for ConflictResolver<T> {
    fn default() -> Self {
        Self::newer_wins()
    }
}
